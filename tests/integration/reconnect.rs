// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::needless_continue,
    clippy::match_same_arms,
    clippy::doc_markdown,
    clippy::manual_let_else,
    clippy::future_not_send,
    clippy::redundant_pub_crate,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_docs_in_private_items
)]

//! Reconnect behavior over real sockets.
//!
//! Backoff arithmetic is covered with paused time in the `net` unit tests;
//! here short delays are used against a live server to check that:
//! - A server restart close (1012) is followed by a reconnect and sending
//!   works again afterwards
//! - A server normal closure (1000) is final and is reported to the user
//! - An unreachable server exhausts the retry budget, fails, and reports
//!   the loss once
//! - Unmounting closes the server-side connection

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use flagchat::chat::history::{HistoryLoader, StaticHistorySource};
use flagchat::chat::merge::{DEFAULT_DEDUP_WINDOW, SelfEchoPolicy};
use flagchat::chat::send::SendError;
use flagchat::conversation::{ConversationIdentity, Credentials, UserProfile};
use flagchat::net::{ConnectionState, DEFAULT_EVENT_BUFFER, ReconnectConfig};
use flagchat::session::{ChatSession, Notice, SessionConfig, SessionEvent};
use flagchat::transport::ws::WsConnector;
use flagchat_proto::ids::UserId;
use flagchat_relay::relay::{RelayState, start_server_with_state};
use flagchat_relay::store::LogKey;
use url::Url;

type Session = ChatSession<WsConnector, StaticHistorySource>;

const WAIT: Duration = Duration::from_secs(5);

fn fast_reconnect(max_attempts: u32) -> ReconnectConfig {
    ReconnectConfig {
        base_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(80),
        max_attempts,
        open_timeout: Duration::from_secs(2),
    }
}

async fn start_relay() -> (SocketAddr, Arc<RelayState>) {
    let state = Arc::new(RelayState::new());
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (addr, state)
}

async fn mount(addr: SocketAddr, reconnect: ReconnectConfig) -> Session {
    let config = SessionConfig {
        ws_url: Url::parse(&format!("ws://{addr}")).unwrap(),
        credentials: Credentials::new("alice-token"),
        profile: UserProfile {
            id: UserId::new(1),
            name: "alice".to_string(),
            avatar: String::new(),
        },
        dedup_window: DEFAULT_DEDUP_WINDOW,
        self_echo: SelfEchoPolicy::default(),
        reconnect,
        event_buffer: DEFAULT_EVENT_BUFFER,
    };
    let history = HistoryLoader::new(StaticHistorySource::new(), 50);
    ChatSession::mount(
        config,
        WsConnector::new(),
        history,
        ConversationIdentity::room("7"),
    )
    .await
    .unwrap()
}

/// Collects events until `stop` matches one, returning everything seen.
async fn events_until(
    session: &mut Session,
    stop: impl Fn(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    tokio::time::timeout(WAIT, async {
        let mut seen = Vec::new();
        while let Some(event) = session.next_event().await {
            let done = stop(&event);
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    })
    .await
    .expect("timed out waiting for session events")
}

fn is_state(event: &SessionEvent, wanted: ConnectionState) -> bool {
    matches!(event, SessionEvent::StateChanged { state, .. } if *state == wanted)
}

async fn wait_subscribed(state: &RelayState) {
    for _ in 0..200 {
        if state.subscribers.room_size("7").await == 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server never subscribed the session");
}

#[tokio::test]
async fn server_restart_close_reconnects() {
    let (addr, state) = start_relay().await;
    let mut session = mount(addr, fast_reconnect(5)).await;
    events_until(&mut session, |e| is_state(e, ConnectionState::Open)).await;
    wait_subscribed(&state).await;

    state.close_all_connections(1012).await;

    let seen = events_until(&mut session, |e| is_state(e, ConnectionState::Open)).await;
    assert!(seen.iter().any(|e| is_state(e, ConnectionState::Closed)));
    assert!(
        seen.iter()
            .any(|e| matches!(e, SessionEvent::RetryScheduled { attempt: 1, .. }))
    );
    assert_eq!(session.state(), ConnectionState::Open);

    wait_subscribed(&state).await;
    session.send("back again").unwrap();
    for _ in 0..200 {
        if state.history.len(&LogKey::Room("7".to_string())).await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state.history.len(&LogKey::Room("7".to_string())).await, 1);

    session.unmount().await;
}

#[tokio::test]
async fn server_normal_closure_is_final() {
    let (addr, state) = start_relay().await;
    let mut session = mount(addr, fast_reconnect(5)).await;
    events_until(&mut session, |e| is_state(e, ConnectionState::Open)).await;
    wait_subscribed(&state).await;

    state.close_all_connections(1000).await;

    let seen = events_until(&mut session, |e| is_state(e, ConnectionState::Terminated)).await;
    assert!(
        !seen
            .iter()
            .any(|e| matches!(e, SessionEvent::RetryScheduled { .. }))
    );

    let rest = events_until(&mut session, |_| false).await;
    let closed = seen
        .iter()
        .chain(&rest)
        .filter(|e| matches!(e, SessionEvent::Notice(Notice::ClosedByServer)))
        .count();
    assert_eq!(closed, 1);

    let err = session.send("hello").unwrap_err();
    assert!(matches!(err, SendError::ClosedByServer));
    assert_eq!(err.notice(), Notice::ClosedByServer);
}

#[tokio::test]
async fn unreachable_server_exhausts_retries() {
    // Bind then drop to get a port with nothing listening.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut session = mount(addr, fast_reconnect(2)).await;
    let seen = events_until(&mut session, |_| false).await;

    let retries: Vec<u32> = seen
        .iter()
        .filter_map(|e| match e {
            SessionEvent::RetryScheduled { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![1, 2]);
    assert!(seen.iter().any(|e| is_state(e, ConnectionState::Failed)));
    assert!(!seen.iter().any(|e| is_state(e, ConnectionState::Open)));

    let lost = seen
        .iter()
        .filter(|e| matches!(e, SessionEvent::Notice(Notice::ConnectionLost)))
        .count();
    assert_eq!(lost, 1);

    assert_eq!(session.state(), ConnectionState::Failed);
    assert!(matches!(
        session.send("anyone?"),
        Err(SendError::ConnectionLost)
    ));
    assert!(session.messages().is_empty());
}

#[tokio::test]
async fn unmount_closes_server_connection() {
    let (addr, state) = start_relay().await;
    let mut session = mount(addr, fast_reconnect(5)).await;
    events_until(&mut session, |e| is_state(e, ConnectionState::Open)).await;
    wait_subscribed(&state).await;

    session.unmount().await;

    for _ in 0..200 {
        if state.connection_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state.connection_count().await, 0);
}
