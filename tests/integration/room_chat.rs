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

//! End-to-end room chat against the in-process development server.
//!
//! Each test starts the server on an OS-assigned port and mounts real
//! sessions (WebSocket connector, HTTP history) against it.
//!
//! These tests validate:
//! - A sender sees its own message exactly once despite the server echo
//! - Other room members receive the message with the server's sender info
//! - A late joiner sees stored history, then live messages after it
//! - Switching rooms starts from a clean list

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use flagchat::chat::{ChatMessage, Origin};
use flagchat::chat::history::{HistoryLoader, HttpHistorySource};
use flagchat::chat::merge::{DEFAULT_DEDUP_WINDOW, SelfEchoPolicy};
use flagchat::conversation::{ConversationIdentity, Credentials, UserProfile};
use flagchat::net::{ConnectionState, DEFAULT_EVENT_BUFFER, ReconnectConfig};
use flagchat::session::{ChatSession, SessionConfig, SessionEvent};
use flagchat::transport::ws::WsConnector;
use flagchat_proto::ids::UserId;
use flagchat_relay::relay::{RelayState, start_server_with_state};
use flagchat_relay::store::LogKey;
use url::Url;

type Session = ChatSession<WsConnector, HttpHistorySource>;

const WAIT: Duration = Duration::from_secs(5);

async fn start_relay() -> (SocketAddr, Arc<RelayState>) {
    let state = Arc::new(RelayState::new());
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (addr, state)
}

async fn mount(addr: SocketAddr, token: &str, id: u64, room: &str) -> Session {
    let credentials = Credentials::new(token);
    let config = SessionConfig {
        ws_url: Url::parse(&format!("ws://{addr}")).unwrap(),
        credentials: credentials.clone(),
        profile: UserProfile {
            id: UserId::new(id),
            name: token.trim_end_matches("-token").to_string(),
            avatar: String::new(),
        },
        dedup_window: DEFAULT_DEDUP_WINDOW,
        self_echo: SelfEchoPolicy::default(),
        reconnect: ReconnectConfig::default(),
        event_buffer: DEFAULT_EVENT_BUFFER,
    };
    let api = Url::parse(&format!("http://{addr}")).unwrap();
    let source = HttpHistorySource::new(api, credentials, WAIT).unwrap();
    let history = HistoryLoader::new(source, 50);

    ChatSession::mount(config, WsConnector::new(), history, ConversationIdentity::room(room))
        .await
        .unwrap()
}

/// Waits for the session to open and for the server to subscribe it.
async fn wait_open(session: &mut Session, state: &RelayState, room: &str, members: usize) {
    tokio::time::timeout(WAIT, async {
        loop {
            match session.next_event().await {
                Some(SessionEvent::StateChanged {
                    state: ConnectionState::Open,
                    ..
                }) => break,
                Some(_) => continue,
                None => panic!("session ended before opening"),
            }
        }
    })
    .await
    .expect("session did not open");

    for _ in 0..200 {
        if state.subscribers.room_size(room).await >= members {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server never subscribed {members} connections to room {room}");
}

async fn next_appended(session: &mut Session) -> ChatMessage {
    tokio::time::timeout(WAIT, async {
        loop {
            match session.next_event().await {
                Some(SessionEvent::Appended(message)) => return message,
                Some(_) => continue,
                None => panic!("session ended before a message arrived"),
            }
        }
    })
    .await
    .expect("no message appended")
}

async fn assert_no_append(session: &mut Session) {
    let result = tokio::time::timeout(Duration::from_millis(300), async {
        loop {
            if let Some(SessionEvent::Appended(message)) = session.next_event().await {
                return message;
            }
        }
    })
    .await;
    assert!(result.is_err(), "unexpected append: {result:?}");
}

#[tokio::test]
async fn own_message_appears_once_and_reaches_members() {
    let (addr, state) = start_relay().await;
    let mut alice = mount(addr, "alice-token", 1, "7").await;
    wait_open(&mut alice, &state, "7", 1).await;
    let mut bob = mount(addr, "bob-token", 2, "7").await;
    wait_open(&mut bob, &state, "7", 2).await;

    let sent = alice.send("  hello room  ").unwrap();
    assert_eq!(sent.content, "hello room");
    assert_eq!(sent.origin, Origin::Optimistic);
    assert!(sent.is_me);

    let received = next_appended(&mut bob).await;
    assert_eq!(received.content, "hello room");
    assert_eq!(received.sender_id, UserId::new(1));
    assert_eq!(received.sender_name, "alice");
    assert!(!received.is_me);

    // The server echo of alice's own frame is dropped.
    assert_no_append(&mut alice).await;
    assert_eq!(alice.messages().len(), 1);
    assert_eq!(bob.messages().len(), 1);

    alice.unmount().await;
    bob.unmount().await;
}

#[tokio::test]
async fn late_joiner_sees_history_then_live() {
    let (addr, state) = start_relay().await;
    let mut alice = mount(addr, "alice-token", 1, "9").await;
    wait_open(&mut alice, &state, "9", 1).await;

    alice.send("first").unwrap();
    alice.send("second").unwrap();
    for _ in 0..200 {
        if state.history.len(&LogKey::Room("9".to_string())).await == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut bob = mount(addr, "bob-token", 2, "9").await;
    let seeded: Vec<(&str, Origin, bool)> = bob
        .messages()
        .iter()
        .map(|m| (m.content.as_str(), m.origin, m.is_me))
        .collect();
    assert_eq!(
        seeded,
        vec![
            ("first", Origin::History, false),
            ("second", Origin::History, false)
        ]
    );

    wait_open(&mut bob, &state, "9", 2).await;
    alice.send("third").unwrap();

    let live = next_appended(&mut bob).await;
    assert_eq!(live.content, "third");
    assert_eq!(live.origin, Origin::Live);
    assert_eq!(bob.messages().len(), 3);

    alice.unmount().await;
    bob.unmount().await;
}

#[tokio::test]
async fn own_history_is_marked_as_mine() {
    let (addr, state) = start_relay().await;
    let mut alice = mount(addr, "alice-token", 1, "3").await;
    wait_open(&mut alice, &state, "3", 1).await;
    alice.send("note to self").unwrap();
    for _ in 0..200 {
        if state.history.len(&LogKey::Room("3".to_string())).await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    alice.unmount().await;

    let again = mount(addr, "alice-token", 1, "3").await;
    assert_eq!(again.messages().len(), 1);
    assert!(again.messages()[0].is_me);
    again.unmount().await;
}

#[tokio::test]
async fn switching_rooms_starts_clean() {
    let (addr, state) = start_relay().await;
    let mut alice = mount(addr, "alice-token", 1, "1").await;
    wait_open(&mut alice, &state, "1", 1).await;
    alice.send("in room one").unwrap();
    assert_eq!(alice.messages().len(), 1);

    alice.switch(ConversationIdentity::room("2")).await.unwrap();
    assert_eq!(alice.identity(), &ConversationIdentity::room("2"));
    wait_open(&mut alice, &state, "2", 1).await;
    assert!(alice.messages().is_empty());
    for _ in 0..200 {
        if state.subscribers.room_size("1").await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state.subscribers.room_size("1").await, 0);

    alice.unmount().await;
}
