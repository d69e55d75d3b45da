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

//! End-to-end direct (one-to-one) chat against the development server.
//!
//! The private live endpoint is per user, so a user's connection carries
//! frames from every pair they belong to. These tests validate that a
//! mounted direct view only shows its own pair:
//! - A message to the peer reaches the peer and is shown once to the sender
//! - Frames from a third user are filtered out of the view
//! - The pair's history is served to either side

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use flagchat::chat::history::{HistoryLoader, HttpHistorySource};
use flagchat::chat::merge::{DEFAULT_DEDUP_WINDOW, SelfEchoPolicy};
use flagchat::chat::{ChatMessage, Origin};
use flagchat::conversation::{ConversationIdentity, Credentials, UserProfile};
use flagchat::net::{ConnectionState, DEFAULT_EVENT_BUFFER, ReconnectConfig};
use flagchat::session::{ChatSession, SessionConfig, SessionEvent};
use flagchat::transport::ws::WsConnector;
use flagchat_proto::ids::UserId;
use flagchat_relay::config::Member;
use flagchat_relay::relay::{RelayState, start_server_with_state};
use flagchat_relay::store::{HistoryStore, LogKey};
use url::Url;

type Session = ChatSession<WsConnector, HttpHistorySource>;

const WAIT: Duration = Duration::from_secs(5);

const ALICE: u64 = 1;
const BOB: u64 = 2;
const CAROL: u64 = 3;

async fn start_relay() -> (SocketAddr, Arc<RelayState>) {
    let members = vec![
        Member::new("alice-token", ALICE, "alice"),
        Member::new("bob-token", BOB, "bob"),
        Member::new("carol-token", CAROL, "carol"),
    ];
    let state = Arc::new(RelayState::with_config(members, HistoryStore::new()));
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (addr, state)
}

fn token(id: u64) -> &'static str {
    match id {
        ALICE => "alice-token",
        BOB => "bob-token",
        _ => "carol-token",
    }
}

/// Mounts `me`'s view of the direct conversation with `peer` and waits
/// until the server has subscribed it.
async fn mount_direct(addr: SocketAddr, state: &RelayState, me: u64, peer: u64) -> Session {
    let credentials = Credentials::new(token(me));
    let config = SessionConfig {
        ws_url: Url::parse(&format!("ws://{addr}")).unwrap(),
        credentials: credentials.clone(),
        profile: UserProfile {
            id: UserId::new(me),
            name: format!("user{me}"),
            avatar: String::new(),
        },
        dedup_window: DEFAULT_DEDUP_WINDOW,
        self_echo: SelfEchoPolicy::default(),
        reconnect: ReconnectConfig::default(),
        event_buffer: DEFAULT_EVENT_BUFFER,
    };
    let api = Url::parse(&format!("http://{addr}")).unwrap();
    let source = HttpHistorySource::new(api, credentials, WAIT).unwrap();
    let identity = ConversationIdentity::direct(UserId::new(me), UserId::new(peer));

    let mut session = ChatSession::mount(
        config,
        WsConnector::new(),
        HistoryLoader::new(source, 50),
        identity,
    )
    .await
    .unwrap();

    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(SessionEvent::StateChanged {
                state: ConnectionState::Open,
                ..
            }) = session.next_event().await
            {
                break;
            }
        }
    })
    .await
    .expect("session did not open");

    for _ in 0..200 {
        if !state.subscribers.user(UserId::new(me)).await.is_empty() {
            return session;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server never subscribed user {me}");
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

async fn wait_stored(state: &RelayState, a: u64, b: u64, count: usize) {
    let key = LogKey::pair(UserId::new(a), UserId::new(b));
    for _ in 0..200 {
        if state.history.len(&key).await >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server never stored {count} messages for {a}/{b}");
}

#[tokio::test]
async fn direct_message_reaches_peer_and_sender_once() {
    let (addr, state) = start_relay().await;
    let mut alice = mount_direct(addr, &state, ALICE, BOB).await;
    let mut bob = mount_direct(addr, &state, BOB, ALICE).await;

    alice.send("hi bob").unwrap();

    let received = next_appended(&mut bob).await;
    assert_eq!(received.content, "hi bob");
    assert_eq!(received.sender_id, UserId::new(ALICE));
    assert!(!received.is_me);

    // Bob's reply proves alice's echo was not appended in between.
    bob.send("hi alice").unwrap();
    let reply = next_appended(&mut alice).await;
    assert_eq!(reply.content, "hi alice");

    let contents: Vec<&str> = alice.messages().iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["hi bob", "hi alice"]);

    alice.unmount().await;
    bob.unmount().await;
}

#[tokio::test]
async fn third_party_messages_stay_out_of_the_view() {
    let (addr, state) = start_relay().await;
    let mut alice = mount_direct(addr, &state, ALICE, BOB).await;
    let mut bob = mount_direct(addr, &state, BOB, ALICE).await;
    let mut carol = mount_direct(addr, &state, CAROL, ALICE).await;

    // Delivered on alice's private connection, but not part of alice/bob.
    carol.send("psst alice").unwrap();
    wait_stored(&state, CAROL, ALICE, 1).await;
    bob.send("from bob").unwrap();

    let first = next_appended(&mut alice).await;
    assert_eq!(first.content, "from bob");
    assert_eq!(alice.messages().len(), 1);

    alice.unmount().await;
    bob.unmount().await;
    carol.unmount().await;
}

#[tokio::test]
async fn pair_history_is_shared_by_both_sides() {
    let (addr, state) = start_relay().await;
    let mut carol = mount_direct(addr, &state, CAROL, ALICE).await;
    carol.send("are you there?").unwrap();
    wait_stored(&state, CAROL, ALICE, 1).await;

    let alice = mount_direct(addr, &state, ALICE, CAROL).await;
    let seeded = alice.messages();
    assert_eq!(seeded.len(), 1);
    assert_eq!(seeded[0].content, "are you there?");
    assert_eq!(seeded[0].origin, Origin::History);
    assert_eq!(seeded[0].sender_name, "carol");
    assert!(!seeded[0].is_me);

    // Alice's view of a different pair has no history.
    let other = mount_direct(addr, &state, ALICE, BOB).await;
    assert!(other.messages().is_empty());

    alice.unmount().await;
    other.unmount().await;
    carol.unmount().await;
}
