//! Server core: shared state, WebSocket handlers, message routing, and the
//! history endpoints.
//!
//! Clients authenticate with a bearer token, either as a `token` query
//! parameter on the live endpoints or an `Authorization` header on the
//! history endpoints. The sender of every routed message is the member the
//! token belongs to, never a value taken from the frame.
//!
//! Routing rules:
//! - a room connection's frames go to every subscriber of that room,
//!   including the sender's own connections;
//! - a private connection's frames go to every private connection of the
//!   recipient and of the sender.
//!
//! Every routed message is appended to the [`HistoryStore`] before delivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Json;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use flagchat_proto::codec;
use flagchat_proto::frame::InboundFrame;
use flagchat_proto::history::HistoryRecord;
use flagchat_proto::ids::UserId;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};

use crate::config::{Member, demo_members};
use crate::rooms::{ConnId, Outbox, Subscribers, Subscription};
use crate::store::{HistoryStore, LogKey};

/// Page size when a history request names no `limit`.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Largest page a history request may ask for.
pub const MAX_PAGE_SIZE: usize = 100;

/// Shared server state: members, live subscribers, and stored history.
pub struct RelayState {
    /// Members keyed by token.
    members: HashMap<String, Member>,
    /// Live subscribers by room and by user.
    pub subscribers: Subscribers,
    /// Every open connection, for shutdown.
    connections: RwLock<HashMap<ConnId, Outbox>>,
    /// Stored messages served by the history endpoints.
    pub history: HistoryStore,
    next_conn: AtomicU64,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates a state with the demo members and the default history cap.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(demo_members(), HistoryStore::new())
    }

    /// Creates a state with the given members and history store.
    #[must_use]
    pub fn with_config(members: Vec<Member>, history: HistoryStore) -> Self {
        Self {
            members: members
                .into_iter()
                .map(|m| (m.token.clone(), m))
                .collect(),
            subscribers: Subscribers::new(),
            connections: RwLock::new(HashMap::new()),
            history,
            next_conn: AtomicU64::new(1),
        }
    }

    /// The member owning `token`, if any.
    #[must_use]
    pub fn authenticate(&self, token: Option<&str>) -> Option<Member> {
        token.and_then(|t| self.members.get(t)).cloned()
    }

    /// Number of open connections of any kind.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Send a WebSocket Close frame with `code` to every open connection.
    ///
    /// Each connection's writer task sends the frame and then ends the
    /// connection. Useful for graceful shutdown and testing.
    pub async fn close_all_connections(&self, code: u16) {
        let conns = self.connections.read().await;
        for (conn, outbox) in conns.iter() {
            tracing::info!(conn, code, "sending close frame");
            let _ = outbox.send(Message::Close(Some(CloseFrame {
                code,
                reason: "server closing".into(),
            })));
        }
    }

    fn bearer(&self, headers: &HeaderMap) -> Option<Member> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        self.authenticate(token)
    }

    async fn register(&self, subscription: &Subscription, outbox: Outbox) -> ConnId {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .subscribe(subscription, conn, outbox.clone())
            .await;
        self.connections.write().await.insert(conn, outbox);
        conn
    }

    async fn unregister(&self, subscription: &Subscription, conn: ConnId) {
        self.subscribers.unsubscribe(subscription, conn).await;
        self.connections.write().await.remove(&conn);
    }
}

/// Query string of the live endpoints.
#[derive(Debug, Default, serde::Deserialize)]
struct ConnectParams {
    token: Option<String>,
    room_id: Option<String>,
}

/// Query string of the history endpoints.
#[derive(Debug, Default, serde::Deserialize)]
struct PageParams {
    limit: Option<usize>,
}

/// Handles an upgraded WebSocket connection for one authenticated member.
///
/// The connection lifecycle:
/// 1. Subscribe the connection.
/// 2. Forward queued frames to the socket from a writer task.
/// 3. Route each text frame the member sends.
/// 4. On disconnect, unsubscribe.
pub async fn handle_socket(
    socket: WebSocket,
    state: Arc<RelayState>,
    member: Member,
    subscription: Subscription,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let conn = state.register(&subscription, tx).await;
    tracing::info!(conn, user = %member.id, ?subscription, "member connected");

    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(conn, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let reader_subscription = subscription.clone();
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    route_text(&reader_state, &member, &reader_subscription, text.as_str()).await;
                }
                Message::Close(_) => {
                    tracing::info!(conn, "received close frame");
                    break;
                }
                _ => {
                    // Binary, ping and pong frames carry nothing for us.
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.unregister(&subscription, conn).await;
    tracing::info!(conn, "connection closed");
}

/// Decodes one client frame, stamps it with the sender's identity, stores
/// it, and delivers it.
async fn route_text(state: &RelayState, member: &Member, subscription: &Subscription, text: &str) {
    let outbound = match codec::decode_outbound(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(user = %member.id, error = %e, "discarding client frame");
            return;
        }
    };

    let (to, key) = match subscription {
        Subscription::Room(room_id) => (None, LogKey::Room(room_id.clone())),
        Subscription::Direct(_) if outbound.to.is_broadcast() => {
            tracing::warn!(user = %member.id, "private frame without recipient");
            return;
        }
        Subscription::Direct(_) => (Some(outbound.to), LogKey::pair(member.id, outbound.to)),
    };

    let record = HistoryRecord {
        id: state.history.next_id(),
        from: member.id,
        user_name: Some(member.name.clone()),
        user_avatar: Some(member.avatar.clone()),
        content: outbound.content.trim().to_string(),
        created_at: Utc::now(),
    };
    let frame = InboundFrame {
        id: Some(record.id),
        from: record.from,
        to,
        user_name: record.user_name.clone(),
        user_avatar: record.user_avatar.clone(),
        content: record.content.clone(),
        created_at: record.created_at,
    };
    state.history.append(key, record).await;

    let json = match codec::encode_inbound(&frame) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode frame");
            return;
        }
    };

    let recipients = match (subscription, to) {
        (Subscription::Room(room_id), _) => state.subscribers.room(room_id).await,
        (Subscription::Direct(_), Some(peer)) => {
            let mut outboxes = state.subscribers.user(peer).await;
            if peer != member.id {
                outboxes.extend(state.subscribers.user(member.id).await);
            }
            outboxes
        }
        (Subscription::Direct(_), None) => Vec::new(),
    };

    tracing::debug!(
        from = %frame.from,
        id = ?frame.id,
        recipients = recipients.len(),
        "routing message"
    );
    for outbox in recipients {
        let _ = outbox.send(Message::Text(json.clone().into()));
    }
}

/// Starts the server on `addr` with the given [`RelayState`].
///
/// [`RelayState::new`] serves the demo members; [`RelayState::with_config`]
/// takes the members and history cap from the resolved
/// [`crate::config::RelayConfig`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws/chat/room", axum::routing::get(room_socket))
        .route("/ws/chat/private", axum::routing::get(private_socket))
        .route(
            "/api/chat/rooms/{room_id}/messages",
            axum::routing::get(room_history),
        )
        .route(
            "/api/chat/private/{peer_id}/messages",
            axum::routing::get(private_history),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok((bound_addr, handle))
}

/// `GET /ws/chat/room?token=..&room_id=..`
async fn room_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    Query(params): Query<ConnectParams>,
) -> Response {
    let Some(member) = state.authenticate(params.token.as_deref()) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let Some(room_id) = params.room_id.filter(|r| !r.trim().is_empty()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, member, Subscription::Room(room_id)))
}

/// `GET /ws/chat/private?token=..`
async fn private_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    Query(params): Query<ConnectParams>,
) -> Response {
    let Some(member) = state.authenticate(params.token.as_deref()) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let subscription = Subscription::Direct(member.id);
    ws.on_upgrade(move |socket| handle_socket(socket, state, member, subscription))
}

/// `GET /api/chat/rooms/{room_id}/messages?limit=N`
async fn room_history(
    State(state): State<Arc<RelayState>>,
    Path(room_id): Path<String>,
    Query(params): Query<PageParams>,
    headers: HeaderMap,
) -> Response {
    if state.bearer(&headers).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let page = state
        .history
        .recent(&LogKey::Room(room_id), page_size(params.limit))
        .await;
    Json(page).into_response()
}

/// `GET /api/chat/private/{peer_id}/messages?limit=N`
async fn private_history(
    State(state): State<Arc<RelayState>>,
    Path(peer_id): Path<String>,
    Query(params): Query<PageParams>,
    headers: HeaderMap,
) -> Response {
    let Some(member) = state.bearer(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let Ok(peer) = peer_id.parse::<UserId>() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let page = state
        .history
        .recent(&LogKey::pair(member.id, peer), page_size(params.limit))
        .await;
    Json(page).into_response()
}

fn page_size(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite;

    type Client =
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    fn three_members() -> Vec<Member> {
        vec![
            Member::new("alice-token", 1, "alice"),
            Member::new("bob-token", 2, "bob"),
            Member::new("carol-token", 3, "carol"),
        ]
    }

    async fn start_with_members() -> (std::net::SocketAddr, Arc<RelayState>) {
        let state = Arc::new(RelayState::with_config(three_members(), HistoryStore::new()));
        let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
            .await
            .unwrap();
        (addr, state)
    }

    /// Connects and waits until the server has registered the connection.
    async fn connect(addr: std::net::SocketAddr, state: &RelayState, path: &str) -> Client {
        let before = state.connection_count().await;
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}{path}"))
            .await
            .unwrap();
        for _ in 0..200 {
            if state.connection_count().await > before {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        ws
    }

    async fn send_text(ws: &mut Client, text: &str) {
        ws.send(tungstenite::Message::Text(text.into())).await.unwrap();
    }

    async fn recv_frame(ws: &mut Client) -> InboundFrame {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        codec::decode_inbound(msg.to_text().unwrap()).unwrap()
    }

    async fn assert_silent(ws: &mut Client) {
        let next = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
        assert!(next.is_err(), "unexpected frame: {next:?}");
    }

    fn rejected_status(
        result: Result<(Client, tungstenite::handshake::client::Response), tungstenite::Error>,
    ) -> u16 {
        match result {
            Err(tungstenite::Error::Http(response)) => response.status().as_u16(),
            Err(other) => panic!("expected HTTP rejection, got {other}"),
            Ok(_) => panic!("expected HTTP rejection, connection was accepted"),
        }
    }

    // --- RelayState unit tests ---

    #[test]
    fn authenticate_known_token() {
        let state = RelayState::new();
        let member = state.authenticate(Some("alice-token")).unwrap();
        assert_eq!(member.id, UserId::new(1));
        assert!(state.authenticate(Some("nope")).is_none());
        assert!(state.authenticate(None).is_none());
    }

    #[test]
    fn bearer_header_parsing() {
        let state = RelayState::new();
        let mut headers = HeaderMap::new();
        assert!(state.bearer(&headers).is_none());

        headers.insert(header::AUTHORIZATION, "Bearer bob-token".parse().unwrap());
        assert_eq!(state.bearer(&headers).unwrap().name, "bob");

        headers.insert(header::AUTHORIZATION, "bob-token".parse().unwrap());
        assert!(state.bearer(&headers).is_none());
    }

    #[test]
    fn page_size_is_clamped() {
        assert_eq!(page_size(None), DEFAULT_PAGE_SIZE);
        assert_eq!(page_size(Some(0)), 1);
        assert_eq!(page_size(Some(500)), MAX_PAGE_SIZE);
        assert_eq!(page_size(Some(20)), 20);
    }

    // --- End-to-end via server ---

    #[tokio::test]
    async fn unknown_token_is_unauthorized() {
        let (addr, _state) = start_with_members().await;
        let result =
            tokio_tungstenite::connect_async(format!("ws://{addr}/ws/chat/room?token=x&room_id=1"))
                .await;
        assert_eq!(rejected_status(result), 401);
    }

    #[tokio::test]
    async fn missing_room_id_is_bad_request() {
        let (addr, _state) = start_with_members().await;
        let result =
            tokio_tungstenite::connect_async(format!("ws://{addr}/ws/chat/room?token=alice-token"))
                .await;
        assert_eq!(rejected_status(result), 400);
    }

    #[tokio::test]
    async fn room_broadcast_reaches_sender_and_members_only() {
        let (addr, state) = start_with_members().await;
        let mut alice = connect(addr, &state, "/ws/chat/room?token=alice-token&room_id=7").await;
        let mut bob = connect(addr, &state, "/ws/chat/room?token=bob-token&room_id=7").await;
        let mut carol = connect(addr, &state, "/ws/chat/room?token=carol-token&room_id=8").await;

        send_text(&mut alice, r#"{"content":" hi room ","to":0}"#).await;

        for ws in [&mut alice, &mut bob] {
            let frame = recv_frame(ws).await;
            assert_eq!(frame.from, UserId::new(1));
            assert_eq!(frame.to, None);
            assert_eq!(frame.content, "hi room");
            assert_eq!(frame.user_name.as_deref(), Some("alice"));
            assert!(frame.id.is_some());
        }
        assert_silent(&mut carol).await;
    }

    #[tokio::test]
    async fn sender_identity_is_enforced() {
        let (addr, state) = start_with_members().await;
        let mut bob = connect(addr, &state, "/ws/chat/room?token=bob-token&room_id=7").await;

        // A client cannot claim another sender; unknown fields are ignored.
        send_text(&mut bob, r#"{"content":"spoof","to":0,"from":1}"#).await;
        assert_eq!(recv_frame(&mut bob).await.from, UserId::new(2));
    }

    #[tokio::test]
    async fn private_message_reaches_both_ends_only() {
        let (addr, state) = start_with_members().await;
        let mut alice = connect(addr, &state, "/ws/chat/private?token=alice-token").await;
        let mut bob = connect(addr, &state, "/ws/chat/private?token=bob-token").await;
        let mut carol = connect(addr, &state, "/ws/chat/private?token=carol-token").await;

        send_text(&mut alice, r#"{"content":"psst","to":2}"#).await;

        for ws in [&mut bob, &mut alice] {
            let frame = recv_frame(ws).await;
            assert_eq!(frame.from, UserId::new(1));
            assert_eq!(frame.to, Some(UserId::new(2)));
            assert_eq!(frame.content, "psst");
        }
        assert_silent(&mut carol).await;
    }

    #[tokio::test]
    async fn malformed_and_unaddressed_frames_are_dropped() {
        let (addr, state) = start_with_members().await;
        let mut alice = connect(addr, &state, "/ws/chat/private?token=alice-token").await;

        send_text(&mut alice, "not json").await;
        send_text(&mut alice, r#"{"content":"   ","to":2}"#).await;
        send_text(&mut alice, r#"{"content":"nobody","to":0}"#).await;
        assert_silent(&mut alice).await;
        assert_eq!(state.history.len(&LogKey::pair(UserId::new(1), UserId::new(2))).await, 0);
    }

    #[tokio::test]
    async fn routed_messages_are_stored() {
        let (addr, state) = start_with_members().await;
        let mut alice = connect(addr, &state, "/ws/chat/room?token=alice-token&room_id=7").await;

        send_text(&mut alice, r#"{"content":"one"}"#).await;
        send_text(&mut alice, r#"{"content":"two"}"#).await;
        recv_frame(&mut alice).await;
        recv_frame(&mut alice).await;

        let stored = state.history.recent(&LogKey::Room("7".to_string()), 10).await;
        let contents: Vec<&str> = stored.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn close_all_sends_close_code() {
        let (addr, state) = start_with_members().await;
        let mut alice = connect(addr, &state, "/ws/chat/room?token=alice-token&room_id=7").await;

        state.close_all_connections(1012).await;

        let msg = tokio::time::timeout(Duration::from_secs(5), alice.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match msg {
            tungstenite::Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1012),
            other => panic!("expected close frame, got {other:?}"),
        }

        for _ in 0..200 {
            if state.connection_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(state.connection_count().await, 0);
    }
}
