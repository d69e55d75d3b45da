//! Live subscriber registry for the relay server.
//!
//! Tracks which open connections receive which frames: room subscribers by
//! room id, and direct subscribers by user id. A user may hold several
//! connections at once (tabs); each gets its own [`ConnId`].
//!
//! Entries are ephemeral and vanish when the connection closes.

use std::collections::HashMap;

use axum::extract::ws::Message;
use flagchat_proto::ids::UserId;
use tokio::sync::{RwLock, mpsc};

/// Identifies one open connection.
pub type ConnId = u64;

/// Channel to one connection's writer task.
pub type Outbox = mpsc::UnboundedSender<Message>;

/// Where a connection is subscribed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    /// Room broadcasts for one room.
    Room(String),
    /// Direct messages to and from one user.
    Direct(UserId),
}

/// In-memory map of live subscribers.
///
/// Thread-safe via [`RwLock`].
#[derive(Default)]
pub struct Subscribers {
    rooms: RwLock<HashMap<String, HashMap<ConnId, Outbox>>>,
    direct: RwLock<HashMap<UserId, HashMap<ConnId, Outbox>>>,
}

impl Subscribers {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds connection `conn` under `subscription`.
    pub async fn subscribe(&self, subscription: &Subscription, conn: ConnId, outbox: Outbox) {
        match subscription {
            Subscription::Room(room_id) => {
                let mut rooms = self.rooms.write().await;
                rooms.entry(room_id.clone()).or_default().insert(conn, outbox);
            }
            Subscription::Direct(user) => {
                let mut direct = self.direct.write().await;
                direct.entry(*user).or_default().insert(conn, outbox);
            }
        }
    }

    /// Removes connection `conn`. Empty entries are dropped.
    pub async fn unsubscribe(&self, subscription: &Subscription, conn: ConnId) {
        match subscription {
            Subscription::Room(room_id) => {
                let mut rooms = self.rooms.write().await;
                if let Some(members) = rooms.get_mut(room_id) {
                    members.remove(&conn);
                    if members.is_empty() {
                        rooms.remove(room_id);
                    }
                }
            }
            Subscription::Direct(user) => {
                let mut direct = self.direct.write().await;
                if let Some(conns) = direct.get_mut(user) {
                    conns.remove(&conn);
                    if conns.is_empty() {
                        direct.remove(user);
                    }
                }
            }
        }
    }

    /// Outboxes of every connection subscribed to `room_id`.
    pub async fn room(&self, room_id: &str) -> Vec<Outbox> {
        let rooms = self.rooms.read().await;
        rooms
            .get(room_id)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Outboxes of every direct connection of `user`.
    pub async fn user(&self, user: UserId) -> Vec<Outbox> {
        let direct = self.direct.read().await;
        direct
            .get(&user)
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of connections subscribed to `room_id`.
    pub async fn room_size(&self, room_id: &str) -> usize {
        self.rooms.read().await.get(room_id).map_or(0, HashMap::len)
    }
}
