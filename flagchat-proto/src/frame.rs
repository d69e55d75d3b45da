//! Live-transport frame types.
//!
//! A single WebSocket connection carries [`InboundFrame`]s from the server
//! and [`OutboundFrame`]s from the client, each as one JSON text frame.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::ids::UserId;

/// Maximum accepted message content size in bytes (8 KB).
pub const MAX_CONTENT_SIZE: usize = 8 * 1024;

/// A message pushed by the server over the live connection.
///
/// Room frames carry no recipient (`to` absent or `0`); direct frames name
/// the intended recipient. The server delivers direct frames to both ends of
/// the pair, and room frames to every subscriber including the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundFrame {
    /// Server-assigned message id, when the server provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// Author of the message.
    pub from: UserId,
    /// Intended recipient for direct messages; `None` for room broadcasts.
    #[serde(
        default,
        deserialize_with = "recipient",
        skip_serializing_if = "Option::is_none"
    )]
    pub to: Option<UserId>,
    /// Author display name at send time.
    #[serde(default)]
    pub user_name: Option<String>,
    /// Author avatar URL at send time.
    #[serde(default)]
    pub user_avatar: Option<String>,
    /// Plain text body.
    pub content: String,
    /// Authoritative server timestamp.
    pub created_at: DateTime<Utc>,
}

impl InboundFrame {
    /// Whether this frame is a room broadcast rather than a direct message.
    #[must_use]
    pub const fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }
}

/// A message sent by the client over the live connection.
///
/// `to` is [`UserId::BROADCAST`] for room conversations, which the server
/// interprets as "the room this connection is subscribed to".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundFrame {
    /// Plain text body, already trimmed.
    pub content: String,
    /// Recipient, or `0` for the current room.
    #[serde(default = "broadcast")]
    pub to: UserId,
}

impl OutboundFrame {
    /// A frame broadcast to the connection's room.
    pub fn to_room(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            to: UserId::BROADCAST,
        }
    }

    /// A frame addressed to a single peer.
    pub fn direct(content: impl Into<String>, peer: UserId) -> Self {
        Self {
            content: content.into(),
            to: peer,
        }
    }
}

const fn broadcast() -> UserId {
    UserId::BROADCAST
}

/// Reads an optional recipient, folding the `0` sentinel into `None`.
fn recipient<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<UserId>, D::Error> {
    Ok(Option::<UserId>::deserialize(deserializer)?.filter(|id| !id.is_broadcast()))
}
