//! The displayed chat message and its dedup key.

use std::time::Duration;

use chrono::{DateTime, Utc};
use flagchat_proto::frame::InboundFrame;
use flagchat_proto::history::HistoryRecord;
use flagchat_proto::ids::UserId;
use uuid::Uuid;

use crate::conversation::UserProfile;

/// Where a [`ChatMessage`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Fetched once at mount by the history loader.
    History,
    /// Pushed by the server over the live connection.
    Live,
    /// Synthesized locally at send time.
    Optimistic,
}

/// One entry of a rendered conversation. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Unique within the rendered conversation.
    pub id: String,
    /// Id assigned by the server, when known. Optimistic entries and live
    /// frames sent without an id have none.
    pub server_id: Option<u64>,
    /// Author.
    pub sender_id: UserId,
    /// Author display name at send time.
    pub sender_name: String,
    /// Author avatar URL at send time (may be empty).
    pub sender_avatar: String,
    /// Plain text body.
    pub content: String,
    /// Server time for history and live entries, client clock for
    /// optimistic ones. Never reconciled.
    pub created_at: DateTime<Utc>,
    /// Whether the viewing user is the author.
    pub is_me: bool,
    /// Where this entry came from.
    pub origin: Origin,
}

/// Practical identity of a message for duplicate collapsing:
/// same author, same text, same coarse time window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    /// Author.
    pub sender: UserId,
    /// Plain text body.
    pub content: String,
    /// `created_at` in milliseconds divided by the window length.
    pub bucket: i64,
}

impl ChatMessage {
    /// Build a history entry. Missing names fall back to the numeric id.
    #[must_use]
    pub fn from_history(record: HistoryRecord, viewer: UserId) -> Self {
        Self {
            id: format!("h-{}-{}", record.id, record.created_at.timestamp_millis()),
            server_id: Some(record.id),
            sender_name: record
                .user_name
                .unwrap_or_else(|| record.from.to_string()),
            sender_avatar: record.user_avatar.unwrap_or_default(),
            is_me: record.from == viewer,
            sender_id: record.from,
            content: record.content,
            created_at: record.created_at,
            origin: Origin::History,
        }
    }

    /// Build a live entry from a decoded frame.
    #[must_use]
    pub fn from_live(frame: InboundFrame, viewer: UserId) -> Self {
        let id = match frame.id {
            Some(server_id) => format!("l-{server_id}"),
            None => format!("l-{}-{}", frame.from, frame.created_at.timestamp_millis()),
        };
        Self {
            id,
            server_id: frame.id,
            sender_name: frame.user_name.unwrap_or_else(|| frame.from.to_string()),
            sender_avatar: frame.user_avatar.unwrap_or_default(),
            is_me: frame.from == viewer,
            sender_id: frame.from,
            content: frame.content,
            created_at: frame.created_at,
            origin: Origin::Live,
        }
    }

    /// Build an optimistic echo of the viewing user's own message.
    #[must_use]
    pub fn optimistic(profile: &UserProfile, content: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: format!("o-{}", Uuid::now_v7()),
            server_id: None,
            sender_id: profile.id,
            sender_name: profile.name.clone(),
            sender_avatar: profile.avatar.clone(),
            content: content.into(),
            created_at: now,
            is_me: true,
            origin: Origin::Optimistic,
        }
    }

    /// Dedup key for a window of `window` (clamped to at least 1 ms).
    #[must_use]
    pub fn dedup_key(&self, window: Duration) -> DedupKey {
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX).max(1);
        DedupKey {
            sender: self.sender_id,
            content: self.content.clone(),
            bucket: self.created_at.timestamp_millis().div_euclid(window_ms),
        }
    }
}
