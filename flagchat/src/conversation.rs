//! Conversation identity and the current user's profile.
//!
//! A [`ConversationIdentity`] is the key of one chat stream. Everything the
//! client keeps per conversation (history, live connection, rendered list)
//! is discarded when the identity changes.

use std::fmt;

use flagchat_proto::ids::{RoomId, UserId};

/// What is being chatted about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConversationIdentity {
    /// Group chat scoped by a server-assigned room.
    Room {
        /// The room identifier.
        room_id: RoomId,
    },
    /// One-on-one chat between the viewing user and a peer.
    ///
    /// The live connection for direct chat is per user, not per peer, so
    /// frames for other pairs arrive on it and must be filtered.
    Direct {
        /// The viewing user.
        self_id: UserId,
        /// The counterpart.
        peer_id: UserId,
    },
}

impl ConversationIdentity {
    /// Room conversation for the given room.
    pub fn room(room_id: impl Into<String>) -> Self {
        Self::Room {
            room_id: RoomId::new(room_id),
        }
    }

    /// Direct conversation between `self_id` and `peer_id`.
    #[must_use]
    pub const fn direct(self_id: UserId, peer_id: UserId) -> Self {
        Self::Direct { self_id, peer_id }
    }

    /// Whether this is a room conversation.
    #[must_use]
    pub const fn is_room(&self) -> bool {
        matches!(self, Self::Room { .. })
    }

    /// The room id, for room conversations.
    #[must_use]
    pub const fn room_id(&self) -> Option<&RoomId> {
        match self {
            Self::Room { room_id } => Some(room_id),
            Self::Direct { .. } => None,
        }
    }

    /// The counterpart, for direct conversations.
    #[must_use]
    pub const fn peer_id(&self) -> Option<UserId> {
        match self {
            Self::Room { .. } => None,
            Self::Direct { peer_id, .. } => Some(*peer_id),
        }
    }

    /// Whether a direct frame `from -> to` belongs to this conversation.
    ///
    /// Matches `(peer, self)` and `(self, peer)`. Always `false` for rooms.
    #[must_use]
    pub fn involves(&self, from: UserId, to: Option<UserId>) -> bool {
        match self {
            Self::Room { .. } => false,
            Self::Direct { self_id, peer_id } => {
                let Some(to) = to else {
                    return false;
                };
                (from == *peer_id && to == *self_id) || (from == *self_id && to == *peer_id)
            }
        }
    }
}

impl fmt::Display for ConversationIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Room { room_id } => write!(f, "# {room_id}"),
            Self::Direct { peer_id, .. } => write!(f, "@ {peer_id}"),
        }
    }
}

/// The viewing user as known to the identity provider.
///
/// Used to build optimistic echoes, which have no server copy to take the
/// author's name and avatar from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    /// The user's id.
    pub id: UserId,
    /// Display name.
    pub name: String,
    /// Avatar URL (may be empty).
    pub avatar: String,
}

/// Bearer token used for both the history endpoint and the live connection.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    token: String,
}

impl Credentials {
    /// Wraps a bearer token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// The raw token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credentials(<redacted>)")
    }
}
