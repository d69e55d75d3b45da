//! Message merge and dedup: the single list a conversation view renders.
//!
//! The list is seeded once with history, then grows by live frames and
//! optimistic echoes in arrival order. Entries are never re-sorted or
//! mutated.
//!
//! A live frame is appended only if it passes, in order:
//! 1. conversation filter: room lists take broadcasts only, direct lists
//!    take frames between the viewing user and the peer
//! 2. self-echo suppression per [`SelfEchoPolicy`]
//! 3. id dedup
//! 4. `(sender, content, bucket)` dedup
//!
//! A message carrying a server id is a duplicate only of the entry with the
//! same server id, or of an id-less entry (optimistic, or a live frame sent
//! without an id) with the same key. Two server messages with distinct ids
//! are always both shown, whatever their text and timing. Id-less messages
//! collapse against any entry with the same key.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use flagchat_proto::frame::InboundFrame;
use flagchat_proto::ids::UserId;

use super::{ChatMessage, DedupKey};
use crate::conversation::ConversationIdentity;

/// Default width of the dedup time bucket.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_millis(1000);

/// Outstanding optimistic sends remembered by [`SelfEchoPolicy::MatchPending`].
const MAX_PENDING: usize = 64;

/// How inbound frames authored by the viewing user are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SelfEchoPolicy {
    /// Drop every live frame whose sender is the viewing user. Their own
    /// messages are shown only through optimistic echoes.
    #[default]
    DropBySender,
    /// Drop a self-authored frame only if it matches an outstanding
    /// optimistic send by content (oldest first). Self-authored frames with
    /// no pending match, such as sends from another tab, are appended.
    MatchPending,
}

impl std::str::FromStr for SelfEchoPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop_by_sender" => Ok(Self::DropBySender),
            "match_pending" => Ok(Self::MatchPending),
            other => Err(format!(
                "unknown self-echo policy {other:?} (expected drop_by_sender or match_pending)"
            )),
        }
    }
}

/// Why a live frame was not appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dropped {
    /// The frame belongs to another conversation.
    OtherConversation,
    /// The frame echoes the viewing user's own send.
    SelfEcho,
    /// An equivalent entry is already displayed.
    Duplicate,
}

/// The rendered message sequence of one conversation.
#[derive(Debug)]
pub struct MessageList {
    identity: ConversationIdentity,
    viewer: UserId,
    policy: SelfEchoPolicy,
    window: Duration,
    entries: Vec<ChatMessage>,
    ids: HashSet<String>,
    server_ids: HashSet<u64>,
    keys: HashSet<DedupKey>,
    anonymous_keys: HashSet<DedupKey>,
    pending: VecDeque<String>,
}

impl MessageList {
    /// Create an empty list for `identity` as seen by `viewer`.
    #[must_use]
    pub fn new(
        identity: ConversationIdentity,
        viewer: UserId,
        policy: SelfEchoPolicy,
        window: Duration,
    ) -> Self {
        Self {
            identity,
            viewer,
            policy,
            window,
            entries: Vec::new(),
            ids: HashSet::new(),
            server_ids: HashSet::new(),
            keys: HashSet::new(),
            anonymous_keys: HashSet::new(),
            pending: VecDeque::new(),
        }
    }

    /// The conversation this list renders.
    #[must_use]
    pub const fn identity(&self) -> &ConversationIdentity {
        &self.identity
    }

    /// Entries in display order.
    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace the contents with `history`, already ordered oldest first.
    ///
    /// History entries collapse by the same rules as live ones, so rows
    /// with distinct server ids are all kept.
    /// Returns the number of entries kept.
    pub fn seed(&mut self, history: Vec<ChatMessage>) -> usize {
        self.clear();
        let total = history.len();
        for message in history {
            if self.is_duplicate(&message) {
                continue;
            }
            self.push(message);
        }
        if self.entries.len() < total {
            tracing::debug!(
                conversation = %self.identity,
                collapsed = total - self.entries.len(),
                "collapsed duplicate history entries"
            );
        }
        self.entries.len()
    }

    /// Offer a live frame. Returns the appended entry, or why it was dropped.
    ///
    /// # Errors
    ///
    /// Returns the [`Dropped`] reason when the frame is not appended. This is
    /// routine filtering, not a failure.
    pub fn accept_live(&mut self, frame: InboundFrame) -> Result<&ChatMessage, Dropped> {
        let belongs = match &self.identity {
            ConversationIdentity::Room { .. } => frame.is_broadcast(),
            ConversationIdentity::Direct { .. } => self.identity.involves(frame.from, frame.to),
        };
        if !belongs {
            return Err(Dropped::OtherConversation);
        }

        if frame.from == self.viewer && self.is_self_echo(&frame.content) {
            tracing::trace!(conversation = %self.identity, "dropped self-echo");
            return Err(Dropped::SelfEcho);
        }

        let message = ChatMessage::from_live(frame, self.viewer);
        if self.is_duplicate(&message) {
            tracing::debug!(id = %message.id, "dropped duplicate live message");
            return Err(Dropped::Duplicate);
        }
        Ok(self.push(message))
    }

    /// Append the optimistic echo of a send. Always appended, even when an
    /// identical text was sent within the same window.
    pub fn push_optimistic(&mut self, message: ChatMessage) -> &ChatMessage {
        if self.policy == SelfEchoPolicy::MatchPending {
            if self.pending.len() == MAX_PENDING {
                self.pending.pop_front();
            }
            self.pending.push_back(message.content.clone());
        }
        self.push(message)
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.ids.clear();
        self.server_ids.clear();
        self.keys.clear();
        self.anonymous_keys.clear();
        self.pending.clear();
    }

    fn is_self_echo(&mut self, content: &str) -> bool {
        match self.policy {
            SelfEchoPolicy::DropBySender => true,
            SelfEchoPolicy::MatchPending => {
                match self.pending.iter().position(|pending| pending == content) {
                    Some(index) => {
                        self.pending.remove(index);
                        true
                    }
                    None => false,
                }
            }
        }
    }

    fn is_duplicate(&self, message: &ChatMessage) -> bool {
        let key = message.dedup_key(self.window);
        match message.server_id {
            Some(id) => self.server_ids.contains(&id) || self.anonymous_keys.contains(&key),
            None => self.ids.contains(&message.id) || self.keys.contains(&key),
        }
    }

    fn push(&mut self, message: ChatMessage) -> &ChatMessage {
        let key = message.dedup_key(self.window);
        self.ids.insert(message.id.clone());
        match message.server_id {
            Some(id) => {
                self.server_ids.insert(id);
            }
            None => {
                self.anonymous_keys.insert(key.clone());
            }
        }
        self.keys.insert(key);
        let index = self.entries.len();
        self.entries.push(message);
        &self.entries[index]
    }
}
