//! In-memory message history for the relay's history endpoints.
//!
//! The [`HistoryStore`] holds one capped FIFO log per conversation. Every
//! message the relay routes is appended before delivery, so a client that
//! mounts later sees it in its history page.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use flagchat_proto::history::HistoryRecord;
use flagchat_proto::ids::UserId;
use tokio::sync::RwLock;

/// Default maximum number of stored messages per conversation.
pub const DEFAULT_HISTORY_CAP: usize = 1000;

/// Which log a message belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogKey {
    /// A room's shared log.
    Room(String),
    /// The log of a direct pair, independent of direction.
    Pair(UserId, UserId),
}

impl LogKey {
    /// Key for the direct conversation between `a` and `b`.
    #[must_use]
    pub fn pair(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self::Pair(a, b)
        } else {
            Self::Pair(b, a)
        }
    }
}

/// Per-conversation message logs with FIFO eviction.
///
/// Thread-safe via [`RwLock`]. Also hands out message ids, which are unique
/// across all logs and increase in append order.
pub struct HistoryStore {
    logs: RwLock<HashMap<LogKey, VecDeque<HistoryRecord>>>,
    next_id: AtomicU64,
    cap: usize,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryStore {
    /// Creates an empty store with the default cap.
    #[must_use]
    pub fn new() -> Self {
        Self::with_cap(DEFAULT_HISTORY_CAP)
    }

    /// Creates an empty store keeping at most `cap` messages per log.
    #[must_use]
    pub fn with_cap(cap: usize) -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            cap: cap.max(1),
        }
    }

    /// Reserves the next message id.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Appends `record` to the log for `key`, evicting the oldest entry when
    /// the cap is exceeded. Returns the new log length.
    pub async fn append(&self, key: LogKey, record: HistoryRecord) -> usize {
        let mut logs = self.logs.write().await;
        let log = logs.entry(key).or_default();
        log.push_back(record);
        if log.len() > self.cap {
            log.pop_front();
        }
        log.len()
    }

    /// The most recent `limit` messages of `key`, oldest first.
    pub async fn recent(&self, key: &LogKey, limit: usize) -> Vec<HistoryRecord> {
        let logs = self.logs.read().await;
        logs.get(key).map_or_else(Vec::new, |log| {
            let skip = log.len().saturating_sub(limit);
            log.iter().skip(skip).cloned().collect()
        })
    }

    /// Number of messages stored for `key`.
    pub async fn len(&self, key: &LogKey) -> usize {
        let logs = self.logs.read().await;
        logs.get(key).map_or(0, VecDeque::len)
    }
}
