//! History loader: the one-shot fetch performed when a conversation mounts.
//!
//! A [`HistorySource`] returns the raw page for a conversation;
//! [`HistoryLoader`] turns it into [`ChatMessage`]s with
//! [`Origin::History`](super::Origin::History), oldest first, bounded to the
//! configured page size.
//!
//! Failure never blocks the live connection: the session shows an empty
//! history and a notice instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use flagchat_proto::codec::FrameError;
use flagchat_proto::history::{self, HistoryPage, HistoryRecord};
use flagchat_proto::ids::UserId;
use parking_lot::Mutex;
use url::Url;

use super::ChatMessage;
use crate::conversation::{ConversationIdentity, Credentials};
use crate::transport::{EndpointError, endpoint};

/// Page size used when none is configured.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Largest page size the client will request.
pub const MAX_HISTORY_LIMIT: usize = 100;

/// Errors that can occur while fetching history.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// The request could not be sent or the response not read.
    #[error("history request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("history endpoint returned HTTP {0}")]
    Status(u16),

    /// The body was not a history page.
    #[error("invalid history body: {0}")]
    Decode(#[from] FrameError),

    /// The configured API base cannot be used.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    /// The source is unavailable for another reason.
    #[error("history unavailable: {0}")]
    Unavailable(String),
}

/// Something that can fetch a history page.
pub trait HistorySource: Send + Sync + 'static {
    /// Fetch up to `limit` of the most recent records for `identity`.
    fn fetch(
        &self,
        identity: &ConversationIdentity,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<HistoryPage, HistoryError>> + Send;
}

/// History over HTTP with bearer authentication.
#[derive(Debug, Clone)]
pub struct HttpHistorySource {
    client: reqwest::Client,
    api_base: Url,
    credentials: Credentials,
}

impl HttpHistorySource {
    /// Create a source for `api_base` whose requests time out after
    /// `request_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Transport`] if the HTTP client cannot be built.
    pub fn new(
        api_base: Url,
        credentials: Credentials,
        request_timeout: Duration,
    ) -> Result<Self, HistoryError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            api_base,
            credentials,
        })
    }

    /// URL of the history page for `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError`] if the API base cannot carry a path.
    pub fn page_url(
        &self,
        identity: &ConversationIdentity,
        limit: usize,
    ) -> Result<Url, EndpointError> {
        let (scope, key) = match identity {
            ConversationIdentity::Room { room_id } => ("rooms", room_id.to_string()),
            ConversationIdentity::Direct { peer_id, .. } => ("private", peer_id.to_string()),
        };
        let segments = ["api", "chat", scope, key.as_str(), "messages"];
        let mut url = endpoint(&self.api_base, segments)?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string());
        Ok(url)
    }
}

impl HistorySource for HttpHistorySource {
    async fn fetch(
        &self,
        identity: &ConversationIdentity,
        limit: usize,
    ) -> Result<HistoryPage, HistoryError> {
        let url = self.page_url(identity, limit)?;
        tracing::debug!(path = url.path(), limit, "fetching history");

        let response = self
            .client
            .get(url)
            .bearer_auth(self.credentials.token())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(HistoryError::Status(status.as_u16()));
        }
        let body = response.text().await?;
        Ok(history::decode_page(&body)?)
    }
}

/// In-memory history, for tests and offline use.
///
/// Answers like the server would: the most recent `limit` records, oldest
/// first. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct StaticHistorySource {
    inner: Arc<Mutex<StaticInner>>,
}

#[derive(Debug, Default)]
struct StaticInner {
    pages: HashMap<ConversationIdentity, Vec<HistoryRecord>>,
    failing: bool,
    requests: usize,
}

impl StaticHistorySource {
    /// Create an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored records for `identity`.
    pub fn insert(&self, identity: ConversationIdentity, records: Vec<HistoryRecord>) {
        self.inner.lock().pages.insert(identity, records);
    }

    /// Make every fetch fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.inner.lock().failing = failing;
    }

    /// Number of fetches so far.
    #[must_use]
    pub fn requests(&self) -> usize {
        self.inner.lock().requests
    }
}

impl HistorySource for StaticHistorySource {
    async fn fetch(
        &self,
        identity: &ConversationIdentity,
        limit: usize,
    ) -> Result<HistoryPage, HistoryError> {
        let mut inner = self.inner.lock();
        inner.requests += 1;
        if inner.failing {
            return Err(HistoryError::Unavailable("static source set to fail".into()));
        }
        let mut records = inner.pages.get(identity).cloned().unwrap_or_default();
        drop(inner);

        records.sort_by_key(|r| r.created_at);
        let skip = records.len().saturating_sub(limit);
        Ok(HistoryPage {
            records: records.split_off(skip),
            skipped: 0,
        })
    }
}

/// Turns a history page into display-ready messages.
#[derive(Debug, Clone)]
pub struct HistoryLoader<H> {
    source: H,
    limit: usize,
}

impl<H: HistorySource> HistoryLoader<H> {
    /// Create a loader. `limit` is clamped to `1..=MAX_HISTORY_LIMIT`.
    pub fn new(source: H, limit: usize) -> Self {
        Self {
            source,
            limit: limit.clamp(1, MAX_HISTORY_LIMIT),
        }
    }

    /// The effective page size.
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Fetch history for `identity` as seen by `viewer`.
    ///
    /// The result is sorted oldest first (stable for equal timestamps) and
    /// holds at most [`limit`](Self::limit) of the most recent messages. An
    /// empty conversation yields an empty vec.
    ///
    /// # Errors
    ///
    /// Returns the source's [`HistoryError`]; callers degrade to an empty
    /// history rather than failing the view.
    pub async fn load(
        &self,
        identity: &ConversationIdentity,
        viewer: UserId,
    ) -> Result<Vec<ChatMessage>, HistoryError> {
        let page = self.source.fetch(identity, self.limit).await?;
        if page.skipped > 0 {
            tracing::warn!(
                conversation = %identity,
                skipped = page.skipped,
                "skipped malformed history records"
            );
        }

        let mut records = page.records;
        records.sort_by_key(|r| r.created_at);
        let skip = records.len().saturating_sub(self.limit);

        let messages: Vec<ChatMessage> = records
            .into_iter()
            .skip(skip)
            .map(|r| ChatMessage::from_history(r, viewer))
            .collect();
        tracing::debug!(conversation = %identity, count = messages.len(), "history loaded");
        Ok(messages)
    }
}
