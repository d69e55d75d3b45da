//! A mounted conversation: history, live connection, and rendered list.
//!
//! [`ChatSession`] composes the history loader, connection manager, message
//! list, and send path the way a conversation view uses them:
//!
//! 1. `mount` fetches history and seeds the list, *then* opens the live
//!    connection, so history always precedes live entries.
//! 2. [`next_event`](ChatSession::next_event) drives connection events
//!    through the list and reports what changed.
//! 3. [`send`](ChatSession::send) transmits and appends the optimistic echo.
//! 4. [`switch`](ChatSession::switch) and [`unmount`](ChatSession::unmount)
//!    close the connection intentionally and discard the list.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use url::Url;

use crate::chat::ChatMessage;
use crate::chat::history::{HistoryLoader, HistorySource};
use crate::chat::merge::{MessageList, SelfEchoPolicy};
use crate::chat::send::{SendError, prepare_outbound};
use crate::conversation::{ConversationIdentity, Credentials, UserProfile};
use crate::net::{
    ConnectionEvent, ConnectionManager, ConnectionState, ReconnectConfig, live_endpoint,
};
use crate::transport::{Connector, EndpointError};

/// A non-blocking, user-visible message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Send ignored: nothing to send.
    EmptyInput,
    /// Send rejected: the connection has not been established yet.
    NotConnected,
    /// Send rejected: the connection dropped and is being re-established.
    Reconnecting,
    /// Reconnect attempts are exhausted. Shown once per mount.
    ConnectionLost,
    /// The server ended the conversation with a normal closure. No
    /// reconnect follows. Shown once per mount.
    ClosedByServer,
    /// History could not be loaded; live chat still works.
    HistoryUnavailable,
    /// Send rejected for another reason.
    SendRejected(String),
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyInput => f.write_str("Type a message first."),
            Self::NotConnected => f.write_str("Not connected yet, please wait."),
            Self::Reconnecting => f.write_str("Disconnected, reconnecting..."),
            Self::ConnectionLost => f.write_str("Connection lost. Rejoin the chat to retry."),
            Self::ClosedByServer => {
                f.write_str("The server closed this chat. Rejoin to continue.")
            }
            Self::HistoryUnavailable => f.write_str("Could not load earlier messages."),
            Self::SendRejected(reason) => write!(f, "Message not sent: {reason}"),
        }
    }
}

/// What changed in the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// An entry was appended to the list.
    Appended(ChatMessage),
    /// The connection changed state.
    StateChanged {
        /// The new state.
        state: ConnectionState,
        /// Reconnect attempts since the last open.
        attempt: u32,
    },
    /// A reconnect was scheduled.
    RetryScheduled {
        /// 1-based reconnect attempt.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// Something the user should be told.
    Notice(Notice),
}

/// Everything a session needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base URL of the live endpoints.
    pub ws_url: Url,
    /// Bearer token for the live connection.
    pub credentials: Credentials,
    /// The viewing user.
    pub profile: UserProfile,
    /// Dedup time bucket width.
    pub dedup_window: Duration,
    /// Self-echo handling.
    pub self_echo: SelfEchoPolicy,
    /// Reconnect policy.
    pub reconnect: ReconnectConfig,
    /// Connection event channel capacity.
    pub event_buffer: usize,
}

/// One mounted conversation view.
#[derive(Debug)]
pub struct ChatSession<C, H> {
    config: SessionConfig,
    connector: C,
    history: HistoryLoader<H>,
    list: MessageList,
    connection: Option<ConnectionManager>,
    events: Option<mpsc::Receiver<ConnectionEvent>>,
    queued: VecDeque<SessionEvent>,
    end_reported: bool,
}

impl<C: Connector + Clone, H: HistorySource> ChatSession<C, H> {
    /// Mount a view of `identity`: load history, then open the live
    /// connection.
    ///
    /// A history failure does not fail the mount; it is reported as
    /// [`Notice::HistoryUnavailable`] by the first
    /// [`next_event`](Self::next_event).
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError`] if the configured live base URL is unusable.
    pub async fn mount(
        config: SessionConfig,
        connector: C,
        history: HistoryLoader<H>,
        identity: ConversationIdentity,
    ) -> Result<Self, EndpointError> {
        let list = MessageList::new(
            identity,
            config.profile.id,
            config.self_echo,
            config.dedup_window,
        );
        let mut session = Self {
            config,
            connector,
            history,
            list,
            connection: None,
            events: None,
            queued: VecDeque::new(),
            end_reported: false,
        };
        session.start().await?;
        Ok(session)
    }

    async fn start(&mut self) -> Result<(), EndpointError> {
        let identity = self.list.identity().clone();
        let endpoint = live_endpoint(&self.config.ws_url, &self.config.credentials, &identity)?;

        match self.history.load(&identity, self.config.profile.id).await {
            Ok(messages) => {
                let kept = self.list.seed(messages);
                tracing::info!(conversation = %identity, messages = kept, "history seeded");
            }
            Err(e) => {
                tracing::warn!(conversation = %identity, err = %e, "history unavailable");
                self.list.clear();
                self.queued
                    .push_back(SessionEvent::Notice(Notice::HistoryUnavailable));
            }
        }

        let (manager, events) = ConnectionManager::open(
            endpoint,
            self.connector.clone(),
            self.config.reconnect,
            self.config.event_buffer,
        );
        self.connection = Some(manager);
        self.events = Some(events);
        Ok(())
    }

    /// Wait for the next change.
    ///
    /// Frames that the list filters out (other conversation, self-echo,
    /// duplicate) produce no event. Returns `None` once the connection has
    /// reached a final state and every event has been reported.
    ///
    /// Cancel-safe: dropping the future loses nothing.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            if let Some(event) = self.queued.pop_front() {
                return Some(event);
            }
            let events = self.events.as_mut()?;
            let Some(event) = events.recv().await else {
                self.events = None;
                continue;
            };

            match event {
                ConnectionEvent::Frame(frame) => match self.list.accept_live(frame) {
                    Ok(message) => return Some(SessionEvent::Appended(message.clone())),
                    Err(reason) => {
                        tracing::trace!(?reason, "live frame not appended");
                    }
                },
                ConnectionEvent::StateChanged { state, attempt } => {
                    // Our own closes drop the receiver first, so a final
                    // state seen here was not requested by this session.
                    let notice = match state {
                        ConnectionState::Failed => Some(Notice::ConnectionLost),
                        ConnectionState::Terminated => Some(Notice::ClosedByServer),
                        _ => None,
                    };
                    if let Some(notice) = notice.filter(|_| !self.end_reported) {
                        self.end_reported = true;
                        tracing::info!(
                            conversation = %self.list.identity(),
                            %notice,
                            "connection ended"
                        );
                        self.queued.push_back(SessionEvent::Notice(notice));
                    }
                    return Some(SessionEvent::StateChanged { state, attempt });
                }
                ConnectionEvent::RetryScheduled { attempt, delay } => {
                    return Some(SessionEvent::RetryScheduled { attempt, delay });
                }
            }
        }
    }

    /// Send `text` and append its optimistic echo.
    ///
    /// Returns the appended entry. The caller should clear its input only on
    /// `Ok`.
    ///
    /// # Errors
    ///
    /// Returns [`SendError`]; use [`SendError::notice`] for the user-visible
    /// message. Nothing is transmitted or appended on error.
    pub fn send(&mut self, text: &str) -> Result<ChatMessage, SendError> {
        let (content, frame) = prepare_outbound(text, self.list.identity())?;
        let connection = self.connection.as_ref().ok_or(SendError::NotConnected)?;
        connection.send(&frame)?;

        let message = ChatMessage::optimistic(&self.config.profile, content, Utc::now());
        Ok(self.list.push_optimistic(message).clone())
    }

    /// Switch to another conversation: close the current connection on
    /// purpose, clear the list, and mount `identity` from scratch.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError`] if the configured live base URL is unusable.
    pub async fn switch(&mut self, identity: ConversationIdentity) -> Result<(), EndpointError> {
        tracing::info!(from = %self.list.identity(), to = %identity, "switching conversation");
        self.teardown().await;
        self.list = MessageList::new(
            identity,
            self.config.profile.id,
            self.config.self_echo,
            self.config.dedup_window,
        );
        self.end_reported = false;
        self.start().await
    }

    /// Close the connection on purpose and discard the view.
    pub async fn unmount(mut self) {
        self.teardown().await;
        tracing::info!(conversation = %self.list.identity(), "conversation unmounted");
    }

    async fn teardown(&mut self) {
        // Stop draining first so the supervisor never waits on a full channel.
        self.events = None;
        self.queued.clear();
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
        self.list.clear();
    }

    /// Entries in display order.
    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        self.list.messages()
    }

    /// The mounted conversation.
    #[must_use]
    pub const fn identity(&self) -> &ConversationIdentity {
        self.list.identity()
    }

    /// The viewing user.
    #[must_use]
    pub const fn profile(&self) -> &UserProfile {
        &self.config.profile
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection
            .as_ref()
            .map_or(ConnectionState::Terminated, ConnectionManager::state)
    }
}
