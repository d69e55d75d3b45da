//! Connection manager: one live connection per mounted conversation.
//!
//! [`ConnectionManager::open`] spawns a supervisor task that dials the live
//! endpoint through a [`Connector`], forwards decoded frames, and
//! re-establishes the connection after unexpected closures with bounded
//! exponential backoff. The owner observes everything through a
//! [`ConnectionEvent`] channel.
//!
//! # Architecture
//!
//! ```text
//! ChatSession ──── send() ─────►  ConnectionManager ── outbound ──► supervisor ──► Link
//!             ◄── ConnectionEvent ───────────────────────────────── supervisor ◄── Link
//! ```
//!
//! The reconnect policy itself lives in [`ReconnectMachine`], which does no
//! I/O and is tested on its own.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use flagchat_proto::codec::{self, FrameError};
use flagchat_proto::frame::{InboundFrame, OutboundFrame};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use url::Url;

use crate::conversation::{ConversationIdentity, Credentials};
use crate::transport::{
    Connector, EndpointError, Link, LinkCommand, LinkEvent, NORMAL_CLOSURE, endpoint,
};

/// Default capacity of the connection event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 64;

/// How long [`ConnectionManager::close`] waits for the supervisor to finish
/// before aborting it.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Reconnect policy parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Reconnect attempts allowed after a failure before giving up.
    pub max_attempts: u32,
    /// Bound on a single connection attempt. A timeout counts as a failure.
    pub open_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            max_attempts: 5,
            open_timeout: Duration::from_secs(10),
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect attempt `attempt` (1-based):
    /// `min(base_delay * 2^(attempt - 1), max_delay)`.
    ///
    /// Attempt 0 is treated like attempt 1.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Lifecycle state of the live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, not yet mounted.
    Idle,
    /// A connection attempt is in flight.
    Connecting,
    /// The connection is established; frames flow both ways.
    Open,
    /// The connection failed or dropped; a retry may be pending.
    Closed,
    /// Intentionally closed. Absorbing.
    Terminated,
    /// Reconnect attempts exhausted. Absorbing.
    Failed,
}

impl ConnectionState {
    /// Whether no further transitions can happen.
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Inputs that drive the [`ReconnectMachine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// The owning view mounted.
    Mount,
    /// The connection attempt succeeded.
    Opened,
    /// The connection attempt failed or timed out.
    ConnectFailed,
    /// An open connection ended. `code` is the close code, if any.
    Dropped {
        /// Close code sent by the server.
        code: Option<u16>,
    },
    /// A scheduled retry delay elapsed.
    RetryDue,
    /// The owner closed the connection on purpose.
    Close,
}

/// What to do after entering [`ConnectionState::Closed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Wait `delay`, then attempt reconnect number `attempt`.
    Retry {
        /// 1-based reconnect attempt number.
        attempt: u32,
        /// Backoff delay before the attempt.
        delay: Duration,
    },
    /// Attempts are exhausted; the machine is now [`ConnectionState::Failed`].
    Failed,
}

/// The reconnect state machine, free of I/O.
///
/// ```text
/// Idle ─Mount─► Connecting ─Opened─► Open ─Dropped(≠1000)─► Closed
///                  ▲   └─ConnectFailed─────────────────────►  │
///                  └──────────RetryDue◄── schedule(): Retry ──┤
///                                         schedule(): Failed ─┴─► Failed
/// any non-final ─Close─► Terminated      Open ─Dropped(1000)─► Terminated
/// ```
#[derive(Debug, Clone)]
pub struct ReconnectMachine {
    config: ReconnectConfig,
    state: ConnectionState,
    attempt: u32,
    retry_pending: bool,
}

impl ReconnectMachine {
    /// Create a machine in [`ConnectionState::Idle`].
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Idle,
            attempt: 0,
            retry_pending: false,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reconnect attempts made since the last successful open.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Apply `input`. Returns the new state, or `None` if the input has no
    /// effect in the current state.
    pub fn apply(&mut self, input: Input) -> Option<ConnectionState> {
        use ConnectionState as S;

        let next = match (self.state, input) {
            (S::Idle, Input::Mount) => S::Connecting,
            (S::Connecting, Input::Opened) => {
                self.attempt = 0;
                S::Open
            }
            (S::Connecting, Input::ConnectFailed) => S::Closed,
            (S::Open, Input::Dropped { code }) if code == Some(NORMAL_CLOSURE) => S::Terminated,
            (S::Open, Input::Dropped { .. }) => S::Closed,
            (S::Closed, Input::RetryDue) if self.retry_pending => {
                self.retry_pending = false;
                S::Connecting
            }
            (S::Idle | S::Connecting | S::Open | S::Closed, Input::Close) => S::Terminated,
            _ => return None,
        };
        self.state = next;
        Some(next)
    }

    /// Decide what follows a closure. Only meaningful in
    /// [`ConnectionState::Closed`] with no retry already scheduled;
    /// returns `None` otherwise.
    pub fn schedule(&mut self) -> Option<Step> {
        if self.state != ConnectionState::Closed || self.retry_pending {
            return None;
        }
        if self.attempt >= self.config.max_attempts {
            self.state = ConnectionState::Failed;
            return Some(Step::Failed);
        }
        self.attempt += 1;
        self.retry_pending = true;
        Some(Step::Retry {
            attempt: self.attempt,
            delay: self.config.backoff_delay(self.attempt),
        })
    }
}

/// Events emitted by a [`ConnectionManager`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The connection moved to a new state.
    StateChanged {
        /// The new state.
        state: ConnectionState,
        /// Reconnect attempts made since the last successful open.
        attempt: u32,
    },
    /// A reconnect attempt was scheduled.
    RetryScheduled {
        /// 1-based reconnect attempt number.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// A well-formed frame arrived while open.
    Frame(InboundFrame),
}

/// Errors from [`ConnectionManager::send`].
#[derive(Debug, thiserror::Error)]
pub enum TransmitError {
    /// The connection is not open.
    #[error("connection is {state}")]
    NotOpen {
        /// State at the time of the call.
        state: ConnectionState,
        /// Reconnect attempts since the last open.
        attempt: u32,
    },

    /// The frame could not be encoded.
    #[error("cannot encode frame: {0}")]
    Encode(#[from] FrameError),

    /// The supervisor task is gone.
    #[error("connection supervisor stopped")]
    Closed,
}

/// Build the live endpoint for `identity`.
///
/// Room conversations connect to `/ws/chat/room?token=..&room_id=..`;
/// direct conversations share one per-user endpoint,
/// `/ws/chat/private?token=..`.
///
/// # Errors
///
/// Returns [`EndpointError`] if `ws_base` cannot carry a path.
pub fn live_endpoint(
    ws_base: &Url,
    credentials: &Credentials,
    identity: &ConversationIdentity,
) -> Result<Url, EndpointError> {
    let kind = if identity.is_room() { "room" } else { "private" };
    let mut url = endpoint(ws_base, ["ws", "chat", kind])?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("token", credentials.token());
        if let Some(room_id) = identity.room_id() {
            query.append_pair("room_id", room_id.as_str());
        }
    }
    Ok(url)
}

/// State shared between the manager handle and its supervisor.
#[derive(Debug)]
struct Shared {
    state: ConnectionState,
    attempt: u32,
}

/// Owns one live connection and keeps it alive.
///
/// Dropping the manager is an intentional close.
#[derive(Debug)]
pub struct ConnectionManager {
    shared: Arc<Mutex<Shared>>,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Mount: start connecting to `endpoint` and return the manager with its
    /// event stream.
    ///
    /// The stream ends after the connection reaches a final state.
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn open<C: Connector>(
        endpoint: Url,
        connector: C,
        config: ReconnectConfig,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let shared = Arc::new(Mutex::new(Shared {
            state: ConnectionState::Idle,
            attempt: 0,
        }));
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(event_buffer.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let supervisor = Supervisor {
            endpoint,
            connector,
            config,
            machine: ReconnectMachine::new(config),
            shared: Arc::clone(&shared),
            outbound: out_rx,
            events: event_tx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(supervisor.run());

        let manager = Self {
            shared,
            outbound: out_tx,
            shutdown: shutdown_tx,
            task: Some(task),
        };
        (manager, event_rx)
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Queue `frame` for transmission on the open connection.
    ///
    /// Never blocks and never queues across connections: a frame accepted
    /// here but not yet written when the connection drops is discarded.
    ///
    /// # Errors
    ///
    /// [`TransmitError::NotOpen`] unless the state is
    /// [`ConnectionState::Open`]; [`TransmitError::Encode`] if the frame is
    /// invalid.
    pub fn send(&self, frame: &OutboundFrame) -> Result<(), TransmitError> {
        let shared = self.shared.lock();
        if shared.state != ConnectionState::Open {
            return Err(TransmitError::NotOpen {
                state: shared.state,
                attempt: shared.attempt,
            });
        }
        let text = codec::encode_outbound(frame)?;
        self.outbound.send(text).map_err(|_| TransmitError::Closed)
    }

    /// Intentionally close the connection (close code 1000). No reconnect
    /// follows.
    ///
    /// Waits briefly for the supervisor to finish, then aborts it.
    pub async fn close(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(mut task) = self.task.take()
            && tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err()
        {
            tracing::warn!("connection supervisor did not stop in time; aborting");
            task.abort();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Why an open connection stopped being serviced.
enum Ended {
    Shutdown,
    Dropped(Option<u16>),
}

/// Background task owning the connection lifecycle.
struct Supervisor<C> {
    endpoint: Url,
    connector: C,
    config: ReconnectConfig,
    machine: ReconnectMachine,
    shared: Arc<Mutex<Shared>>,
    outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::Sender<ConnectionEvent>,
    shutdown: watch::Receiver<bool>,
}

/// Resolves once shutdown is requested or the manager is dropped.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

impl<C: Connector> Supervisor<C> {
    async fn run(mut self) {
        self.advance(Input::Mount).await;

        loop {
            // Connecting.
            let result = tokio::select! {
                biased;
                () = stopped(&mut self.shutdown) => return self.terminate(),
                result = tokio::time::timeout(
                    self.config.open_timeout,
                    self.connector.connect(&self.endpoint),
                ) => result,
            };

            match result {
                Ok(Ok(link)) => {
                    self.advance(Input::Opened).await;
                    match self.service(link).await {
                        Ended::Shutdown => return self.terminate(),
                        Ended::Dropped(code) => {
                            tracing::info!(?code, "live connection dropped");
                            self.advance(Input::Dropped { code }).await;
                        }
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(err = %e, attempt = self.machine.attempt(), "connect failed");
                    self.advance(Input::ConnectFailed).await;
                }
                Err(_) => {
                    tracing::warn!(
                        timeout_ms = self.config.open_timeout.as_millis(),
                        "connect timed out"
                    );
                    self.advance(Input::ConnectFailed).await;
                }
            }

            if self.machine.state().is_final() {
                return;
            }

            // Closed.
            match self.machine.schedule() {
                Some(Step::Retry { attempt, delay }) => {
                    tracing::info!(attempt, delay_ms = delay.as_millis(), "reconnect scheduled");
                    let _ = self
                        .events
                        .send(ConnectionEvent::RetryScheduled { attempt, delay })
                        .await;
                    tokio::select! {
                        biased;
                        () = stopped(&mut self.shutdown) => return self.terminate(),
                        () = tokio::time::sleep(delay) => {}
                    }
                    self.advance(Input::RetryDue).await;
                }
                Some(Step::Failed) => {
                    tracing::warn!(
                        max_attempts = self.config.max_attempts,
                        "reconnect attempts exhausted"
                    );
                    self.publish();
                    let _ = self.events.send(self.state_event()).await;
                    return;
                }
                None => return,
            }
        }
    }

    /// Pump frames both ways until the link ends or shutdown is requested.
    async fn service(&mut self, link: Link) -> Ended {
        let Link {
            outbound: link_tx,
            inbound: mut link_rx,
        } = link;

        loop {
            tokio::select! {
                biased;
                () = stopped(&mut self.shutdown) => {
                    let _ = link_tx.send(LinkCommand::Close);
                    return Ended::Shutdown;
                }
                event = link_rx.recv() => match event {
                    Some(LinkEvent::Text(text)) => self.deliver(&text).await,
                    Some(LinkEvent::Closed { code }) => return Ended::Dropped(code),
                    None => return Ended::Dropped(None),
                },
                Some(text) = self.outbound.recv() => {
                    if link_tx.send(LinkCommand::Text(text)).is_err() {
                        return Ended::Dropped(None);
                    }
                }
            }
        }
    }

    /// Decode one frame and forward it; malformed frames are discarded.
    async fn deliver(&self, text: &str) {
        match codec::decode_inbound(text) {
            Ok(frame) => {
                let _ = self.events.send(ConnectionEvent::Frame(frame)).await;
            }
            Err(e) => {
                tracing::warn!(err = %e, len = text.len(), "discarding malformed frame");
            }
        }
    }

    /// Apply `input` and announce the resulting state.
    async fn advance(&mut self, input: Input) {
        if self.machine.apply(input).is_some() {
            self.publish();
            let _ = self.events.send(self.state_event()).await;
        }
    }

    /// Intentional close from any non-final state. Uses `try_send` because
    /// the owner may no longer be draining events.
    fn terminate(&mut self) {
        if self.machine.apply(Input::Close).is_some() {
            self.publish();
            let _ = self.events.try_send(self.state_event());
        }
    }

    /// Copy the machine state into the shared cell. Leaving `Open` discards
    /// frames queued for the old connection under the same lock `send` takes.
    fn publish(&mut self) {
        let state = self.machine.state();
        let attempt = self.machine.attempt();
        let mut shared = self.shared.lock();
        let left_open = shared.state == ConnectionState::Open && state != ConnectionState::Open;
        shared.state = state;
        shared.attempt = attempt;
        if left_open {
            let mut discarded = 0usize;
            while self.outbound.try_recv().is_ok() {
                discarded += 1;
            }
            if discarded > 0 {
                tracing::debug!(discarded, "dropped unsent frames from previous connection");
            }
        }
        drop(shared);
        tracing::info!(%state, attempt, "connection state changed");
    }

    fn state_event(&self) -> ConnectionEvent {
        ConnectionEvent::StateChanged {
            state: self.machine.state(),
            attempt: self.machine.attempt(),
        }
    }
}
