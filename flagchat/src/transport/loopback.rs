//! Loopback transport for testing.
//!
//! [`LoopbackConnector`] dials in-process channel pairs instead of sockets.
//! Each accepted connection shows up on the paired [`LoopbackServer`] as a
//! [`LoopbackPeer`], which plays the server side: it pushes frames to the
//! client, reads what the client sent, and closes with any code.
//!
//! Connection outcomes are scriptable so reconnect behavior can be driven
//! deterministically: accept, refuse, or hang forever (to exercise the
//! open-timeout watchdog).

use std::collections::VecDeque;
use std::sync::Arc;

use flagchat_proto::codec;
use flagchat_proto::frame::InboundFrame;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use url::Url;

use super::{Connector, Link, LinkCommand, LinkEvent, TransportError};

/// Capacity of the server-to-client channel of each loopback connection.
const INBOUND_BUFFER: usize = 64;

/// What the connector does on one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Establish the connection and hand the server side to the
    /// [`LoopbackServer`].
    Accept,
    /// Fail immediately with [`TransportError::Unreachable`].
    Refuse,
    /// Never complete.
    Hang,
}

#[derive(Debug)]
struct Script {
    queued: VecDeque<Behavior>,
    fallback: Behavior,
    attempts: usize,
    urls: Vec<Url>,
}

/// In-process [`Connector`] with scriptable outcomes.
///
/// Clones share the same script and server.
#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    script: Arc<Mutex<Script>>,
    accepted: mpsc::UnboundedSender<LoopbackPeer>,
}

/// Receives the server side of every accepted loopback connection.
#[derive(Debug)]
pub struct LoopbackServer {
    accepted: mpsc::UnboundedReceiver<LoopbackPeer>,
}

/// Server side of one loopback connection.
#[derive(Debug)]
pub struct LoopbackPeer {
    url: Url,
    to_client: mpsc::Sender<LinkEvent>,
    from_client: mpsc::UnboundedReceiver<LinkCommand>,
}

impl LoopbackConnector {
    /// Create a connector that accepts every attempt, plus its server side.
    #[must_use]
    pub fn new() -> (Self, LoopbackServer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            script: Arc::new(Mutex::new(Script {
                queued: VecDeque::new(),
                fallback: Behavior::Accept,
                attempts: 0,
                urls: Vec::new(),
            })),
            accepted: tx,
        };
        (connector, LoopbackServer { accepted: rx })
    }

    /// Queue `behavior` for the next `count` attempts, after anything
    /// already queued.
    pub fn queue(&self, behavior: Behavior, count: usize) {
        let mut script = self.script.lock();
        script
            .queued
            .extend(std::iter::repeat_n(behavior, count));
    }

    /// Refuse the next `count` attempts.
    pub fn refuse_next(&self, count: usize) {
        self.queue(Behavior::Refuse, count);
    }

    /// Set what happens once the queue is empty.
    pub fn set_default(&self, behavior: Behavior) {
        self.script.lock().fallback = behavior;
    }

    /// Number of connection attempts made so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.script.lock().attempts
    }

    /// URLs of all attempts, in order.
    #[must_use]
    pub fn dialed(&self) -> Vec<Url> {
        self.script.lock().urls.clone()
    }

    fn next_behavior(&self, url: &Url) -> Behavior {
        let mut script = self.script.lock();
        script.attempts += 1;
        script.urls.push(url.clone());
        script.queued.pop_front().unwrap_or(script.fallback)
    }
}

impl Connector for LoopbackConnector {
    async fn connect(&self, url: &Url) -> Result<Link, TransportError> {
        match self.next_behavior(url) {
            Behavior::Refuse => Err(TransportError::Unreachable(format!(
                "loopback refused {}",
                url.path()
            ))),
            Behavior::Hang => std::future::pending().await,
            Behavior::Accept => {
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                let (in_tx, in_rx) = mpsc::channel(INBOUND_BUFFER);
                let peer = LoopbackPeer {
                    url: url.clone(),
                    to_client: in_tx,
                    from_client: out_rx,
                };
                self.accepted
                    .send(peer)
                    .map_err(|_| TransportError::ConnectionClosed)?;
                Ok(Link {
                    outbound: out_tx,
                    inbound: in_rx,
                })
            }
        }
    }
}

impl LoopbackServer {
    /// Wait for the next accepted connection.
    ///
    /// Returns `None` once every connector clone has been dropped.
    pub async fn accept(&mut self) -> Option<LoopbackPeer> {
        self.accepted.recv().await
    }
}

impl LoopbackPeer {
    /// The URL the client dialed.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// Push one raw text frame to the client.
    pub async fn push_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.to_client
            .send(LinkEvent::Text(text.into()))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Encode and push one inbound frame to the client.
    pub async fn push_frame(&self, frame: &InboundFrame) -> Result<(), TransportError> {
        let text = codec::encode_inbound(frame)
            .map_err(|e| TransportError::Io(std::io::Error::other(e.to_string())))?;
        self.push_text(text).await
    }

    /// Receive the next command the client sent.
    ///
    /// Returns `None` when the client dropped the link.
    pub async fn recv(&mut self) -> Option<LinkCommand> {
        self.from_client.recv().await
    }

    /// Close the connection with the given close code.
    pub async fn close(self, code: u16) {
        let _ = self
            .to_client
            .send(LinkEvent::Closed { code: Some(code) })
            .await;
    }

    /// Drop the connection without a close frame.
    pub fn abort(self) {
        drop(self);
    }
}
