//! Transport layer abstraction for Flag chat.
//!
//! A [`Connector`] dials one live-duplex connection and hands back a
//! [`Link`]: a pair of channels carrying text frames in each direction.
//! The connection manager owns the link and never touches sockets directly.
//! Concrete implementations:
//! - [`ws::WsConnector`] for WebSocket over tokio-tungstenite
//! - [`loopback::LoopbackConnector`] for in-process, scriptable testing

pub mod loopback;
pub mod ws;

use tokio::sync::mpsc;
use url::Url;

/// WebSocket close code for a normal, intentional closure.
pub const NORMAL_CLOSURE: u16 = 1000;

/// A configured base URL could not be extended with an endpoint path.
#[derive(Debug, thiserror::Error)]
#[error("base URL {0} cannot carry a path")]
pub struct EndpointError(pub String);

/// Append `segments` to the path of `base`, dropping any query or fragment.
///
/// A trailing slash on the base is not doubled:
/// `http://host/api/` + `["chat"]` becomes `http://host/api/chat`.
///
/// # Errors
///
/// Returns [`EndpointError`] when `base` cannot be a base (e.g. `mailto:`).
pub fn endpoint<'a>(
    base: &Url,
    segments: impl IntoIterator<Item = &'a str>,
) -> Result<Url, EndpointError> {
    let mut url = base.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.path_segments_mut()
        .map_err(|()| EndpointError(base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Errors that can occur while establishing a connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection was closed before it could be used.
    #[error("connection closed")]
    ConnectionClosed,

    /// The endpoint could not be reached.
    #[error("endpoint {0} is unreachable")]
    Unreachable(String),

    /// The server refused the upgrade (bad token, unknown room, ...).
    #[error("server rejected connection: HTTP {status}")]
    Rejected {
        /// HTTP status returned instead of the upgrade.
        status: u16,
    },

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Command sent from the connection manager to an open link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    /// Write one text frame.
    Text(String),
    /// Close the connection with [`NORMAL_CLOSURE`].
    Close,
}

/// Event delivered from an open link to the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One text frame was received.
    Text(String),
    /// The connection ended. `code` is `None` when no close frame was seen
    /// (reset, read error, stream end).
    Closed {
        /// The close code sent by the remote side, if any.
        code: Option<u16>,
    },
}

/// An established connection, expressed as two channels.
///
/// Dropping the `outbound` sender asks the link to shut down; the
/// `inbound` receiver yields [`LinkEvent::Closed`] (or ends) when the
/// remote side goes away.
#[derive(Debug)]
pub struct Link {
    /// Frames and control commands toward the server.
    pub outbound: mpsc::UnboundedSender<LinkCommand>,
    /// Frames and closure notification from the server.
    pub inbound: mpsc::Receiver<LinkEvent>,
}

/// Dials live connections.
///
/// Implementations must not retry internally: one call is one attempt, and
/// the connection manager decides when to try again. They also need not
/// enforce a timeout; the manager bounds every attempt with its own
/// open-timeout watchdog.
pub trait Connector: Send + Sync + 'static {
    /// Open one connection to `url`.
    fn connect(
        &self,
        url: &Url,
    ) -> impl std::future::Future<Output = Result<Link, TransportError>> + Send;
}
