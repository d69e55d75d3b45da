//! WebSocket connector for Flag chat.
//!
//! Implements [`Connector`] over tokio-tungstenite. Each connection gets a
//! reader task and a writer task; the connection manager talks to them
//! through the [`Link`] channels only.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::{Connector, Link, LinkCommand, LinkEvent, TransportError};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Capacity of the per-connection inbound channel.
const INBOUND_BUFFER: usize = 256;

/// WebSocket connector.
///
/// The authentication token and room id are already part of the URL query;
/// the live endpoint has no separate handshake phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl WsConnector {
    /// Create a connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<Link, TransportError> {
        let (ws_stream, _response) = connect_async(url.as_str()).await.map_err(|e| {
            tracing::warn!(endpoint = %redacted(url), err = %e, "WebSocket connect failed");
            map_ws_connect_error(e)
        })?;

        tracing::debug!(endpoint = %redacted(url), "WebSocket connected");

        let (ws_sender, ws_reader) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(INBOUND_BUFFER);

        tokio::spawn(writer_loop(ws_sender, out_rx));
        tokio::spawn(reader_loop(ws_reader, in_tx));

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Background task that writes outbound commands to the socket.
///
/// Exits after an explicit close, a write error, or when the link owner
/// drops the command sender (in which case the socket is closed as well).
async fn writer_loop(mut ws_sender: WsSender, mut commands: mpsc::UnboundedReceiver<LinkCommand>) {
    while let Some(command) = commands.recv().await {
        match command {
            LinkCommand::Text(text) => {
                if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                    tracing::warn!(err = %e, "WebSocket write failed");
                    return;
                }
            }
            LinkCommand::Close => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "".into(),
                };
                let _ = ws_sender.send(Message::Close(Some(frame))).await;
                let _ = ws_sender.close().await;
                return;
            }
        }
    }
    let _ = ws_sender.close().await;
}

/// Background task that forwards received text frames.
///
/// Binary, ping and pong frames are ignored. Always finishes by emitting
/// exactly one [`LinkEvent::Closed`] (unless the receiver is gone).
async fn reader_loop(mut ws_reader: WsReader, tx: mpsc::Sender<LinkEvent>) {
    let mut code = None;
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                if tx.send(LinkEvent::Text(text.to_string())).await.is_err() {
                    // Link dropped; nobody is listening.
                    return;
                }
            }
            Ok(Message::Close(frame)) => {
                code = frame.map(|f| u16::from(f.code));
                tracing::info!(?code, "WebSocket closed by server");
                break;
            }
            Ok(Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(err = %e, "WebSocket read error");
                break;
            }
        }
    }
    let _ = tx.send(LinkEvent::Closed { code }).await;
}

/// Endpoint without its query string, which carries the token.
fn redacted(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(io_err.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Http(response) => TransportError::Rejected {
            status: response.status().as_u16(),
        },
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::ConnectionClosed,
        other => TransportError::Io(std::io::Error::other(format!(
            "WebSocket connection error: {other}"
        ))),
    }
}
