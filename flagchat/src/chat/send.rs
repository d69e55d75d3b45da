//! Outbound send path: validation and error classification.
//!
//! [`prepare_outbound`] turns raw input into the frame to transmit. The
//! session transmits it through the connection manager and, on success,
//! appends the optimistic echo. Every rejection maps to a distinct
//! user-visible [`Notice`].

use flagchat_proto::codec::FrameError;
use flagchat_proto::frame::{MAX_CONTENT_SIZE, OutboundFrame};

use crate::conversation::ConversationIdentity;
use crate::net::{ConnectionState, TransmitError};
use crate::session::Notice;

/// Why a send was rejected. Nothing reaches the transport in any case.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The input is empty after trimming.
    #[error("message is empty")]
    Empty,

    /// No connection has been established yet.
    #[error("not connected yet")]
    NotConnected,

    /// The connection dropped and a reconnect is in progress.
    #[error("disconnected, reconnecting")]
    Reconnecting,

    /// Reconnect attempts are exhausted.
    #[error("connection lost")]
    ConnectionLost,

    /// The server closed the connection normally; it will not reopen.
    #[error("closed by the server")]
    ClosedByServer,

    /// The direct conversation has no addressable peer.
    #[error("conversation has no valid peer")]
    InvalidPeer,

    /// The message cannot be encoded (for example, it is too large).
    #[error(transparent)]
    Encode(#[from] FrameError),
}

impl SendError {
    /// The notice to show for this rejection.
    #[must_use]
    pub fn notice(&self) -> Notice {
        match self {
            Self::Empty => Notice::EmptyInput,
            Self::NotConnected => Notice::NotConnected,
            Self::Reconnecting => Notice::Reconnecting,
            Self::ConnectionLost => Notice::ConnectionLost,
            Self::ClosedByServer => Notice::ClosedByServer,
            Self::InvalidPeer | Self::Encode(_) => Notice::SendRejected(self.to_string()),
        }
    }
}

impl From<TransmitError> for SendError {
    fn from(err: TransmitError) -> Self {
        match err {
            TransmitError::NotOpen { state, attempt } => match state {
                ConnectionState::Idle => Self::NotConnected,
                ConnectionState::Terminated => Self::ClosedByServer,
                ConnectionState::Connecting if attempt == 0 => Self::NotConnected,
                ConnectionState::Connecting | ConnectionState::Closed | ConnectionState::Open => {
                    Self::Reconnecting
                }
                ConnectionState::Failed => Self::ConnectionLost,
            },
            TransmitError::Encode(e) => Self::Encode(e),
            TransmitError::Closed => Self::NotConnected,
        }
    }
}

/// Validate `text` for `identity` and build the frame to transmit.
///
/// Returns the trimmed content alongside the frame. Room conversations
/// broadcast; direct conversations address the peer.
///
/// # Errors
///
/// [`SendError::Empty`] for blank input, [`SendError::Encode`] for oversized
/// input, [`SendError::InvalidPeer`] if the direct peer id is zero.
pub fn prepare_outbound(
    text: &str,
    identity: &ConversationIdentity,
) -> Result<(String, OutboundFrame), SendError> {
    let content = text.trim();
    if content.is_empty() {
        return Err(SendError::Empty);
    }
    if content.len() > MAX_CONTENT_SIZE {
        return Err(FrameError::TooLarge {
            size: content.len(),
            max: MAX_CONTENT_SIZE,
        }
        .into());
    }

    let frame = match identity.peer_id() {
        None => OutboundFrame::to_room(content),
        Some(peer) if peer.is_broadcast() => return Err(SendError::InvalidPeer),
        Some(peer) => OutboundFrame::direct(content, peer),
    };
    Ok((content.to_string(), frame))
}
