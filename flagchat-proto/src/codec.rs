//! JSON encoding and strict decoding for the Flag chat wire protocol.
//!
//! Decoding is where the schema is enforced: a frame that parses as JSON but
//! violates an invariant (zero sender, empty or oversized content) is an
//! error, so callers can discard it as a unit instead of displaying a
//! half-valid message.

use crate::frame::{InboundFrame, MAX_CONTENT_SIZE, OutboundFrame};

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The text is not valid JSON for the expected shape.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The frame parsed but carries a value the protocol forbids.
    #[error("invalid frame: {0}")]
    Invalid(&'static str),

    /// Content exceeds [`MAX_CONTENT_SIZE`].
    #[error("content too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// Decodes and validates a server-to-client live frame.
///
/// # Errors
///
/// Returns [`FrameError`] if the text is not a well-formed inbound frame.
pub fn decode_inbound(text: &str) -> Result<InboundFrame, FrameError> {
    let frame: InboundFrame = serde_json::from_str(text)?;
    if frame.from.is_broadcast() {
        return Err(FrameError::Invalid("sender id is zero"));
    }
    check_content(&frame.content)?;
    Ok(frame)
}

/// Encodes a server-to-client live frame.
///
/// # Errors
///
/// Returns [`FrameError::Malformed`] if serialization fails.
pub fn encode_inbound(frame: &InboundFrame) -> Result<String, FrameError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decodes and validates a client-to-server live frame.
///
/// # Errors
///
/// Returns [`FrameError`] if the text is not a well-formed outbound frame.
pub fn decode_outbound(text: &str) -> Result<OutboundFrame, FrameError> {
    let frame: OutboundFrame = serde_json::from_str(text)?;
    check_content(&frame.content)?;
    Ok(frame)
}

/// Encodes a client-to-server live frame.
///
/// # Errors
///
/// Returns [`FrameError`] if the content is empty or too large, or if
/// serialization fails.
pub fn encode_outbound(frame: &OutboundFrame) -> Result<String, FrameError> {
    check_content(&frame.content)?;
    Ok(serde_json::to_string(frame)?)
}

fn check_content(content: &str) -> Result<(), FrameError> {
    if content.trim().is_empty() {
        return Err(FrameError::Invalid("content is empty"));
    }
    if content.len() > MAX_CONTENT_SIZE {
        return Err(FrameError::TooLarge {
            size: content.len(),
            max: MAX_CONTENT_SIZE,
        });
    }
    Ok(())
}
