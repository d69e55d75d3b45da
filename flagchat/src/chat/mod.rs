//! Chat layer: message model, history loading, merging, and sending.
//!
//! - [`message`]: the displayed [`ChatMessage`] and its dedup key
//! - [`history`]: one-shot history fetch at mount
//! - [`merge`]: the rendered list, with self-echo and duplicate suppression
//! - [`send`]: outbound validation and optimistic echo

pub mod history;
pub mod merge;
pub mod message;
pub mod send;

pub use message::{ChatMessage, DedupKey, Origin};
