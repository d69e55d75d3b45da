//! Shared protocol definitions for the Flag chat wire format.
//!
//! Both the client and the development relay speak JSON text frames over
//! WebSocket and JSON arrays over the history endpoints. The types here are
//! the strict schema for those payloads.

pub mod codec;
pub mod frame;
pub mod history;
pub mod ids;
