//! Flag chat development server library.
//!
//! Exposes the server for use in tests and embedding. The server accepts
//! token-authenticated WebSocket connections for rooms and private chats,
//! routes messages between them, and serves per-conversation history.

pub mod config;
pub mod relay;
pub mod rooms;
pub mod store;
