//! Flag chat client library.
//!
//! The real-time chat transport of the Flag app: conversation identity,
//! one-shot history loading, a reconnecting live connection, duplicate-free
//! merging of history and live messages, and the optimistic send path.
//! [`session::ChatSession`] ties them together the way a conversation view
//! uses them.

pub mod chat;
pub mod config;
pub mod conversation;
pub mod net;
pub mod session;
pub mod transport;
