//! Realtime chat message broker.
//!
//! This library provides the server-side broker for a WebSocket chat system:
//! connection registration, room membership, bounded message history, presence,
//! typing indicators, heartbeat supervision and event fan-out.

// layers
pub mod broker;
pub mod domain;
pub mod protocol;
pub mod server;

// shared library
pub mod common;
