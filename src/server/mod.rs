//! WebSocket broker server: axum routing, socket plumbing and HTTP
//! introspection endpoints.

mod handler;
mod runner;
mod signal;
mod state;

pub use runner::run_server;
pub use state::AppState;
