//! Shared application state.

use std::sync::Arc;

use crate::broker::{Broker, ChannelTransport};

/// State handed to every axum handler.
///
/// The broker and the transport are the same objects wired together at
/// startup: handlers attach each accepted socket to the transport, then feed
/// inbound frames to the broker.
pub struct AppState {
    pub broker: Arc<Broker>,
    pub transport: Arc<ChannelTransport>,
}
