//! Transport seam between the broker and the socket layer.
//!
//! The dispatcher only ever needs three primitives — send a frame, probe
//! liveness, close — addressed by connection id. The WebSocket plumbing
//! lives on the other side of this trait, in [`crate::server`].

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use crate::domain::ConnectionId;

/// One unit of outbound traffic for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A serialized event frame
    Text(String),
    /// Transport-level liveness probe
    Ping,
    /// Orderly close requested by the broker
    Close,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection '{0}' is not attached")]
    NotAttached(ConnectionId),
    /// The connection's send buffer was full; the transport has dropped the
    /// connection rather than queue unboundedly.
    #[error("connection '{0}' dropped on send-buffer overflow")]
    Overflow(ConnectionId),
    #[error("connection '{0}' is gone")]
    Disconnected(ConnectionId),
}

/// Outbound primitives the dispatcher depends on.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, connection_id: ConnectionId, frame: String)
    -> Result<(), TransportError>;
    async fn ping(&self, connection_id: ConnectionId) -> Result<(), TransportError>;
    async fn close(&self, connection_id: ConnectionId);
}

/// Transport over bounded per-connection channels.
///
/// Each connection's writer task owns the receiving end. Sends never await
/// channel capacity: a full buffer means the peer has stalled, and the
/// sender is detached on the spot — dropping it ends the writer task, which
/// closes the socket and triggers normal disconnect cleanup.
#[derive(Default)]
pub struct ChannelTransport {
    senders: Mutex<HashMap<ConnectionId, mpsc::Sender<Outbound>>>,
}

impl ChannelTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a connection's outbound channel.
    pub async fn attach(&self, connection_id: ConnectionId, sender: mpsc::Sender<Outbound>) {
        let mut senders = self.senders.lock().await;
        senders.insert(connection_id, sender);
        tracing::debug!("Connection '{}' attached to transport", connection_id);
    }

    /// Detach a connection. Idempotent.
    pub async fn detach(&self, connection_id: ConnectionId) {
        let mut senders = self.senders.lock().await;
        senders.remove(&connection_id);
        tracing::debug!("Connection '{}' detached from transport", connection_id);
    }

    async fn push(
        &self,
        connection_id: ConnectionId,
        item: Outbound,
    ) -> Result<(), TransportError> {
        let mut senders = self.senders.lock().await;
        let Some(sender) = senders.get(&connection_id) else {
            return Err(TransportError::NotAttached(connection_id));
        };
        match sender.try_send(item) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    "Send buffer full for connection '{}', dropping connection",
                    connection_id
                );
                senders.remove(&connection_id);
                Err(TransportError::Overflow(connection_id))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                senders.remove(&connection_id);
                Err(TransportError::Disconnected(connection_id))
            }
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(
        &self,
        connection_id: ConnectionId,
        frame: String,
    ) -> Result<(), TransportError> {
        self.push(connection_id, Outbound::Text(frame)).await
    }

    async fn ping(&self, connection_id: ConnectionId) -> Result<(), TransportError> {
        self.push(connection_id, Outbound::Ping).await
    }

    async fn close(&self, connection_id: ConnectionId) {
        // Best effort: the writer task exits on Close or on sender drop.
        let _ = self.push(connection_id, Outbound::Close).await;
        self.detach(connection_id).await;
    }
}
