//! Periodic liveness supervision.
//!
//! The supervisor runs one sweep per heartbeat interval: connections quiet
//! for more than twice the interval are terminated, everyone else gets a
//! transport ping. Pong handling happens in the socket layer, which calls
//! [`Broker::touch`].

use std::sync::Arc;

use tokio::task::JoinHandle;

use super::dispatcher::Broker;

/// Background task driving [`Broker::sweep`] on a fixed cadence.
pub struct HeartbeatSupervisor {
    broker: Arc<Broker>,
}

impl HeartbeatSupervisor {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    /// Spawn the sweep loop. The task runs until the returned handle is
    /// aborted or the runtime shuts down.
    pub fn spawn(self) -> JoinHandle<()> {
        let interval = self.broker.config().heartbeat_interval;
        tokio::spawn(async move {
            tracing::info!(
                "Heartbeat supervisor started (interval: {:?})",
                interval
            );
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so freshly accepted
            // connections are not probed before the handshake settles.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.broker.sweep().await;
            }
        })
    }
}
