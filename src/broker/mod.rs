//! Broker core: stores, dispatcher and heartbeat supervision.
//!
//! Each store owns exactly one concern behind a narrow method contract; the
//! [`dispatcher::Broker`] orchestrates cross-store effects and fan-out. No
//! store calls into another store.

pub mod auth;
pub mod dispatcher;
pub mod heartbeat;
pub mod history;
pub mod presence;
pub mod ratelimit;
pub mod registry;
pub mod rooms;
pub mod transport;
pub mod typing;

pub use auth::{AuthError, AuthGrant, AuthValidator, DevAuthValidator};
pub use dispatcher::{Broker, BrokerConfig};
pub use heartbeat::HeartbeatSupervisor;
pub use transport::{ChannelTransport, Outbound, Transport, TransportError};
