//! Live connection tracking.
//!
//! The registry maintains a bidirectional mapping: connection → entry and
//! user → connections. A user with several open tabs has several entries
//! mapped to the same user id; the reverse index is what the dispatcher's
//! fan-out and last-connection presence logic walk.

use std::collections::{HashMap, HashSet};

use crate::domain::{ConnectionId, UserId};

/// State of one registered connection.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    /// Set exactly once, on successful authentication
    pub user_id: Option<UserId>,
    pub remote_addr: String,
    /// Unix epoch milliseconds of the last observed sign of life
    pub last_liveness_at: i64,
}

impl ConnectionEntry {
    pub fn authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}

/// Result of unregistering a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unregistered {
    pub user_id: Option<UserId>,
    /// True when no other connection remains for the same user
    pub last_for_user: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection '{0}' is not registered")]
    NotFound(ConnectionId),
}

/// Registry of live connections and their user associations.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    /// Reverse index, user → open connections
    user_connections: HashMap<UserId, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted connection and return its generated id.
    pub fn register(&mut self, remote_addr: impl Into<String>, now: i64) -> ConnectionId {
        let connection_id = ConnectionId::generate();
        self.connections.insert(
            connection_id,
            ConnectionEntry {
                user_id: None,
                remote_addr: remote_addr.into(),
                last_liveness_at: now,
            },
        );
        connection_id
    }

    /// Associate an authenticated user with a connection.
    pub fn set_user(
        &mut self,
        connection_id: ConnectionId,
        user_id: UserId,
    ) -> Result<(), RegistryError> {
        let entry = self
            .connections
            .get_mut(&connection_id)
            .ok_or(RegistryError::NotFound(connection_id))?;
        entry.user_id = Some(user_id.clone());
        self.user_connections
            .entry(user_id)
            .or_default()
            .insert(connection_id);
        Ok(())
    }

    /// Remove a connection. Idempotent: unknown ids are a no-op.
    ///
    /// Reports the removed user association and whether it was the user's
    /// last open connection, so the caller can decide on a presence flip.
    pub fn unregister(&mut self, connection_id: ConnectionId) -> Option<Unregistered> {
        let entry = self.connections.remove(&connection_id)?;
        let mut last_for_user = false;
        if let Some(user_id) = &entry.user_id {
            if let Some(conns) = self.user_connections.get_mut(user_id) {
                conns.remove(&connection_id);
                if conns.is_empty() {
                    self.user_connections.remove(user_id);
                    last_for_user = true;
                }
            }
        }
        Some(Unregistered {
            user_id: entry.user_id,
            last_for_user,
        })
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<&ConnectionEntry> {
        self.connections.get(&connection_id)
    }

    pub fn contains(&self, connection_id: ConnectionId) -> bool {
        self.connections.contains_key(&connection_id)
    }

    /// All open connections for a user. Empty set for unknown users.
    pub fn connections_of(&self, user_id: &UserId) -> HashSet<ConnectionId> {
        self.user_connections
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Record a sign of life on a connection. Unknown ids are a no-op.
    pub fn touch(&mut self, connection_id: ConnectionId, now: i64) {
        if let Some(entry) = self.connections.get_mut(&connection_id) {
            entry.last_liveness_at = now;
        }
    }

    /// Whether a connection has gone quiet past the timeout. Unknown ids are
    /// never stale; they are simply gone.
    pub fn is_stale(&self, connection_id: ConnectionId, now: i64, timeout_millis: i64) -> bool {
        self.connections
            .get(&connection_id)
            .is_some_and(|entry| now - entry.last_liveness_at > timeout_millis)
    }

    /// Snapshot of all registered connection ids.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
