//! Per-connection, per-action fixed-window rate limiting.
//!
//! A connection gets `limit` actions of each type per one-second window.
//! Excess frames are rejected with RATE_LIMIT_EXCEEDED; the connection is
//! never closed for it.

use std::collections::HashMap;

use crate::domain::ConnectionId;
use crate::protocol::Action;

const WINDOW_MILLIS: i64 = 1000;

#[derive(Debug)]
struct Window {
    started_at: i64,
    count: u32,
}

/// Fixed-window counter keyed by (connection, action type).
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    windows: HashMap<(ConnectionId, Action), Window>,
}

impl RateLimiter {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            windows: HashMap::new(),
        }
    }

    /// Record one action; returns whether it is within the limit.
    pub fn check(&mut self, connection_id: ConnectionId, action: Action, now: i64) -> bool {
        let window = self
            .windows
            .entry((connection_id, action))
            .or_insert(Window {
                started_at: now,
                count: 0,
            });
        if now - window.started_at >= WINDOW_MILLIS {
            window.started_at = now;
            window.count = 0;
        }
        window.count += 1;
        window.count <= self.limit
    }

    /// Drop all state for a closed connection.
    pub fn forget(&mut self, connection_id: ConnectionId) {
        self.windows.retain(|(conn, _), _| *conn != connection_id);
    }
}
