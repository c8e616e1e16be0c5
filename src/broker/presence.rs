//! Per-user presence records, independent of any single connection.
//!
//! Presence only flips to offline on an explicit call from the dispatcher,
//! after it has confirmed via the connection registry that no connection
//! remains for the user. The store itself never inspects connections.

use std::collections::HashMap;

use crate::domain::{PresenceStatus, UserId};

/// Presence snapshot for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub display_name: String,
    pub status: PresenceStatus,
    /// Unix epoch milliseconds of the last transition to offline
    pub last_seen_at: Option<i64>,
}

impl PresenceRecord {
    fn offline() -> Self {
        Self {
            display_name: String::new(),
            status: PresenceStatus::Offline,
            last_seen_at: None,
        }
    }
}

/// Store of per-user presence status and last-seen timestamps.
#[derive(Debug, Default)]
pub struct PresenceStore {
    users: HashMap<UserId, PresenceRecord>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a user online, recording their display name.
    pub fn mark_online(&mut self, user_id: UserId, display_name: impl Into<String>) {
        let record = self.users.entry(user_id).or_insert_with(PresenceRecord::offline);
        record.display_name = display_name.into();
        record.status = PresenceStatus::Online;
    }

    /// Mark a user offline with `last_seen_at = now`, returning the previous
    /// status. Unknown users are already offline.
    pub fn mark_offline(&mut self, user_id: &UserId, now: i64) -> PresenceStatus {
        match self.users.get_mut(user_id) {
            Some(record) => {
                let previous = record.status;
                record.status = PresenceStatus::Offline;
                record.last_seen_at = Some(now);
                previous
            }
            None => PresenceStatus::Offline,
        }
    }

    /// Set an explicit status (away/busy/...) for a known user.
    pub fn set_status(&mut self, user_id: &UserId, status: PresenceStatus) {
        if let Some(record) = self.users.get_mut(user_id) {
            record.status = status;
        }
    }

    /// Presence of a user. Unknown users are implicitly offline with no
    /// last-seen timestamp; this is not an error.
    pub fn get(&self, user_id: &UserId) -> PresenceRecord {
        self.users
            .get(user_id)
            .cloned()
            .unwrap_or_else(PresenceRecord::offline)
    }

    /// Display name recorded at the user's last authentication.
    pub fn display_name(&self, user_id: &UserId) -> Option<String> {
        self.users.get(user_id).map(|r| r.display_name.clone())
    }
}
