//! Domain model for the chat broker.
//!
//! Identifier newtypes plus the `Message` and `Room` records shared by the
//! stores, the dispatcher and the wire protocol. These types carry no
//! behavior beyond construction and accessors; all mutation goes through the
//! stores in [`crate::broker`].

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier for one transport-level connection.
///
/// Generated at accept time; a user with several open tabs holds several
/// connection ids mapped to the same [`UserId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh connection id
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of an authenticated user, independent of connection count.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a named channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monotonic message identifier assigned by the message log on append.
///
/// Ordering of two ids matches their append order within the broker.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct MessageId(pub u64);

/// User presence status, decoupled from any single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
}

/// Room visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
    Direct,
}

/// Message payload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    System,
}

/// A single reaction attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub emoji: String,
    pub user_id: UserId,
}

/// One chat message, immutable once appended to the log.
///
/// Edits and deletes never rewrite `content` in place; they set the
/// `tombstone` flag through [`crate::broker::history::MessageLog`], which
/// keeps ordering stable for concurrent readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub sender_display_name: String,
    pub content: String,
    #[serde(default)]
    pub kind: MessageKind,
    /// Server receive time, Unix epoch milliseconds
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reactions: Vec<Reaction>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tombstone: bool,
}

/// Fields of a message supplied by the sender; the log fills in the id and
/// receive timestamp on append.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub sender_id: UserId,
    pub sender_display_name: String,
    pub content: String,
    pub kind: MessageKind,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// A named channel with a membership set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub description: String,
    pub visibility: Visibility,
    pub created_by: Option<UserId>,
    /// Unix epoch milliseconds
    pub created_at: i64,
    pub members: HashSet<UserId>,
}

impl Room {
    /// Create an empty room
    pub fn new(
        id: RoomId,
        name: impl Into<String>,
        visibility: Visibility,
        created_by: Option<UserId>,
        created_at: i64,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            description: String::new(),
            visibility,
            created_by,
            created_at,
            members: HashSet::new(),
        }
    }
}
