//! Wire protocol: inbound frame envelope and outbound event frames.
//!
//! One JSON frame per logical message. Inbound frames are parsed in two
//! stages: first the envelope (`type`, raw `payload`, optional `requestId`),
//! then the payload against the schema of the resolved action. Anything that
//! fails either stage is an `INVALID_MESSAGE`, never a silent reinterpretation.

use serde::{Deserialize, Serialize};

use crate::domain::{Message, MessageKind, PresenceStatus, Room, RoomId, UserId};

/// Client-to-server action types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Authenticate,
    JoinRoom,
    LeaveRoom,
    SendMessage,
    TypingStatus,
    Ping,
}

impl Action {
    /// Resolve a wire `type` string to an action.
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "AUTHENTICATE" => Some(Self::Authenticate),
            "JOIN_ROOM" => Some(Self::JoinRoom),
            "LEAVE_ROOM" => Some(Self::LeaveRoom),
            "SEND_MESSAGE" => Some(Self::SendMessage),
            "TYPING_STATUS" => Some(Self::TypingStatus),
            "PING" => Some(Self::Ping),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authenticate => "AUTHENTICATE",
            Self::JoinRoom => "JOIN_ROOM",
            Self::LeaveRoom => "LEAVE_ROOM",
            Self::SendMessage => "SEND_MESSAGE",
            Self::TypingStatus => "TYPING_STATUS",
            Self::Ping => "PING",
        }
    }
}

/// Raw inbound frame before per-action payload validation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub request_id: Option<String>,
}

impl Envelope {
    /// Parse a raw text frame into an envelope.
    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        let envelope: Envelope = serde_json::from_str(raw).map_err(FrameError::Malformed)?;
        if envelope.kind.is_empty() {
            return Err(FrameError::EmptyType);
        }
        Ok(envelope)
    }

    /// Deserialize the payload against an action's schema.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, FrameError> {
        serde_json::from_value(self.payload.clone()).map_err(FrameError::BadPayload)
    }
}

/// Frame-level parse failures, all reported to the sender as INVALID_MESSAGE.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("frame has empty type")]
    EmptyType,
    #[error("unknown action type '{0}'")]
    UnknownAction(String),
    #[error("invalid payload: {0}")]
    BadPayload(#[source] serde_json::Error),
}

// ---- inbound payload schemas ----

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatePayload {
    pub token: String,
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomPayload {
    pub room_id: RoomId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRoomPayload {
    pub room_id: RoomId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub room_id: RoomId,
    pub content: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingStatusPayload {
    pub room_id: RoomId,
    pub is_typing: bool,
}

// ---- outbound events ----

/// Server-to-client event type strings.
pub mod event {
    pub const AUTH_SUCCESS: &str = "AUTH_SUCCESS";
    pub const ROOM_JOINED: &str = "ROOM_JOINED";
    pub const USER_JOINED: &str = "USER_JOINED";
    pub const USER_LEFT: &str = "USER_LEFT";
    pub const NEW_MESSAGE: &str = "NEW_MESSAGE";
    pub const TYPING_UPDATE: &str = "TYPING_UPDATE";
    pub const USER_STATUS_CHANGED: &str = "USER_STATUS_CHANGED";
    pub const PONG: &str = "PONG";
    pub const ERROR: &str = "ERROR";
}

/// Error taxonomy carried in ERROR frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    Unauthorized,
    RateLimitExceeded,
    RoomNotFound,
    NotAMember,
    AuthenticationFailed,
    InternalError,
}

/// Outbound frame envelope.
///
/// Direct replies echo the sender's `requestId`; broadcasts carry none.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: i64,
}

impl EventFrame {
    /// Build an event frame from a serializable payload.
    pub fn new<P: Serialize>(
        kind: &'static str,
        payload: &P,
        request_id: Option<String>,
        timestamp: i64,
    ) -> Self {
        let payload =
            serde_json::to_value(payload).expect("event payloads serialize infallibly");
        Self {
            kind,
            payload,
            request_id,
            timestamp,
        }
    }

    /// Serialize the frame to its wire representation.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("event frames serialize infallibly")
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSuccessPayload {
    pub user_id: UserId,
    pub username: String,
    pub display_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoinedPayload {
    pub room: Room,
    pub messages: Vec<Message>,
    pub members: Vec<UserId>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserJoinedPayload {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub display_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLeftPayload {
    pub room_id: RoomId,
    pub user_id: UserId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessagePayload {
    pub message: Message,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingUpdatePayload {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub is_typing: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatusChangedPayload {
    pub user_id: UserId,
    pub status: PresenceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct PongPayload {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}
