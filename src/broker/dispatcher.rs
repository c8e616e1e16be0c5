//! The broker dispatcher: protocol state machine and event fan-out.
//!
//! One logical dispatch path runs per inbound connection event. Every frame
//! goes through the same gauntlet — well-formedness, auth state, rate limit,
//! payload schema — before its handler touches the stores. Fan-out resolves
//! room → members → connections, because a user with several open tabs must
//! receive room events on every one of them.
//!
//! All per-action failures are converted to ERROR frames at this boundary;
//! only authentication failure and internal errors terminate the connection,
//! and never anything beyond that one connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::common::time::Clock;
use crate::domain::{ConnectionId, MessageDraft, Room, RoomId, UserId};
use crate::protocol::{
    Action, AuthSuccessPayload, AuthenticatePayload, Envelope, ErrorCode, ErrorPayload,
    EventFrame, FrameError, JoinRoomPayload, LeaveRoomPayload, NewMessagePayload, PongPayload,
    RoomJoinedPayload, SendMessagePayload, TypingStatusPayload, TypingUpdatePayload,
    UserJoinedPayload, UserLeftPayload, UserStatusChangedPayload, event,
};

use super::auth::AuthValidator;
use super::history::MessageLog;
use super::presence::PresenceStore;
use super::ratelimit::RateLimiter;
use super::registry::ConnectionRegistry;
use super::rooms::RoomStore;
use super::transport::Transport;
use super::typing::TypingTracker;

/// Broker tuning knobs. The defaults match production settings; tests dial
/// them down.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Per-room message history cap (FIFO eviction beyond it)
    pub max_messages_per_room: usize,
    /// How much history the join handshake replays
    pub history_replay_limit: usize,
    /// Lifetime of a typing mark without refresh
    pub typing_ttl_millis: i64,
    /// Actions per second per connection and action type
    pub rate_limit_per_sec: u32,
    /// Heartbeat probe interval; staleness timeout is twice this
    pub heartbeat_interval: Duration,
    /// Outbound channel capacity per connection
    pub send_buffer: usize,
    /// Rooms seeded at startup, exempt from empty-room deletion
    pub default_rooms: Vec<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_messages_per_room: 1000,
            history_replay_limit: 100,
            typing_ttl_millis: 5_000,
            rate_limit_per_sec: 10,
            heartbeat_interval: Duration::from_secs(30),
            send_buffer: 256,
            default_rooms: vec!["general".to_string()],
        }
    }
}

/// A failure while handling one frame, reported back to the sender.
#[derive(Debug)]
struct FrameFailure {
    code: ErrorCode,
    message: String,
    request_id: Option<String>,
}

impl FrameFailure {
    fn new(code: ErrorCode, message: impl Into<String>, request_id: Option<String>) -> Self {
        Self {
            code,
            message: message.into(),
            request_id,
        }
    }
}

/// The chat broker: owns the stores and orchestrates every cross-store
/// effect. Stores are independent mutexes taken one at a time; snapshots are
/// extracted before fan-out so no lock is held across a transport send.
pub struct Broker {
    config: BrokerConfig,
    registry: Mutex<ConnectionRegistry>,
    presence: Mutex<PresenceStore>,
    rooms: Mutex<RoomStore>,
    history: Mutex<MessageLog>,
    typing: Mutex<TypingTracker>,
    limiter: Mutex<RateLimiter>,
    transport: Arc<dyn Transport>,
    auth: Arc<dyn AuthValidator>,
    clock: Arc<dyn Clock>,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        transport: Arc<dyn Transport>,
        auth: Arc<dyn AuthValidator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now_millis();
        let default_rooms = config
            .default_rooms
            .iter()
            .map(|name| RoomId::new(name.clone()));
        Self {
            registry: Mutex::new(ConnectionRegistry::new()),
            presence: Mutex::new(PresenceStore::new()),
            rooms: Mutex::new(RoomStore::with_defaults(default_rooms, now)),
            history: Mutex::new(MessageLog::new(config.max_messages_per_room)),
            typing: Mutex::new(TypingTracker::new()),
            limiter: Mutex::new(RateLimiter::new(config.rate_limit_per_sec)),
            config,
            transport,
            auth,
            clock,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Register a freshly accepted connection.
    pub async fn connect(&self, remote_addr: &str) -> ConnectionId {
        let now = self.now();
        let connection_id = self.registry.lock().await.register(remote_addr, now);
        tracing::info!(
            "Connection '{}' accepted from {}",
            connection_id,
            remote_addr
        );
        connection_id
    }

    /// Record a sign of life (transport pong or any liveness signal).
    pub async fn touch(&self, connection_id: ConnectionId) {
        let now = self.now();
        self.registry.lock().await.touch(connection_id, now);
    }

    /// Handle one inbound text frame from a connection.
    ///
    /// Never panics the dispatch loop: every failure is converted to an
    /// ERROR frame, and only internal errors terminate the connection.
    pub async fn handle_frame(&self, connection_id: ConnectionId, raw: &str) {
        // Closed connections discard frames.
        if !self.registry.lock().await.contains(connection_id) {
            tracing::debug!("Discarding frame from closed connection '{}'", connection_id);
            return;
        }
        self.touch(connection_id).await;

        if let Err(failure) = self.dispatch(connection_id, raw).await {
            let fatal = failure.code == ErrorCode::AuthenticationFailed
                || failure.code == ErrorCode::InternalError;
            self.send_error(connection_id, failure).await;
            if fatal {
                // Clients must re-handshake on a fresh connection.
                self.transport.close(connection_id).await;
                self.disconnect(connection_id).await;
            }
        }
    }

    async fn dispatch(&self, connection_id: ConnectionId, raw: &str) -> Result<(), FrameFailure> {
        let envelope = Envelope::parse(raw).map_err(|err| {
            FrameFailure::new(ErrorCode::InvalidMessage, err.to_string(), None)
        })?;
        let request_id = envelope.request_id.clone();

        let Some(action) = Action::parse(&envelope.kind) else {
            return Err(FrameFailure::new(
                ErrorCode::InvalidMessage,
                FrameError::UnknownAction(envelope.kind.clone()).to_string(),
                request_id,
            ));
        };

        // Auth gate: everything except AUTHENTICATE and PING requires an
        // authenticated connection.
        let user_id = {
            let registry = self.registry.lock().await;
            match registry.get(connection_id) {
                Some(entry) => entry.user_id.clone(),
                None => return Ok(()), // closed under us, discard
            }
        };
        if user_id.is_none() && !matches!(action, Action::Authenticate | Action::Ping) {
            return Err(FrameFailure::new(
                ErrorCode::Unauthorized,
                "authenticate before sending actions",
                request_id,
            ));
        }

        // Rate limit per connection and action type; liveness probes are
        // exempt so a throttled client is still supervisable.
        if !matches!(action, Action::Ping) {
            let now = self.now();
            let allowed = self.limiter.lock().await.check(connection_id, action, now);
            if !allowed {
                return Err(FrameFailure::new(
                    ErrorCode::RateLimitExceeded,
                    format!("rate limit exceeded for {}", action.as_str()),
                    request_id,
                ));
            }
        }

        match action {
            Action::Authenticate => {
                let payload: AuthenticatePayload = self.parse_payload(&envelope)?;
                self.handle_authenticate(connection_id, payload, request_id)
                    .await
            }
            Action::JoinRoom => {
                let payload: JoinRoomPayload = self.parse_payload(&envelope)?;
                let user = user_id.take_authenticated(&request_id)?;
                self.handle_join_room(connection_id, user, payload, request_id)
                    .await
            }
            Action::LeaveRoom => {
                let payload: LeaveRoomPayload = self.parse_payload(&envelope)?;
                let user = user_id.take_authenticated(&request_id)?;
                self.handle_leave_room(connection_id, user, payload, request_id)
                    .await
            }
            Action::SendMessage => {
                let payload: SendMessagePayload = self.parse_payload(&envelope)?;
                let user = user_id.take_authenticated(&request_id)?;
                self.handle_send_message(connection_id, user, payload, request_id)
                    .await
            }
            Action::TypingStatus => {
                let payload: TypingStatusPayload = self.parse_payload(&envelope)?;
                let user = user_id.take_authenticated(&request_id)?;
                self.handle_typing_status(connection_id, user, payload, request_id)
                    .await
            }
            Action::Ping => self.handle_ping(connection_id, request_id).await,
        }
    }

    fn parse_payload<T: serde::de::DeserializeOwned>(
        &self,
        envelope: &Envelope,
    ) -> Result<T, FrameFailure> {
        envelope.payload_as().map_err(|err| {
            FrameFailure::new(
                ErrorCode::InvalidMessage,
                err.to_string(),
                envelope.request_id.clone(),
            )
        })
    }

    async fn handle_authenticate(
        &self,
        connection_id: ConnectionId,
        payload: AuthenticatePayload,
        request_id: Option<String>,
    ) -> Result<(), FrameFailure> {
        {
            let registry = self.registry.lock().await;
            if registry
                .get(connection_id)
                .is_some_and(|entry| entry.authenticated())
            {
                return Err(FrameFailure::new(
                    ErrorCode::InvalidMessage,
                    "connection is already authenticated",
                    request_id,
                ));
            }
        }

        // The external call may suspend; no locks are held across it.
        let grant = match self
            .auth
            .validate(&payload.token, &payload.username)
            .await
        {
            Ok(grant) => grant,
            Err(err) => {
                tracing::warn!(
                    "Authentication failed for connection '{}': {}",
                    connection_id,
                    err
                );
                return Err(FrameFailure::new(
                    ErrorCode::AuthenticationFailed,
                    err.to_string(),
                    request_id,
                ));
            }
        };

        // The connection may have closed while validation was in flight;
        // a late grant must not reanimate it.
        {
            let mut registry = self.registry.lock().await;
            if registry
                .set_user(connection_id, grant.user_id.clone())
                .is_err()
            {
                tracing::debug!(
                    "Discarding auth grant for closed connection '{}'",
                    connection_id
                );
                return Ok(());
            }
        }

        self.presence
            .lock()
            .await
            .mark_online(grant.user_id.clone(), grant.display_name.clone());

        tracing::info!(
            "Connection '{}' authenticated as user '{}'",
            connection_id,
            grant.user_id
        );

        self.reply(
            connection_id,
            event::AUTH_SUCCESS,
            &AuthSuccessPayload {
                user_id: grant.user_id,
                username: payload.username,
                display_name: grant.display_name,
            },
            request_id,
        )
        .await;
        Ok(())
    }

    async fn handle_join_room(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        payload: JoinRoomPayload,
        request_id: Option<String>,
    ) -> Result<(), FrameFailure> {
        let now = self.now();
        let (room, newly_joined, members) = {
            let mut rooms = self.rooms.lock().await;
            rooms.get_or_create(&payload.room_id, &user_id, now);
            let newly_joined = rooms.join(&payload.room_id, &user_id);
            let members = rooms.members(&payload.room_id);
            let Some(room) = rooms.get(&payload.room_id) else {
                return Err(FrameFailure::new(
                    ErrorCode::InternalError,
                    "room state lost during join",
                    request_id,
                ));
            };
            (room, newly_joined, members)
        };

        let messages = self
            .history
            .lock()
            .await
            .tail(&payload.room_id, self.config.history_replay_limit);

        let mut member_list: Vec<UserId> = members.iter().cloned().collect();
        member_list.sort();

        self.reply(
            connection_id,
            event::ROOM_JOINED,
            &RoomJoinedPayload {
                room,
                messages,
                members: member_list,
            },
            request_id,
        )
        .await;

        // Re-joining an already-joined room must not re-announce the user.
        if newly_joined {
            let display_name = self
                .presence
                .lock()
                .await
                .display_name(&user_id)
                .unwrap_or_else(|| user_id.to_string());
            self.broadcast(
                &payload.room_id,
                Some(&user_id),
                event::USER_JOINED,
                &UserJoinedPayload {
                    room_id: payload.room_id.clone(),
                    user_id: user_id.clone(),
                    display_name,
                },
            )
            .await;
            tracing::info!("User '{}' joined room '{}'", user_id, payload.room_id);
        }
        Ok(())
    }

    async fn handle_leave_room(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        payload: LeaveRoomPayload,
        request_id: Option<String>,
    ) -> Result<(), FrameFailure> {
        self.require_membership(&payload.room_id, &user_id, &request_id)
            .await?;

        let room_removed = {
            let mut rooms = self.rooms.lock().await;
            let outcome = rooms.leave(&payload.room_id, &user_id);
            outcome.room_now_empty && !rooms.is_default(&payload.room_id)
        };
        let now = self.now();
        self.typing
            .lock()
            .await
            .clear_typing(&payload.room_id, &user_id, now);

        // Default rooms survive emptiness and keep their history.
        if room_removed {
            self.cascade_room_cleanup(&payload.room_id).await;
        }

        let left = UserLeftPayload {
            room_id: payload.room_id.clone(),
            user_id: user_id.clone(),
        };
        // Ack the sender, then tell the remaining members.
        self.reply(connection_id, event::USER_LEFT, &left, request_id)
            .await;
        self.broadcast(&payload.room_id, Some(&user_id), event::USER_LEFT, &left)
            .await;
        tracing::info!("User '{}' left room '{}'", user_id, payload.room_id);
        Ok(())
    }

    async fn handle_send_message(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        payload: SendMessagePayload,
        request_id: Option<String>,
    ) -> Result<(), FrameFailure> {
        if payload.content.trim().is_empty() {
            return Err(FrameFailure::new(
                ErrorCode::InvalidMessage,
                "message content must not be empty",
                request_id,
            ));
        }
        self.require_membership(&payload.room_id, &user_id, &request_id)
            .await?;

        let display_name = self
            .presence
            .lock()
            .await
            .display_name(&user_id)
            .unwrap_or_else(|| user_id.to_string());

        // Append order is server receive order; the id assigned here is the
        // room's total order, not any client timestamp.
        let now = self.now();
        let message = self.history.lock().await.append(
            &payload.room_id,
            MessageDraft {
                sender_id: user_id.clone(),
                sender_display_name: display_name,
                content: payload.content,
                kind: payload.kind,
                metadata: payload.metadata,
            },
            now,
        );

        // Echo to every member including the sender: the broadcast doubles
        // as the send confirmation, with the requestId on the sender's copy.
        self.broadcast_with_trigger(
            &payload.room_id,
            None,
            event::NEW_MESSAGE,
            &NewMessagePayload { message },
            Some((connection_id, request_id)),
        )
        .await;
        Ok(())
    }

    async fn handle_typing_status(
        &self,
        _connection_id: ConnectionId,
        user_id: UserId,
        payload: TypingStatusPayload,
        request_id: Option<String>,
    ) -> Result<(), FrameFailure> {
        self.require_membership(&payload.room_id, &user_id, &request_id)
            .await?;

        let now = self.now();
        {
            let mut typing = self.typing.lock().await;
            if payload.is_typing {
                typing.set_typing(
                    &payload.room_id,
                    &user_id,
                    now,
                    self.config.typing_ttl_millis,
                );
            } else {
                typing.clear_typing(&payload.room_id, &user_id, now);
            }
        }

        // Never echoed to the typist's own connections.
        self.broadcast(
            &payload.room_id,
            Some(&user_id),
            event::TYPING_UPDATE,
            &TypingUpdatePayload {
                room_id: payload.room_id.clone(),
                user_id: user_id.clone(),
                is_typing: payload.is_typing,
            },
        )
        .await;
        Ok(())
    }

    async fn handle_ping(
        &self,
        connection_id: ConnectionId,
        request_id: Option<String>,
    ) -> Result<(), FrameFailure> {
        // touch already happened in handle_frame
        self.reply(connection_id, event::PONG, &PongPayload {}, request_id)
            .await;
        Ok(())
    }

    /// Full disconnect cleanup: unregister, presence flip on the last
    /// connection, implicit typing clears, membership removal with the
    /// empty-room cascade.
    pub async fn disconnect(&self, connection_id: ConnectionId) {
        self.limiter.lock().await.forget(connection_id);

        let removed = self.registry.lock().await.unregister(connection_id);
        let Some(removed) = removed else {
            return; // already gone, idempotent
        };
        tracing::info!("Connection '{}' disconnected", connection_id);

        let Some(user_id) = removed.user_id else {
            return; // never authenticated, nothing to announce
        };

        if !removed.last_for_user {
            return; // other tabs remain open; presence and typing unchanged
        }

        let member_rooms = self.rooms.lock().await.rooms_of(&user_id);

        // Implicit TYPING_STATUS(false) wherever observers saw a live mark.
        let now = self.now();
        let cleared_rooms = self
            .typing
            .lock()
            .await
            .clear_user(&member_rooms, &user_id, now);
        for room_id in &cleared_rooms {
            self.broadcast(
                room_id,
                Some(&user_id),
                event::TYPING_UPDATE,
                &TypingUpdatePayload {
                    room_id: room_id.clone(),
                    user_id: user_id.clone(),
                    is_typing: false,
                },
            )
            .await;
        }

        let previous = self.presence.lock().await.mark_offline(&user_id, now);
        tracing::info!(
            "User '{}' is offline (was {:?})",
            user_id,
            previous
        );

        for room_id in &member_rooms {
            self.broadcast(
                room_id,
                Some(&user_id),
                event::USER_STATUS_CHANGED,
                &UserStatusChangedPayload {
                    user_id: user_id.clone(),
                    status: crate::domain::PresenceStatus::Offline,
                    last_seen_at: Some(now),
                },
            )
            .await;
        }

        // Membership follows the last connection out; emptied non-default
        // rooms are garbage collected along with their log and typing state.
        for room_id in &member_rooms {
            let room_removed = {
                let mut rooms = self.rooms.lock().await;
                let outcome = rooms.leave(room_id, &user_id);
                outcome.room_now_empty && !rooms.is_default(room_id)
            };
            if room_removed {
                self.cascade_room_cleanup(room_id).await;
            }
        }
    }

    /// Heartbeat pass: terminate stale connections, probe the rest.
    pub async fn sweep(&self) {
        let now = self.now();
        let timeout = 2 * self.config.heartbeat_interval.as_millis() as i64;

        let (stale, live): (Vec<ConnectionId>, Vec<ConnectionId>) = {
            let registry = self.registry.lock().await;
            registry
                .connection_ids()
                .into_iter()
                .partition(|conn| registry.is_stale(*conn, now, timeout))
        };

        for connection_id in stale {
            tracing::warn!(
                "Terminating stale connection '{}' (no liveness for >{}ms)",
                connection_id,
                timeout
            );
            self.transport.close(connection_id).await;
            self.disconnect(connection_id).await;
        }

        for connection_id in live {
            if let Err(err) = self.transport.ping(connection_id).await {
                tracing::debug!("Ping to '{}' failed: {}", connection_id, err);
            }
        }

        // Reclaim lapsed typing marks while we are here.
        self.typing.lock().await.sweep(now);
    }

    /// Rooms snapshot for the introspection API.
    pub async fn rooms_snapshot(&self) -> Vec<Room> {
        self.rooms.lock().await.all()
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    // ---- helpers ----

    async fn require_membership(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        request_id: &Option<String>,
    ) -> Result<(), FrameFailure> {
        let rooms = self.rooms.lock().await;
        if !rooms.exists(room_id) {
            return Err(FrameFailure::new(
                ErrorCode::RoomNotFound,
                format!("room '{room_id}' does not exist"),
                request_id.clone(),
            ));
        }
        if !rooms.is_member(room_id, user_id) {
            return Err(FrameFailure::new(
                ErrorCode::NotAMember,
                format!("not a member of room '{room_id}'"),
                request_id.clone(),
            ));
        }
        Ok(())
    }

    async fn cascade_room_cleanup(&self, room_id: &RoomId) {
        self.history.lock().await.remove_room(room_id);
        self.typing.lock().await.clear_room(room_id);
        tracing::info!("Room '{}' emptied, state cleaned up", room_id);
    }

    /// Direct reply to one connection, echoing the request id.
    async fn reply<P: serde::Serialize>(
        &self,
        connection_id: ConnectionId,
        kind: &'static str,
        payload: &P,
        request_id: Option<String>,
    ) {
        let frame = EventFrame::new(kind, payload, request_id, self.now());
        if let Err(err) = self.transport.send(connection_id, frame.to_json()).await {
            tracing::warn!("Failed to send {} to '{}': {}", kind, connection_id, err);
        }
    }

    async fn send_error(&self, connection_id: ConnectionId, failure: FrameFailure) {
        tracing::debug!(
            "Rejecting frame from '{}': {:?} {}",
            connection_id,
            failure.code,
            failure.message
        );
        self.reply(
            connection_id,
            event::ERROR,
            &ErrorPayload {
                code: failure.code,
                message: failure.message,
            },
            failure.request_id,
        )
        .await;
    }

    /// Fan an event out to a room, optionally excluding one user's
    /// connections entirely (typing updates, join/leave announcements).
    async fn broadcast<P: serde::Serialize>(
        &self,
        room_id: &RoomId,
        exclude_user: Option<&UserId>,
        kind: &'static str,
        payload: &P,
    ) {
        self.broadcast_with_trigger(room_id, exclude_user, kind, payload, None)
            .await;
    }

    /// Fan-out with an optional triggering connection whose copy carries the
    /// request id (SEND_MESSAGE confirmation-by-echo).
    async fn broadcast_with_trigger<P: serde::Serialize>(
        &self,
        room_id: &RoomId,
        exclude_user: Option<&UserId>,
        kind: &'static str,
        payload: &P,
        trigger: Option<(ConnectionId, Option<String>)>,
    ) {
        // room → users → connections; both snapshots taken before sending.
        let members = self.rooms.lock().await.members(room_id);
        let targets: Vec<ConnectionId> = {
            let registry = self.registry.lock().await;
            members
                .iter()
                .filter(|member| exclude_user != Some(*member))
                .flat_map(|member| registry.connections_of(member))
                .collect()
        };

        let now = self.now();
        let plain = EventFrame::new(kind, payload, None, now).to_json();
        let (trigger_conn, trigger_request_id) = match trigger {
            Some((conn, request_id)) => (Some(conn), request_id),
            None => (None, None),
        };

        for connection_id in targets {
            let frame = if Some(connection_id) == trigger_conn {
                EventFrame::new(kind, payload, trigger_request_id.clone(), now).to_json()
            } else {
                plain.clone()
            };
            // Partial delivery failure is tolerated: a slow peer loses its
            // own connection, never the room's ability to make progress.
            if let Err(err) = self.transport.send(connection_id, frame).await {
                tracing::warn!(
                    "Failed to deliver {} to '{}': {}",
                    kind,
                    connection_id,
                    err
                );
            }
        }
    }
}

/// Small extension to turn the pre-fetched auth state into a hard error for
/// handlers that require it. The auth gate in `dispatch` already rejected
/// unauthenticated traffic; this covers the race where the entry vanished.
trait TakeAuthenticated {
    fn take_authenticated(self, request_id: &Option<String>) -> Result<UserId, FrameFailure>;
}

impl TakeAuthenticated for Option<UserId> {
    fn take_authenticated(self, request_id: &Option<String>) -> Result<UserId, FrameFailure> {
        self.ok_or_else(|| {
            FrameFailure::new(
                ErrorCode::Unauthorized,
                "authenticate before sending actions",
                request_id.clone(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::auth::{AuthError, AuthGrant, MockAuthValidator};
    use crate::broker::transport::TransportError;
    use crate::common::time::ManualClock;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    /// Transport double that records every frame per connection.
    #[derive(Default)]
    struct RecordingTransport {
        frames: StdMutex<HashMap<ConnectionId, Vec<String>>>,
        closed: StdMutex<Vec<ConnectionId>>,
        pings: StdMutex<Vec<ConnectionId>>,
    }

    impl RecordingTransport {
        fn frames_for(&self, connection_id: ConnectionId) -> Vec<serde_json::Value> {
            self.frames
                .lock()
                .unwrap()
                .get(&connection_id)
                .map(|frames| {
                    frames
                        .iter()
                        .map(|f| serde_json::from_str(f).unwrap())
                        .collect()
                })
                .unwrap_or_default()
        }

        fn closed_connections(&self) -> Vec<ConnectionId> {
            self.closed.lock().unwrap().clone()
        }

        fn pinged(&self) -> Vec<ConnectionId> {
            self.pings.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Transport for RecordingTransport {
        async fn send(
            &self,
            connection_id: ConnectionId,
            frame: String,
        ) -> Result<(), TransportError> {
            self.frames
                .lock()
                .unwrap()
                .entry(connection_id)
                .or_default()
                .push(frame);
            Ok(())
        }

        async fn ping(&self, connection_id: ConnectionId) -> Result<(), TransportError> {
            self.pings.lock().unwrap().push(connection_id);
            Ok(())
        }

        async fn close(&self, connection_id: ConnectionId) {
            self.closed.lock().unwrap().push(connection_id);
        }
    }

    fn accepting_auth() -> MockAuthValidator {
        let mut auth = MockAuthValidator::new();
        auth.expect_validate().returning(|_, username| {
            let username = username.to_string();
            Ok(AuthGrant {
                user_id: UserId::new(format!("user-{username}")),
                display_name: username,
            })
        });
        auth
    }

    struct Fixture {
        broker: Arc<Broker>,
        transport: Arc<RecordingTransport>,
        clock: ManualClock,
    }

    fn fixture_with(config: BrokerConfig, auth: MockAuthValidator) -> Fixture {
        let transport = Arc::new(RecordingTransport::default());
        let clock = ManualClock::new(1_000_000);
        let broker = Arc::new(Broker::new(
            config,
            transport.clone(),
            Arc::new(auth),
            Arc::new(clock.clone()),
        ));
        Fixture {
            broker,
            transport,
            clock,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(BrokerConfig::default(), accepting_auth())
    }

    async fn authed_connection(fixture: &Fixture, username: &str) -> ConnectionId {
        let conn = fixture.broker.connect("127.0.0.1:9000").await;
        fixture
            .broker
            .handle_frame(
                conn,
                &format!(
                    r#"{{"type":"AUTHENTICATE","payload":{{"token":"t","username":"{username}"}}}}"#
                ),
            )
            .await;
        conn
    }

    fn kinds(frames: &[serde_json::Value]) -> Vec<String> {
        frames
            .iter()
            .map(|f| f["type"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_authenticate_then_join_fresh_room() {
        // given: scenario A
        let fx = fixture();
        let c1 = fx.broker.connect("127.0.0.1:9000").await;

        // when:
        fx.broker
            .handle_frame(
                c1,
                r#"{"type":"AUTHENTICATE","payload":{"token":"t","username":"alice"},"requestId":"r1"}"#,
            )
            .await;
        fx.broker
            .handle_frame(
                c1,
                r#"{"type":"JOIN_ROOM","payload":{"roomId":"general"},"requestId":"r2"}"#,
            )
            .await;

        // then:
        let frames = fx.transport.frames_for(c1);
        assert_eq!(kinds(&frames), vec!["AUTH_SUCCESS", "ROOM_JOINED"]);
        assert_eq!(frames[0]["payload"]["username"], "alice");
        assert_eq!(frames[0]["requestId"], "r1");
        assert_eq!(frames[1]["requestId"], "r2");
        assert_eq!(
            frames[1]["payload"]["members"],
            serde_json::json!(["user-alice"])
        );
        assert_eq!(frames[1]["payload"]["messages"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_send_message_echoes_to_sender_and_members() {
        // given: scenario B, alice and bob in "general"
        let fx = fixture();
        let c1 = authed_connection(&fx, "alice").await;
        let c2 = authed_connection(&fx, "bob").await;
        for conn in [c1, c2] {
            fx.broker
                .handle_frame(conn, r#"{"type":"JOIN_ROOM","payload":{"roomId":"general"}}"#)
                .await;
        }

        // when:
        fx.broker
            .handle_frame(
                c1,
                r#"{"type":"SEND_MESSAGE","payload":{"roomId":"general","content":"hi"},"requestId":"m1"}"#,
            )
            .await;

        // then: both receive NEW_MESSAGE, sender included
        for conn in [c1, c2] {
            let frames = fx.transport.frames_for(conn);
            let new_message = frames
                .iter()
                .find(|f| f["type"] == "NEW_MESSAGE")
                .unwrap_or_else(|| panic!("no NEW_MESSAGE for {conn}"));
            assert_eq!(new_message["payload"]["message"]["content"], "hi");
            assert_eq!(
                new_message["payload"]["message"]["senderId"],
                "user-alice"
            );
        }
        // sender's copy carries the request id, bob's does not
        let alice_msg = fx
            .transport
            .frames_for(c1)
            .into_iter()
            .find(|f| f["type"] == "NEW_MESSAGE")
            .unwrap();
        assert_eq!(alice_msg["requestId"], "m1");
        let bob_msg = fx
            .transport
            .frames_for(c2)
            .into_iter()
            .find(|f| f["type"] == "NEW_MESSAGE")
            .unwrap();
        assert!(bob_msg.get("requestId").is_none());
    }

    #[tokio::test]
    async fn test_action_before_authentication_is_rejected() {
        // given: scenario C
        let fx = fixture();
        let c1 = fx.broker.connect("127.0.0.1:9000").await;

        // when:
        fx.broker
            .handle_frame(
                c1,
                r#"{"type":"SEND_MESSAGE","payload":{"roomId":"general","content":"hi"}}"#,
            )
            .await;

        // then: UNAUTHORIZED, connection still open
        let frames = fx.transport.frames_for(c1);
        assert_eq!(kinds(&frames), vec!["ERROR"]);
        assert_eq!(frames[0]["payload"]["code"], "UNAUTHORIZED");
        assert!(fx.transport.closed_connections().is_empty());
        assert_eq!(fx.broker.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_multi_tab_disconnect_keeps_user_online() {
        // given: scenario D, alice on two tabs, bob watching
        let fx = fixture();
        let c1 = authed_connection(&fx, "alice").await;
        let c2 = authed_connection(&fx, "alice").await;
        let c3 = authed_connection(&fx, "bob").await;
        for conn in [c1, c2, c3] {
            fx.broker
                .handle_frame(conn, r#"{"type":"JOIN_ROOM","payload":{"roomId":"general"}}"#)
                .await;
        }

        // when: first tab closes
        fx.broker.disconnect(c1).await;

        // then: no offline broadcast yet
        let bob_kinds = kinds(&fx.transport.frames_for(c3));
        assert!(!bob_kinds.contains(&"USER_STATUS_CHANGED".to_string()));

        // when: the last tab closes
        fx.broker.disconnect(c2).await;

        // then: bob sees alice go offline
        let frames = fx.transport.frames_for(c3);
        let status = frames
            .iter()
            .find(|f| f["type"] == "USER_STATUS_CHANGED")
            .unwrap();
        assert_eq!(status["payload"]["userId"], "user-alice");
        assert_eq!(status["payload"]["status"], "offline");
    }

    #[tokio::test]
    async fn test_typing_update_never_echoes_to_sender() {
        // given: P6
        let fx = fixture();
        let c1 = authed_connection(&fx, "alice").await;
        let c1b = authed_connection(&fx, "alice").await; // second tab
        let c2 = authed_connection(&fx, "bob").await;
        for conn in [c1, c1b, c2] {
            fx.broker
                .handle_frame(conn, r#"{"type":"JOIN_ROOM","payload":{"roomId":"general"}}"#)
                .await;
        }

        // when:
        fx.broker
            .handle_frame(
                c1,
                r#"{"type":"TYPING_STATUS","payload":{"roomId":"general","isTyping":true}}"#,
            )
            .await;

        // then: bob sees it, neither of alice's tabs does
        assert!(kinds(&fx.transport.frames_for(c2)).contains(&"TYPING_UPDATE".to_string()));
        assert!(!kinds(&fx.transport.frames_for(c1)).contains(&"TYPING_UPDATE".to_string()));
        assert!(!kinds(&fx.transport.frames_for(c1b)).contains(&"TYPING_UPDATE".to_string()));
    }

    #[tokio::test]
    async fn test_malformed_frame_reports_invalid_message() {
        // given:
        let fx = fixture();
        let c1 = fx.broker.connect("127.0.0.1:9000").await;

        // when:
        fx.broker.handle_frame(c1, "{definitely not json").await;

        // then: error reply, no closure, no crash
        let frames = fx.transport.frames_for(c1);
        assert_eq!(frames[0]["type"], "ERROR");
        assert_eq!(frames[0]["payload"]["code"], "INVALID_MESSAGE");
        assert!(fx.transport.closed_connections().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_action_reports_invalid_message() {
        // given:
        let fx = fixture();
        let c1 = authed_connection(&fx, "alice").await;

        // when:
        fx.broker
            .handle_frame(c1, r#"{"type":"TELEPORT","payload":{}}"#)
            .await;

        // then:
        let frames = fx.transport.frames_for(c1);
        assert_eq!(frames.last().unwrap()["payload"]["code"], "INVALID_MESSAGE");
    }

    #[tokio::test]
    async fn test_authentication_failure_closes_connection() {
        // given: a validator that rejects everything
        let mut auth = MockAuthValidator::new();
        auth.expect_validate()
            .returning(|_, _| Err(AuthError::Rejected("bad token".to_string())));
        let fx = fixture_with(BrokerConfig::default(), auth);
        let c1 = fx.broker.connect("127.0.0.1:9000").await;

        // when:
        fx.broker
            .handle_frame(
                c1,
                r#"{"type":"AUTHENTICATE","payload":{"token":"bad","username":"alice"}}"#,
            )
            .await;

        // then: AUTHENTICATION_FAILED and the connection is torn down
        let frames = fx.transport.frames_for(c1);
        assert_eq!(frames[0]["payload"]["code"], "AUTHENTICATION_FAILED");
        assert_eq!(fx.transport.closed_connections(), vec![c1]);
        assert_eq!(fx.broker.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_excess_but_keeps_connection() {
        // given: limit of 2 per second
        let config = BrokerConfig {
            rate_limit_per_sec: 2,
            ..BrokerConfig::default()
        };
        let fx = fixture_with(config, accepting_auth());
        let c1 = authed_connection(&fx, "alice").await;
        fx.broker
            .handle_frame(c1, r#"{"type":"JOIN_ROOM","payload":{"roomId":"general"}}"#)
            .await;

        // when: three sends inside one window
        for i in 0..3 {
            fx.broker
                .handle_frame(
                    c1,
                    &format!(
                        r#"{{"type":"SEND_MESSAGE","payload":{{"roomId":"general","content":"m{i}"}}}}"#
                    ),
                )
                .await;
        }

        // then: third is rejected, connection stays open
        let frames = fx.transport.frames_for(c1);
        let errors: Vec<_> = frames
            .iter()
            .filter(|f| f["type"] == "ERROR")
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["payload"]["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(fx.broker.connection_count().await, 1);

        // and: the window lapses, sends flow again
        fx.clock.advance(1000);
        fx.broker
            .handle_frame(
                c1,
                r#"{"type":"SEND_MESSAGE","payload":{"roomId":"general","content":"again"}}"#,
            )
            .await;
        let frames = fx.transport.frames_for(c1);
        assert_eq!(
            frames.last().unwrap()["payload"]["message"]["content"],
            "again"
        );
    }

    #[tokio::test]
    async fn test_send_to_room_not_joined_is_not_a_member() {
        // given: room exists (default), alice authenticated but never joined
        let fx = fixture();
        let c1 = authed_connection(&fx, "alice").await;

        // when:
        fx.broker
            .handle_frame(
                c1,
                r#"{"type":"SEND_MESSAGE","payload":{"roomId":"general","content":"hi"}}"#,
            )
            .await;

        // then:
        let frames = fx.transport.frames_for(c1);
        assert_eq!(frames.last().unwrap()["payload"]["code"], "NOT_A_MEMBER");
    }

    #[tokio::test]
    async fn test_send_to_unknown_room_is_room_not_found() {
        // given:
        let fx = fixture();
        let c1 = authed_connection(&fx, "alice").await;

        // when:
        fx.broker
            .handle_frame(
                c1,
                r#"{"type":"SEND_MESSAGE","payload":{"roomId":"nowhere","content":"hi"}}"#,
            )
            .await;

        // then:
        let frames = fx.transport.frames_for(c1);
        assert_eq!(frames.last().unwrap()["payload"]["code"], "ROOM_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_empty_content_is_invalid_message() {
        // given:
        let fx = fixture();
        let c1 = authed_connection(&fx, "alice").await;
        fx.broker
            .handle_frame(c1, r#"{"type":"JOIN_ROOM","payload":{"roomId":"general"}}"#)
            .await;

        // when:
        fx.broker
            .handle_frame(
                c1,
                r#"{"type":"SEND_MESSAGE","payload":{"roomId":"general","content":"   "}}"#,
            )
            .await;

        // then:
        let frames = fx.transport.frames_for(c1);
        assert_eq!(frames.last().unwrap()["payload"]["code"], "INVALID_MESSAGE");
    }

    #[tokio::test]
    async fn test_duplicate_join_suppresses_user_joined_broadcast() {
        // given: P3, bob watches alice join twice
        let fx = fixture();
        let c1 = authed_connection(&fx, "alice").await;
        let c2 = authed_connection(&fx, "bob").await;
        fx.broker
            .handle_frame(c2, r#"{"type":"JOIN_ROOM","payload":{"roomId":"general"}}"#)
            .await;

        // when:
        for _ in 0..2 {
            fx.broker
                .handle_frame(c1, r#"{"type":"JOIN_ROOM","payload":{"roomId":"general"}}"#)
                .await;
        }

        // then: exactly one USER_JOINED at bob
        let joined: Vec<_> = fx
            .transport
            .frames_for(c2)
            .into_iter()
            .filter(|f| f["type"] == "USER_JOINED")
            .collect();
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0]["payload"]["userId"], "user-alice");
    }

    #[tokio::test]
    async fn test_leave_empties_room_and_clears_history() {
        // given: P4, a non-default room
        let fx = fixture();
        let c1 = authed_connection(&fx, "alice").await;
        fx.broker
            .handle_frame(c1, r#"{"type":"JOIN_ROOM","payload":{"roomId":"scratch"}}"#)
            .await;
        fx.broker
            .handle_frame(
                c1,
                r#"{"type":"SEND_MESSAGE","payload":{"roomId":"scratch","content":"bye"}}"#,
            )
            .await;

        // when: last member leaves, then the room is recreated
        fx.broker
            .handle_frame(c1, r#"{"type":"LEAVE_ROOM","payload":{"roomId":"scratch"}}"#)
            .await;
        fx.broker
            .handle_frame(c1, r#"{"type":"JOIN_ROOM","payload":{"roomId":"scratch"}}"#)
            .await;

        // then: replayed history starts empty
        let frames = fx.transport.frames_for(c1);
        let rejoined = frames
            .iter()
            .filter(|f| f["type"] == "ROOM_JOINED")
            .next_back()
            .unwrap();
        assert_eq!(rejoined["payload"]["messages"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_disconnect_broadcasts_implicit_typing_clear() {
        // given: alice typing, then her only connection drops
        let fx = fixture();
        let c1 = authed_connection(&fx, "alice").await;
        let c2 = authed_connection(&fx, "bob").await;
        for conn in [c1, c2] {
            fx.broker
                .handle_frame(conn, r#"{"type":"JOIN_ROOM","payload":{"roomId":"general"}}"#)
                .await;
        }
        fx.broker
            .handle_frame(
                c1,
                r#"{"type":"TYPING_STATUS","payload":{"roomId":"general","isTyping":true}}"#,
            )
            .await;

        // when:
        fx.broker.disconnect(c1).await;

        // then: bob sees typing stop, then the status change
        let frames = fx.transport.frames_for(c2);
        let stop = frames
            .iter()
            .find(|f| f["type"] == "TYPING_UPDATE" && f["payload"]["isTyping"] == false)
            .unwrap();
        assert_eq!(stop["payload"]["userId"], "user-alice");
        assert!(
            frames
                .iter()
                .any(|f| f["type"] == "USER_STATUS_CHANGED")
        );
    }

    #[tokio::test]
    async fn test_ping_works_before_authentication() {
        // given:
        let fx = fixture();
        let c1 = fx.broker.connect("127.0.0.1:9000").await;

        // when:
        fx.broker
            .handle_frame(c1, r#"{"type":"PING","payload":{},"requestId":"p1"}"#)
            .await;

        // then:
        let frames = fx.transport.frames_for(c1);
        assert_eq!(kinds(&frames), vec!["PONG"]);
        assert_eq!(frames[0]["requestId"], "p1");
    }

    #[tokio::test]
    async fn test_sweep_terminates_stale_and_pings_live() {
        // given: two connections, one goes quiet past 2x interval
        let config = BrokerConfig {
            heartbeat_interval: Duration::from_secs(30),
            ..BrokerConfig::default()
        };
        let fx = fixture_with(config, accepting_auth());
        let quiet = fx.broker.connect("127.0.0.1:9000").await;
        fx.clock.advance(61_000);
        let lively = fx.broker.connect("127.0.0.1:9001").await;

        // when:
        fx.broker.sweep().await;

        // then:
        assert_eq!(fx.transport.closed_connections(), vec![quiet]);
        assert_eq!(fx.transport.pinged(), vec![lively]);
        assert_eq!(fx.broker.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_touch_saves_connection_from_sweep() {
        // given: a connection about to go stale
        let fx = fixture();
        let conn = fx.broker.connect("127.0.0.1:9000").await;
        fx.clock.advance(59_000);

        // when: a pong arrives, then time passes within the fresh window
        fx.broker.touch(conn).await;
        fx.clock.advance(59_000);
        fx.broker.sweep().await;

        // then: still alive
        assert!(fx.transport.closed_connections().is_empty());
        assert_eq!(fx.broker.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_frames_from_closed_connection_are_discarded() {
        // given:
        let fx = fixture();
        let c1 = authed_connection(&fx, "alice").await;
        fx.broker.disconnect(c1).await;
        let before = fx.transport.frames_for(c1).len();

        // when:
        fx.broker
            .handle_frame(c1, r#"{"type":"PING","payload":{}}"#)
            .await;

        // then: no reply, no error
        assert_eq!(fx.transport.frames_for(c1).len(), before);
    }

    #[tokio::test]
    async fn test_double_authenticate_is_rejected() {
        // given:
        let fx = fixture();
        let c1 = authed_connection(&fx, "alice").await;

        // when:
        fx.broker
            .handle_frame(
                c1,
                r#"{"type":"AUTHENTICATE","payload":{"token":"t","username":"alice"}}"#,
            )
            .await;

        // then:
        let frames = fx.transport.frames_for(c1);
        assert_eq!(frames.last().unwrap()["payload"]["code"], "INVALID_MESSAGE");
    }

    #[tokio::test]
    async fn test_default_room_history_survives_emptiness() {
        // given: general (default) accrues history, empties, is rejoined
        let fx = fixture();
        let c1 = authed_connection(&fx, "alice").await;
        fx.broker
            .handle_frame(c1, r#"{"type":"JOIN_ROOM","payload":{"roomId":"general"}}"#)
            .await;
        fx.broker
            .handle_frame(
                c1,
                r#"{"type":"SEND_MESSAGE","payload":{"roomId":"general","content":"kept"}}"#,
            )
            .await;
        fx.broker
            .handle_frame(c1, r#"{"type":"LEAVE_ROOM","payload":{"roomId":"general"}}"#)
            .await;

        // when:
        fx.broker
            .handle_frame(c1, r#"{"type":"JOIN_ROOM","payload":{"roomId":"general"}}"#)
            .await;

        // then: default rooms keep their log across emptiness
        let frames = fx.transport.frames_for(c1);
        let rejoined = frames
            .iter()
            .filter(|f| f["type"] == "ROOM_JOINED")
            .next_back()
            .unwrap();
        assert_eq!(
            rejoined["payload"]["messages"][0]["content"],
            "kept"
        );
    }
}
