//! Room metadata and membership.
//!
//! Default rooms are seeded at startup and survive emptiness; every other
//! room is removed the moment its last member leaves. Cascading cleanup of
//! the room's message log and typing state is the dispatcher's job, driven
//! by the `room_now_empty` signal — this store knows nothing about either.

use std::collections::{HashMap, HashSet};

use crate::domain::{Room, RoomId, UserId, Visibility};

/// Outcome of a `leave` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub was_member: bool,
    /// True when the room emptied and, unless it is a default room, was
    /// removed. The caller cascades log/typing cleanup on this signal.
    pub room_now_empty: bool,
}

/// Store of rooms and their membership sets.
#[derive(Debug, Default)]
pub struct RoomStore {
    rooms: HashMap<RoomId, Room>,
    default_rooms: HashSet<RoomId>,
}

impl RoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with well-known rooms seeded; these are exempt from
    /// empty-room deletion.
    pub fn with_defaults<I: IntoIterator<Item = RoomId>>(default_rooms: I, now: i64) -> Self {
        let mut store = Self::new();
        for room_id in default_rooms {
            let room = Room::new(
                room_id.clone(),
                room_id.as_str(),
                Visibility::Public,
                None,
                now,
            );
            store.rooms.insert(room_id.clone(), room);
            store.default_rooms.insert(room_id);
        }
        store
    }

    /// Fetch a room, creating it as public and auto-named if absent.
    pub fn get_or_create(&mut self, room_id: &RoomId, creator: &UserId, now: i64) -> Room {
        self.rooms
            .entry(room_id.clone())
            .or_insert_with(|| {
                Room::new(
                    room_id.clone(),
                    room_id.as_str(),
                    Visibility::Public,
                    Some(creator.clone()),
                    now,
                )
            })
            .clone()
    }

    /// Add a user to a room's membership set.
    ///
    /// Returns `true` only when the user was not already a member, so the
    /// caller can suppress duplicate USER_JOINED broadcasts.
    pub fn join(&mut self, room_id: &RoomId, user_id: &UserId) -> bool {
        match self.rooms.get_mut(room_id) {
            Some(room) => room.members.insert(user_id.clone()),
            None => false,
        }
    }

    /// Remove a user from a room. An emptied non-default room is deleted.
    pub fn leave(&mut self, room_id: &RoomId, user_id: &UserId) -> LeaveOutcome {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return LeaveOutcome {
                was_member: false,
                room_now_empty: false,
            };
        };
        let was_member = room.members.remove(user_id);
        let room_now_empty = room.members.is_empty();
        if room_now_empty && !self.default_rooms.contains(room_id) {
            self.rooms.remove(room_id);
        }
        LeaveOutcome {
            was_member,
            room_now_empty,
        }
    }

    /// Membership set of a room. Empty for unknown rooms.
    pub fn members(&self, room_id: &RoomId) -> HashSet<UserId> {
        self.rooms
            .get(room_id)
            .map(|room| room.members.clone())
            .unwrap_or_default()
    }

    pub fn is_member(&self, room_id: &RoomId, user_id: &UserId) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|room| room.members.contains(user_id))
    }

    pub fn exists(&self, room_id: &RoomId) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn is_default(&self, room_id: &RoomId) -> bool {
        self.default_rooms.contains(room_id)
    }

    pub fn get(&self, room_id: &RoomId) -> Option<Room> {
        self.rooms.get(room_id).cloned()
    }

    /// All rooms a user is currently a member of.
    pub fn rooms_of(&self, user_id: &UserId) -> Vec<RoomId> {
        self.rooms
            .values()
            .filter(|room| room.members.contains(user_id))
            .map(|room| room.id.clone())
            .collect()
    }

    /// Snapshot of all rooms, for the introspection endpoints.
    pub fn all(&self) -> Vec<Room> {
        self.rooms.values().cloned().collect()
    }
}
