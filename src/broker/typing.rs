//! Ephemeral typing indicators with auto-expiry.
//!
//! A mark whose `expires_at` has passed is logically absent even before any
//! sweep removes it: every read filters against `now`, so the sweep is purely
//! a memory-reclamation pass and never a correctness requirement.

use std::collections::{HashMap, HashSet};

use crate::domain::{RoomId, UserId};

/// Tracker of who is currently typing in which room.
#[derive(Debug, Default)]
pub struct TypingTracker {
    /// room → user → expires_at (epoch millis)
    marks: HashMap<RoomId, HashMap<UserId, i64>>,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or refresh a typing mark lasting `ttl_millis` from `now`.
    pub fn set_typing(&mut self, room_id: &RoomId, user_id: &UserId, now: i64, ttl_millis: i64) {
        self.marks
            .entry(room_id.clone())
            .or_default()
            .insert(user_id.clone(), now + ttl_millis);
    }

    /// Remove a user's mark in a room.
    ///
    /// Returns `true` only if a still-live mark was removed, so the caller
    /// knows whether observers actually saw this user as typing.
    pub fn clear_typing(&mut self, room_id: &RoomId, user_id: &UserId, now: i64) -> bool {
        let Some(room_marks) = self.marks.get_mut(room_id) else {
            return false;
        };
        let removed = room_marks.remove(user_id);
        if room_marks.is_empty() {
            self.marks.remove(room_id);
        }
        removed.is_some_and(|expires_at| expires_at >= now)
    }

    /// Users with a live mark in a room. Expired marks are filtered out
    /// regardless of whether a sweep has run.
    pub fn active_typers(&self, room_id: &RoomId, now: i64) -> HashSet<UserId> {
        self.marks
            .get(room_id)
            .into_iter()
            .flat_map(|room_marks| {
                room_marks
                    .iter()
                    .filter(move |(_, expires_at)| **expires_at >= now)
                    .map(|(user_id, _)| user_id.clone())
            })
            .collect()
    }

    /// Drop expired marks. Optional; reads are already expiry-correct.
    pub fn sweep(&mut self, now: i64) {
        self.marks.retain(|_, room_marks| {
            room_marks.retain(|_, expires_at| *expires_at >= now);
            !room_marks.is_empty()
        });
    }

    /// Drop all marks for a room (empty-room cascade).
    pub fn clear_room(&mut self, room_id: &RoomId) {
        self.marks.remove(room_id);
    }

    /// Remove a user's marks across the given rooms, returning the rooms
    /// where observers saw a live mark disappear. Disconnect cleanup uses
    /// this to emit the implicit `TYPING_STATUS(false)` broadcasts.
    pub fn clear_user(&mut self, rooms: &[RoomId], user_id: &UserId, now: i64) -> Vec<RoomId> {
        rooms
            .iter()
            .filter(|room_id| self.clear_typing(room_id, user_id, now))
            .cloned()
            .collect()
    }
}
