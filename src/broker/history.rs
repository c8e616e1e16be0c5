//! Bounded per-room message history.
//!
//! Each room holds a fixed-capacity FIFO of messages; appending past the cap
//! evicts the oldest entry. Total order within a room is the append order —
//! server receive time, never a client-supplied timestamp — and `append` is
//! the only content mutator. Message ids come from one monotonic counter, so
//! id order agrees with append order across the whole broker.

use std::collections::{HashMap, VecDeque};

use crate::domain::{Message, MessageDraft, MessageId, RoomId};

/// In-memory message log with per-room FIFO eviction.
///
/// This is the narrow seam a durable backing store would sit behind; the
/// broker only ever calls `append`, `tail` and the cleanup hooks.
#[derive(Debug)]
pub struct MessageLog {
    rooms: HashMap<RoomId, VecDeque<Message>>,
    capacity: usize,
    next_id: u64,
}

impl MessageLog {
    /// Create a log where each room retains at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: HashMap::new(),
            capacity,
            next_id: 1,
        }
    }

    /// Append a message to a room's log, evicting the oldest entry when the
    /// room is at capacity. Returns the stored message with its assigned id.
    pub fn append(&mut self, room_id: &RoomId, draft: MessageDraft, now: i64) -> Message {
        let message = Message {
            id: MessageId(self.next_id),
            room_id: room_id.clone(),
            sender_id: draft.sender_id,
            sender_display_name: draft.sender_display_name,
            content: draft.content,
            kind: draft.kind,
            created_at: now,
            metadata: draft.metadata,
            reactions: Vec::new(),
            tombstone: false,
        };
        self.next_id += 1;

        let log = self.rooms.entry(room_id.clone()).or_default();
        if log.len() == self.capacity {
            log.pop_front();
        }
        log.push_back(message.clone());
        message
    }

    /// The newest `limit` messages of a room, returned oldest-first.
    ///
    /// Oldest-first is what the join handshake replays, so clients render
    /// history in creation order without re-sorting.
    pub fn tail(&self, room_id: &RoomId, limit: usize) -> Vec<Message> {
        match self.rooms.get(room_id) {
            Some(log) => {
                let skip = log.len().saturating_sub(limit);
                log.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Messages of a room matching a predicate, in append order.
    ///
    /// The iterator borrows the log; collect it before releasing the store
    /// lock. Restartable by calling `search` again.
    pub fn search<'a, P>(
        &'a self,
        room_id: &RoomId,
        predicate: P,
    ) -> impl Iterator<Item = &'a Message>
    where
        P: Fn(&Message) -> bool + 'a,
    {
        self.rooms
            .get(room_id)
            .into_iter()
            .flat_map(|log| log.iter())
            .filter(move |message| predicate(message))
    }

    /// Flag a message as edited/deleted without touching its content slot's
    /// position. Returns false if the message is no longer retained.
    pub fn mark_tombstone(&mut self, room_id: &RoomId, message_id: MessageId) -> bool {
        self.rooms
            .get_mut(room_id)
            .and_then(|log| log.iter_mut().find(|m| m.id == message_id))
            .map(|message| {
                message.tombstone = true;
            })
            .is_some()
    }

    pub fn len(&self, room_id: &RoomId) -> usize {
        self.rooms.get(room_id).map_or(0, VecDeque::len)
    }

    /// Drop a room's entire history (empty-room cascade).
    pub fn remove_room(&mut self, room_id: &RoomId) {
        self.rooms.remove(room_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MessageKind, UserId};

    fn draft(content: &str) -> MessageDraft {
        MessageDraft {
            sender_id: UserId::new("alice"),
            sender_display_name: "Alice".to_string(),
            content: content.to_string(),
            kind: MessageKind::Text,
            metadata: serde_json::Map::new(),
        }
    }

    fn general() -> RoomId {
        RoomId::new("general")
    }

    #[test]
    fn test_append_assigns_monotonic_ids() {
        // given:
        let mut log = MessageLog::new(10);

        // when:
        let m1 = log.append(&general(), draft("one"), 1000);
        let m2 = log.append(&general(), draft("two"), 1000);

        // then:
        assert!(m1.id < m2.id);
    }

    #[test]
    fn test_tail_returns_newest_oldest_first() {
        // given:
        let mut log = MessageLog::new(10);
        for i in 0..5 {
            log.append(&general(), draft(&format!("msg-{i}")), 1000 + i);
        }

        // when:
        let tail = log.tail(&general(), 3);

        // then: last three, in creation order
        let contents: Vec<&str> = tail.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["msg-2", "msg-3", "msg-4"]);
    }

    #[test]
    fn test_tail_of_unknown_room_is_empty() {
        // given:
        let log = MessageLog::new(10);

        // when / then:
        assert!(log.tail(&RoomId::new("nowhere"), 100).is_empty());
    }

    #[test]
    fn test_append_beyond_capacity_evicts_oldest() {
        // given: capacity 3, 3 + 2 appends
        let mut log = MessageLog::new(3);
        for i in 0..5 {
            log.append(&general(), draft(&format!("msg-{i}")), 1000);
        }

        // when:
        let tail = log.tail(&general(), 10);

        // then: exactly capacity retained, oldest two gone
        assert_eq!(log.len(&general()), 3);
        let contents: Vec<&str> = tail.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["msg-2", "msg-3", "msg-4"]);
    }

    #[test]
    fn test_search_is_restartable() {
        // given:
        let mut log = MessageLog::new(10);
        log.append(&general(), draft("keep this"), 1000);
        log.append(&general(), draft("drop"), 1000);
        log.append(&general(), draft("keep that"), 1000);

        // when: run the same search twice
        let first: Vec<String> = log
            .search(&general(), |m| m.content.starts_with("keep"))
            .map(|m| m.content.clone())
            .collect();
        let second: Vec<String> = log
            .search(&general(), |m| m.content.starts_with("keep"))
            .map(|m| m.content.clone())
            .collect();

        // then:
        assert_eq!(first, vec!["keep this", "keep that"]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_mark_tombstone_keeps_position() {
        // given:
        let mut log = MessageLog::new(10);
        let first = log.append(&general(), draft("first"), 1000);
        log.append(&general(), draft("second"), 1000);

        // when:
        let marked = log.mark_tombstone(&general(), first.id);

        // then: flagged in place, ordering untouched
        assert!(marked);
        let tail = log.tail(&general(), 10);
        assert!(tail[0].tombstone);
        assert_eq!(tail[0].content, "first");
        assert!(!tail[1].tombstone);
    }

    #[test]
    fn test_mark_tombstone_on_evicted_message_fails() {
        // given: capacity 1, the first message gets evicted
        let mut log = MessageLog::new(1);
        let first = log.append(&general(), draft("first"), 1000);
        log.append(&general(), draft("second"), 1000);

        // when / then:
        assert!(!log.mark_tombstone(&general(), first.id));
    }

    #[test]
    fn test_remove_room_clears_history() {
        // given:
        let mut log = MessageLog::new(10);
        log.append(&general(), draft("hello"), 1000);

        // when:
        log.remove_room(&general());

        // then: a recreated room starts empty
        assert!(log.tail(&general(), 10).is_empty());
        assert_eq!(log.len(&general()), 0);
    }

    #[test]
    fn test_ids_stay_monotonic_across_rooms_and_eviction() {
        // given:
        let mut log = MessageLog::new(2);
        let other = RoomId::new("other");

        // when:
        let a = log.append(&general(), draft("a"), 0);
        let b = log.append(&other, draft("b"), 0);
        log.append(&general(), draft("c"), 0);
        let d = log.append(&general(), draft("d"), 0); // evicts "a"

        // then:
        assert!(a.id < b.id && b.id < d.id);
        assert_eq!(log.tail(&general(), 10).first().unwrap().content, "c");
    }
}
