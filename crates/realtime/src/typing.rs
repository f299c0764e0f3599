//! Typing indicators keyed by (conversation, identity).
//!
//! An identity counts as typing while any of its connections has an unexpired
//! start. Only the transitions into and out of that state are reported.

use std::{collections::HashSet, time::Duration};

use dashmap::{mapref::entry::Entry, DashMap};
use shared::domain::{ConnectionId, ConversationId, UserId};
use tokio::time::Instant;

#[derive(Debug)]
struct TypingEntry {
    connections: HashSet<ConnectionId>,
    deadline: Instant,
}

#[derive(Debug)]
pub struct TypingTracker {
    timeout: Duration,
    entries: DashMap<(ConversationId, UserId), TypingEntry>,
}

impl TypingTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            entries: DashMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Records a start and pushes the deadline out. True when the identity was not typing before.
    pub fn start(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        connection_id: ConnectionId,
        now: Instant,
    ) -> bool {
        let deadline = now + self.timeout;
        match self.entries.entry((conversation_id, user_id)) {
            Entry::Occupied(mut entry) => {
                let entry = entry.get_mut();
                entry.connections.insert(connection_id);
                entry.deadline = deadline;
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(TypingEntry {
                    connections: HashSet::from([connection_id]),
                    deadline,
                });
                true
            }
        }
    }

    /// Stops one connection. True when that was the identity's last typing connection.
    pub fn stop(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> bool {
        match self.entries.entry((conversation_id, user_id)) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().connections.remove(&connection_id);
                if entry.get().connections.is_empty() {
                    entry.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Clears the identity regardless of which connections were typing.
    pub fn stop_identity(&self, conversation_id: ConversationId, user_id: UserId) -> bool {
        self.entries.remove(&(conversation_id, user_id)).is_some()
    }

    /// Forgets every typist in a conversation and returns who was typing.
    pub fn clear_conversation(&self, conversation_id: ConversationId) -> Vec<UserId> {
        let typists: Vec<UserId> = self
            .entries
            .iter()
            .filter(|entry| entry.key().0 == conversation_id)
            .map(|entry| entry.key().1)
            .collect();
        for user_id in &typists {
            self.entries.remove(&(conversation_id, *user_id));
        }
        typists
    }

    pub fn is_typing(&self, conversation_id: ConversationId, user_id: UserId) -> bool {
        self.entries.contains_key(&(conversation_id, user_id))
    }

    /// Entries whose deadline has passed at `now`.
    pub fn due(&self, now: Instant) -> Vec<(ConversationId, UserId)> {
        self.entries
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Removes the entry if it is still expired. A start that arrived after
    /// [`TypingTracker::due`] keeps the entry alive.
    pub fn expire_if_due(&self, conversation_id: ConversationId, user_id: UserId, now: Instant) -> bool {
        self.entries
            .remove_if(&(conversation_id, user_id), |_, entry| entry.deadline <= now)
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOM: ConversationId = ConversationId(1);
    const ALICE: UserId = UserId(1);

    #[test]
    fn repeated_starts_report_one_transition() {
        let tracker = TypingTracker::new(Duration::from_secs(3));
        let now = Instant::now();
        let conn = ConnectionId::new();
        assert!(tracker.start(ROOM, ALICE, conn, now));
        assert!(!tracker.start(ROOM, ALICE, conn, now));
        assert!(tracker.is_typing(ROOM, ALICE));
        assert!(tracker.stop(ROOM, ALICE, conn));
        assert!(!tracker.stop(ROOM, ALICE, conn));
    }

    #[test]
    fn identity_keeps_typing_while_another_connection_types() {
        let tracker = TypingTracker::new(Duration::from_secs(3));
        let now = Instant::now();
        let (desk, phone) = (ConnectionId::new(), ConnectionId::new());
        tracker.start(ROOM, ALICE, desk, now);
        tracker.start(ROOM, ALICE, phone, now);
        assert!(!tracker.stop(ROOM, ALICE, desk));
        assert!(tracker.is_typing(ROOM, ALICE));
        assert!(tracker.stop(ROOM, ALICE, phone));
    }

    #[test]
    fn refreshed_start_postpones_expiry() {
        let tracker = TypingTracker::new(Duration::from_secs(3));
        let start = Instant::now();
        let conn = ConnectionId::new();
        tracker.start(ROOM, ALICE, conn, start);
        tracker.start(ROOM, ALICE, conn, start + Duration::from_secs(2));

        let check = start + Duration::from_secs(4);
        assert!(tracker.due(check).is_empty());
        assert!(!tracker.expire_if_due(ROOM, ALICE, check));

        let later = start + Duration::from_secs(5);
        assert_eq!(tracker.due(later), vec![(ROOM, ALICE)]);
        assert!(tracker.expire_if_due(ROOM, ALICE, later));
        assert!(!tracker.is_typing(ROOM, ALICE));
    }

    #[test]
    fn clear_conversation_only_touches_that_room() {
        let tracker = TypingTracker::new(Duration::from_secs(3));
        let now = Instant::now();
        tracker.start(ROOM, ALICE, ConnectionId::new(), now);
        tracker.start(ROOM, UserId(2), ConnectionId::new(), now);
        tracker.start(ConversationId(2), ALICE, ConnectionId::new(), now);

        let mut cleared = tracker.clear_conversation(ROOM);
        cleared.sort();
        assert_eq!(cleared, vec![ALICE, UserId(2)]);
        assert!(tracker.is_typing(ConversationId(2), ALICE));
    }
}
