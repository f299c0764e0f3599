//! Room subscriptions: which connections currently receive a conversation's events.
//!
//! `rooms` is the forward index and `subscriptions` the reverse one, so closing a
//! connection can drop all of its rooms without scanning every room.

use std::collections::HashSet;

use dashmap::DashMap;
use shared::domain::{ConnectionId, ConversationId};
use tracing::debug;

#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: DashMap<ConversationId, HashSet<ConnectionId>>,
    subscriptions: DashMap<ConnectionId, HashSet<ConversationId>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the connection was already subscribed.
    pub fn join(&self, conversation_id: ConversationId, connection_id: ConnectionId) -> bool {
        let added = self
            .rooms
            .entry(conversation_id)
            .or_default()
            .insert(connection_id);
        if added {
            self.subscriptions
                .entry(connection_id)
                .or_default()
                .insert(conversation_id);
            debug!(conversation_id = conversation_id.0, %connection_id, "joined room");
        }
        added
    }

    /// Returns false when the connection was not subscribed.
    pub fn leave(&self, conversation_id: ConversationId, connection_id: ConnectionId) -> bool {
        let removed = self
            .rooms
            .get_mut(&conversation_id)
            .map(|mut room| room.remove(&connection_id))
            .unwrap_or(false);
        self.rooms
            .remove_if(&conversation_id, |_, members| members.is_empty());

        if let Some(mut rooms) = self.subscriptions.get_mut(&connection_id) {
            rooms.remove(&conversation_id);
        }
        self.subscriptions
            .remove_if(&connection_id, |_, rooms| rooms.is_empty());

        if removed {
            debug!(conversation_id = conversation_id.0, %connection_id, "left room");
        }
        removed
    }

    /// Drops every subscription of a connection and returns the rooms it was in.
    pub fn leave_all(&self, connection_id: ConnectionId) -> Vec<ConversationId> {
        let Some((_, rooms)) = self.subscriptions.remove(&connection_id) else {
            return Vec::new();
        };
        let mut left: Vec<ConversationId> = rooms.into_iter().collect();
        left.sort();
        for conversation_id in &left {
            if let Some(mut room) = self.rooms.get_mut(conversation_id) {
                room.remove(&connection_id);
            }
            self.rooms
                .remove_if(conversation_id, |_, members| members.is_empty());
        }
        left
    }

    /// Removes the whole room, returning the connections that were subscribed.
    pub fn close(&self, conversation_id: ConversationId) -> Vec<ConnectionId> {
        let Some((_, members)) = self.rooms.remove(&conversation_id) else {
            return Vec::new();
        };
        for connection_id in &members {
            if let Some(mut rooms) = self.subscriptions.get_mut(connection_id) {
                rooms.remove(&conversation_id);
            }
            self.subscriptions
                .remove_if(connection_id, |_, rooms| rooms.is_empty());
        }
        members.into_iter().collect()
    }

    pub fn subscribers(&self, conversation_id: ConversationId) -> Vec<ConnectionId> {
        self.rooms
            .get(&conversation_id)
            .map(|room| room.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, conversation_id: ConversationId, connection_id: ConnectionId) -> bool {
        self.rooms
            .get(&conversation_id)
            .is_some_and(|room| room.contains(&connection_id))
    }

    pub fn rooms_of(&self, connection_id: ConnectionId) -> Vec<ConversationId> {
        self.subscriptions
            .get(&connection_id)
            .map(|rooms| rooms.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
