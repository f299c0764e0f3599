use dashmap::{mapref::entry::Entry, DashMap};
use shared::domain::{ConversationId, MessageId, UserId};

/// In-memory read cursors for identities with a live connection.
///
/// Cursors only move forward; an older message id is accepted and ignored.
#[derive(Debug, Default)]
pub struct ReadCursors {
    cursors: DashMap<(ConversationId, UserId), MessageId>,
}

impl ReadCursors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_known(&self, conversation_id: ConversationId, user_id: UserId) -> bool {
        self.cursors.contains_key(&(conversation_id, user_id))
    }

    /// Loads a stored cursor. An existing in-memory value wins.
    pub fn seed(&self, conversation_id: ConversationId, user_id: UserId, stored: Option<MessageId>) {
        self.cursors
            .entry((conversation_id, user_id))
            .or_insert(stored.unwrap_or(MessageId(0)));
    }

    /// True when the cursor moved.
    pub fn advance(&self, conversation_id: ConversationId, user_id: UserId, message_id: MessageId) -> bool {
        match self.cursors.entry((conversation_id, user_id)) {
            Entry::Occupied(mut entry) => {
                if message_id > *entry.get() {
                    entry.insert(message_id);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(message_id);
                true
            }
        }
    }

    pub fn current(&self, conversation_id: ConversationId, user_id: UserId) -> Option<MessageId> {
        self.cursors
            .get(&(conversation_id, user_id))
            .map(|cursor| *cursor)
    }

    pub fn forget_user(&self, user_id: UserId) {
        self.cursors.retain(|(_, owner), _| *owner != user_id);
    }

    pub fn forget_conversation(&self, conversation_id: ConversationId) {
        self.cursors
            .retain(|(conversation, _), _| *conversation != conversation_id);
    }
}
