use chrono::{DateTime, Utc};
use shared::{domain::ConversationId, protocol::ConversationSummary, protocol::MessagePayload};

/// Conversations ordered most recent activity first.
#[derive(Debug, Clone, Default)]
pub struct ConversationList {
    entries: Vec<ConversationSummary>,
}

impl ConversationList {
    pub fn replace(&mut self, mut entries: Vec<ConversationSummary>) {
        entries.sort_by(|a, b| order_key(b).cmp(&order_key(a)));
        self.entries = entries;
    }

    pub fn entries(&self) -> &[ConversationSummary] {
        &self.entries
    }

    pub fn get(&self, conversation_id: ConversationId) -> Option<&ConversationSummary> {
        self.entries
            .iter()
            .find(|entry| entry.conversation_id == conversation_id)
    }

    pub fn upsert(&mut self, summary: ConversationSummary) {
        self.remove(summary.conversation_id);
        self.insert_ordered(summary);
    }

    pub fn remove(&mut self, conversation_id: ConversationId) -> Option<ConversationSummary> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.conversation_id == conversation_id)?;
        Some(self.entries.remove(index))
    }

    /// Records activity and moves the conversation to its new position.
    /// Returns false when the conversation is not in the list.
    pub fn bump(
        &mut self,
        conversation_id: ConversationId,
        at: DateTime<Utc>,
        message: Option<MessagePayload>,
        unread: bool,
    ) -> bool {
        let Some(mut entry) = self.remove(conversation_id) else {
            return false;
        };
        if at > entry.last_activity_at {
            entry.last_activity_at = at;
        }
        if let Some(message) = message {
            let newer = entry
                .last_message
                .as_ref()
                .map_or(true, |last| last.message_id < message.message_id);
            if newer {
                entry.last_message = Some(message);
            }
        }
        if unread {
            entry.unread_count = entry.unread_count.saturating_add(1);
        }
        self.insert_ordered(entry);
        true
    }

    pub fn mark_read(&mut self, conversation_id: ConversationId) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|entry| entry.conversation_id == conversation_id)
        {
            Some(entry) if entry.unread_count > 0 => {
                entry.unread_count = 0;
                true
            }
            _ => false,
        }
    }

    fn insert_ordered(&mut self, summary: ConversationSummary) {
        let key = order_key(&summary);
        let index = self
            .entries
            .iter()
            .position(|entry| order_key(entry) < key)
            .unwrap_or(self.entries.len());
        self.entries.insert(index, summary);
    }
}

fn order_key(summary: &ConversationSummary) -> (DateTime<Utc>, ConversationId) {
    (summary.last_activity_at, summary.conversation_id)
}
