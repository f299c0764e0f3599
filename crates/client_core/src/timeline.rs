use std::{collections::HashSet, time::Duration};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, MessageKind, UserId},
    protocol::{MessagePage, MessagePayload},
};

/// How far apart a local echo and its broadcast copy may be for the content
/// heuristic to pair them when no acknowledgement arrived first.
pub const ECHO_MATCH_WINDOW: Duration = Duration::from_secs(10);

/// A message shown locally before the server confirmed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEcho {
    pub client_ref: String,
    pub content: String,
    pub kind: MessageKind,
    pub reply_to_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    pub failed: bool,
}

/// Messages of one open conversation, ordered by `(sent_at, message_id)`.
#[derive(Debug, Clone)]
pub struct MessageTimeline {
    conversation_id: ConversationId,
    own_user_id: UserId,
    messages: Vec<MessagePayload>,
    ids: HashSet<MessageId>,
    pending: Vec<PendingEcho>,
    acknowledged: HashSet<MessageId>,
    has_more: bool,
    loading_older: bool,
}

impl MessageTimeline {
    pub fn new(conversation_id: ConversationId, own_user_id: UserId) -> Self {
        Self {
            conversation_id,
            own_user_id,
            messages: Vec::new(),
            ids: HashSet::new(),
            pending: Vec::new(),
            acknowledged: HashSet::new(),
            has_more: true,
            loading_older: false,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn messages(&self) -> &[MessagePayload] {
        &self.messages
    }

    pub fn pending(&self) -> &[PendingEcho] {
        &self.pending
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_loading_older(&self) -> bool {
        self.loading_older
    }

    pub fn oldest_id(&self) -> Option<MessageId> {
        self.messages.first().map(|message| message.message_id)
    }

    pub fn newest_id(&self) -> Option<MessageId> {
        self.messages.iter().map(|message| message.message_id).max()
    }

    /// Claims the older-page fetch. Returns the cursor to page before, or
    /// `None` when a fetch is already running or history is exhausted.
    pub fn begin_load_older(&mut self) -> Option<MessageId> {
        if self.loading_older || !self.has_more {
            return None;
        }
        let cursor = self.oldest_id()?;
        self.loading_older = true;
        Some(cursor)
    }

    pub fn abort_load_older(&mut self) {
        self.loading_older = false;
    }

    /// Merges a history page. Returns how many messages were new.
    pub fn apply_page(&mut self, page: MessagePage) -> usize {
        self.loading_older = false;
        self.has_more = page.has_more;
        let mut added = 0;
        for message in page.messages {
            if self.insert(message) {
                added += 1;
            }
        }
        added
    }

    /// Inserts a confirmed message, settling the pending echo it stands for.
    /// Returns false for a message already present.
    pub fn insert(&mut self, message: MessagePayload) -> bool {
        if message.conversation_id != self.conversation_id || self.ids.contains(&message.message_id)
        {
            return false;
        }
        if message.sender_id == self.own_user_id
            && !self.acknowledged.remove(&message.message_id)
        {
            self.settle_by_content(&message);
        }

        let key = (message.sent_at, message.message_id);
        let index = self
            .messages
            .partition_point(|existing| (existing.sent_at, existing.message_id) < key);
        self.ids.insert(message.message_id);
        self.messages.insert(index, message);
        true
    }

    pub fn add_pending(&mut self, echo: PendingEcho) {
        self.pending.push(echo);
    }

    /// Settles the echo named by an acknowledgement. Returns false when the
    /// echo was already settled by the content heuristic.
    pub fn acknowledge(&mut self, client_ref: &str, message_id: MessageId) -> bool {
        let Some(index) = self
            .pending
            .iter()
            .position(|echo| echo.client_ref == client_ref)
        else {
            return false;
        };
        self.pending.remove(index);
        if !self.ids.contains(&message_id) {
            self.acknowledged.insert(message_id);
        }
        true
    }

    pub fn mark_failed(&mut self, client_ref: &str) -> bool {
        match self
            .pending
            .iter_mut()
            .find(|echo| echo.client_ref == client_ref)
        {
            Some(echo) => {
                echo.failed = true;
                true
            }
            None => false,
        }
    }

    fn settle_by_content(&mut self, message: &MessagePayload) {
        let matched = self.pending.iter().position(|echo| {
            !echo.failed
                && echo.kind == message.kind
                && echo.content == message.content
                && (message.sent_at - echo.created_at)
                    .abs()
                    .to_std()
                    .is_ok_and(|gap| gap <= ECHO_MATCH_WINDOW)
        });
        if let Some(index) = matched {
            self.pending.remove(index);
        }
    }
}

#[cfg(test)]
#[path = "tests/timeline_tests.rs"]
mod tests;
