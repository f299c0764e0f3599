use std::collections::{BTreeSet, HashMap};

use shared::{
    domain::{ConversationId, MessageId, PresenceStatus, UserId},
    error::ApiError,
    protocol::{ConversationSummary, MessagePage, PresenceEntry, ServerEvent},
};

use crate::{
    conversations::ConversationList,
    timeline::{MessageTimeline, PendingEcho},
};

/// What changed after a server event, for a front-end to re-render.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Ready {
        user: PresenceEntry,
    },
    ConversationsUpdated,
    /// The list no longer matches the server and should be fetched again.
    ConversationsStale,
    TimelineUpdated {
        conversation_id: ConversationId,
    },
    MessageConfirmed {
        client_ref: String,
        message_id: MessageId,
    },
    TypingUpdated {
        conversation_id: ConversationId,
        user_ids: Vec<UserId>,
    },
    ReadReceipt {
        conversation_id: ConversationId,
        user_id: UserId,
        message_id: MessageId,
    },
    PresenceUpdated {
        user_id: UserId,
        status: PresenceStatus,
    },
    ConversationRemoved {
        conversation_id: ConversationId,
    },
    Disconnected,
    Error(ApiError),
}

#[derive(Debug, Default)]
pub struct ChatState {
    user: Option<PresenceEntry>,
    own_user_id: Option<UserId>,
    conversations: ConversationList,
    pending_invitations: Vec<ConversationSummary>,
    open: Option<MessageTimeline>,
    presence: HashMap<UserId, PresenceEntry>,
    typing: HashMap<ConversationId, BTreeSet<UserId>>,
    read_receipts: HashMap<(ConversationId, UserId), MessageId>,
}

impl ChatState {
    pub fn new(own_user_id: UserId) -> Self {
        Self {
            own_user_id: Some(own_user_id),
            ..Self::default()
        }
    }

    pub fn user(&self) -> Option<&PresenceEntry> {
        self.user.as_ref()
    }

    pub fn own_user_id(&self) -> Option<UserId> {
        self.own_user_id
    }

    pub fn conversations(&self) -> &ConversationList {
        &self.conversations
    }

    pub fn pending_invitations(&self) -> &[ConversationSummary] {
        &self.pending_invitations
    }

    pub fn open_timeline(&self) -> Option<&MessageTimeline> {
        self.open.as_ref()
    }

    pub fn open_conversation_id(&self) -> Option<ConversationId> {
        self.open.as_ref().map(MessageTimeline::conversation_id)
    }

    pub fn presence_of(&self, user_id: UserId) -> PresenceStatus {
        self.presence
            .get(&user_id)
            .map_or(PresenceStatus::Offline, |entry| entry.status)
    }

    pub fn typing_in(&self, conversation_id: ConversationId) -> Vec<UserId> {
        self.typing
            .get(&conversation_id)
            .map(|users| users.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn read_cursor_of(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Option<MessageId> {
        self.read_receipts.get(&(conversation_id, user_id)).copied()
    }

    pub fn replace_conversations(
        &mut self,
        accepted: Vec<ConversationSummary>,
        pending: Vec<ConversationSummary>,
    ) {
        self.conversations.replace(accepted);
        self.pending_invitations = pending;
    }

    /// Swaps the open conversation and returns the one that was open before.
    /// Pagination and loading flags start fresh.
    pub fn open_conversation(&mut self, conversation_id: ConversationId) -> Option<ConversationId> {
        let previous = self.open_conversation_id();
        let own = self.own_user_id.unwrap_or(UserId(0));
        self.open = Some(MessageTimeline::new(conversation_id, own));
        previous
    }

    /// Applies a history page. A page for a conversation that is no longer
    /// open is discarded and `false` returned.
    pub fn apply_page(&mut self, conversation_id: ConversationId, page: MessagePage) -> bool {
        match self.open.as_mut() {
            Some(timeline) if timeline.conversation_id() == conversation_id => {
                timeline.apply_page(page);
                true
            }
            _ => false,
        }
    }

    pub fn begin_load_older(&mut self) -> Option<(ConversationId, MessageId)> {
        let timeline = self.open.as_mut()?;
        let cursor = timeline.begin_load_older()?;
        Some((timeline.conversation_id(), cursor))
    }

    pub fn abort_load_older(&mut self, conversation_id: ConversationId) {
        if let Some(timeline) = self.open.as_mut() {
            if timeline.conversation_id() == conversation_id {
                timeline.abort_load_older();
            }
        }
    }

    pub fn add_pending(&mut self, conversation_id: ConversationId, echo: PendingEcho) -> bool {
        match self.open.as_mut() {
            Some(timeline) if timeline.conversation_id() == conversation_id => {
                timeline.add_pending(echo);
                true
            }
            _ => false,
        }
    }

    pub fn mark_failed(&mut self, client_ref: &str) -> bool {
        self.open
            .as_mut()
            .is_some_and(|timeline| timeline.mark_failed(client_ref))
    }

    pub fn mark_read_locally(&mut self, conversation_id: ConversationId) -> bool {
        self.conversations.mark_read(conversation_id)
    }

    pub fn apply_server_event(&mut self, event: ServerEvent) -> Vec<ClientEvent> {
        match event {
            ServerEvent::Ready { user, online } => {
                self.own_user_id = Some(user.user_id);
                self.presence = online
                    .into_iter()
                    .map(|entry| (entry.user_id, entry))
                    .collect();
                self.presence.insert(user.user_id, user.clone());
                self.user = Some(user.clone());
                vec![ClientEvent::Ready { user }]
            }
            ServerEvent::Joined { .. } | ServerEvent::Left { .. } => Vec::new(),
            ServerEvent::MessageAccepted {
                client_ref,
                conversation_id,
                message_id,
                ..
            } => {
                let settled = self
                    .open
                    .as_mut()
                    .filter(|timeline| timeline.conversation_id() == conversation_id)
                    .is_some_and(|timeline| timeline.acknowledge(&client_ref, message_id));
                let mut events = vec![ClientEvent::MessageConfirmed {
                    client_ref,
                    message_id,
                }];
                if settled {
                    events.push(ClientEvent::TimelineUpdated { conversation_id });
                }
                events
            }
            ServerEvent::MessageDelivered { message } => {
                let conversation_id = message.conversation_id;
                let own = Some(message.sender_id) == self.own_user_id;
                let is_open = self.open_conversation_id() == Some(conversation_id);
                let mut events = Vec::new();

                if self.stop_typing(conversation_id, message.sender_id) {
                    events.push(self.typing_event(conversation_id));
                }
                if self.conversations.bump(
                    conversation_id,
                    message.sent_at,
                    Some(message.clone()),
                    !own && !is_open,
                ) {
                    events.push(ClientEvent::ConversationsUpdated);
                } else {
                    events.push(ClientEvent::ConversationsStale);
                }
                if let Some(timeline) = self.open.as_mut().filter(|_| is_open) {
                    if timeline.insert(message) {
                        events.push(ClientEvent::TimelineUpdated { conversation_id });
                    }
                }
                events
            }
            ServerEvent::ConversationActivity {
                conversation_id,
                sender_id,
                last_activity_at,
                ..
            } => {
                let own = Some(sender_id) == self.own_user_id;
                let is_open = self.open_conversation_id() == Some(conversation_id);
                if self
                    .conversations
                    .bump(conversation_id, last_activity_at, None, !own && !is_open)
                {
                    vec![ClientEvent::ConversationsUpdated]
                } else {
                    vec![ClientEvent::ConversationsStale]
                }
            }
            ServerEvent::TypingStarted {
                conversation_id,
                user_id,
            } => {
                if self.typing.entry(conversation_id).or_default().insert(user_id) {
                    vec![self.typing_event(conversation_id)]
                } else {
                    Vec::new()
                }
            }
            ServerEvent::TypingStopped {
                conversation_id,
                user_id,
            } => {
                if self.stop_typing(conversation_id, user_id) {
                    vec![self.typing_event(conversation_id)]
                } else {
                    Vec::new()
                }
            }
            ServerEvent::ReadStatus {
                conversation_id,
                user_id,
                message_id,
                ..
            } => {
                let cursor = self
                    .read_receipts
                    .entry((conversation_id, user_id))
                    .or_insert(message_id);
                if *cursor < message_id {
                    *cursor = message_id;
                }
                let mut events = vec![ClientEvent::ReadReceipt {
                    conversation_id,
                    user_id,
                    message_id,
                }];
                if Some(user_id) == self.own_user_id && self.conversations.mark_read(conversation_id)
                {
                    events.push(ClientEvent::ConversationsUpdated);
                }
                events
            }
            ServerEvent::PresenceOnline {
                user_id,
                display_name,
                status,
            } => {
                self.presence.insert(
                    user_id,
                    PresenceEntry {
                        user_id,
                        display_name,
                        status,
                    },
                );
                vec![ClientEvent::PresenceUpdated { user_id, status }]
            }
            ServerEvent::PresenceOffline { user_id, .. } => {
                self.presence.remove(&user_id);
                vec![ClientEvent::PresenceUpdated {
                    user_id,
                    status: PresenceStatus::Offline,
                }]
            }
            ServerEvent::PresenceStatusChanged { user_id, status } => {
                if status == PresenceStatus::Offline {
                    self.presence.remove(&user_id);
                } else {
                    self.presence
                        .entry(user_id)
                        .or_insert_with(|| PresenceEntry {
                            user_id,
                            display_name: user_id.to_string(),
                            status,
                        })
                        .status = status;
                }
                if let Some(user) = self.user.as_mut().filter(|user| user.user_id == user_id) {
                    user.status = status;
                }
                vec![ClientEvent::PresenceUpdated { user_id, status }]
            }
            ServerEvent::ConversationCreated { .. } => vec![ClientEvent::ConversationsStale],
            ServerEvent::ConversationRemoved { conversation_id } => {
                self.conversations.remove(conversation_id);
                self.pending_invitations
                    .retain(|entry| entry.conversation_id != conversation_id);
                self.typing.remove(&conversation_id);
                self.read_receipts
                    .retain(|(conversation, _), _| *conversation != conversation_id);
                if self.open_conversation_id() == Some(conversation_id) {
                    self.open = None;
                }
                vec![
                    ClientEvent::ConversationRemoved { conversation_id },
                    ClientEvent::ConversationsUpdated,
                ]
            }
            ServerEvent::Error(error) => vec![ClientEvent::Error(error)],
        }
    }

    fn stop_typing(&mut self, conversation_id: ConversationId, user_id: UserId) -> bool {
        let Some(users) = self.typing.get_mut(&conversation_id) else {
            return false;
        };
        let removed = users.remove(&user_id);
        if users.is_empty() {
            self.typing.remove(&conversation_id);
        }
        removed
    }

    fn typing_event(&self, conversation_id: ConversationId) -> ClientEvent {
        ClientEvent::TypingUpdated {
            conversation_id,
            user_ids: self.typing_in(conversation_id),
        }
    }
}

#[cfg(test)]
#[path = "tests/state_tests.rs"]
mod tests;
