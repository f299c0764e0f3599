//! The realtime chat service: one object owning presence, rooms, typing and
//! read state, with a single dispatch point per connection.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use chrono::{DateTime, Utc};
use session_auth::TokenIssuer;
use shared::{
    domain::{ConnectionId, ConversationId, MessageId, MessageKind, PresenceStatus, UserId},
    protocol::{ClientRequest, MessagePayload, ServerEvent},
};
use storage::NewMessage;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    auth::SessionAuthenticator,
    connection::{ConnectionHandle, Identity},
    error::{persistence, RealtimeError},
    presence::PresenceRegistry,
    read_state::ReadCursors,
    rooms::RoomRegistry,
    sequencer::RoomSequencer,
    store::ChatStore,
    typing::TypingTracker,
};

pub const MAX_MESSAGE_CHARS: usize = 4000;

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// How long a typing indicator survives without a fresh start signal.
    pub typing_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            typing_timeout: Duration::from_secs(3),
        }
    }
}

/// A message submission as received from a connection.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub conversation_id: ConversationId,
    pub content: String,
    pub kind: MessageKind,
    pub reply_to_id: Option<MessageId>,
    pub client_ref: Option<String>,
}

/// Which subscribers a room broadcast skips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exclude {
    Nobody,
    Connection(ConnectionId),
    Identity(UserId),
}

/// Writes that are applied in submission order by a single background task.
enum WriteBehind {
    Presence {
        user_id: UserId,
        status: PresenceStatus,
        at: DateTime<Utc>,
        done: Option<oneshot::Sender<anyhow::Result<()>>>,
    },
    ReadCursor {
        conversation_id: ConversationId,
        user_id: UserId,
        message_id: MessageId,
        read_at: DateTime<Utc>,
    },
    Flush(oneshot::Sender<()>),
}

pub struct ChatHub {
    store: Arc<dyn ChatStore>,
    authenticator: SessionAuthenticator,
    presence: PresenceRegistry,
    rooms: RoomRegistry,
    sequencer: RoomSequencer,
    typing: TypingTracker,
    reads: ReadCursors,
    writes: mpsc::UnboundedSender<WriteBehind>,
}

impl ChatHub {
    /// Must be called inside a tokio runtime: the write-behind task is spawned here.
    pub fn new(store: Arc<dyn ChatStore>, tokens: TokenIssuer, config: HubConfig) -> Arc<Self> {
        let (writes, queue) = mpsc::unbounded_channel();
        tokio::spawn(run_write_behind(Arc::clone(&store), queue));
        Arc::new(Self {
            authenticator: SessionAuthenticator::new(tokens, Arc::clone(&store)),
            store,
            presence: PresenceRegistry::new(),
            rooms: RoomRegistry::new(),
            sequencer: RoomSequencer::new(),
            typing: TypingTracker::new(config.typing_timeout),
            reads: ReadCursors::new(),
            writes,
        })
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn typing(&self) -> &TypingTracker {
        &self.typing
    }

    pub async fn authenticate(&self, credential: Option<&str>) -> Result<Identity, RealtimeError> {
        self.authenticator.authenticate(credential).await
    }

    /// Admits an authenticated identity. The returned receiver yields the ready
    /// snapshot first, then every event addressed to the connection.
    pub fn connect(
        &self,
        identity: Identity,
    ) -> (Arc<ConnectionHandle>, mpsc::UnboundedReceiver<ServerEvent>) {
        let (handle, events) = ConnectionHandle::new(identity);
        let status = self.presence.register(&handle);
        self.write_behind(WriteBehind::Presence {
            user_id: handle.identity.user_id,
            status,
            at: Utc::now(),
            done: None,
        });
        info!(
            connection_id = %handle.id,
            user_id = handle.identity.user_id.0,
            "connection registered"
        );
        (handle, events)
    }

    /// Handles one inbound frame. Failures are reported to the originating connection only.
    pub async fn dispatch(&self, handle: &Arc<ConnectionHandle>, request: ClientRequest) {
        let result = match request {
            ClientRequest::Authenticate { .. } => Err(RealtimeError::Validation(
                "connection is already authenticated".into(),
            )),
            ClientRequest::JoinConversation { conversation_id } => {
                self.join(handle, conversation_id).await
            }
            ClientRequest::LeaveConversation { conversation_id } => {
                self.leave(handle, conversation_id).await;
                Ok(())
            }
            ClientRequest::SendMessage {
                conversation_id,
                content,
                kind,
                reply_to_id,
                client_ref,
            } => self
                .submit(
                    handle,
                    MessageDraft {
                        conversation_id,
                        content,
                        kind,
                        reply_to_id,
                        client_ref,
                    },
                )
                .await
                .map(drop),
            ClientRequest::TypingStart { conversation_id } => {
                self.start_typing(handle, conversation_id).await
            }
            ClientRequest::TypingStop { conversation_id } => {
                self.stop_typing(handle, conversation_id).await;
                Ok(())
            }
            ClientRequest::MarkMessageRead { message_id } => {
                self.mark_message_read(handle, message_id).await.map(drop)
            }
            ClientRequest::MarkConversationRead {
                conversation_id,
                last_message_id,
            } => self
                .mark_conversation_read(handle, conversation_id, last_message_id)
                .await
                .map(drop),
            ClientRequest::SetStatus { status } => self
                .set_status(handle.identity.user_id, &status)
                .await
                .map(drop),
        };

        if let Err(err) = result {
            debug!(
                connection_id = %handle.id,
                code = ?err.code(),
                error = %err,
                "request rejected"
            );
            handle.deliver(ServerEvent::Error(err.to_api_error()));
        }
    }

    pub async fn join(
        &self,
        handle: &Arc<ConnectionHandle>,
        conversation_id: ConversationId,
    ) -> Result<(), RealtimeError> {
        let user_id = handle.identity.user_id;
        let _turn = self.sequencer.turn(conversation_id).await;
        let member = self
            .store
            .is_member(conversation_id, user_id)
            .await
            .map_err(persistence)?;
        if !member {
            warn!(
                user_id = user_id.0,
                conversation_id = conversation_id.0,
                "join refused for non-member"
            );
            return Err(RealtimeError::Forbidden(conversation_id));
        }
        self.rooms.join(conversation_id, handle.id);
        handle.deliver(ServerEvent::Joined { conversation_id });
        Ok(())
    }

    /// Leaving a room the connection is not in still acknowledges.
    pub async fn leave(&self, handle: &Arc<ConnectionHandle>, conversation_id: ConversationId) {
        let _turn = self.sequencer.turn(conversation_id).await;
        if self.rooms.leave(conversation_id, handle.id) {
            self.stop_typing_in_turn(conversation_id, handle.identity.user_id, handle.id);
        }
        handle.deliver(ServerEvent::Left { conversation_id });
    }

    pub async fn submit(
        &self,
        handle: &Arc<ConnectionHandle>,
        draft: MessageDraft,
    ) -> Result<MessagePayload, RealtimeError> {
        let MessageDraft {
            conversation_id,
            content,
            kind,
            reply_to_id,
            client_ref,
        } = draft;
        if content.trim().is_empty() {
            return Err(RealtimeError::Validation("message content is empty".into()));
        }
        if content.chars().count() > MAX_MESSAGE_CHARS {
            return Err(RealtimeError::Validation(format!(
                "message exceeds {MAX_MESSAGE_CHARS} characters"
            )));
        }

        let sender_id = handle.identity.user_id;
        let message = {
            // Membership is checked under the turn, ordered with evictions.
            let _turn = self.sequencer.turn(conversation_id).await;
            let member = self
                .store
                .is_member(conversation_id, sender_id)
                .await
                .map_err(persistence)?;
            if !member {
                return Err(RealtimeError::NotMember(conversation_id));
            }
            if let Some(reply_to_id) = reply_to_id {
                let target = self
                    .store
                    .message_conversation(reply_to_id)
                    .await
                    .map_err(persistence)?;
                if target != Some(conversation_id) {
                    return Err(RealtimeError::Validation(format!(
                        "reply target {reply_to_id} is not in this conversation"
                    )));
                }
            }

            let message = self
                .store
                .append_message(NewMessage {
                    conversation_id,
                    sender_id,
                    content,
                    kind,
                    reply_to_id,
                    sent_at: Utc::now(),
                })
                .await
                .map_err(persistence)?;

            if let Some(client_ref) = client_ref {
                handle.deliver(ServerEvent::MessageAccepted {
                    client_ref,
                    conversation_id,
                    message_id: message.message_id,
                    sent_at: message.sent_at,
                });
            }
            let delivered = self.broadcast_room(
                conversation_id,
                ServerEvent::MessageDelivered {
                    message: message.clone(),
                },
                Exclude::Nobody,
            );
            if self.typing.stop_identity(conversation_id, sender_id) {
                self.broadcast_room(
                    conversation_id,
                    ServerEvent::TypingStopped {
                        conversation_id,
                        user_id: sender_id,
                    },
                    Exclude::Identity(sender_id),
                );
            }
            info!(
                conversation_id = conversation_id.0,
                message_id = message.message_id.0,
                sender_id = sender_id.0,
                delivered,
                "message accepted"
            );
            message
        };

        self.notify_activity(&message).await;
        Ok(message)
    }

    /// Tells members that are online but not looking at the conversation that it moved.
    async fn notify_activity(&self, message: &MessagePayload) {
        let members = match self.store.member_ids(message.conversation_id).await {
            Ok(members) => members,
            Err(err) => {
                warn!(
                    conversation_id = message.conversation_id.0,
                    error = %err,
                    "skipping activity notification"
                );
                return;
            }
        };
        let event = ServerEvent::ConversationActivity {
            conversation_id: message.conversation_id,
            message_id: message.message_id,
            sender_id: message.sender_id,
            last_activity_at: message.sent_at,
        };
        for member in members {
            for handle in self.presence.connections_of(member) {
                if !self.rooms.is_subscribed(message.conversation_id, handle.id) {
                    handle.deliver(event.clone());
                }
            }
        }
    }

    pub async fn start_typing(
        &self,
        handle: &Arc<ConnectionHandle>,
        conversation_id: ConversationId,
    ) -> Result<(), RealtimeError> {
        let user_id = handle.identity.user_id;
        let _turn = self.sequencer.turn(conversation_id).await;
        if !self.rooms.is_subscribed(conversation_id, handle.id) {
            return Err(RealtimeError::Forbidden(conversation_id));
        }
        if self
            .typing
            .start(conversation_id, user_id, handle.id, Instant::now())
        {
            self.broadcast_room(
                conversation_id,
                ServerEvent::TypingStarted {
                    conversation_id,
                    user_id,
                },
                Exclude::Identity(user_id),
            );
        }
        Ok(())
    }

    pub async fn stop_typing(&self, handle: &Arc<ConnectionHandle>, conversation_id: ConversationId) {
        let _turn = self.sequencer.turn(conversation_id).await;
        self.stop_typing_in_turn(conversation_id, handle.identity.user_id, handle.id);
    }

    fn stop_typing_in_turn(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        connection_id: ConnectionId,
    ) {
        if self.typing.stop(conversation_id, user_id, connection_id) {
            self.broadcast_room(
                conversation_id,
                ServerEvent::TypingStopped {
                    conversation_id,
                    user_id,
                },
                Exclude::Identity(user_id),
            );
        }
    }

    /// Synthesizes stops for indicators whose deadline passed at `now`.
    pub async fn expire_typing(&self, now: Instant) -> usize {
        let mut expired = 0;
        for (conversation_id, user_id) in self.typing.due(now) {
            let _turn = self.sequencer.turn(conversation_id).await;
            if self.typing.expire_if_due(conversation_id, user_id, now) {
                self.broadcast_room(
                    conversation_id,
                    ServerEvent::TypingStopped {
                        conversation_id,
                        user_id,
                    },
                    Exclude::Identity(user_id),
                );
                expired += 1;
            }
        }
        expired
    }

    /// Runs [`ChatHub::expire_typing`] every `every` until the hub is dropped.
    pub fn spawn_typing_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let hub: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(hub) = hub.upgrade() else {
                    break;
                };
                let expired = hub.expire_typing(Instant::now()).await;
                if expired > 0 {
                    debug!(expired, "typing indicators timed out");
                }
            }
        })
    }

    /// Returns whether the cursor moved.
    pub async fn mark_message_read(
        &self,
        handle: &Arc<ConnectionHandle>,
        message_id: MessageId,
    ) -> Result<bool, RealtimeError> {
        let conversation_id = self
            .store
            .message_conversation(message_id)
            .await
            .map_err(persistence)?
            .ok_or_else(|| RealtimeError::InvalidCursor(format!("message {message_id} does not exist")))?;
        self.advance_cursor(handle, conversation_id, message_id).await
    }

    pub async fn mark_conversation_read(
        &self,
        handle: &Arc<ConnectionHandle>,
        conversation_id: ConversationId,
        last_message_id: MessageId,
    ) -> Result<bool, RealtimeError> {
        match self
            .store
            .message_conversation(last_message_id)
            .await
            .map_err(persistence)?
        {
            Some(owner) if owner == conversation_id => {}
            Some(_) => {
                return Err(RealtimeError::InvalidCursor(format!(
                    "message {last_message_id} is not in conversation {conversation_id}"
                )))
            }
            None => {
                return Err(RealtimeError::InvalidCursor(format!(
                    "message {last_message_id} does not exist"
                )))
            }
        }
        self.advance_cursor(handle, conversation_id, last_message_id)
            .await
    }

    async fn advance_cursor(
        &self,
        handle: &Arc<ConnectionHandle>,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<bool, RealtimeError> {
        let user_id = handle.identity.user_id;
        let member = self
            .store
            .is_member(conversation_id, user_id)
            .await
            .map_err(persistence)?;
        if !member {
            return Err(RealtimeError::NotMember(conversation_id));
        }
        if !self.reads.is_known(conversation_id, user_id) {
            // Cursor writes queued before a disconnect must land before the stored value is read.
            self.flush_writes().await;
            let stored = self
                .store
                .read_cursor(conversation_id, user_id)
                .await
                .map_err(persistence)?;
            self.reads.seed(conversation_id, user_id, stored);
        }

        let _turn = self.sequencer.turn(conversation_id).await;
        if !self.reads.advance(conversation_id, user_id, message_id) {
            debug!(
                user_id = user_id.0,
                conversation_id = conversation_id.0,
                message_id = message_id.0,
                "stale read mark ignored"
            );
            return Ok(false);
        }
        let read_at = Utc::now();
        self.write_behind(WriteBehind::ReadCursor {
            conversation_id,
            user_id,
            message_id,
            read_at,
        });
        self.broadcast_room(
            conversation_id,
            ServerEvent::ReadStatus {
                conversation_id,
                user_id,
                message_id,
                read_at,
            },
            Exclude::Connection(handle.id),
        );
        Ok(true)
    }

    /// Persists and applies a self-chosen status. `offline` cannot be chosen.
    pub async fn set_status(&self, user_id: UserId, raw: &str) -> Result<PresenceStatus, RealtimeError> {
        let status: PresenceStatus = raw
            .parse()
            .map_err(|_| RealtimeError::InvalidStatus(raw.to_string()))?;
        if !status.is_settable() {
            return Err(RealtimeError::InvalidStatus(raw.to_string()));
        }

        let (done, persisted) = oneshot::channel();
        self.write_behind(WriteBehind::Presence {
            user_id,
            status,
            at: Utc::now(),
            done: Some(done),
        });
        match persisted.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(persistence(err)),
            Err(_) => {
                return Err(RealtimeError::Persistence(
                    "presence writer is not running".into(),
                ))
            }
        }

        self.presence.set_status(user_id, status);
        info!(user_id = user_id.0, status = status.as_str(), "presence status changed");
        Ok(status)
    }

    /// Tears down a connection: rooms, typing state, then presence.
    pub async fn disconnect(&self, connection_id: ConnectionId) {
        let Some(handle) = self.presence.handle(connection_id) else {
            return;
        };
        let user_id = handle.identity.user_id;

        for conversation_id in self.rooms.leave_all(connection_id) {
            let _turn = self.sequencer.turn(conversation_id).await;
            self.stop_typing_in_turn(conversation_id, user_id, connection_id);
        }

        if let Some(unregistered) = self.presence.unregister(connection_id) {
            if let Some(last_seen) = unregistered.went_offline {
                self.write_behind(WriteBehind::Presence {
                    user_id,
                    status: PresenceStatus::Offline,
                    at: last_seen,
                    done: None,
                });
                self.reads.forget_user(user_id);
            }
        }
        info!(%connection_id, user_id = user_id.0, "connection closed");
    }

    /// Drops a user's subscriptions to a conversation they no longer belong to.
    pub async fn evict_member(&self, conversation_id: ConversationId, user_id: UserId) {
        let connections = self.presence.connections_of(user_id);
        {
            let _turn = self.sequencer.turn(conversation_id).await;
            for handle in &connections {
                self.rooms.leave(conversation_id, handle.id);
            }
            if self.typing.stop_identity(conversation_id, user_id) {
                self.broadcast_room(
                    conversation_id,
                    ServerEvent::TypingStopped {
                        conversation_id,
                        user_id,
                    },
                    Exclude::Identity(user_id),
                );
            }
        }
        for handle in connections {
            handle.deliver(ServerEvent::ConversationRemoved { conversation_id });
        }
        debug!(
            conversation_id = conversation_id.0,
            user_id = user_id.0,
            "member evicted from room"
        );
    }

    /// Closes a deleted conversation's room and tells every former member.
    pub async fn close_conversation(&self, conversation_id: ConversationId, members: &[UserId]) {
        {
            let _turn = self.sequencer.turn(conversation_id).await;
            self.rooms.close(conversation_id);
            self.typing.clear_conversation(conversation_id);
            self.reads.forget_conversation(conversation_id);
        }
        self.notify_users(members, &ServerEvent::ConversationRemoved { conversation_id });
        info!(conversation_id = conversation_id.0, "conversation closed");
    }

    /// Sends an event to every live connection of the given users.
    pub fn notify_users(&self, users: &[UserId], event: &ServerEvent) -> usize {
        let mut delivered = 0;
        for user_id in users {
            for handle in self.presence.connections_of(*user_id) {
                if handle.deliver(event.clone()) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Waits until every write queued so far has been applied.
    pub async fn flush_writes(&self) {
        let (done, flushed) = oneshot::channel();
        self.write_behind(WriteBehind::Flush(done));
        let _ = flushed.await;
    }

    fn write_behind(&self, write: WriteBehind) {
        if self.writes.send(write).is_err() {
            error!("write-behind queue is closed");
        }
    }

    /// Must be called while holding the room's turn.
    fn broadcast_room(&self, conversation_id: ConversationId, event: ServerEvent, exclude: Exclude) -> usize {
        let mut delivered = 0;
        for connection_id in self.rooms.subscribers(conversation_id) {
            let Some(handle) = self.presence.handle(connection_id) else {
                continue;
            };
            let skip = match exclude {
                Exclude::Nobody => false,
                Exclude::Connection(excluded) => excluded == connection_id,
                Exclude::Identity(user_id) => handle.identity.user_id == user_id,
            };
            if skip {
                continue;
            }
            if handle.deliver(event.clone()) {
                delivered += 1;
            } else {
                warn!(
                    %connection_id,
                    conversation_id = conversation_id.0,
                    "dropping room event for closed connection"
                );
            }
        }
        delivered
    }
}

async fn run_write_behind(store: Arc<dyn ChatStore>, mut queue: mpsc::UnboundedReceiver<WriteBehind>) {
    while let Some(write) = queue.recv().await {
        match write {
            WriteBehind::Presence {
                user_id,
                status,
                at,
                done,
            } => {
                let result = store.store_presence(user_id, status, at).await;
                if let Err(err) = &result {
                    error!(user_id = user_id.0, error = %err, "failed to persist presence");
                }
                if let Some(done) = done {
                    let _ = done.send(result);
                }
            }
            WriteBehind::ReadCursor {
                conversation_id,
                user_id,
                message_id,
                read_at,
            } => {
                if let Err(err) = store
                    .store_read_cursor(conversation_id, user_id, message_id, read_at)
                    .await
                {
                    error!(
                        conversation_id = conversation_id.0,
                        user_id = user_id.0,
                        error = %err,
                        "failed to persist read cursor"
                    );
                }
            }
            WriteBehind::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("write-behind task stopped");
}

#[cfg(test)]
#[path = "tests/hub_tests.rs"]
mod tests;
