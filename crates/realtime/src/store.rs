use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, PresenceStatus, UserId},
    protocol::MessagePayload,
};
use storage::{NewMessage, Storage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub user_id: UserId,
    pub display_name: String,
    pub disabled: bool,
}

/// Durable state the realtime core reads and writes. Implemented by [`Storage`];
/// tests wrap it to inject failures.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn account(&self, user_id: UserId) -> Result<Option<Account>>;
    async fn is_member(&self, conversation_id: ConversationId, user_id: UserId) -> Result<bool>;
    async fn member_ids(&self, conversation_id: ConversationId) -> Result<Vec<UserId>>;
    async fn append_message(&self, message: NewMessage) -> Result<MessagePayload>;
    async fn message_conversation(&self, message_id: MessageId) -> Result<Option<ConversationId>>;
    async fn read_cursor(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<MessageId>>;
    async fn store_read_cursor(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        message_id: MessageId,
        read_at: DateTime<Utc>,
    ) -> Result<()>;
    async fn store_presence(
        &self,
        user_id: UserId,
        status: PresenceStatus,
        last_seen_at: DateTime<Utc>,
    ) -> Result<()>;
}

#[async_trait]
impl ChatStore for Storage {
    async fn account(&self, user_id: UserId) -> Result<Option<Account>> {
        Ok(self.load_user(user_id).await?.map(|user| Account {
            user_id: user.user_id,
            display_name: user.display_name,
            disabled: user.disabled,
        }))
    }

    async fn is_member(&self, conversation_id: ConversationId, user_id: UserId) -> Result<bool> {
        self.is_accepted_member(conversation_id, user_id).await
    }

    async fn member_ids(&self, conversation_id: ConversationId) -> Result<Vec<UserId>> {
        self.accepted_member_ids(conversation_id).await
    }

    async fn append_message(&self, message: NewMessage) -> Result<MessagePayload> {
        Ok(self.insert_message(&message).await?.into_payload())
    }

    async fn message_conversation(&self, message_id: MessageId) -> Result<Option<ConversationId>> {
        Ok(self
            .load_message(message_id)
            .await?
            .map(|message| message.conversation_id))
    }

    async fn read_cursor(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<MessageId>> {
        Storage::read_cursor(self, conversation_id, user_id).await
    }

    async fn store_read_cursor(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        message_id: MessageId,
        read_at: DateTime<Utc>,
    ) -> Result<()> {
        self.advance_read_cursor(conversation_id, user_id, message_id, read_at)
            .await?;
        Ok(())
    }

    async fn store_presence(
        &self,
        user_id: UserId,
        status: PresenceStatus,
        last_seen_at: DateTime<Utc>,
    ) -> Result<()> {
        self.set_presence(user_id, status, last_seen_at).await
    }
}
