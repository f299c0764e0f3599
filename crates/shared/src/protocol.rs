use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        ConversationId, ConversationKind, MembershipState, MessageId, MessageKind,
        PresenceStatus, Role, UserId,
    },
    error::ApiError,
};

/// Frames a client sends over the persistent connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    Authenticate {
        token: String,
    },
    JoinConversation {
        conversation_id: ConversationId,
    },
    LeaveConversation {
        conversation_id: ConversationId,
    },
    SendMessage {
        conversation_id: ConversationId,
        content: String,
        #[serde(default)]
        kind: MessageKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to_id: Option<MessageId>,
        /// Provisional id the sender uses for its local echo.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_ref: Option<String>,
    },
    TypingStart {
        conversation_id: ConversationId,
    },
    TypingStop {
        conversation_id: ConversationId,
    },
    MarkMessageRead {
        message_id: MessageId,
    },
    MarkConversationRead {
        conversation_id: ConversationId,
        last_message_id: MessageId,
    },
    SetStatus {
        status: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub content: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub display_name: String,
    pub status: PresenceStatus,
}

/// Events the server pushes over the persistent connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    Ready {
        user: PresenceEntry,
        online: Vec<PresenceEntry>,
    },
    Joined {
        conversation_id: ConversationId,
    },
    Left {
        conversation_id: ConversationId,
    },
    MessageAccepted {
        client_ref: String,
        conversation_id: ConversationId,
        message_id: MessageId,
        sent_at: DateTime<Utc>,
    },
    MessageDelivered {
        message: MessagePayload,
    },
    TypingStarted {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    TypingStopped {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    ReadStatus {
        conversation_id: ConversationId,
        user_id: UserId,
        message_id: MessageId,
        read_at: DateTime<Utc>,
    },
    PresenceOnline {
        user_id: UserId,
        display_name: String,
        status: PresenceStatus,
    },
    PresenceOffline {
        user_id: UserId,
        last_seen: DateTime<Utc>,
    },
    PresenceStatusChanged {
        user_id: UserId,
        status: PresenceStatus,
    },
    ConversationActivity {
        conversation_id: ConversationId,
        message_id: MessageId,
        sender_id: UserId,
        last_activity_at: DateTime<Utc>,
    },
    ConversationCreated {
        conversation_id: ConversationId,
        kind: ConversationKind,
    },
    ConversationRemoved {
        conversation_id: ConversationId,
    },
    Error(ApiError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub user_id: UserId,
    pub display_name: String,
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
    /// Group name, or the other participant's display name for private chats.
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<UserId>,
    pub role: Role,
    pub state: MembershipState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePayload>,
    pub last_activity_at: DateTime<Utc>,
    pub unread_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<MessagePayload>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagesQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CreateConversationRequest {
    Private {
        user_id: UserId,
    },
    Group {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default)]
        member_ids: Vec<UserId>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMemberSummary {
    pub user_id: UserId,
    pub display_name: String,
    pub role: Role,
    pub state: MembershipState,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDetails {
    pub conversation_id: ConversationId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub members: Vec<GroupMemberSummary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateGroupRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddMembersRequest {
    pub member_ids: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateMemberRoleRequest {
    pub role: Role,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_request_uses_tagged_payload_encoding() {
        let raw = r#"{"type":"send_message","payload":{"conversation_id":4,"content":"hi"}}"#;
        let request: ClientRequest = serde_json::from_str(raw).expect("decode");
        match request {
            ClientRequest::SendMessage {
                conversation_id,
                content,
                kind,
                reply_to_id,
                client_ref,
            } => {
                assert_eq!(conversation_id, ConversationId(4));
                assert_eq!(content, "hi");
                assert_eq!(kind, MessageKind::Text);
                assert!(reply_to_id.is_none());
                assert!(client_ref.is_none());
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn error_event_carries_snake_case_code() {
        let event = ServerEvent::Error(ApiError::new(
            crate::error::ErrorCode::NotMember,
            "not a member",
        ));
        let value = serde_json::to_value(&event).expect("encode");
        assert_eq!(value["type"], "error");
        assert_eq!(value["payload"]["code"], "not_member");
    }

    #[test]
    fn create_conversation_request_is_tagged_by_kind() {
        let raw = r#"{"kind":"group","name":"ops","member_ids":[2,3]}"#;
        let request: CreateConversationRequest = serde_json::from_str(raw).expect("decode");
        assert!(matches!(
            request,
            CreateConversationRequest::Group { ref member_ids, .. } if member_ids.len() == 2
        ));
    }
}
