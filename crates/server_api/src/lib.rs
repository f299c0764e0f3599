use chrono::Utc;
use session_auth::{TokenError, TokenIssuer, TokenKind, VerifiedSession};
use shared::{
    domain::{ConversationId, ConversationKind, MembershipState, Role, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        AddMembersRequest, ConversationSummary, CreateConversationRequest, GroupDetails,
        GroupMemberSummary, LoginRequest, MessagePage, MessagesQuery, SessionResponse,
        UpdateGroupRequest,
    },
};
use storage::{HistoryCursor, Storage, StoredConversation, StoredConversationSummary};
use tracing::info;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;
const MAX_USERNAME_CHARS: usize = 32;
const MAX_DISPLAY_NAME_CHARS: usize = 64;
const MAX_GROUP_NAME_CHARS: usize = 100;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub tokens: TokenIssuer,
}

/// Realtime side effects of a request, applied by the transport layer after it succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
    /// Newly invited users, to be told the conversation exists.
    pub invited: Vec<UserId>,
    /// Users that lost access and must be dropped from the room.
    pub removed: Vec<UserId>,
    /// Everyone who belonged to the conversation when it was deleted.
    pub closed_for: Option<Vec<UserId>>,
}

impl MembershipChange {
    fn new(conversation_id: ConversationId, kind: ConversationKind) -> Self {
        Self {
            conversation_id,
            kind,
            invited: Vec::new(),
            removed: Vec::new(),
            closed_for: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreatedConversation {
    pub summary: ConversationSummary,
    /// False when an existing private conversation was returned.
    pub created: bool,
    pub change: MembershipChange,
}

pub async fn login(ctx: &ApiContext, req: &LoginRequest) -> Result<SessionResponse, ApiError> {
    let username = req.username.trim();
    validate_username(username)?;
    let display_name = match req.display_name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => name,
        _ => username,
    };
    if display_name.chars().count() > MAX_DISPLAY_NAME_CHARS {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("display name exceeds {MAX_DISPLAY_NAME_CHARS} characters"),
        ));
    }

    let user = match ctx
        .storage
        .find_user_by_username(username)
        .await
        .map_err(internal)?
    {
        Some(user) => user,
        None => {
            let user_id = ctx
                .storage
                .create_user(username, display_name)
                .await
                .map_err(internal)?;
            info!(user_id = user_id.0, %username, "user created on first login");
            ctx.storage
                .load_user(user_id)
                .await
                .map_err(internal)?
                .ok_or_else(|| ApiError::new(ErrorCode::Internal, "created user vanished"))?
        }
    };
    if user.disabled {
        return Err(ApiError::new(
            ErrorCode::AccountUnavailable,
            "account is disabled",
        ));
    }
    issue_session(ctx, user.user_id, &user.display_name)
}

pub async fn refresh(ctx: &ApiContext, refresh_token: &str) -> Result<SessionResponse, ApiError> {
    let session = ctx
        .tokens
        .verify(refresh_token, TokenKind::Refresh)
        .map_err(token_error)?;
    let user = ctx
        .storage
        .load_user(session.user_id)
        .await
        .map_err(internal)?
        .filter(|user| !user.disabled)
        .ok_or_else(|| ApiError::new(ErrorCode::AccountUnavailable, "account is unavailable"))?;
    issue_session(ctx, user.user_id, &user.display_name)
}

/// Resolves the bearer token of an HTTP request.
pub async fn authenticate_bearer(
    ctx: &ApiContext,
    token: Option<&str>,
) -> Result<VerifiedSession, ApiError> {
    let token = token
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ApiError::new(ErrorCode::Unauthenticated, "missing bearer token"))?;
    let session = ctx
        .tokens
        .verify(token, TokenKind::Access)
        .map_err(token_error)?;
    let available = ctx
        .storage
        .load_user(session.user_id)
        .await
        .map_err(internal)?
        .is_some_and(|user| !user.disabled);
    if !available {
        return Err(ApiError::new(
            ErrorCode::AccountUnavailable,
            "account is unavailable",
        ));
    }
    Ok(session)
}

pub async fn list_conversations(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Vec<ConversationSummary>, ApiError> {
    let conversations = ctx
        .storage
        .list_conversations(user_id)
        .await
        .map_err(internal)?;
    Ok(conversations.into_iter().map(summary_from_stored).collect())
}

pub async fn list_pending_conversations(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Vec<ConversationSummary>, ApiError> {
    let conversations = ctx
        .storage
        .list_pending_conversations(user_id)
        .await
        .map_err(internal)?;
    Ok(conversations.into_iter().map(summary_from_stored).collect())
}

pub async fn get_messages(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
    query: &MessagesQuery,
) -> Result<MessagePage, ApiError> {
    load_conversation(ctx, conversation_id).await?;
    ensure_accepted(ctx, conversation_id, user_id).await?;

    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let cursor = match (query.before_id, query.before_ts) {
        (Some(before_id), _) => HistoryCursor::BeforeId(shared::domain::MessageId(before_id)),
        (None, Some(before_ts)) => HistoryCursor::BeforeTime(before_ts),
        (None, None) => HistoryCursor::Latest,
    };
    let page = ctx
        .storage
        .list_messages(conversation_id, limit, cursor)
        .await
        .map_err(internal)?;
    Ok(MessagePage {
        messages: page
            .messages
            .into_iter()
            .map(|message| message.into_payload())
            .collect(),
        has_more: page.has_more,
    })
}

pub async fn create_conversation(
    ctx: &ApiContext,
    user_id: UserId,
    req: &CreateConversationRequest,
) -> Result<CreatedConversation, ApiError> {
    let now = Utc::now();
    let (conversation_id, kind, created, invited) = match req {
        CreateConversationRequest::Private { user_id: peer } => {
            if *peer == user_id {
                return Err(ApiError::new(
                    ErrorCode::Validation,
                    "cannot start a private conversation with yourself",
                ));
            }
            ensure_users_exist(ctx, &[*peer]).await?;
            let (conversation_id, created) = ctx
                .storage
                .create_private_conversation(user_id, *peer, now)
                .await
                .map_err(internal)?;
            let invited = if created { vec![*peer] } else { Vec::new() };
            (conversation_id, ConversationKind::Private, created, invited)
        }
        CreateConversationRequest::Group {
            name,
            description,
            member_ids,
        } => {
            let name = validate_group_name(name)?;
            let mut invited: Vec<UserId> = member_ids
                .iter()
                .copied()
                .filter(|member| *member != user_id)
                .collect();
            invited.sort();
            invited.dedup();
            ensure_users_exist(ctx, &invited).await?;
            let conversation_id = ctx
                .storage
                .create_group_conversation(
                    user_id,
                    name,
                    description.as_deref().map(str::trim),
                    &invited,
                    now,
                )
                .await
                .map_err(internal)?;
            (conversation_id, ConversationKind::Group, true, invited)
        }
    };

    if created {
        info!(
            conversation_id = conversation_id.0,
            kind = kind.as_str(),
            creator = user_id.0,
            "conversation created"
        );
    }
    let summary = ctx
        .storage
        .list_conversations(user_id)
        .await
        .map_err(internal)?
        .into_iter()
        .find(|summary| summary.conversation.conversation_id == conversation_id)
        .map(summary_from_stored)
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "conversation not found"))?;

    let mut change = MembershipChange::new(conversation_id, kind);
    change.invited = invited;
    Ok(CreatedConversation {
        summary,
        created,
        change,
    })
}

pub async fn accept_conversation(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
) -> Result<(), ApiError> {
    let accepted = ctx
        .storage
        .accept_membership(conversation_id, user_id)
        .await
        .map_err(internal)?;
    if !accepted {
        return Err(ApiError::new(
            ErrorCode::NotFound,
            "no pending invitation for this conversation",
        ));
    }
    info!(conversation_id = conversation_id.0, user_id = user_id.0, "invitation accepted");
    Ok(())
}

/// Declines an invitation. Declining a private conversation deletes it.
pub async fn reject_conversation(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
) -> Result<MembershipChange, ApiError> {
    let conversation = load_conversation(ctx, conversation_id).await?;
    match membership(ctx, conversation_id, user_id).await? {
        Some((_, MembershipState::Pending)) => {}
        _ => {
            return Err(ApiError::new(
                ErrorCode::NotFound,
                "no pending invitation for this conversation",
            ))
        }
    }

    let mut change = MembershipChange::new(conversation_id, conversation.kind);
    if conversation.kind == ConversationKind::Private {
        let members = member_ids(ctx, conversation_id).await?;
        ctx.storage
            .delete_conversation(conversation_id)
            .await
            .map_err(internal)?;
        change.closed_for = Some(members);
    } else {
        ctx.storage
            .remove_membership(conversation_id, user_id)
            .await
            .map_err(internal)?;
    }
    info!(conversation_id = conversation_id.0, user_id = user_id.0, "invitation rejected");
    Ok(change)
}

/// Private conversations can be deleted by either participant, groups only by their owner.
pub async fn delete_conversation(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
) -> Result<MembershipChange, ApiError> {
    let conversation = load_conversation(ctx, conversation_id).await?;
    let role = ensure_accepted(ctx, conversation_id, user_id).await?;
    if conversation.kind == ConversationKind::Group && role != Role::Owner {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "only the owner can delete a group",
        ));
    }

    let members = member_ids(ctx, conversation_id).await?;
    ctx.storage
        .delete_conversation(conversation_id)
        .await
        .map_err(internal)?;
    info!(conversation_id = conversation_id.0, user_id = user_id.0, "conversation deleted");

    let mut change = MembershipChange::new(conversation_id, conversation.kind);
    change.closed_for = Some(members);
    Ok(change)
}

pub async fn get_group_details(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
) -> Result<GroupDetails, ApiError> {
    let group = load_group(ctx, conversation_id).await?;
    ensure_accepted(ctx, conversation_id, user_id).await?;
    group_details(ctx, group).await
}

pub async fn update_group_settings(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
    req: &UpdateGroupRequest,
) -> Result<GroupDetails, ApiError> {
    load_group(ctx, conversation_id).await?;
    ensure_manager(ctx, conversation_id, user_id).await?;
    let name = req.name.as_deref().map(validate_group_name).transpose()?;
    let description = req.description.as_deref().map(str::trim);

    ctx.storage
        .update_group_settings(conversation_id, name, description)
        .await
        .map_err(internal)?;
    let group = load_group(ctx, conversation_id).await?;
    group_details(ctx, group).await
}

pub async fn add_members(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
    req: &AddMembersRequest,
) -> Result<MembershipChange, ApiError> {
    load_group(ctx, conversation_id).await?;
    ensure_manager(ctx, conversation_id, user_id).await?;
    if req.member_ids.is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "no members given"));
    }
    ensure_users_exist(ctx, &req.member_ids).await?;

    let invited = ctx
        .storage
        .invite_members(conversation_id, &req.member_ids)
        .await
        .map_err(internal)?;
    info!(
        conversation_id = conversation_id.0,
        invited = invited.len(),
        "members invited"
    );
    let mut change = MembershipChange::new(conversation_id, ConversationKind::Group);
    change.invited = invited;
    Ok(change)
}

/// Owners may remove anyone else; admins may remove plain members.
pub async fn remove_member(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
    target: UserId,
) -> Result<MembershipChange, ApiError> {
    load_group(ctx, conversation_id).await?;
    let actor_role = ensure_manager(ctx, conversation_id, user_id).await?;
    if target == user_id {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "leave the group instead of removing yourself",
        ));
    }
    let (target_role, _) = membership(ctx, conversation_id, target)
        .await?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "user is not in this group"))?;
    let allowed = match actor_role {
        Role::Owner => true,
        Role::Admin => target_role == Role::Member,
        Role::Member => false,
    };
    if !allowed {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            format!("{} cannot remove {}", actor_role.as_str(), target_role.as_str()),
        ));
    }

    ctx.storage
        .remove_membership(conversation_id, target)
        .await
        .map_err(internal)?;
    info!(
        conversation_id = conversation_id.0,
        removed = target.0,
        by = user_id.0,
        "member removed"
    );
    let mut change = MembershipChange::new(conversation_id, ConversationKind::Group);
    change.removed = vec![target];
    Ok(change)
}

/// Only the owner assigns roles, and ownership itself is not assignable.
pub async fn update_member_role(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
    target: UserId,
    role: Role,
) -> Result<(), ApiError> {
    load_group(ctx, conversation_id).await?;
    let actor_role = ensure_accepted(ctx, conversation_id, user_id).await?;
    if actor_role != Role::Owner {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "only the owner can change roles",
        ));
    }
    if role == Role::Owner {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "ownership cannot be assigned",
        ));
    }
    if target == user_id {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "the owner's role cannot be changed",
        ));
    }
    let updated = ctx
        .storage
        .update_member_role(conversation_id, target, role)
        .await
        .map_err(internal)?;
    if !updated {
        return Err(ApiError::new(ErrorCode::NotFound, "user is not in this group"));
    }
    Ok(())
}

/// An owner leaving hands the group to the longest-standing admin, else the
/// longest-standing member. The last member leaving deletes the group.
pub async fn leave_group(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
) -> Result<MembershipChange, ApiError> {
    load_group(ctx, conversation_id).await?;
    let role = ensure_accepted(ctx, conversation_id, user_id).await?;
    let mut change = MembershipChange::new(conversation_id, ConversationKind::Group);

    let remaining: Vec<_> = ctx
        .storage
        .list_members(conversation_id)
        .await
        .map_err(internal)?
        .into_iter()
        .filter(|member| member.user_id != user_id && member.state == MembershipState::Accepted)
        .collect();
    if remaining.is_empty() {
        let members = member_ids(ctx, conversation_id).await?;
        ctx.storage
            .delete_conversation(conversation_id)
            .await
            .map_err(internal)?;
        info!(conversation_id = conversation_id.0, "last member left, group deleted");
        change.closed_for = Some(members);
        return Ok(change);
    }

    if role == Role::Owner {
        let heir = remaining
            .iter()
            .find(|member| member.role == Role::Admin)
            .or_else(|| remaining.first())
            .map(|member| member.user_id)
            .ok_or_else(|| ApiError::new(ErrorCode::Internal, "no member to inherit the group"))?;
        ctx.storage
            .update_member_role(conversation_id, heir, Role::Owner)
            .await
            .map_err(internal)?;
        info!(
            conversation_id = conversation_id.0,
            new_owner = heir.0,
            "group ownership transferred"
        );
    }
    ctx.storage
        .remove_membership(conversation_id, user_id)
        .await
        .map_err(internal)?;
    change.removed = vec![user_id];
    Ok(change)
}

fn issue_session(
    ctx: &ApiContext,
    user_id: UserId,
    display_name: &str,
) -> Result<SessionResponse, ApiError> {
    let issued = ctx
        .tokens
        .issue(user_id, display_name)
        .map_err(|e| ApiError::new(ErrorCode::Internal, format!("token issue failed: {e}")))?;
    Ok(SessionResponse {
        user_id,
        display_name: display_name.to_string(),
        access_token: issued.access_token,
        refresh_token: issued.refresh_token,
        access_expires_at: issued.access_expires_at,
    })
}

fn summary_from_stored(stored: StoredConversationSummary) -> ConversationSummary {
    let StoredConversationSummary {
        conversation,
        role,
        state,
        peer,
        last_message,
        unread_count,
    } = stored;
    let (title, peer_id) = match (conversation.kind, peer) {
        (ConversationKind::Private, Some((peer_id, name))) => (name, Some(peer_id)),
        (ConversationKind::Private, None) => ("Direct message".to_string(), None),
        (ConversationKind::Group, _) => (conversation.name.unwrap_or_default(), None),
    };
    ConversationSummary {
        conversation_id: conversation.conversation_id,
        kind: conversation.kind,
        title,
        description: conversation.description,
        peer_id,
        role,
        state,
        last_message: last_message.map(|message| message.into_payload()),
        last_activity_at: conversation.last_activity_at,
        unread_count,
    }
}

async fn group_details(ctx: &ApiContext, group: StoredConversation) -> Result<GroupDetails, ApiError> {
    let members = ctx
        .storage
        .list_members(group.conversation_id)
        .await
        .map_err(internal)?;
    Ok(GroupDetails {
        conversation_id: group.conversation_id,
        name: group.name.unwrap_or_default(),
        description: group.description,
        created_at: group.created_at,
        members: members
            .into_iter()
            .map(|member| GroupMemberSummary {
                user_id: member.user_id,
                display_name: member.display_name,
                role: member.role,
                state: member.state,
                joined_at: member.joined_at,
            })
            .collect(),
    })
}

async fn load_conversation(
    ctx: &ApiContext,
    conversation_id: ConversationId,
) -> Result<StoredConversation, ApiError> {
    ctx.storage
        .load_conversation(conversation_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "conversation not found"))
}

async fn load_group(
    ctx: &ApiContext,
    conversation_id: ConversationId,
) -> Result<StoredConversation, ApiError> {
    let conversation = load_conversation(ctx, conversation_id).await?;
    if conversation.kind != ConversationKind::Group {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "conversation is not a group",
        ));
    }
    Ok(conversation)
}

async fn membership(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    user_id: UserId,
) -> Result<Option<(Role, MembershipState)>, ApiError> {
    ctx.storage
        .membership(conversation_id, user_id)
        .await
        .map_err(internal)
}

async fn ensure_accepted(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    user_id: UserId,
) -> Result<Role, ApiError> {
    match membership(ctx, conversation_id, user_id).await? {
        Some((role, MembershipState::Accepted)) => Ok(role),
        _ => Err(ApiError::new(
            ErrorCode::NotMember,
            "user is not a member of this conversation",
        )),
    }
}

async fn ensure_manager(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    user_id: UserId,
) -> Result<Role, ApiError> {
    let role = ensure_accepted(ctx, conversation_id, user_id).await?;
    if !role.can_manage_group() {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "only owners and admins can manage the group",
        ));
    }
    Ok(role)
}

async fn member_ids(ctx: &ApiContext, conversation_id: ConversationId) -> Result<Vec<UserId>, ApiError> {
    Ok(ctx
        .storage
        .list_members(conversation_id)
        .await
        .map_err(internal)?
        .into_iter()
        .map(|member| member.user_id)
        .collect())
}

async fn ensure_users_exist(ctx: &ApiContext, user_ids: &[UserId]) -> Result<(), ApiError> {
    for user_id in user_ids {
        let exists = ctx
            .storage
            .load_user(*user_id)
            .await
            .map_err(internal)?
            .is_some();
        if !exists {
            return Err(ApiError::new(
                ErrorCode::NotFound,
                format!("user {user_id} not found"),
            ));
        }
    }
    Ok(())
}

fn validate_username(username: &str) -> Result<(), ApiError> {
    if username.is_empty() || username.chars().count() > MAX_USERNAME_CHARS {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("username must be 1 to {MAX_USERNAME_CHARS} characters"),
        ));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "username may only contain letters, digits, '_', '-' and '.'",
        ));
    }
    Ok(())
}

fn validate_group_name(name: &str) -> Result<&str, ApiError> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > MAX_GROUP_NAME_CHARS {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("group name must be 1 to {MAX_GROUP_NAME_CHARS} characters"),
        ));
    }
    Ok(name)
}

fn token_error(err: TokenError) -> ApiError {
    match err {
        TokenError::Malformed => ApiError::new(ErrorCode::Unauthenticated, err.to_string()),
        TokenError::Expired => ApiError::new(ErrorCode::TokenExpired, err.to_string()),
        TokenError::Signing(_) => ApiError::new(ErrorCode::Internal, err.to_string()),
        TokenError::InvalidSignature | TokenError::WrongKind { .. } => {
            ApiError::new(ErrorCode::InvalidCredential, err.to_string())
        }
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
