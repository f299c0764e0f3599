use super::*;
use session_auth::TokenConfig;
use shared::protocol::{RefreshRequest, UpdateMemberRoleRequest};

async fn setup() -> ApiContext {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    ApiContext {
        storage,
        tokens: TokenIssuer::new(TokenConfig {
            secret: "api-test-secret".into(),
            access_ttl_seconds: 900,
            refresh_ttl_seconds: 3600,
        }),
    }
}

async fn user(ctx: &ApiContext, name: &str) -> UserId {
    login(
        ctx,
        &LoginRequest {
            username: name.to_string(),
            display_name: None,
        },
    )
    .await
    .expect("login")
    .user_id
}

async fn group_with(
    ctx: &ApiContext,
    owner: UserId,
    members: &[(UserId, Role)],
) -> ConversationId {
    let created = create_conversation(
        ctx,
        owner,
        &CreateConversationRequest::Group {
            name: "Ops".into(),
            description: Some("on call".into()),
            member_ids: members.iter().map(|(id, _)| *id).collect(),
        },
    )
    .await
    .expect("group");
    let conversation_id = created.summary.conversation_id;
    for (member, role) in members {
        accept_conversation(ctx, *member, conversation_id)
            .await
            .expect("accept");
        if *role != Role::Member {
            update_member_role(ctx, owner, conversation_id, *member, *role)
                .await
                .expect("role");
        }
    }
    conversation_id
}

#[tokio::test]
async fn login_creates_the_user_once_and_issues_usable_tokens() {
    let ctx = setup().await;
    let first = login(
        &ctx,
        &LoginRequest {
            username: "alice".into(),
            display_name: Some("Alice A.".into()),
        },
    )
    .await
    .expect("login");
    let second = login(
        &ctx,
        &LoginRequest {
            username: "alice".into(),
            display_name: None,
        },
    )
    .await
    .expect("login again");
    assert_eq!(first.user_id, second.user_id);
    assert_eq!(second.display_name, "Alice A.");

    let session = authenticate_bearer(&ctx, Some(&first.access_token))
        .await
        .expect("bearer");
    assert_eq!(session.user_id, first.user_id);

    let refreshed = refresh(&ctx, &first.refresh_token).await.expect("refresh");
    assert_eq!(refreshed.user_id, first.user_id);

    let err = refresh(&ctx, &first.access_token)
        .await
        .expect_err("access token is not a refresh token");
    assert_eq!(err.code, ErrorCode::InvalidCredential);
}

#[tokio::test]
async fn login_rejects_bad_usernames_and_disabled_accounts() {
    let ctx = setup().await;
    for bad in ["", "   ", "has space", "way-too-long-username-for-this-service"] {
        let err = login(
            &ctx,
            &LoginRequest {
                username: bad.into(),
                display_name: None,
            },
        )
        .await
        .expect_err(bad);
        assert_eq!(err.code, ErrorCode::Validation);
    }

    let mallory = user(&ctx, "mallory").await;
    ctx.storage
        .set_user_disabled(mallory, true)
        .await
        .expect("disable");
    let err = login(
        &ctx,
        &LoginRequest {
            username: "mallory".into(),
            display_name: None,
        },
    )
    .await
    .expect_err("disabled");
    assert_eq!(err.code, ErrorCode::AccountUnavailable);
}

#[tokio::test]
async fn expired_refresh_token_reports_token_expired() {
    let ctx = setup().await;
    let alice = user(&ctx, "alice").await;
    let expired = TokenIssuer::new(TokenConfig {
        secret: "api-test-secret".into(),
        access_ttl_seconds: -60,
        refresh_ttl_seconds: -60,
    })
    .issue(alice, "alice")
    .expect("issue");

    let request = RefreshRequest {
        refresh_token: expired.refresh_token,
    };
    let err = refresh(&ctx, &request.refresh_token)
        .await
        .expect_err("expired");
    assert_eq!(err.code, ErrorCode::TokenExpired);

    let err = authenticate_bearer(&ctx, None).await.expect_err("missing");
    assert_eq!(err.code, ErrorCode::Unauthenticated);
}

#[tokio::test]
async fn private_conversation_is_deduplicated_and_pending_for_the_peer() {
    let ctx = setup().await;
    let alice = user(&ctx, "alice").await;
    let bob = user(&ctx, "bob").await;

    let first = create_conversation(&ctx, alice, &CreateConversationRequest::Private { user_id: bob })
        .await
        .expect("create");
    assert!(first.created);
    assert_eq!(first.change.invited, vec![bob]);
    assert_eq!(first.summary.title, "bob");
    assert_eq!(first.summary.peer_id, Some(bob));

    let again = create_conversation(&ctx, alice, &CreateConversationRequest::Private { user_id: bob })
        .await
        .expect("dedupe");
    assert!(!again.created);
    assert!(again.change.invited.is_empty());
    assert_eq!(again.summary.conversation_id, first.summary.conversation_id);

    let pending = list_pending_conversations(&ctx, bob).await.expect("pending");
    assert_eq!(pending.len(), 1);
    let err = get_messages(&ctx, bob, first.summary.conversation_id, &MessagesQuery::default())
        .await
        .expect_err("not accepted yet");
    assert_eq!(err.code, ErrorCode::NotMember);

    accept_conversation(&ctx, bob, first.summary.conversation_id)
        .await
        .expect("accept");
    assert!(list_pending_conversations(&ctx, bob).await.expect("pending").is_empty());
    assert_eq!(list_conversations(&ctx, bob).await.expect("list").len(), 1);

    let err = create_conversation(&ctx, alice, &CreateConversationRequest::Private { user_id: alice })
        .await
        .expect_err("self");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn rejecting_a_private_invitation_deletes_it() {
    let ctx = setup().await;
    let alice = user(&ctx, "alice").await;
    let bob = user(&ctx, "bob").await;
    let created = create_conversation(&ctx, alice, &CreateConversationRequest::Private { user_id: bob })
        .await
        .expect("create");
    let conversation_id = created.summary.conversation_id;

    let change = reject_conversation(&ctx, bob, conversation_id)
        .await
        .expect("reject");
    let mut closed = change.closed_for.expect("closed");
    closed.sort();
    assert_eq!(closed, vec![alice, bob]);
    assert!(ctx
        .storage
        .load_conversation(conversation_id)
        .await
        .expect("load")
        .is_none());

    let err = reject_conversation(&ctx, bob, conversation_id)
        .await
        .expect_err("gone");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn message_pages_are_clamped_and_authorized() {
    let ctx = setup().await;
    let alice = user(&ctx, "alice").await;
    let carol = user(&ctx, "carol").await;
    let group = group_with(&ctx, alice, &[]).await;
    for n in 0..3 {
        ctx.storage
            .insert_message(&storage::NewMessage {
                conversation_id: group,
                sender_id: alice,
                content: format!("m{n}"),
                kind: shared::domain::MessageKind::Text,
                reply_to_id: None,
                sent_at: Utc::now(),
            })
            .await
            .expect("insert");
    }

    let page = get_messages(
        &ctx,
        alice,
        group,
        &MessagesQuery {
            limit: Some(0),
            ..MessagesQuery::default()
        },
    )
    .await
    .expect("page");
    assert_eq!(page.messages.len(), 1);
    assert_eq!(page.messages[0].content, "m2");
    assert!(page.has_more);

    let older = get_messages(
        &ctx,
        alice,
        group,
        &MessagesQuery {
            limit: Some(500),
            before_id: Some(page.messages[0].message_id.0),
            before_ts: None,
        },
    )
    .await
    .expect("older");
    let contents: Vec<_> = older.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["m0", "m1"]);
    assert!(!older.has_more);

    let err = get_messages(&ctx, carol, group, &MessagesQuery::default())
        .await
        .expect_err("outsider");
    assert_eq!(err.code, ErrorCode::NotMember);
    let err = get_messages(&ctx, alice, ConversationId(9999), &MessagesQuery::default())
        .await
        .expect_err("missing");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn group_management_follows_roles() {
    let ctx = setup().await;
    let owner = user(&ctx, "owner").await;
    let admin = user(&ctx, "admin").await;
    let member = user(&ctx, "member").await;
    let other_admin = user(&ctx, "admin2").await;
    let newcomer = user(&ctx, "newcomer").await;
    let group = group_with(
        &ctx,
        owner,
        &[
            (admin, Role::Admin),
            (member, Role::Member),
            (other_admin, Role::Admin),
        ],
    )
    .await;

    // Plain members cannot manage.
    let err = add_members(&ctx, member, group, &AddMembersRequest { member_ids: vec![newcomer] })
        .await
        .expect_err("member cannot invite");
    assert_eq!(err.code, ErrorCode::Forbidden);
    let err = update_group_settings(
        &ctx,
        member,
        group,
        &UpdateGroupRequest {
            name: Some("Renamed".into()),
            description: None,
        },
    )
    .await
    .expect_err("member cannot rename");
    assert_eq!(err.code, ErrorCode::Forbidden);

    // Admins can invite and rename.
    let change = add_members(&ctx, admin, group, &AddMembersRequest { member_ids: vec![newcomer] })
        .await
        .expect("admin invites");
    assert_eq!(change.invited, vec![newcomer]);
    let details = update_group_settings(
        &ctx,
        admin,
        group,
        &UpdateGroupRequest {
            name: Some("  Renamed ".into()),
            description: None,
        },
    )
    .await
    .expect("rename");
    assert_eq!(details.name, "Renamed");
    assert_eq!(details.description.as_deref(), Some("on call"));

    // Admins remove members but not other admins.
    let err = remove_member(&ctx, admin, group, other_admin)
        .await
        .expect_err("admin vs admin");
    assert_eq!(err.code, ErrorCode::Forbidden);
    let change = remove_member(&ctx, admin, group, member).await.expect("remove");
    assert_eq!(change.removed, vec![member]);

    // Only the owner assigns roles.
    let err = update_member_role(&ctx, admin, group, other_admin, Role::Member)
        .await
        .expect_err("admin cannot demote");
    assert_eq!(err.code, ErrorCode::Forbidden);
    let err = update_member_role(&ctx, owner, group, admin, Role::Owner)
        .await
        .expect_err("no owner grants");
    assert_eq!(err.code, ErrorCode::Validation);
    let request = UpdateMemberRoleRequest { role: Role::Member };
    update_member_role(&ctx, owner, group, other_admin, request.role)
        .await
        .expect("owner demotes");

    let err = delete_conversation(&ctx, admin, group)
        .await
        .expect_err("only owner deletes");
    assert_eq!(err.code, ErrorCode::Forbidden);
}

#[tokio::test]
async fn owner_leaving_hands_the_group_to_the_oldest_admin() {
    let ctx = setup().await;
    let owner = user(&ctx, "owner").await;
    let member = user(&ctx, "member").await;
    let admin = user(&ctx, "admin").await;
    let group = group_with(&ctx, owner, &[(member, Role::Member), (admin, Role::Admin)]).await;

    let change = leave_group(&ctx, owner, group).await.expect("leave");
    assert_eq!(change.removed, vec![owner]);
    assert!(change.closed_for.is_none());

    let details = get_group_details(&ctx, admin, group).await.expect("details");
    let roles: Vec<_> = details
        .members
        .iter()
        .map(|m| (m.user_id, m.role))
        .collect();
    assert!(roles.contains(&(admin, Role::Owner)));
    assert!(roles.contains(&(member, Role::Member)));
    assert!(!roles.iter().any(|(id, _)| *id == owner));
}

#[tokio::test]
async fn owner_without_admins_hands_over_to_a_member_and_last_one_out_deletes() {
    let ctx = setup().await;
    let owner = user(&ctx, "owner").await;
    let member = user(&ctx, "member").await;
    let group = group_with(&ctx, owner, &[(member, Role::Member)]).await;

    leave_group(&ctx, owner, group).await.expect("owner leaves");
    assert_eq!(
        ctx.storage.membership(group, member).await.expect("membership"),
        Some((Role::Owner, MembershipState::Accepted))
    );

    let change = leave_group(&ctx, member, group).await.expect("last leaves");
    assert_eq!(change.closed_for, Some(vec![member]));
    assert!(ctx
        .storage
        .load_conversation(group)
        .await
        .expect("load")
        .is_none());
}

#[tokio::test]
async fn group_operations_reject_private_conversations() {
    let ctx = setup().await;
    let alice = user(&ctx, "alice").await;
    let bob = user(&ctx, "bob").await;
    let created = create_conversation(&ctx, alice, &CreateConversationRequest::Private { user_id: bob })
        .await
        .expect("create");
    let err = get_group_details(&ctx, alice, created.summary.conversation_id)
        .await
        .expect_err("not a group");
    assert_eq!(err.code, ErrorCode::Validation);

    let change = delete_conversation(&ctx, alice, created.summary.conversation_id)
        .await
        .expect("either participant may delete");
    assert_eq!(change.kind, ConversationKind::Private);
}
