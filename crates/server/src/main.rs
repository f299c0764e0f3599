use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    routing::{get, patch, post},
    Json, Router,
};
use realtime::{ChatHub, HubConfig};
use server_api::{ApiContext, MembershipChange};
use session_auth::TokenIssuer;
use shared::{
    domain::{ConversationId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        AddMembersRequest, ConversationSummary, CreateConversationRequest, GroupDetails,
        LoginRequest, MessagePage, MessagesQuery, RefreshRequest, ServerEvent, SessionResponse,
        UpdateGroupRequest, UpdateMemberRoleRequest,
    },
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;
mod ws;

use app_state::AppState;
use config::{load_settings, prepare_database_url, DEFAULT_JWT_SECRET};

const MAX_BODY_BYTES: usize = 64 * 1024;

type HttpError = (StatusCode, Json<ApiError>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings();
    if settings.jwt_secret == DEFAULT_JWT_SECRET {
        warn!("using the built-in development token secret; set APP__JWT_SECRET");
    }
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let tokens = TokenIssuer::new(settings.token_config());
    let hub = ChatHub::new(
        Arc::new(storage.clone()),
        tokens.clone(),
        HubConfig {
            typing_timeout: settings.typing_timeout(),
        },
    );
    let sweeper = hub.spawn_typing_sweeper(settings.typing_sweep_interval());

    let state = AppState {
        api: ApiContext { storage, tokens },
        hub: Arc::clone(&hub),
        transport: settings.transport(),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.bind_addr.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    hub.flush_writes().await;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/auth/login", post(http_login))
        .route("/auth/refresh", post(http_refresh))
        .route(
            "/conversations",
            get(http_list_conversations).post(http_create_conversation),
        )
        .route("/conversations/pending", get(http_list_pending))
        .route(
            "/conversations/:conversation_id",
            axum::routing::delete(http_delete_conversation),
        )
        .route(
            "/conversations/:conversation_id/messages",
            get(http_get_messages),
        )
        .route(
            "/conversations/:conversation_id/accept",
            post(http_accept_conversation),
        )
        .route(
            "/conversations/:conversation_id/reject",
            post(http_reject_conversation),
        )
        .route(
            "/groups/:conversation_id",
            get(http_group_details).patch(http_update_group),
        )
        .route("/groups/:conversation_id/members", post(http_add_members))
        .route(
            "/groups/:conversation_id/members/:user_id",
            patch(http_update_member_role).delete(http_remove_member),
        )
        .route("/groups/:conversation_id/leave", post(http_leave_group))
        .route("/ws", get(ws::ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthenticated | ErrorCode::InvalidCredential | ErrorCode::TokenExpired => {
            StatusCode::UNAUTHORIZED
        }
        ErrorCode::AccountUnavailable | ErrorCode::Forbidden | ErrorCode::NotMember => {
            StatusCode::FORBIDDEN
        }
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation | ErrorCode::InvalidStatus | ErrorCode::InvalidCursor => {
            StatusCode::BAD_REQUEST
        }
        ErrorCode::PersistenceError | ErrorCode::TransportError | ErrorCode::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn http_error(err: ApiError) -> HttpError {
    (status_for(err.code), Json(err))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

async fn require_user(state: &AppState, headers: &HeaderMap) -> Result<UserId, HttpError> {
    server_api::authenticate_bearer(&state.api, bearer_token(headers))
        .await
        .map(|session| session.user_id)
        .map_err(http_error)
}

/// Pushes the realtime consequences of a membership change to live connections.
async fn apply_change(hub: &ChatHub, change: MembershipChange) {
    if !change.invited.is_empty() {
        hub.notify_users(
            &change.invited,
            &ServerEvent::ConversationCreated {
                conversation_id: change.conversation_id,
                kind: change.kind,
            },
        );
    }
    for user_id in &change.removed {
        hub.evict_member(change.conversation_id, *user_id).await;
    }
    if let Some(members) = &change.closed_for {
        hub.close_conversation(change.conversation_id, members).await;
    }
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state.api.storage.health_check().await.map_err(|e| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Internal, e.to_string())),
        )
    })?;
    Ok("ok")
}

async fn http_login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<SessionResponse>, HttpError> {
    let session = server_api::login(&state.api, &req)
        .await
        .map_err(http_error)?;
    Ok(Json(session))
}

async fn http_refresh(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<SessionResponse>, HttpError> {
    let session = server_api::refresh(&state.api, &req.refresh_token)
        .await
        .map_err(http_error)?;
    Ok(Json(session))
}

async fn http_list_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ConversationSummary>>, HttpError> {
    let user_id = require_user(&state, &headers).await?;
    let conversations = server_api::list_conversations(&state.api, user_id)
        .await
        .map_err(http_error)?;
    Ok(Json(conversations))
}

async fn http_list_pending(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ConversationSummary>>, HttpError> {
    let user_id = require_user(&state, &headers).await?;
    let conversations = server_api::list_pending_conversations(&state.api, user_id)
        .await
        .map_err(http_error)?;
    Ok(Json(conversations))
}

async fn http_create_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateConversationRequest>,
) -> Result<(StatusCode, Json<ConversationSummary>), HttpError> {
    let user_id = require_user(&state, &headers).await?;
    let created = server_api::create_conversation(&state.api, user_id, &req)
        .await
        .map_err(http_error)?;
    let status = if created.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    apply_change(&state.hub, created.change).await;
    Ok((status, Json(created.summary)))
}

async fn http_get_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<i64>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<MessagePage>, HttpError> {
    let user_id = require_user(&state, &headers).await?;
    let page = server_api::get_messages(&state.api, user_id, ConversationId(conversation_id), &query)
        .await
        .map_err(http_error)?;
    Ok(Json(page))
}

async fn http_accept_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<i64>,
) -> Result<StatusCode, HttpError> {
    let user_id = require_user(&state, &headers).await?;
    server_api::accept_conversation(&state.api, user_id, ConversationId(conversation_id))
        .await
        .map_err(http_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_reject_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<i64>,
) -> Result<StatusCode, HttpError> {
    let user_id = require_user(&state, &headers).await?;
    let change = server_api::reject_conversation(&state.api, user_id, ConversationId(conversation_id))
        .await
        .map_err(http_error)?;
    apply_change(&state.hub, change).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_delete_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<i64>,
) -> Result<StatusCode, HttpError> {
    let user_id = require_user(&state, &headers).await?;
    let change = server_api::delete_conversation(&state.api, user_id, ConversationId(conversation_id))
        .await
        .map_err(http_error)?;
    apply_change(&state.hub, change).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_group_details(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<i64>,
) -> Result<Json<GroupDetails>, HttpError> {
    let user_id = require_user(&state, &headers).await?;
    let details = server_api::get_group_details(&state.api, user_id, ConversationId(conversation_id))
        .await
        .map_err(http_error)?;
    Ok(Json(details))
}

async fn http_update_group(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<i64>,
    Json(req): Json<UpdateGroupRequest>,
) -> Result<Json<GroupDetails>, HttpError> {
    let user_id = require_user(&state, &headers).await?;
    let details = server_api::update_group_settings(
        &state.api,
        user_id,
        ConversationId(conversation_id),
        &req,
    )
    .await
    .map_err(http_error)?;
    Ok(Json(details))
}

async fn http_add_members(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<i64>,
    Json(req): Json<AddMembersRequest>,
) -> Result<StatusCode, HttpError> {
    let user_id = require_user(&state, &headers).await?;
    let change = server_api::add_members(&state.api, user_id, ConversationId(conversation_id), &req)
        .await
        .map_err(http_error)?;
    apply_change(&state.hub, change).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_remove_member(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((conversation_id, target)): Path<(i64, i64)>,
) -> Result<StatusCode, HttpError> {
    let user_id = require_user(&state, &headers).await?;
    let change = server_api::remove_member(
        &state.api,
        user_id,
        ConversationId(conversation_id),
        UserId(target),
    )
    .await
    .map_err(http_error)?;
    apply_change(&state.hub, change).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_update_member_role(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((conversation_id, target)): Path<(i64, i64)>,
    Json(req): Json<UpdateMemberRoleRequest>,
) -> Result<StatusCode, HttpError> {
    let user_id = require_user(&state, &headers).await?;
    server_api::update_member_role(
        &state.api,
        user_id,
        ConversationId(conversation_id),
        UserId(target),
        req.role,
    )
    .await
    .map_err(http_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_leave_group(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<i64>,
) -> Result<StatusCode, HttpError> {
    let user_id = require_user(&state, &headers).await?;
    let change = server_api::leave_group(&state.api, user_id, ConversationId(conversation_id))
        .await
        .map_err(http_error)?;
    apply_change(&state.hub, change).await;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
