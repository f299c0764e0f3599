use super::*;
use axum::{
    extract::{ws::Message as WsMessage, Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use shared::{
    domain::{ConversationKind, MembershipState, MessageId, Role, UserId},
    error::ErrorCode,
    protocol::MessagePayload,
};
use chrono::TimeZone;
use tokio::net::TcpListener;

const ACCESS_TOKEN: &str = "access-1";
const OWN_USER: UserId = UserId(1);

#[derive(Clone)]
struct StubState {
    received: mpsc::UnboundedSender<ClientRequest>,
    push: Arc<Mutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>>,
}

struct Stub {
    url: String,
    received: mpsc::UnboundedReceiver<ClientRequest>,
    push: mpsc::UnboundedSender<ServerEvent>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == format!("Bearer {ACCESS_TOKEN}"))
}

fn summary(id: i64) -> ConversationSummary {
    ConversationSummary {
        conversation_id: ConversationId(id),
        kind: ConversationKind::Group,
        title: format!("room {id}"),
        description: None,
        peer_id: None,
        role: Role::Member,
        state: MembershipState::Accepted,
        last_message: None,
        last_activity_at: Utc::now(),
        unread_count: 0,
    }
}

fn stored_message(id: i64, conversation_id: ConversationId) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        conversation_id,
        sender_id: UserId(2),
        sender_name: Some("bob".into()),
        content: format!("history {id}"),
        kind: MessageKind::Text,
        reply_to_id: None,
        sent_at: Utc
            .timestamp_opt(1_700_000_000 + id, 0)
            .single()
            .expect("time"),
    }
}

async fn stub_login(Json(req): Json<LoginRequest>) -> impl IntoResponse {
    if req.username == "disabled" {
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({
                "code": "account_unavailable",
                "message": "account is unavailable"
            })),
        );
    }
    let session = SessionResponse {
        user_id: OWN_USER,
        display_name: req.username,
        access_token: ACCESS_TOKEN.into(),
        refresh_token: "refresh-1".into(),
        access_expires_at: Utc::now(),
    };
    (
        StatusCode::OK,
        Json(serde_json::to_value(session).expect("session json")),
    )
}

async fn stub_conversations(headers: HeaderMap) -> Result<Json<Vec<ConversationSummary>>, StatusCode> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(Json(vec![summary(10), summary(11)]))
}

async fn stub_pending() -> Json<Vec<ConversationSummary>> {
    Json(Vec::new())
}

async fn stub_messages(
    headers: HeaderMap,
    Path(conversation_id): Path<i64>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<MessagePage>, StatusCode> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let conversation_id = ConversationId(conversation_id);
    let newest = conversation_id.0 * 10;
    let messages = match query.before_id {
        None => vec![stored_message(newest, conversation_id)],
        Some(before) => vec![stored_message(before - 1, conversation_id)],
    };
    Ok(Json(MessagePage {
        messages,
        has_more: query.before_id.is_none(),
    }))
}

async fn stub_ws(ws: WebSocketUpgrade, State(state): State<StubState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let (mut sink, mut stream) = socket.split();
        if let Some(mut push) = state.push.lock().await.take() {
            tokio::spawn(async move {
                while let Some(event) = push.recv().await {
                    let text = serde_json::to_string(&event).expect("encode event");
                    if sink.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
            });
        }
        while let Some(Ok(frame)) = stream.next().await {
            if let WsMessage::Text(text) = frame {
                if let Ok(request) = serde_json::from_str::<ClientRequest>(&text) {
                    let _ = state.received.send(request);
                }
            }
        }
    })
}

async fn spawn_stub() -> Stub {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (received_tx, received) = mpsc::unbounded_channel();
    let (push, push_rx) = mpsc::unbounded_channel();
    let state = StubState {
        received: received_tx,
        push: Arc::new(Mutex::new(Some(push_rx))),
    };
    let app = Router::new()
        .route("/auth/login", post(stub_login))
        .route("/conversations", get(stub_conversations))
        .route("/conversations/pending", get(stub_pending))
        .route("/conversations/:conversation_id/messages", get(stub_messages))
        .route("/ws", get(stub_ws))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Stub {
        url: format!("http://{addr}"),
        received,
        push,
    }
}

async fn next_request(received: &mut mpsc::UnboundedReceiver<ClientRequest>) -> ClientRequest {
    tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .expect("request within timeout")
        .expect("stub still running")
}

async fn logged_in(stub: &mut Stub) -> Arc<RealtimeClient> {
    let client = RealtimeClient::new();
    client.login(&stub.url, "alice").await.expect("login");
    match next_request(&mut stub.received).await {
        ClientRequest::Authenticate { token } => assert_eq!(token, ACCESS_TOKEN),
        other => panic!("expected authenticate first, got {other:?}"),
    }
    client
}

async fn wait_for(client: &RealtimeClient, check: impl Fn(&ChatState) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if client.snapshot(&check).await {
            return;
        }
        assert!(Instant::now() < deadline, "state never converged");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn login_authenticates_socket_and_loads_conversations() {
    let mut stub = spawn_stub().await;
    let client = logged_in(&mut stub).await;

    let ids: Vec<i64> = client
        .snapshot(|state| {
            state
                .conversations()
                .entries()
                .iter()
                .map(|entry| entry.conversation_id.0)
                .collect()
        })
        .await;
    assert_eq!(ids.len(), 2);
    assert_eq!(client.snapshot(|state| state.own_user_id()).await, Some(OWN_USER));
}

#[tokio::test]
async fn login_surfaces_server_error_codes() {
    let stub = spawn_stub().await;
    let client = RealtimeClient::new();
    match client.login(&stub.url, "disabled").await {
        Err(ClientError::Api(error)) => assert_eq!(error.code, ErrorCode::AccountUnavailable),
        other => panic!("expected api error, got {other:?}"),
    }
    assert!(matches!(
        client.send_message("hi").await,
        Err(ClientError::NoOpenConversation)
    ));
}

#[tokio::test]
async fn switching_conversations_joins_before_leaving() {
    let mut stub = spawn_stub().await;
    let client = logged_in(&mut stub).await;

    client
        .open_conversation(ConversationId(10))
        .await
        .expect("open first");
    client
        .open_conversation(ConversationId(11))
        .await
        .expect("open second");

    assert!(matches!(
        next_request(&mut stub.received).await,
        ClientRequest::JoinConversation { conversation_id } if conversation_id == ConversationId(10)
    ));
    assert!(matches!(
        next_request(&mut stub.received).await,
        ClientRequest::JoinConversation { conversation_id } if conversation_id == ConversationId(11)
    ));
    assert!(matches!(
        next_request(&mut stub.received).await,
        ClientRequest::LeaveConversation { conversation_id } if conversation_id == ConversationId(10)
    ));

    let shown: Vec<i64> = client
        .snapshot(|state| {
            state
                .open_timeline()
                .map(|timeline| timeline.messages().iter().map(|m| m.message_id.0).collect())
                .unwrap_or_default()
        })
        .await;
    assert_eq!(shown, vec![110]);
}

#[tokio::test]
async fn older_history_is_fetched_once_and_prepended() {
    let mut stub = spawn_stub().await;
    let client = logged_in(&mut stub).await;
    client
        .open_conversation(ConversationId(10))
        .await
        .expect("open");

    assert!(client.load_older().await.expect("older page"));
    assert!(!client.load_older().await.expect("exhausted"));

    let shown: Vec<i64> = client
        .snapshot(|state| {
            state
                .open_timeline()
                .map(|timeline| timeline.messages().iter().map(|m| m.message_id.0).collect())
                .unwrap_or_default()
        })
        .await;
    assert_eq!(shown, vec![99, 100]);
}

#[tokio::test]
async fn sent_message_is_echoed_then_confirmed() {
    let mut stub = spawn_stub().await;
    let client = logged_in(&mut stub).await;
    let conversation_id = ConversationId(10);
    client.open_conversation(conversation_id).await.expect("open");
    next_request(&mut stub.received).await;

    let client_ref = client.send_message("hi there").await.expect("send");
    assert_eq!(
        client
            .snapshot(|state| state.open_timeline().map(|t| t.pending().len()))
            .await,
        Some(1)
    );
    match next_request(&mut stub.received).await {
        ClientRequest::SendMessage {
            content,
            client_ref: sent_ref,
            ..
        } => {
            assert_eq!(content, "hi there");
            assert_eq!(sent_ref.as_deref(), Some(client_ref.as_str()));
        }
        other => panic!("expected send, got {other:?}"),
    }

    let sent_at = Utc::now();
    stub.push
        .send(ServerEvent::MessageAccepted {
            client_ref: client_ref.clone(),
            conversation_id,
            message_id: MessageId(101),
            sent_at,
        })
        .expect("push ack");
    stub.push
        .send(ServerEvent::MessageDelivered {
            message: MessagePayload {
                message_id: MessageId(101),
                conversation_id,
                sender_id: OWN_USER,
                sender_name: Some("alice".into()),
                content: "hi there".into(),
                kind: MessageKind::Text,
                reply_to_id: None,
                sent_at,
            },
        })
        .expect("push delivery");

    wait_for(&client, |state| {
        state.open_timeline().is_some_and(|timeline| {
            timeline.pending().is_empty()
                && timeline
                    .messages()
                    .iter()
                    .any(|m| m.message_id == MessageId(101))
        })
    })
    .await;
}

#[tokio::test]
async fn mark_read_reports_newest_loaded_message() {
    let mut stub = spawn_stub().await;
    let client = logged_in(&mut stub).await;
    client
        .open_conversation(ConversationId(10))
        .await
        .expect("open");
    next_request(&mut stub.received).await;

    client.mark_read().await.expect("mark read");
    match next_request(&mut stub.received).await {
        ClientRequest::MarkConversationRead {
            conversation_id,
            last_message_id,
        } => {
            assert_eq!(conversation_id, ConversationId(10));
            assert_eq!(last_message_id, MessageId(100));
        }
        other => panic!("expected read mark, got {other:?}"),
    }
}

#[test]
fn websocket_url_follows_http_scheme() {
    assert_eq!(
        websocket_url("http://127.0.0.1:8443").expect("url"),
        "ws://127.0.0.1:8443/ws"
    );
    assert_eq!(
        websocket_url("https://chat.example.com/base/").expect("url"),
        "wss://chat.example.com/base/ws"
    );
    assert!(matches!(
        websocket_url("ftp://example.com"),
        Err(ClientError::InvalidUrl(_))
    ));
}
