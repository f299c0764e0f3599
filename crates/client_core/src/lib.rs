use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{ConversationId, MessageKind},
    error::ApiError,
    protocol::{
        ClientRequest, ConversationSummary, CreateConversationRequest, LoginRequest,
        MessagePage, MessagesQuery, RefreshRequest, ServerEvent, SessionResponse,
    },
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
    time::{interval, Instant, MissedTickBehavior},
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

pub mod conversations;
pub mod state;
pub mod timeline;
pub mod typing;

pub use conversations::ConversationList;
pub use state::{ChatState, ClientEvent};
pub use timeline::{MessageTimeline, PendingEcho, ECHO_MATCH_WINDOW};
pub use typing::{TypingCommand, TypingDebouncer, TYPING_IDLE_TIMEOUT};

pub const PAGE_SIZE: u32 = 50;
const EVENT_CAPACITY: usize = 1024;
const TYPING_TICK: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not logged in")]
    NotLoggedIn,
    #[error("no conversation is open")]
    NoOpenConversation,
    #[error("realtime connection is closed")]
    ConnectionClosed,
    #[error("server rejected the request ({:?}): {}", .0.code, .0.message)]
    Api(ApiError),
    #[error("server answered with status {0}")]
    Status(u16),
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket failure: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait ClientHandle: Send + Sync {
    async fn login(&self, server_url: &str, username: &str)
        -> Result<SessionResponse, ClientError>;
    async fn refresh_session(&self) -> Result<(), ClientError>;
    async fn refresh_conversations(&self) -> Result<(), ClientError>;
    async fn create_conversation(
        &self,
        request: CreateConversationRequest,
    ) -> Result<ConversationSummary, ClientError>;
    async fn accept_conversation(&self, conversation_id: ConversationId)
        -> Result<(), ClientError>;
    async fn reject_conversation(&self, conversation_id: ConversationId)
        -> Result<(), ClientError>;
    async fn open_conversation(&self, conversation_id: ConversationId) -> Result<(), ClientError>;
    async fn load_older(&self) -> Result<bool, ClientError>;
    async fn send_message(&self, content: &str) -> Result<String, ClientError>;
    async fn notify_typing(&self) -> Result<(), ClientError>;
    async fn mark_read(&self) -> Result<(), ClientError>;
    async fn set_status(&self, status: &str) -> Result<(), ClientError>;
    async fn logout(&self);
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
}

pub struct RealtimeClient {
    http: Client,
    inner: Mutex<RealtimeClientState>,
    state: Mutex<ChatState>,
    typing: Mutex<TypingDebouncer>,
    events: broadcast::Sender<ClientEvent>,
}

#[derive(Default)]
struct RealtimeClientState {
    server_url: Option<String>,
    session: Option<SessionResponse>,
    outbound: Option<mpsc::UnboundedSender<ClientRequest>>,
    tasks: Vec<JoinHandle<()>>,
}

impl RealtimeClientState {
    fn teardown(&mut self) {
        self.outbound = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl RealtimeClient {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            http: Client::new(),
            inner: Mutex::new(RealtimeClientState::default()),
            state: Mutex::new(ChatState::default()),
            typing: Mutex::new(TypingDebouncer::default()),
            events,
        })
    }

    /// Reads the current state under its lock.
    pub async fn snapshot<R>(&self, read: impl FnOnce(&ChatState) -> R) -> R {
        let state = self.state.lock().await;
        read(&state)
    }

    async fn session(&self) -> Result<(String, String), ClientError> {
        let guard = self.inner.lock().await;
        match (&guard.server_url, &guard.session) {
            (Some(server_url), Some(session)) => {
                Ok((server_url.clone(), session.access_token.clone()))
            }
            _ => Err(ClientError::NotLoggedIn),
        }
    }

    async fn send_request(&self, request: ClientRequest) -> Result<(), ClientError> {
        let guard = self.inner.lock().await;
        let outbound = guard.outbound.as_ref().ok_or(ClientError::ConnectionClosed)?;
        outbound
            .send(request)
            .map_err(|_| ClientError::ConnectionClosed)
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    async fn apply_server_event(&self, event: ServerEvent) {
        let events = self.state.lock().await.apply_server_event(event);
        for event in events {
            self.emit(event);
        }
    }

    async fn open_conversation_id(&self) -> Result<ConversationId, ClientError> {
        self.state
            .lock()
            .await
            .open_conversation_id()
            .ok_or(ClientError::NoOpenConversation)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: Option<&MessagesQuery>,
    ) -> Result<T, ClientError> {
        let (server_url, token) = self.session().await?;
        let mut request = self
            .http
            .get(format!("{server_url}{path}"))
            .bearer_auth(token);
        if let Some(query) = query {
            request = request.query(query);
        }
        read_json(request.send().await?).await
    }

    async fn post_json<T, B>(&self, path: &str, body: &B) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let (server_url, token) = self.session().await?;
        let response = self
            .http
            .post(format!("{server_url}{path}"))
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        read_json(response).await
    }

    async fn post_empty(&self, path: &str) -> Result<(), ClientError> {
        let (server_url, token) = self.session().await?;
        let response = self
            .http
            .post(format!("{server_url}{path}"))
            .bearer_auth(token)
            .send()
            .await?;
        check_status(response).await.map(|_| ())
    }

    async fn fetch_page(
        &self,
        conversation_id: ConversationId,
        query: &MessagesQuery,
    ) -> Result<MessagePage, ClientError> {
        self.get_json(
            &format!("/conversations/{}/messages", conversation_id.0),
            Some(query),
        )
        .await
    }

    async fn spawn_ws_session(
        self: &Arc<Self>,
        server_url: &str,
        access_token: &str,
    ) -> Result<(), ClientError> {
        let ws_url = websocket_url(server_url)?;
        let (ws_stream, _) = connect_async(ws_url.as_str()).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let hello = serde_json::to_string(&ClientRequest::Authenticate {
            token: access_token.to_string(),
        })?;
        ws_writer.send(Message::Text(hello)).await?;

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientRequest>();
        let writer = tokio::spawn(async move {
            while let Some(request) = outbound_rx.recv().await {
                let frame = match serde_json::to_string(&request) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(error = %err, "failed to encode client request");
                        continue;
                    }
                };
                if ws_writer.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let client = Arc::clone(self);
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => client.apply_server_event(event).await,
                        Err(err) => debug!(error = %err, "ignoring unreadable server event"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "realtime connection failed");
                        break;
                    }
                }
            }
            client.inner.lock().await.outbound = None;
            client.emit(ClientEvent::Disconnected);
        });

        let client = Arc::clone(self);
        let typing = tokio::spawn(async move {
            let mut ticker = interval(TYPING_TICK);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let command = client.typing.lock().await.tick(Instant::now());
                if let Some(command) = command {
                    if client.send_request(command.into_request()).await.is_err() {
                        break;
                    }
                }
            }
        });

        let mut guard = self.inner.lock().await;
        guard.outbound = Some(outbound);
        guard.tasks.extend([writer, reader, typing]);
        Ok(())
    }
}

#[async_trait]
impl ClientHandle for Arc<RealtimeClient> {
    async fn login(
        &self,
        server_url: &str,
        username: &str,
    ) -> Result<SessionResponse, ClientError> {
        let server_url = server_url.trim_end_matches('/').to_string();
        let response = self
            .http
            .post(format!("{server_url}/auth/login"))
            .json(&LoginRequest {
                username: username.to_string(),
                display_name: None,
            })
            .send()
            .await?;
        let session: SessionResponse = read_json(response).await?;

        {
            let mut guard = self.inner.lock().await;
            guard.teardown();
            guard.server_url = Some(server_url.clone());
            guard.session = Some(session.clone());
        }
        *self.state.lock().await = ChatState::new(session.user_id);
        *self.typing.lock().await = TypingDebouncer::default();

        if let Err(err) = self
            .spawn_ws_session(&server_url, &session.access_token)
            .await
        {
            let mut guard = self.inner.lock().await;
            guard.teardown();
            guard.server_url = None;
            guard.session = None;
            return Err(err);
        }
        info!(user_id = %session.user_id, "logged in");

        self.refresh_conversations().await?;
        Ok(session)
    }

    async fn refresh_session(&self) -> Result<(), ClientError> {
        let (server_url, refresh_token) = {
            let guard = self.inner.lock().await;
            match (&guard.server_url, &guard.session) {
                (Some(url), Some(session)) => (url.clone(), session.refresh_token.clone()),
                _ => return Err(ClientError::NotLoggedIn),
            }
        };
        let response = self
            .http
            .post(format!("{server_url}/auth/refresh"))
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;
        let session: SessionResponse = read_json(response).await?;
        self.inner.lock().await.session = Some(session);
        Ok(())
    }

    async fn refresh_conversations(&self) -> Result<(), ClientError> {
        let accepted: Vec<ConversationSummary> = self.get_json("/conversations", None).await?;
        let pending: Vec<ConversationSummary> =
            self.get_json("/conversations/pending", None).await?;
        self.state
            .lock()
            .await
            .replace_conversations(accepted, pending);
        self.emit(ClientEvent::ConversationsUpdated);
        Ok(())
    }

    async fn create_conversation(
        &self,
        request: CreateConversationRequest,
    ) -> Result<ConversationSummary, ClientError> {
        let summary: ConversationSummary = self.post_json("/conversations", &request).await?;
        self.refresh_conversations().await?;
        Ok(summary)
    }

    async fn accept_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(), ClientError> {
        self.post_empty(&format!("/conversations/{}/accept", conversation_id.0))
            .await?;
        self.refresh_conversations().await
    }

    async fn reject_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(), ClientError> {
        self.post_empty(&format!("/conversations/{}/reject", conversation_id.0))
            .await?;
        self.refresh_conversations().await
    }

    async fn open_conversation(&self, conversation_id: ConversationId) -> Result<(), ClientError> {
        let previous = self.state.lock().await.open_conversation(conversation_id);
        let stop = self.typing.lock().await.cancel();
        if let Some(stop) = stop {
            self.send_request(stop.into_request()).await?;
        }

        // Subscribe to the new room before dropping the old one so no event falls between.
        self.send_request(ClientRequest::JoinConversation { conversation_id })
            .await?;
        if let Some(previous) = previous.filter(|previous| *previous != conversation_id) {
            self.send_request(ClientRequest::LeaveConversation {
                conversation_id: previous,
            })
            .await?;
        }
        self.emit(ClientEvent::TimelineUpdated { conversation_id });

        let page = self
            .fetch_page(
                conversation_id,
                &MessagesQuery {
                    limit: Some(PAGE_SIZE),
                    ..MessagesQuery::default()
                },
            )
            .await?;
        if self.state.lock().await.apply_page(conversation_id, page) {
            self.emit(ClientEvent::TimelineUpdated { conversation_id });
        } else {
            debug!(conversation_id = %conversation_id, "discarding page for a conversation that is no longer open");
        }
        Ok(())
    }

    async fn load_older(&self) -> Result<bool, ClientError> {
        let Some((conversation_id, cursor)) = self.state.lock().await.begin_load_older() else {
            return Ok(false);
        };
        let query = MessagesQuery {
            limit: Some(PAGE_SIZE),
            before_id: Some(cursor.0),
            before_ts: None,
        };
        match self.fetch_page(conversation_id, &query).await {
            Ok(page) => {
                let applied = self.state.lock().await.apply_page(conversation_id, page);
                if applied {
                    self.emit(ClientEvent::TimelineUpdated { conversation_id });
                }
                Ok(applied)
            }
            Err(err) => {
                self.state.lock().await.abort_load_older(conversation_id);
                Err(err)
            }
        }
    }

    async fn send_message(&self, content: &str) -> Result<String, ClientError> {
        let conversation_id = self.open_conversation_id().await?;
        let client_ref = Uuid::new_v4().to_string();
        self.state.lock().await.add_pending(
            conversation_id,
            PendingEcho {
                client_ref: client_ref.clone(),
                content: content.to_string(),
                kind: MessageKind::Text,
                reply_to_id: None,
                created_at: Utc::now(),
                failed: false,
            },
        );
        self.emit(ClientEvent::TimelineUpdated { conversation_id });
        self.typing.lock().await.message_sent(conversation_id);

        let sent = self
            .send_request(ClientRequest::SendMessage {
                conversation_id,
                content: content.to_string(),
                kind: MessageKind::Text,
                reply_to_id: None,
                client_ref: Some(client_ref.clone()),
            })
            .await;
        if let Err(err) = sent {
            self.state.lock().await.mark_failed(&client_ref);
            self.emit(ClientEvent::TimelineUpdated { conversation_id });
            return Err(err);
        }
        Ok(client_ref)
    }

    async fn notify_typing(&self) -> Result<(), ClientError> {
        let conversation_id = self.open_conversation_id().await?;
        let commands = self
            .typing
            .lock()
            .await
            .input(conversation_id, Instant::now());
        for command in commands {
            self.send_request(command.into_request()).await?;
        }
        Ok(())
    }

    async fn mark_read(&self) -> Result<(), ClientError> {
        let (conversation_id, newest) = {
            let state = self.state.lock().await;
            let timeline = state
                .open_timeline()
                .ok_or(ClientError::NoOpenConversation)?;
            (timeline.conversation_id(), timeline.newest_id())
        };
        let Some(last_message_id) = newest else {
            return Ok(());
        };
        self.send_request(ClientRequest::MarkConversationRead {
            conversation_id,
            last_message_id,
        })
        .await?;
        if self.state.lock().await.mark_read_locally(conversation_id) {
            self.emit(ClientEvent::ConversationsUpdated);
        }
        Ok(())
    }

    async fn set_status(&self, status: &str) -> Result<(), ClientError> {
        self.send_request(ClientRequest::SetStatus {
            status: status.to_string(),
        })
        .await
    }

    async fn logout(&self) {
        let mut guard = self.inner.lock().await;
        guard.teardown();
        guard.session = None;
        guard.server_url = None;
        drop(guard);
        *self.state.lock().await = ChatState::default();
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

async fn check_status(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match response.json::<ApiError>().await {
        Ok(error) => Err(ClientError::Api(error)),
        Err(_) => Err(ClientError::Status(status.as_u16())),
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    Ok(check_status(response).await?.json().await?)
}

fn websocket_url(server_url: &str) -> Result<String, ClientError> {
    let mut url =
        Url::parse(server_url).map_err(|err| ClientError::InvalidUrl(format!("{server_url}: {err}")))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(ClientError::InvalidUrl(format!(
                "unsupported scheme {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ClientError::InvalidUrl(server_url.to_string()))?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
