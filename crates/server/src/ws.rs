//! Websocket transport: handshake, writer task and the sequential reader loop.

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use realtime::{ChatHub, Identity, RealtimeError};
use serde::Deserialize;
use shared::{
    error::{ApiError, ErrorCode},
    protocol::{ClientRequest, ServerEvent},
};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::app_state::AppState;

/// How long queued events may take to flush after the reader stops.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
pub(crate) struct WsQuery {
    token: Option<String>,
}

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket, q.token))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket, query_token: Option<String>) {
    let (mut sender, mut receiver) = socket.split();

    let handshake = timeout(
        state.transport.handshake_timeout,
        handshake(&state.hub, query_token, &mut receiver),
    )
    .await;
    let identity = match handshake {
        Ok(Ok(identity)) => identity,
        Ok(Err(err)) => {
            info!(code = ?err.code(), error = %err, "websocket authentication failed");
            reject(&mut sender, err.to_api_error()).await;
            return;
        }
        Err(_) => {
            info!("websocket authentication timed out");
            reject(
                &mut sender,
                ApiError::new(ErrorCode::Unauthenticated, "authentication timed out"),
            )
            .await;
            return;
        }
    };

    let (handle, mut events) = state.hub.connect(identity);
    let ping_every = state.transport.ping_interval;
    let mut writer = tokio::spawn(async move {
        let mut ping = interval(ping_every);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let Some(frame) = encode_event(&event) else { continue };
                    if sender.send(frame).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sender.close().await;
    });

    loop {
        let frame = match timeout(state.transport.idle_timeout, receiver.next()).await {
            Err(_) => {
                info!(connection_id = %handle.id, "closing idle connection");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                debug!(connection_id = %handle.id, error = %err, "websocket read failed");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };
        match frame {
            Message::Text(text) => match decode_request(&text) {
                Ok(request) => state.hub.dispatch(&handle, request).await,
                Err(err) => {
                    handle.deliver(ServerEvent::Error(err));
                }
            },
            Message::Binary(_) => {
                handle.deliver(ServerEvent::Error(ApiError::new(
                    ErrorCode::Validation,
                    "binary frames are not supported",
                )));
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    state.hub.disconnect(handle.id).await;
    // The writer stops once the last sender, held by the handle, is gone.
    drop(handle);
    if timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        debug!("writer did not drain in time");
        writer.abort();
    }
}

/// Takes the credential from the query string, or else from a first
/// `authenticate` frame. Any other first frame fails the handshake.
pub(crate) async fn handshake<S, E>(
    hub: &ChatHub,
    query_token: Option<String>,
    frames: &mut S,
) -> Result<Identity, RealtimeError>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
{
    if let Some(token) = query_token.filter(|token| !token.trim().is_empty()) {
        return hub.authenticate(Some(&token)).await;
    }
    let token = first_frame_credential(frames).await?;
    hub.authenticate(Some(&token)).await
}

pub(crate) async fn first_frame_credential<S, E>(frames: &mut S) -> Result<String, RealtimeError>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
{
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                return match serde_json::from_str::<ClientRequest>(&text) {
                    Ok(ClientRequest::Authenticate { token }) => Ok(token),
                    _ => Err(RealtimeError::Unauthenticated),
                };
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            _ => break,
        }
    }
    Err(RealtimeError::Unauthenticated)
}

pub(crate) fn decode_request(text: &str) -> Result<ClientRequest, ApiError> {
    serde_json::from_str(text)
        .map_err(|err| ApiError::new(ErrorCode::Validation, format!("malformed frame: {err}")))
}

pub(crate) fn encode_event(event: &ServerEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(text) => Some(Message::Text(text)),
        Err(err) => {
            warn!(error = %err, "failed to encode server event");
            None
        }
    }
}

async fn reject<S>(sender: &mut S, error: ApiError)
where
    S: Sink<Message> + Unpin,
{
    if let Some(frame) = encode_event(&ServerEvent::Error(error)) {
        let _ = sender.send(frame).await;
    }
    let _ = sender.send(Message::Close(None)).await;
}
