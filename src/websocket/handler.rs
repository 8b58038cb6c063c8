use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::auth::Claims;
use crate::inbox::pull_undelivered;
use crate::messaging::MessageType;
use crate::metrics::{
    WsMessageMetrics, WS_CONNECTIONS_CLOSED, WS_CONNECTIONS_OPENED, WS_CONNECTION_DURATION,
};
use crate::presence::PresenceSession;
use crate::server::AppState;

use super::message::{ClientMessage, ServerMessage, UserStatus};

const CHANNEL_BUFFER_SIZE: usize = 32;

/// How often the connection loop checks whether the gateway evicted it
const EVICTION_CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// Per-connection context handed to message handlers
struct Connection {
    state: AppState,
    session: Arc<PresenceSession>,
    /// Kept for re-validation on `join_conversation`
    token: String,
}

impl Connection {
    fn id(&self) -> Uuid {
        self.session.connection_id
    }

    fn user_id(&self) -> &str {
        &self.session.user_id
    }

    fn reply(&self, message: ServerMessage) {
        if !self.session.push(message) {
            tracing::debug!(connection_id = %self.id(), "Reply dropped, send queue full or closing");
        }
    }
}

/// WebSocket upgrade handler
#[tracing::instrument(
    name = "ws.upgrade",
    skip(ws, state, query, headers),
    fields(has_query_token = query.token.is_some())
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(token) = extract_token(&query, &headers) else {
        return (StatusCode::UNAUTHORIZED, "Missing authentication token").into_response();
    };

    let claims = match state.jwt_validator.validate(&token) {
        Ok(claims) => claims,
        Err(e) => {
            tracing::warn!(error = %e, "JWT validation failed");
            return (StatusCode::UNAUTHORIZED, "Invalid token").into_response();
        }
    };

    tracing::info!(user_id = %claims.sub, "WebSocket upgrade requested");

    ws.on_upgrade(move |socket| handle_socket(socket, state, claims, token))
}

/// Token from the `token` query parameter, else a Bearer header
fn extract_token(query: &WsQuery, headers: &HeaderMap) -> Option<String> {
    if let Some(ref token) = query.token {
        return Some(token.clone());
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

#[tracing::instrument(
    name = "ws.connection",
    skip(socket, state, claims, token),
    fields(user_id = %claims.sub, otel.kind = "server")
)]
async fn handle_socket(socket: WebSocket, state: AppState, claims: Claims, token: String) {
    let user_id = claims.user_id().to_string();
    let connection_start = std::time::Instant::now();

    let (tx, rx) = mpsc::channel::<ServerMessage>(CHANNEL_BUFFER_SIZE);
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let connected = match state.presence.connect(&user_id, tx) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "Connection rejected");
            let error_msg = ServerMessage::error(e.code(), e.to_string());
            if let Ok(json) = serde_json::to_string(&error_msg) {
                let _ = ws_sender.send(Message::Text(json.into())).await;
            }
            let _ = ws_sender.close().await;
            return;
        }
    };
    WS_CONNECTIONS_OPENED.inc();

    let connection = Arc::new(Connection {
        state: state.clone(),
        session: connected.session,
        token,
    });
    let connection_id = connection.id();

    tracing::info!(connection_id = %connection_id, user_id = %user_id, "WebSocket connection established");

    if connected.came_online {
        announce_status(&state, &user_id, UserStatus::Online).await;
    }

    // Catch up on anything stored while offline
    handle_sync(None, &connection).await;

    let send_task = tokio::spawn(async move {
        let mut outbound = ReceiverStream::new(rx);
        while let Some(msg) = outbound.next().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize message");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let recv_connection = connection.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(msg) => {
                    if !process_message(msg, &recv_connection).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    let watched = connection.session.clone();
    let eviction_watch = async move {
        let mut ticker = tokio::time::interval(EVICTION_CHECK_INTERVAL);
        loop {
            ticker.tick().await;
            if watched.is_closing() {
                break;
            }
        }
    };

    tokio::select! {
        _ = send_task => {
            tracing::debug!(connection_id = %connection_id, "Send task completed");
        }
        _ = recv_task => {
            tracing::debug!(connection_id = %connection_id, "Receive task completed");
        }
        _ = eviction_watch => {
            tracing::debug!(connection_id = %connection_id, "Session evicted");
        }
    }

    // Already gone if the liveness sweep evicted it
    if let Some(disconnected) = state.presence.disconnect(connection_id) {
        if disconnected.went_offline {
            announce_status(&state, &user_id, UserStatus::Offline).await;
        }
    }

    WS_CONNECTIONS_CLOSED.inc();
    let duration = connection_start.elapsed().as_secs_f64();
    WS_CONNECTION_DURATION.observe(duration);

    tracing::info!(
        connection_id = %connection_id,
        user_id = %user_id,
        duration_secs = duration,
        "WebSocket connection closed"
    );
}

pub(crate) async fn announce_status(state: &AppState, user_id: &str, status: UserStatus) {
    if let Err(e) = state.conversations.broadcast_status(user_id, status).await {
        tracing::warn!(user_id = %user_id, error = %e, "Failed to broadcast presence change");
    }
}

/// Returns false if the connection should be closed
async fn process_message(msg: Message, connection: &Connection) -> bool {
    if connection.session.is_closing() {
        return false;
    }

    match msg {
        Message::Text(text) => {
            connection.session.touch();

            let client_msg: ClientMessage = match serde_json::from_str(&text) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to parse client message");
                    connection.reply(ServerMessage::error("INVALID_MESSAGE", e.to_string()));
                    return true;
                }
            };

            handle_client_message(client_msg, connection).await;
            true
        }
        Message::Binary(_) => {
            connection.reply(ServerMessage::error(
                "UNSUPPORTED_FORMAT",
                "Binary messages are not supported",
            ));
            true
        }
        Message::Ping(_) | Message::Pong(_) => {
            // Axum answers pings; either way the peer is alive
            connection.session.touch();
            true
        }
        Message::Close(_) => {
            tracing::debug!(connection_id = %connection.id(), "Received close frame");
            false
        }
    }
}

#[tracing::instrument(
    name = "ws.message",
    skip(msg, connection),
    fields(
        connection_id = %connection.id(),
        user_id = %connection.user_id(),
        message_type = msg.kind()
    )
)]
async fn handle_client_message(msg: ClientMessage, connection: &Connection) {
    WsMessageMetrics::record(msg.kind());

    match msg {
        ClientMessage::JoinConversation { conversation_id } => {
            handle_join(conversation_id, connection).await;
        }
        ClientMessage::LeaveConversation { conversation_id } => {
            connection
                .state
                .conversations
                .leave(connection.id(), &conversation_id);
            connection.reply(ServerMessage::LeftConversation { conversation_id });
        }
        ClientMessage::SendMessage {
            conversation_id,
            content,
            message_type,
            reply_to,
        } => {
            handle_send(conversation_id, content, message_type, reply_to, connection).await;
        }
        ClientMessage::TypingStart { conversation_id } => {
            handle_typing(conversation_id, true, connection).await;
        }
        ClientMessage::TypingStop { conversation_id } => {
            handle_typing(conversation_id, false, connection).await;
        }
        ClientMessage::AddReaction { message_id, emoji } => {
            if let Err(e) = connection
                .state
                .conversations
                .add_reaction(connection.user_id(), message_id, &emoji)
                .await
            {
                connection.reply(ServerMessage::error(e.code(), e.to_string()));
            }
        }
        ClientMessage::Sync { limit } => {
            handle_sync(limit, connection).await;
        }
        ClientMessage::Ack { notification_ids } => {
            handle_ack(notification_ids, connection).await;
        }
        ClientMessage::Ping => {
            connection.reply(ServerMessage::Pong);
        }
    }
}

async fn handle_join(conversation_id: String, connection: &Connection) {
    // Tokens can expire over a long-lived socket
    if let Err(e) = connection.state.jwt_validator.validate(&connection.token) {
        tracing::info!(connection_id = %connection.id(), error = %e, "Token no longer valid");
        connection.reply(ServerMessage::error("TOKEN_EXPIRED", "Reconnect with a fresh token"));
        return;
    }

    match connection
        .state
        .conversations
        .join(connection.id(), connection.user_id(), &conversation_id)
        .await
    {
        Ok(()) => {
            tracing::info!(connection_id = %connection.id(), conversation_id = %conversation_id, "Joined conversation");
            connection.reply(ServerMessage::JoinedConversation { conversation_id });
        }
        Err(e) => {
            tracing::warn!(
                connection_id = %connection.id(),
                conversation_id = %conversation_id,
                error = %e,
                "Join rejected"
            );
            connection.reply(ServerMessage::error(e.code(), e.to_string()));
        }
    }
}

async fn handle_send(
    conversation_id: String,
    content: String,
    message_type: MessageType,
    reply_to: Option<Uuid>,
    connection: &Connection,
) {
    match connection
        .state
        .conversations
        .send_message(
            connection.user_id(),
            &conversation_id,
            &content,
            message_type,
            reply_to,
        )
        .await
    {
        Ok(message) => connection.reply(ServerMessage::MessageSent {
            conversation_id,
            message_id: message.id,
        }),
        Err(e) => connection.reply(ServerMessage::error(e.code(), e.to_string())),
    }
}

async fn handle_typing(conversation_id: String, is_typing: bool, connection: &Connection) {
    if let Err(e) = connection
        .state
        .conversations
        .typing(
            connection.user_id(),
            &conversation_id,
            is_typing,
            Some(connection.id()),
        )
        .await
    {
        connection.reply(ServerMessage::error(e.code(), e.to_string()));
    }
}

async fn handle_sync(limit: Option<usize>, connection: &Connection) {
    let state = &connection.state;
    match pull_undelivered(
        state.inbox.as_ref(),
        connection.user_id(),
        limit,
        state.settings.inbox.sync_batch_limit,
    )
    .await
    {
        Ok(batch) => connection.reply(ServerMessage::SyncBatch {
            notifications: batch.notifications,
            unread_count: batch.unread_count,
            has_more: batch.has_more,
        }),
        Err(e) => {
            tracing::warn!(connection_id = %connection.id(), error = %e, "Sync failed");
            connection.reply(ServerMessage::error("SYNC_FAILED", e.to_string()));
        }
    }
}

async fn handle_ack(notification_ids: Vec<Uuid>, connection: &Connection) {
    match connection
        .state
        .inbox
        .mark_delivered(connection.user_id(), &notification_ids)
        .await
    {
        Ok(acknowledged) => connection.reply(ServerMessage::Acked {
            notification_ids,
            acknowledged,
        }),
        Err(e) => {
            tracing::warn!(connection_id = %connection.id(), error = %e, "Ack failed");
            connection.reply(ServerMessage::error("ACK_FAILED", e.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_query_token_wins_over_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));

        let query = WsQuery {
            token: Some("from-query".into()),
        };
        assert_eq!(extract_token(&query, &headers).as_deref(), Some("from-query"));

        let query = WsQuery { token: None };
        assert_eq!(extract_token(&query, &headers).as_deref(), Some("from-header"));
    }

    #[test]
    fn test_missing_or_non_bearer_token() {
        let query = WsQuery { token: None };
        assert!(extract_token(&query, &HeaderMap::new()).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(extract_token(&query, &headers).is_none());
    }
}
