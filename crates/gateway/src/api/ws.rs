//! The chat WebSocket endpoint.
//!
//! `GET /ws/chat?token=<jwt>`: the JWT is validated during the handshake;
//! failures close the socket with code 4001. One JSON event per text
//! frame. Reconnects while a turn is running re-attach to the existing
//! handler and replay undelivered events.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use cq_domain::event::parse_client_event;

use crate::auth::authenticate;
use crate::state::AppState;

/// WebSocket close code for failed authentication.
const CLOSE_UNAUTHORIZED: u16 = 4001;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

pub async fn chat_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    let username = match authenticate(&token, &state.config.auth.jwt_secret) {
        Ok(username) => username,
        Err(e) => {
            tracing::warn!(error = %e, "chat socket auth failed");
            return ws.on_upgrade(|socket| close_unauthorized(socket, "Unauthorized"));
        }
    };

    ws.on_upgrade(move |socket| async move {
        let user = match state.store.users().get_by_username(&username).await {
            Ok(Some(user)) => user,
            _ => {
                tracing::warn!(%username, "token names an unknown user");
                close_unauthorized(socket, "User not found").await;
                return;
            }
        };
        handle_socket(socket, state, user.id, username).await;
    })
}

async fn close_unauthorized(mut socket: WebSocket, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_UNAUTHORIZED,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: i64, username: String) {
    tracing::info!(user_id, %username, "chat socket connected");

    let handler = state.connections.handler_for(&state, user_id);
    let outbound = handler.outbound();

    // Swap this socket in; undelivered events from a running turn replay
    // first, then the live channel drains in order.
    let (mut rx, replay, generation) = outbound.attach();
    let (mut sink, mut stream) = socket.split();

    let writer_outbound = outbound.clone();
    let writer = tokio::spawn(async move {
        for envelope in replay {
            let Ok(json) = serde_json::to_string(&envelope) else {
                continue;
            };
            if sink.send(Message::Text(json)).await.is_err() {
                return;
            }
            writer_outbound.mark_delivered();
        }
        while let Some(envelope) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&envelope) else {
                continue;
            };
            if sink.send(Message::Text(json)).await.is_err() {
                return;
            }
            writer_outbound.mark_delivered();
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => match parse_client_event(&text) {
                Ok(event) => handler.handle_event(event),
                Err(e) => {
                    tracing::debug!(error = %e, "rejecting malformed client event");
                    handler.send_error(&e);
                }
            },
            Message::Close(_) => break,
            // axum answers pings at the protocol level.
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }

    // The handler (and any running turn) outlives the socket; only the
    // socket plumbing is torn down here.
    outbound.detach(generation);
    writer.abort();
    state.connections.release_if_idle(user_id);
    tracing::info!(user_id, %username, "chat socket disconnected");
}
