//! WebSocket surfaces: the normalized event stream and the bidirectional PTY
//! byte stream.

use std::sync::Arc;

use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::state::AppState;

#[derive(Deserialize)]
pub struct WsQuery {
    pub conversation_id: Option<String>,
}

/// `/ws/appserver`: normalized events for one conversation (the active one
/// unless specified). A subscriber joining at time *t* begins at *t*; a
/// subscriber that lags out is dropped rather than stalling the emitter.
pub async fn appserver_ws(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events(socket, state, query.conversation_id))
}

async fn handle_events(socket: WebSocket, state: Arc<AppState>, explicit: Option<String>) {
    let conversation_id = match state.resolve_conversation(explicit).await {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!("event socket rejected: {e}");
            return;
        }
    };
    let mut rx = state.hub.subscribe(&conversation_id);
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("dropping slow event subscriber ({n} events behind)");
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }
}

/// `/ws/pty/{conversation_id}`: raw PTY bytes both ways.
pub async fn pty_ws(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_pty(socket, state, conversation_id))
}

async fn handle_pty(socket: WebSocket, state: Arc<AppState>, conversation_id: String) {
    let pty = match state.pty(&conversation_id).await {
        Ok(pty) => pty,
        Err(e) => {
            tracing::warn!("pty socket rejected: {e}");
            return;
        }
    };
    if let Err(e) = pty.ensure_started() {
        tracing::warn!("pty start failed: {e}");
        return;
    }
    let mut output = match pty.subscribe_output() {
        Ok(rx) => rx,
        Err(e) => {
            tracing::warn!("pty subscribe failed: {e}");
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            chunk = output.recv() => match chunk {
                Ok(bytes) => {
                    if sink.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("pty subscriber lagged by {n} chunks");
                }
                // Process exit closes the stream: terminal eof for the client.
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Binary(bytes))) => {
                    if pty.send(bytes.to_vec()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    if pty.send(text.as_bytes().to_vec()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }
}
