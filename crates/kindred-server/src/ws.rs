//! WebSocket bridge between the [`EventBus`] and connected clients.
//!
//! Downstream, every bus event is sent as one JSON text frame. Upstream,
//! a client may send `{"session_id": "...", "text": "..."}` to hold a
//! conversation over the socket; the reply arrives as a `{"reply": ...}`
//! frame and the recorded turns follow on the event stream.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use kindred_runtime::Orchestrator;
use kindred_types::SessionId;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub(crate) struct UpstreamMessage {
    session_id: String,
    text: String,
}

/// `GET /ws`
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut bus_rx = state.bus.subscribe();
    // Replies produced by spawned exchanges are funnelled back through here.
    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(16);
    debug!("websocket client connected");

    loop {
        tokio::select! {
            // ── Downstream: EventBus → client ──
            result = bus_rx.recv() => match result {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(frame) => {
                        if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "event serialization failed"),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "websocket client lagged behind the event bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            Some(frame) = reply_rx.recv() => {
                if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }

            // ── Upstream: client → orchestrator ──
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    spawn_upstream(text.as_str(), Arc::clone(&state.orchestrator), reply_tx.clone());
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("websocket client disconnected");
}

/// Parse an upstream frame and run the exchange on its own task.
fn spawn_upstream(text: &str, orchestrator: Arc<Orchestrator>, replies: mpsc::Sender<String>) {
    let request = match parse_upstream(text) {
        Ok(r) => r,
        Err(message) => {
            let _ = replies.try_send(json!({ "error": message }).to_string());
            return;
        }
    };
    tokio::spawn(async move {
        let (session_id, text) = request;
        let frame = match orchestrator.handle_message(&session_id, &text).await {
            Ok(reply) => json!({ "session_id": session_id, "reply": reply }).to_string(),
            Err(e) => json!({ "session_id": session_id, "error": e.to_string() }).to_string(),
        };
        // The client may have gone; the exchange is durable either way.
        let _ = replies.send(frame).await;
    });
}

pub(crate) fn parse_upstream(text: &str) -> Result<(SessionId, String), String> {
    let msg: UpstreamMessage = serde_json::from_str(text).map_err(|e| format!("invalid message: {e}"))?;
    let session_id = SessionId::parse(msg.session_id).map_err(|e| e.to_string())?;
    Ok((session_id, msg.text))
}
