//! WebSocket control-plane transport.
//!
//! Clients that send `X-Use-WebSocket: true` run the same operations over one
//! socket at `GET /api/ws` instead of per-request HTTP. Messages are the
//! control wire format from [`crate::shell::protocol`]:
//!
//! | Inbound (client → server) | Outbound (server → client) |
//! |---------------------------|----------------------------|
//! | `exec {id, command, cwd?}` | `result {id, stdout, stderr, exitCode}` |
//! | `exec_stream {id, command, cwd?}` | `stream_event {id, event}` … then a final `stream_event complete` |
//! | `exit {id}` | — (socket closes) |
//!
//! A `ready` message is emitted once after the upgrade. Unparsable frames get
//! an `error` with code `INVALID_JSON`. The socket's session is chosen by the
//! `X-Session-Id` header at upgrade time (default session otherwise);
//! per-session mutexes keep concurrent socket commands in arrival order.

pub mod bridge;
pub mod terminal;

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{FromRequestParts, Request, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::ApiError;
use crate::routes::session_id_from;
use crate::shell::protocol::{ControlRequest, ControlResponse, StreamEvent};
use crate::state::AppState;

/// Extract the websocket upgrade, or fail with the 426 transport error.
pub(crate) async fn require_upgrade(request: Request) -> Result<WebSocketUpgrade, ApiError> {
    let (mut parts, _body) = request.into_parts();
    <WebSocketUpgrade as FromRequestParts<()>>::from_request_parts(&mut parts, &())
        .await
        .map_err(|_| {
            ApiError::NotWebSocketRequest("This endpoint only speaks WebSocket".to_string())
        })
}

/// `GET /api/ws` — control-plane upgrade (426 otherwise).
pub async fn control_upgrade(State(state): State<AppState>, request: Request) -> Response {
    let session_id = session_id_from(request.headers(), None);
    let ws = match require_upgrade(request).await {
        Ok(ws) => ws,
        Err(e) => return e.into_response(),
    };
    ws.on_upgrade(move |socket| handle_control(socket, state, session_id))
}

async fn handle_control(socket: WebSocket, state: AppState, session_id: Option<String>) {
    let (mut sink, mut stream) = socket.split();

    // Replies from concurrently-running commands funnel through one channel.
    let (tx, mut rx) = mpsc::channel::<ControlResponse>(256);

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    error!("Control WS: failed to serialize reply: {e}");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let _ = tx
        .send(ControlResponse::Ready {
            id: "0".to_string(),
        })
        .await;

    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let request = match serde_json::from_str::<ControlRequest>(&text) {
            Ok(request) => request,
            Err(e) => {
                let _ = tx
                    .send(ControlResponse::Error {
                        id: String::new(),
                        code: "INVALID_JSON".to_string(),
                        message: format!("Failed to parse control message: {e}"),
                    })
                    .await;
                continue;
            }
        };

        match request {
            ControlRequest::Exec { id, command, cwd } => {
                let state = state.clone();
                let session_id = session_id.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let reply = run_exec(&state, session_id.as_deref(), &command, cwd.as_deref(), &id)
                        .await;
                    let _ = tx.send(reply).await;
                });
            }
            ControlRequest::ExecStream { id, command, cwd } => {
                let state = state.clone();
                let session_id = session_id.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    run_exec_stream(&state, session_id.as_deref(), &command, cwd.as_deref(), &id, tx)
                        .await;
                });
            }
            ControlRequest::Exit { id } => {
                debug!("Control WS: exit requested ({id})");
                break;
            }
        }
    }

    drop(tx);
    let _ = send_task.await;
}

async fn run_exec(
    state: &AppState,
    session_id: Option<&str>,
    command: &str,
    cwd: Option<&str>,
    id: &str,
) -> ControlResponse {
    let session = match state.sessions.get_or_default(session_id).await {
        Ok(session) => session,
        Err(e) => {
            return ControlResponse::Error {
                id: id.to_string(),
                code: e.code().to_string(),
                message: e.to_string(),
            }
        }
    };
    match state
        .sessions
        .exec(&session, command, &HashMap::new(), cwd, None)
        .await
    {
        Ok(outcome) => ControlResponse::Result {
            id: id.to_string(),
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            exit_code: outcome.exit_code,
        },
        Err(e) => ControlResponse::Error {
            id: id.to_string(),
            code: e.code().to_string(),
            message: e.to_string(),
        },
    }
}

async fn run_exec_stream(
    state: &AppState,
    session_id: Option<&str>,
    command: &str,
    cwd: Option<&str>,
    id: &str,
    tx: mpsc::Sender<ControlResponse>,
) {
    let session = match state.sessions.get_or_default(session_id).await {
        Ok(session) => session,
        Err(e) => {
            let _ = tx
                .send(ControlResponse::Error {
                    id: id.to_string(),
                    code: e.code().to_string(),
                    message: e.to_string(),
                })
                .await;
            return;
        }
    };

    // Forward driver stream events as they arrive; the driver emits the
    // terminal complete/error event itself.
    let (event_tx, mut event_rx) = mpsc::channel::<StreamEvent>(256);
    let forward_tx = tx.clone();
    let forward_id = id.to_string();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let _ = forward_tx
                .send(ControlResponse::StreamEvent {
                    id: forward_id.clone(),
                    event,
                })
                .await;
        }
    });

    let result = state
        .sessions
        .exec_stream(&session, command, &HashMap::new(), cwd, None, event_tx)
        .await;
    let _ = forwarder.await;

    if let Err(e) = result {
        // The stream already carried an error event; log for the server side.
        debug!("Control WS exec_stream {id} failed: {e}");
    }
}
