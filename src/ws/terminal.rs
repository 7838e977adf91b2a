//! PTY terminal websocket endpoint.
//!
//! `GET /terminal/{sessionId?}` — upgrade-only (426 otherwise). The peer
//! first receives the session's replay buffer as one binary frame, then a
//! single `{"type":"ready"}` text frame, then live output. Binary frames
//! from the peer are user input; text frames are JSON control messages
//! (`{"type":"resize","cols":C,"rows":R}`).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Request, State};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::require_upgrade;
use crate::state::AppState;
use crate::terminal::PtySession;

/// Control messages accepted on the terminal socket.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TerminalControl {
    Resize { cols: u16, rows: u16 },
}

/// `GET /terminal` — fresh session id.
pub async fn terminal_new(State(state): State<AppState>, request: Request) -> Response {
    terminal(state, None, request).await
}

/// `GET /terminal/{sessionId}` — attach (or lazily create) a named session.
pub async fn terminal_named(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    request: Request,
) -> Response {
    terminal(state, Some(session_id), request).await
}

async fn terminal(state: AppState, session_id: Option<String>, request: Request) -> Response {
    let ws = match require_upgrade(request).await {
        Ok(ws) => ws,
        Err(e) => return e.into_response(),
    };

    let session = match state.terminals.get_or_create(session_id.as_deref()).await {
        Ok(session) => session,
        Err(e) => return e.into_response(),
    };

    ws.on_upgrade(move |socket| handle_terminal(socket, session))
}

async fn handle_terminal(socket: WebSocket, session: Arc<PtySession>) {
    let (mut sink, mut stream) = socket.split();

    // Replay first, then the ready marker, then live traffic.
    let (replay, mut peer) = session.attach(256);
    if !replay.is_empty() {
        if sink.send(Message::Binary(replay.into())).await.is_err() {
            return;
        }
    }
    if sink
        .send(Message::Text(json!({"type": "ready"}).to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            output = peer.rx.recv() => {
                match output {
                    Some(chunk) => {
                        if sink.send(Message::Binary(chunk.into())).await.is_err() {
                            break;
                        }
                    }
                    // Session torn down — normal close.
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            incoming = stream.next() => {
                let Some(Ok(message)) = incoming else { break };
                match message {
                    Message::Binary(data) => {
                        if session.write_input(data.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Message::Text(text) => {
                        match serde_json::from_str::<TerminalControl>(&text) {
                            Ok(TerminalControl::Resize { cols, rows }) => {
                                if let Err(e) = session.resize(rows, cols) {
                                    warn!("Terminal {}: resize failed: {e}", session.id);
                                }
                            }
                            Err(_) => {
                                let _ = sink
                                    .send(Message::Text(
                                        json!({
                                            "type": "error",
                                            "code": "INVALID_JSON",
                                            "message": "Unrecognized control message",
                                        })
                                        .to_string()
                                        .into(),
                                    ))
                                    .await;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        }
    }

    debug!("Terminal {}: peer loop ended", session.id);
    // Dropping `peer` detaches; the idle grace period owns the session now.
}
