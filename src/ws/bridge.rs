//! Websocket bridge to in-container helper services.
//!
//! `GET /ws/{name}` — upgrade-only. Frames are piped verbatim between the
//! client and `ws://127.0.0.1:{helper port}/` until either side closes.

use axum::extract::ws::{Message as ClientMessage, WebSocket};
use axum::extract::{Path, Request, State};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tracing::{debug, warn};

use super::require_upgrade;
use crate::error::ApiError;
use crate::state::AppState;

/// `GET /ws/{name}`.
pub async fn bridge(
    State(state): State<AppState>,
    Path(name): Path<String>,
    request: Request,
) -> Response {
    let ws = match require_upgrade(request).await {
        Ok(ws) => ws,
        Err(e) => return e.into_response(),
    };
    let Some(port) = state.helpers.port_of(&name) else {
        return ApiError::InvalidRequest(format!("Unknown helper service {name:?}"))
            .into_response();
    };

    ws.on_upgrade(move |socket| async move {
        if let Err(e) = run_bridge(socket, &name, port).await {
            warn!("WS bridge to {name} failed: {e}");
        }
    })
}

async fn run_bridge(client: WebSocket, name: &str, port: u16) -> Result<(), String> {
    let url = format!("ws://127.0.0.1:{port}/");
    let (upstream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .map_err(|e| format!("connect to {url}: {e}"))?;

    let (mut client_sink, mut client_stream) = client.split();
    let (mut upstream_sink, mut upstream_stream) = upstream.split();

    debug!("WS bridge to {name} (port {port}) open");
    loop {
        tokio::select! {
            from_client = client_stream.next() => {
                let Some(Ok(message)) = from_client else { break };
                let Some(outbound) = client_to_upstream(message) else { break };
                if upstream_sink.send(outbound).await.is_err() {
                    break;
                }
            }
            from_upstream = upstream_stream.next() => {
                let Some(Ok(message)) = from_upstream else { break };
                let Some(outbound) = upstream_to_client(message) else { break };
                if client_sink.send(outbound).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("WS bridge to {name} closed");
    Ok(())
}

/// Client frame → upstream frame. `None` ends the bridge (close frames).
fn client_to_upstream(message: ClientMessage) -> Option<UpstreamMessage> {
    match message {
        ClientMessage::Text(text) => Some(UpstreamMessage::text(text.to_string())),
        ClientMessage::Binary(data) => Some(UpstreamMessage::binary(data.to_vec())),
        ClientMessage::Ping(data) => Some(UpstreamMessage::Ping(data.to_vec().into())),
        ClientMessage::Pong(data) => Some(UpstreamMessage::Pong(data.to_vec().into())),
        ClientMessage::Close(_) => None,
    }
}

/// Upstream frame → client frame. `None` ends the bridge.
fn upstream_to_client(message: UpstreamMessage) -> Option<ClientMessage> {
    match message {
        UpstreamMessage::Text(text) => Some(ClientMessage::Text(text.to_string().into())),
        UpstreamMessage::Binary(data) => Some(ClientMessage::Binary(data)),
        UpstreamMessage::Ping(data) => Some(ClientMessage::Ping(data)),
        UpstreamMessage::Pong(data) => Some(ClientMessage::Pong(data)),
        UpstreamMessage::Close(_) => None,
        UpstreamMessage::Frame(_) => None,
    }
}
