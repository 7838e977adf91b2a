//! Background-process endpoints.
//!
//! - `POST /api/process/start` — start a tracked process
//! - `GET /api/process/list` — list records (`?sessionId=&status=`)
//! - `GET /api/process/{id}` — fetch a record with buffered output
//! - `DELETE /api/process/{id}` — kill
//! - `GET /api/process/{id}/stream` — SSE of live output and status
//! - `POST /api/process/{id}/waitForLog` / `waitForPort` — readiness waits

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::ApiError;
use crate::process::{ProcessRecord, ProcessStatus, StartOptions};
use crate::routes::session_id_from;
use crate::security::validate_command;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct StartRequest {
    pub command: String,
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub struct WaitForLogRequest {
    pub pattern: String,
    /// Milliseconds; default 30 000.
    pub timeout: Option<u64>,
}

#[derive(Deserialize)]
pub struct WaitForPortRequest {
    pub port: u16,
    /// Milliseconds; default 30 000.
    pub timeout: Option<u64>,
}

/// Start a process for a request: detached through the named session when one
/// is given (so it observes session env/cwd), directly spawned otherwise.
pub async fn launch(
    state: &AppState,
    command: &str,
    cwd: Option<String>,
    env: HashMap<String, String>,
    session_id: Option<String>,
) -> Result<Arc<ProcessRecord>, ApiError> {
    validate_command(command)?;
    match session_id {
        Some(session_id) => {
            let session = state.sessions.get(&session_id).await?;
            state
                .processes
                .start_detached(&state.sessions, &session, command)
                .await
        }
        None => {
            state
                .processes
                .start_spawned(StartOptions {
                    command: command.to_string(),
                    cwd,
                    env,
                    session_id: None,
                })
                .await
        }
    }
}

/// `POST /api/process/start`.
pub async fn start(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<StartRequest>,
) -> Result<Json<Value>, ApiError> {
    let session_id = session_id_from(&headers, payload.session_id.as_deref());
    let record = launch(
        &state,
        &payload.command,
        payload.cwd,
        payload.env,
        session_id,
    )
    .await?;
    Ok(Json(json!({
        "success": true,
        "processId": record.id,
        "pid": record.pid(),
        "status": record.status(),
    })))
}

/// `GET /api/process/list?sessionId=&status=`.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let status = match query.status.as_deref() {
        Some(s) => Some(ProcessStatus::parse(s).ok_or_else(|| {
            ApiError::InvalidRequest(format!("Unknown process status {s:?}"))
        })?),
        None => None,
    };
    let processes = state.processes.list(query.session_id.as_deref(), status).await;
    Ok(Json(json!({
        "success": true,
        "count": processes.len(),
        "processes": processes,
    })))
}

/// `GET /api/process/{id}` — record including buffered stdout/stderr.
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state.processes.get(&id).await?;
    Ok(Json(json!({
        "success": true,
        "process": record.snapshot(true),
    })))
}

/// `DELETE /api/process/{id}` — kill (idempotent).
pub async fn kill(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.processes.kill(&id).await?;
    Ok(Json(json!({"success": true})))
}

/// `POST /api/process/{id}/waitForLog`.
pub async fn wait_for_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<WaitForLogRequest>,
) -> Result<Json<Value>, ApiError> {
    let timeout = Duration::from_millis(payload.timeout.unwrap_or(30_000));
    let line = state
        .processes
        .wait_for_log(&id, &payload.pattern, timeout)
        .await?;
    Ok(Json(json!({"success": true, "line": line})))
}

/// `POST /api/process/{id}/waitForPort`.
pub async fn wait_for_port(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<WaitForPortRequest>,
) -> Result<Json<Value>, ApiError> {
    let timeout = Duration::from_millis(payload.timeout.unwrap_or(30_000));
    let port = state
        .processes
        .wait_for_port(&id, payload.port, timeout)
        .await?;
    Ok(Json(json!({"success": true, "port": port})))
}

/// `GET /api/process/{id}/stream` — SSE view of a running process.
pub async fn stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let record = state.processes.get(&id).await?;
    Ok(process_sse(record, "process_info"))
}

/// Build the SSE stream for a process record.
///
/// Emits one `initial_event` with the record snapshot, then forwards output
/// chunks and status changes; a terminal status produces a final
/// `process_ended` event and closes the stream. Dropping the stream (client
/// disconnect) tears down the transient listeners without touching anyone
/// else's.
pub fn process_sse(
    record: Arc<ProcessRecord>,
    initial_event: &'static str,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<Event>(256);

    tokio::spawn(async move {
        let mut output = record.subscribe_output();
        let mut status = record.subscribe_status();

        let initial = Event::default()
            .event(initial_event)
            .data(serde_json::to_string(&record.snapshot(true)).unwrap_or_default());
        if tx.send(initial).await.is_err() {
            return;
        }

        // The record may already be terminal; say so and stop.
        if record.status().is_terminal() {
            let _ = tx.send(ended_event(&record)).await;
            return;
        }

        loop {
            tokio::select! {
                chunk = output.rx.recv() => {
                    let Some(chunk) = chunk else { break };
                    let event = Event::default().event("output").data(
                        json!({"stream": chunk.stream, "data": chunk.data}).to_string(),
                    );
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                next = status.rx.recv() => {
                    let Some(next) = next else { break };
                    let event = Event::default()
                        .event("status_change")
                        .data(json!({"status": next}).to_string());
                    if tx.send(event).await.is_err() {
                        break;
                    }
                    if next.is_terminal() {
                        // Flush output that raced the status event.
                        while let Ok(chunk) = output.rx.try_recv() {
                            let event = Event::default().event("output").data(
                                json!({"stream": chunk.stream, "data": chunk.data}).to_string(),
                            );
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        let _ = tx.send(ended_event(&record)).await;
                        break;
                    }
                }
            }
        }
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok(event), rx))
    });
    Sse::new(stream).keep_alive(KeepAlive::default().interval(Duration::from_secs(15)))
}

fn ended_event(record: &Arc<ProcessRecord>) -> Event {
    Event::default()
        .event("process_ended")
        .data(serde_json::to_string(&record.snapshot(false)).unwrap_or_default())
}
