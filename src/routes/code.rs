//! Code-interpreter endpoints.
//!
//! - `POST /api/code/context/create` / `GET /api/code/context/list` /
//!   `DELETE /api/code/context/{id}` — context lifecycle
//! - `POST /api/code/execute` — run code on a context
//! - `POST /api/code/execute/stream` — SSE of `stdout`/`stderr`/`result`/
//!   `completed` events as they arrive

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateContextRequest {
    pub language: String,
}

#[derive(Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    #[serde(default)]
    pub options: ExecuteOptions,
}

#[derive(Deserialize, Default)]
pub struct ExecuteOptions {
    /// Target context id. Required — contexts carry all interpreter state.
    pub context: Option<String>,
}

/// `POST /api/code/context/create`.
pub async fn create_context(
    State(state): State<AppState>,
    Json(payload): Json<CreateContextRequest>,
) -> Result<Json<Value>, ApiError> {
    let info = state.code.create(&payload.language).await?;
    Ok(Json(json!({"success": true, "context": info})))
}

/// `GET /api/code/context/list`.
pub async fn list_contexts(State(state): State<AppState>) -> Json<Value> {
    let contexts = state.code.list().await;
    Json(json!({"success": true, "contexts": contexts}))
}

/// `DELETE /api/code/context/{id}`.
pub async fn delete_context(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.code.delete(&id).await?;
    Ok(Json(json!({"success": true})))
}

fn context_of(payload: &ExecuteRequest) -> Result<&str, ApiError> {
    payload.options.context.as_deref().ok_or_else(|| {
        ApiError::InvalidRequest("options.context is required for code execution".to_string())
    })
}

/// `POST /api/code/execute` — aggregate result after the run finishes.
pub async fn execute(
    State(state): State<AppState>,
    Json(payload): Json<ExecuteRequest>,
) -> Result<Json<Value>, ApiError> {
    let context = context_of(&payload)?;
    let result = state.code.execute(context, &payload.code, None).await?;
    Ok(Json(json!({
        "success": result.error.is_none(),
        "stdout": result.stdout,
        "stderr": result.stderr,
        "results": result.results,
        "error": result.error,
    })))
}

/// `POST /api/code/execute/stream` — events as the worker produces them.
pub async fn execute_stream(
    State(state): State<AppState>,
    Json(payload): Json<ExecuteRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let context = context_of(&payload)?.to_string();
    let code = payload.code;

    let (tx, rx) = mpsc::channel(256);
    let registry = state.code.clone();
    tokio::spawn(async move {
        // Failures after the stream opened surface as a terminal error event.
        if let Err(e) = registry.execute(&context, &code, Some(tx.clone())).await {
            let _ = tx
                .send(crate::code::CodeEvent::Completed {
                    error: Some(e.to_string()),
                })
                .await;
        }
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| {
            let sse = Event::default()
                .event(event.kind())
                .data(serde_json::to_string(&event).unwrap_or_default());
            (Ok(sse), rx)
        })
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default().interval(Duration::from_secs(15))))
}
