//! Command execution endpoints.
//!
//! - `POST /api/execute` — run a command on a session (or start a background
//!   process with `background: true`)
//! - `POST /api/execute/stream` — the same work as a background process with
//!   an SSE view of its output and status

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use axum::Json;
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::routes::session_id_from;
use crate::security::validate_command;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ExecuteRequest {
    pub command: String,
    /// Per-command env overrides; `null` values mask for this command only.
    #[serde(default)]
    pub env: HashMap<String, Option<String>>,
    /// Per-command working directory override.
    pub cwd: Option<String>,
    /// `true` starts a background process and returns its id instead.
    #[serde(default)]
    pub background: bool,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    /// Per-request timeout in milliseconds.
    #[serde(rename = "timeoutMs")]
    pub timeout_ms: Option<u64>,
}

/// `POST /api/execute`.
///
/// Foreground commands run through the target session's shell under its
/// mutex, so state (cwd, exports, functions) persists across calls and
/// commands on one session never interleave.
pub async fn execute(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ExecuteRequest>,
) -> Result<Json<Value>, ApiError> {
    validate_command(&payload.command)?;
    let session_id = session_id_from(&headers, payload.session_id.as_deref());

    if payload.background {
        let env = flatten_env(&payload.env);
        let record = super::process::launch(
            &state,
            &payload.command,
            payload.cwd.clone(),
            env,
            session_id,
        )
        .await?;
        return Ok(Json(json!({
            "success": true,
            "processId": record.id,
        })));
    }

    let session = state.sessions.get_or_default(session_id.as_deref()).await?;
    let timeout = payload.timeout_ms.map(Duration::from_millis);
    let outcome = state
        .sessions
        .exec(
            &session,
            &payload.command,
            &payload.env,
            payload.cwd.as_deref(),
            timeout,
        )
        .await?;

    let mut body = json!({
        "success": outcome.exit_code == 0,
        "exitCode": outcome.exit_code,
        "stdout": outcome.stdout,
        "stderr": outcome.stderr,
        "durationMs": outcome.duration_ms,
    });
    if let Some(capture_error) = outcome.capture_error {
        body["details"] = json!({"captureError": capture_error});
    }
    Ok(Json(body))
}

/// `POST /api/execute/stream` — SSE of `process_started`, `output`,
/// `status_change`, and `process_ended` events.
pub async fn execute_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ExecuteRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    validate_command(&payload.command)?;
    let session_id = session_id_from(&headers, payload.session_id.as_deref());
    let env = flatten_env(&payload.env);
    let record = super::process::launch(
        &state,
        &payload.command,
        payload.cwd.clone(),
        env,
        session_id,
    )
    .await?;
    Ok(super::process::process_sse(record, "process_started"))
}

/// Background processes inherit only concrete values; a `null` override has
/// nothing to mask in a fresh child environment.
fn flatten_env(env: &HashMap<String, Option<String>>) -> HashMap<String, String> {
    env.iter()
        .filter_map(|(k, v)| v.as_ref().map(|v| (k.clone(), v.clone())))
        .collect()
}
