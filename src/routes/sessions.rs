//! Session lifecycle and environment endpoints.
//!
//! - `POST /api/session/create` / `POST /api/session/delete` /
//!   `GET /api/session/list`
//! - `POST /api/env/set` — update the session env layer (null values unset)

use std::collections::HashMap;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::ApiError;
use crate::routes::session_id_from;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateRequest {
    /// Explicit id; a fresh one is generated when omitted.
    pub id: Option<String>,
    /// Initial env; `null` values unset inherited image variables.
    #[serde(default)]
    pub env: HashMap<String, Option<String>>,
    pub cwd: Option<String>,
    /// Launch the shell in a new PID namespace.
    #[serde(default)]
    pub isolation: bool,
}

#[derive(Deserialize)]
pub struct DeleteRequest {
    pub id: String,
}

#[derive(Deserialize)]
pub struct SetEnvRequest {
    #[serde(rename = "envVars")]
    pub env_vars: HashMap<String, Option<String>>,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// `POST /api/session/create`.
pub async fn create(
    State(state): State<AppState>,
    Json(payload): Json<CreateRequest>,
) -> Result<Json<Value>, ApiError> {
    let id = payload.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let info = state
        .sessions
        .create(&id, payload.env, payload.cwd.as_deref(), payload.isolation)
        .await?;
    Ok(Json(json!({"success": true, "session": info})))
}

/// `POST /api/session/delete`.
pub async fn delete(
    State(state): State<AppState>,
    Json(payload): Json<DeleteRequest>,
) -> Result<Json<Value>, ApiError> {
    state.sessions.delete(&payload.id).await?;
    Ok(Json(json!({"success": true})))
}

/// `GET /api/session/list`.
pub async fn list(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.sessions.list().await;
    Json(json!({"success": true, "count": sessions.len(), "sessions": sessions}))
}

/// `POST /api/env/set` — applies to the request's session (default session
/// when none is named).
pub async fn set_env(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SetEnvRequest>,
) -> Result<Json<Value>, ApiError> {
    let session_id = session_id_from(&headers, payload.session_id.as_deref());
    let session = state.sessions.get_or_default(session_id.as_deref()).await?;
    state.sessions.set_env(&session, payload.env_vars).await?;
    Ok(Json(json!({"success": true})))
}
