//! Health, init, bucket, and cleanup endpoints.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::bucket::MountOptions;
use crate::error::ApiError;
use crate::state::AppState;

/// `GET /api/health`.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": state.start_time.elapsed().as_secs(),
    }))
}

/// `POST /api/init` — idempotently start the well-known helper services.
pub async fn init(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let started = state.helpers.init(&state.processes).await?;
    Ok(Json(json!({
        "success": true,
        "serversStarted": started,
    })))
}

#[derive(Deserialize)]
pub struct MountRequest {
    pub bucket: String,
    #[serde(rename = "mountPath")]
    pub mount_path: String,
    #[serde(default)]
    pub options: MountOptions,
}

/// `POST /api/bucket/mount`.
pub async fn mount_bucket(
    State(state): State<AppState>,
    Json(payload): Json<MountRequest>,
) -> Result<Json<Value>, ApiError> {
    state
        .buckets
        .mount(&payload.bucket, &payload.mount_path, &payload.options)
        .await?;
    Ok(Json(json!({"success": true, "mountPath": payload.mount_path})))
}

/// `POST /cleanup` — tear the sandbox down from the inside.
///
/// Kills background processes, stops every session shell and terminal, and
/// runs one last temp-file sweep. The HTTP server itself stays up so the
/// caller gets its response.
pub async fn cleanup(State(state): State<AppState>) -> Json<Value> {
    info!("Cleanup requested");
    state.processes.kill_all().await;
    state.terminals.shutdown_all().await;
    state.code.shutdown_all().await;
    state.sessions.shutdown_all().await;
    crate::shell::tempfiles::sweep(
        state.sessions.temp_dir(),
        std::time::Duration::ZERO,
        &std::collections::HashSet::new(),
    )
    .await;
    Json(json!({"success": true}))
}
