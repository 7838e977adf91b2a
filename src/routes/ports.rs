//! Exposed-port endpoints.
//!
//! - `POST /api/expose-port` — declare a port reachable
//! - `GET /api/exposed-ports` — list records
//! - `DELETE /api/exposed-ports/{port}` — unexpose

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ExposeRequest {
    pub port: u16,
    pub name: Option<String>,
}

/// `POST /api/expose-port`.
pub async fn expose(
    State(state): State<AppState>,
    Json(payload): Json<ExposeRequest>,
) -> Result<Json<Value>, ApiError> {
    let record = state.ports.expose(payload.port, payload.name).await?;
    Ok(Json(json!({"success": true, "port": record})))
}

/// `GET /api/exposed-ports`.
pub async fn list(State(state): State<AppState>) -> Json<Value> {
    let ports = state.ports.list().await;
    Json(json!({"success": true, "count": ports.len(), "ports": ports}))
}

/// `DELETE /api/exposed-ports/{port}`.
pub async fn unexpose(
    State(state): State<AppState>,
    Path(port): Path<u16>,
) -> Result<Json<Value>, ApiError> {
    state.ports.unexpose(port).await?;
    Ok(Json(json!({"success": true})))
}
