//! REST API route handlers and router assembly.

pub mod admin;
pub mod code;
pub mod execute;
pub mod files;
pub mod git;
pub mod ports;
pub mod process;
pub mod sessions;

use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderName};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get, post};
use axum::Router;
use tower_http::cors::{Any as CorsAny, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::ApiError;
use crate::ports::proxy;
use crate::state::AppState;
use crate::ws;

/// Header identifying the target container instance.
pub const SANDBOX_ID_HEADER: &str = "x-sandbox-id";
/// Header selecting a session other than the default.
pub const SESSION_ID_HEADER: &str = "x-session-id";

/// Session id for a request: explicit body value wins over the header.
pub fn session_id_from(headers: &HeaderMap, body_value: Option<&str>) -> Option<String> {
    if let Some(id) = body_value {
        if !id.is_empty() {
            return Some(id.to_string());
        }
    }
    headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

/// Middleware requiring `X-Sandbox-Id` on the `/api/*` surface.
///
/// The value is the orchestrator's routing concern; only its presence is
/// enforced here.
pub async fn require_sandbox_id(request: Request, next: Next) -> Response {
    let present = request
        .headers()
        .get(SANDBOX_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| !v.is_empty());
    if !present {
        return ApiError::InvalidRequest(format!(
            "Missing required {SANDBOX_ID_HEADER} header"
        ))
        .into_response();
    }
    next.run(request).await
}

/// Build the full application router.
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/api/execute", post(execute::execute))
        .route("/api/execute/stream", post(execute::execute_stream))
        .route("/api/read", post(files::read_file))
        .route("/api/write", post(files::write_file))
        .route("/api/delete", post(files::delete_file))
        .route("/api/rename", post(files::rename_file))
        .route("/api/move", post(files::move_file))
        .route("/api/mkdir", post(files::mkdir))
        .route("/api/list", post(files::list_dir))
        .route("/api/git/checkout", post(git::checkout))
        .route("/api/process/start", post(process::start))
        .route("/api/process/list", get(process::list))
        .route(
            "/api/process/{id}",
            get(process::get).delete(process::kill),
        )
        .route("/api/process/{id}/stream", get(process::stream))
        .route("/api/process/{id}/waitForLog", post(process::wait_for_log))
        .route(
            "/api/process/{id}/waitForPort",
            post(process::wait_for_port),
        )
        .route("/api/code/context/create", post(code::create_context))
        .route("/api/code/context/list", get(code::list_contexts))
        .route("/api/code/context/{id}", delete(code::delete_context))
        .route("/api/code/execute", post(code::execute))
        .route("/api/code/execute/stream", post(code::execute_stream))
        .route("/api/expose-port", post(ports::expose))
        .route("/api/exposed-ports", get(ports::list))
        .route("/api/exposed-ports/{port}", delete(ports::unexpose))
        .route("/api/session/create", post(sessions::create))
        .route("/api/session/delete", post(sessions::delete))
        .route("/api/session/list", get(sessions::list))
        .route("/api/env/set", post(sessions::set_env))
        .route("/api/init", post(admin::init))
        .route("/api/bucket/mount", post(admin::mount_bucket))
        .layer(middleware::from_fn(require_sandbox_id));

    let open_routes = Router::new()
        .route("/api/health", get(admin::health))
        .route("/cleanup", post(admin::cleanup))
        .route("/proxy/{port}", any(proxy::proxy_root))
        .route("/proxy/{port}/{*rest}", any(proxy::proxy_path))
        .route("/terminal", get(ws::terminal::terminal_new))
        .route("/terminal/{session_id}", get(ws::terminal::terminal_named))
        .route("/ws/{name}", get(ws::bridge::bridge))
        .route("/api/ws", get(ws::control_upgrade));

    // GUARD: headers must be listed explicitly — `allow_headers(Any)` breaks
    // credentialed preflights in Firefox.
    let cors = CorsLayer::new()
        .allow_origin(CorsAny)
        .allow_methods(CorsAny)
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static(SANDBOX_ID_HEADER),
            HeaderName::from_static(SESSION_ID_HEADER),
            HeaderName::from_static("x-use-websocket"),
            HeaderName::from_static("x-sandbox-keepalive"),
        ]);

    let max_connections = state.config.server.max_connections;
    Router::new()
        .merge(api_routes)
        .merge(open_routes)
        // Wraps the whole router: preview hostnames are intercepted before
        // route dispatch.
        .layer(middleware::from_fn_with_state(
            state.clone(),
            proxy::subdomain_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn session_id_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_ID_HEADER, HeaderValue::from_static("from-header"));

        assert_eq!(
            session_id_from(&headers, Some("from-body")),
            Some("from-body".to_string())
        );
        assert_eq!(
            session_id_from(&headers, None),
            Some("from-header".to_string())
        );
        assert_eq!(session_id_from(&HeaderMap::new(), None), None);
        // Empty values count as absent.
        assert_eq!(session_id_from(&HeaderMap::new(), Some("")), None);
    }
}
