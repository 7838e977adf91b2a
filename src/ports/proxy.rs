//! Reverse proxy for exposed ports.
//!
//! Two URL shapes reach the same forwarder:
//!
//! 1. **Path form** (development): `/proxy/{port}/{rest…}` — the prefix is
//!    stripped and the remainder is sent to `http://127.0.0.1:{port}/{rest…}`.
//! 2. **Subdomain form** (production): a `{port}-{sandboxId}.<base>` hostname;
//!    the full path and query are preserved.
//!
//! The proxy is a stateless forwarder: it never serializes through a session,
//! streams both request and response bodies, and passes status and headers
//! through unchanged. Connect failures surface as 502 with a JSON body.

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::uri::Uri;
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::json;
use tracing::debug;

use crate::error::{now_ms, ApiError};
use crate::state::AppState;

/// Shared HTTP/1 client for in-container origins.
pub type ProxyClient = Client<HttpConnector, Body>;

pub fn new_client() -> ProxyClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// `ANY /proxy/{port}/{*rest}` — path-form proxy.
pub async fn proxy_path(
    State(state): State<AppState>,
    Path((port, rest)): Path<(u16, String)>,
    request: Request,
) -> Response {
    let query = request
        .uri()
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    forward(&state, port, &format!("/{rest}{query}"), request).await
}

/// `ANY /proxy/{port}` — path-form proxy with an empty remainder.
pub async fn proxy_root(
    State(state): State<AppState>,
    Path(port): Path<u16>,
    request: Request,
) -> Response {
    let query = request
        .uri()
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    forward(&state, port, &format!("/{query}"), request).await
}

/// Outermost middleware implementing the subdomain form.
///
/// Requests whose `Host` matches `{port}-{sandboxId}.<base>` are forwarded
/// with their URL untouched; everything else continues down the router.
pub async fn subdomain_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);

    if let Some(host) = host {
        let base = state.config.server.proxy_base_host.as_deref();
        if let Some((port, sandbox_id)) = parse_preview_host(&host, base) {
            debug!("Preview host {host} → port {port} (sandbox {sandbox_id})");
            let path_and_query = request
                .uri()
                .path_and_query()
                .map_or("/", |pq| pq.as_str())
                .to_string();
            return forward(&state, port, &path_and_query, request).await;
        }
    }

    next.run(request).await
}

/// Parse `{port}-{sandboxId}.<base>` out of a Host header value.
///
/// When `base` is configured the hostname must end with it; otherwise any
/// multi-label host with a matching first label is accepted (development).
pub fn parse_preview_host(host: &str, base: Option<&str>) -> Option<(u16, String)> {
    // Strip an explicit :port suffix.
    let host = host.split(':').next().unwrap_or(host);
    let (label, rest) = host.split_once('.')?;
    if rest.is_empty() {
        return None;
    }
    if let Some(base) = base {
        if !rest.eq_ignore_ascii_case(base) {
            return None;
        }
    }
    let (port, sandbox_id) = label.split_once('-')?;
    let port: u16 = port.parse().ok()?;
    if sandbox_id.is_empty() {
        return None;
    }
    Some((port, sandbox_id.to_string()))
}

/// Forward a request to `http://127.0.0.1:{port}{path_and_query}`.
async fn forward(state: &AppState, port: u16, path_and_query: &str, request: Request) -> Response {
    if !state.ports.is_active(port).await {
        return ApiError::PortNotFound(port).into_response();
    }

    let uri: Uri = match format!("http://127.0.0.1:{port}{path_and_query}").parse() {
        Ok(uri) => uri,
        Err(e) => {
            return ApiError::InvalidRequest(format!("Unproxyable URL: {e}")).into_response();
        }
    };

    let (mut parts, body) = request.into_parts();
    parts.uri = uri;
    // The origin sees itself as the host; everything else passes through.
    parts.headers.remove(header::HOST);
    let outbound = Request::from_parts(parts, body);

    match state.proxy_client.request(outbound).await {
        Ok(response) => {
            let (parts, body) = response.into_parts();
            Response::from_parts(parts, Body::new(body))
        }
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({
                "success": false,
                "error": format!("Failed to reach 127.0.0.1:{port}: {e}"),
                "code": "PROXY_ERROR",
                "timestamp": now_ms(),
            })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_host_parsing() {
        assert_eq!(
            parse_preview_host("9092-sbx1.preview.example.com", None),
            Some((9092, "sbx1".to_string()))
        );
        assert_eq!(
            parse_preview_host("9092-sbx1.preview.example.com:8787", None),
            Some((9092, "sbx1".to_string()))
        );
        // Base host enforcement.
        assert_eq!(
            parse_preview_host("9092-sbx1.preview.example.com", Some("preview.example.com")),
            Some((9092, "sbx1".to_string()))
        );
        assert_eq!(
            parse_preview_host("9092-sbx1.evil.example.com", Some("preview.example.com")),
            None
        );
        // Not preview shapes.
        assert_eq!(parse_preview_host("localhost", None), None);
        assert_eq!(parse_preview_host("api.example.com", None), None);
        assert_eq!(parse_preview_host("notaport-sbx1.example.com", None), None);
        assert_eq!(parse_preview_host("9092-.example.com", None), None);
    }
}
