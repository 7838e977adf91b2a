//! Typed error taxonomy shared by every component.
//!
//! Components return [`ApiError`] up to the router, which maps each error to
//! an HTTP status via a fixed code→status table and renders the uniform body
//! `{success:false, error, code, details?, timestamp}`. Streaming endpoints
//! instead inline errors as terminal `error` events before closing.
//!
//! Fatal-to-the-session conditions (shell death) poison only the owning
//! session; fatal-to-the-process conditions mark the record `error` and notify
//! listeners once. Nothing here unwinds the server.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Every error the HTTP/WS surface can report, tagged with its short code.
#[derive(Debug, Error)]
pub enum ApiError {
    // --- Validation (400) ---
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    InvalidPath(String),
    #[error("{0}")]
    InvalidPort(String),
    #[error("{0}")]
    InvalidCommand(String),
    #[error("{0}")]
    Validation(String),

    // --- Security (403) ---
    #[error("{0}")]
    PathSecurityViolation(String),
    #[error("{0}")]
    CommandSecurityViolation(String),
    #[error("{0}")]
    GitUrlSecurityViolation(String),

    // --- Not found (404) ---
    #[error("File not found: {0}")]
    FileNotFound(String),
    #[error("Process not found: {0}")]
    ProcessNotFound(String),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Port not found: {0}")]
    PortNotFound(u16),
    #[error("Context not found: {0}")]
    ContextNotFound(String),

    // --- Conflict ---
    #[error("Port {0} is already exposed")]
    PortAlreadyExposed(u16),
    #[error("Session already exists: {0}")]
    SessionAlreadyExists(String),
    #[error("Cannot delete directory {0} with delete_file; pass recursive=true")]
    CannotDeleteDirectory(String),

    // --- Capability (500) ---
    #[error("{0}")]
    PythonNotAvailable(String),
    #[error("{0}")]
    FuseNotAvailable(String),

    // --- Timing (408) ---
    #[error("{0}")]
    Timeout(String),

    // --- Process (500) ---
    #[error("{0}")]
    ProcessStartError(String),
    #[error("{0}")]
    ProcessExitedBeforeReady(String),
    #[error("{0}")]
    NoStdoutStream(String),

    // --- Transport ---
    #[error("{0}")]
    InvalidJson(String),
    #[error("{0}")]
    NotWebSocketRequest(String),

    // --- Last resort (500) ---
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// The short machine-readable code carried in every error body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::InvalidPath(_) => "INVALID_PATH",
            Self::InvalidPort(_) => "INVALID_PORT",
            Self::InvalidCommand(_) => "INVALID_COMMAND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::PathSecurityViolation(_) => "PATH_SECURITY_VIOLATION",
            Self::CommandSecurityViolation(_) => "COMMAND_SECURITY_VIOLATION",
            Self::GitUrlSecurityViolation(_) => "GIT_URL_SECURITY_VIOLATION",
            Self::FileNotFound(_) => "FILE_NOT_FOUND",
            Self::ProcessNotFound(_) => "PROCESS_NOT_FOUND",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::PortNotFound(_) => "PORT_NOT_FOUND",
            Self::ContextNotFound(_) => "CONTEXT_NOT_FOUND",
            Self::PortAlreadyExposed(_) => "PORT_ALREADY_EXPOSED",
            Self::SessionAlreadyExists(_) => "SESSION_ALREADY_EXISTS",
            Self::CannotDeleteDirectory(_) => "CANNOT_DELETE_DIRECTORY_WITH_DELETE_FILE",
            Self::PythonNotAvailable(_) => "PYTHON_NOT_AVAILABLE",
            Self::FuseNotAvailable(_) => "FUSE_NOT_AVAILABLE",
            Self::Timeout(_) => "TIMEOUT",
            Self::ProcessStartError(_) => "PROCESS_START_ERROR",
            Self::ProcessExitedBeforeReady(_) => "PROCESS_EXITED_BEFORE_READY",
            Self::NoStdoutStream(_) => "NO_STDOUT_STREAM",
            Self::InvalidJson(_) => "INVALID_JSON",
            Self::NotWebSocketRequest(_) => "NOT_WEBSOCKET_REQUEST",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Fixed code→status table.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_)
            | Self::InvalidPath(_)
            | Self::InvalidPort(_)
            | Self::InvalidCommand(_)
            | Self::Validation(_)
            | Self::InvalidJson(_)
            | Self::CannotDeleteDirectory(_) => StatusCode::BAD_REQUEST,
            Self::PathSecurityViolation(_)
            | Self::CommandSecurityViolation(_)
            | Self::GitUrlSecurityViolation(_) => StatusCode::FORBIDDEN,
            Self::FileNotFound(_)
            | Self::ProcessNotFound(_)
            | Self::SessionNotFound(_)
            | Self::PortNotFound(_)
            | Self::ContextNotFound(_) => StatusCode::NOT_FOUND,
            Self::PortAlreadyExposed(_) | Self::SessionAlreadyExists(_) => StatusCode::CONFLICT,
            Self::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Self::NotWebSocketRequest(_) => StatusCode::UPGRADE_REQUIRED,
            Self::PythonNotAvailable(_)
            | Self::FuseNotAvailable(_)
            | Self::ProcessStartError(_)
            | Self::ProcessExitedBeforeReady(_)
            | Self::NoStdoutStream(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The uniform JSON error body.
    pub fn body(&self) -> Value {
        json!({
            "success": false,
            "error": self.to_string(),
            "code": self.code(),
            "timestamp": now_ms(),
        })
    }

    /// Error body with a `details` payload attached.
    pub fn body_with_details(&self, details: Value) -> Value {
        let mut body = self.body();
        body["details"] = details;
        body
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::FileNotFound(e.to_string()),
            _ => Self::Internal(e.to_string()),
        }
    }
}

/// Current wall-clock time as Unix epoch milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_status_table() {
        assert_eq!(
            ApiError::InvalidRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::GitUrlSecurityViolation("x".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::ProcessNotFound("p1".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::PortAlreadyExposed(9092).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Timeout("slow".into()).status(),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            ApiError::NotWebSocketRequest("x".into()).status(),
            StatusCode::UPGRADE_REQUIRED
        );
        assert_eq!(
            ApiError::FuseNotAvailable("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn body_shape() {
        let body = ApiError::PortNotFound(9092).body();
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "PORT_NOT_FOUND");
        assert!(body["error"].as_str().unwrap().contains("9092"));
        assert!(body["timestamp"].as_u64().unwrap() > 0);
        assert!(body.get("details").is_none());
    }

    #[test]
    fn details_attach() {
        let body = ApiError::FuseNotAvailable("no /dev/fuse".into())
            .body_with_details(json!({"helper": "s3fs"}));
        assert_eq!(body["details"]["helper"], "s3fs");
    }
}
