//! Control-plane wire format between the orchestrator and the shell driver.
//!
//! Newline-delimited JSON. The same message set is spoken by the WebSocket
//! control transport and serialized into SSE frames by the streaming HTTP
//! endpoints, so every shape here is observable on the wire.

use serde::{Deserialize, Serialize};

use crate::error::now_ms;

/// Inbound control messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Run a command to completion and reply with a single `result`.
    Exec {
        id: String,
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    /// Run a command and stream `stream_event`s until `complete`.
    ExecStream {
        id: String,
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    /// Shut the driver down.
    Exit { id: String },
}

/// Outbound control messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    /// Emitted once when the driver's shell is up.
    Ready { id: String },
    /// Terminal reply to an `exec`.
    Result {
        id: String,
        stdout: String,
        stderr: String,
        #[serde(rename = "exitCode")]
        exit_code: i32,
    },
    /// Terminal failure reply.
    Error {
        id: String,
        code: String,
        message: String,
    },
    /// Incremental reply to an `exec_stream`.
    StreamEvent { id: String, event: StreamEvent },
}

/// Payload of a `stream_event` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Start {
        timestamp: u64,
    },
    Stdout {
        timestamp: u64,
        data: String,
    },
    Stderr {
        timestamp: u64,
        data: String,
    },
    Complete {
        timestamp: u64,
        #[serde(rename = "exitCode")]
        exit_code: i32,
    },
    Error {
        timestamp: u64,
        code: String,
        message: String,
    },
}

impl StreamEvent {
    pub fn start() -> Self {
        Self::Start {
            timestamp: now_ms(),
        }
    }

    pub fn stdout(data: impl Into<String>) -> Self {
        Self::Stdout {
            timestamp: now_ms(),
            data: data.into(),
        }
    }

    pub fn stderr(data: impl Into<String>) -> Self {
        Self::Stderr {
            timestamp: now_ms(),
            data: data.into(),
        }
    }

    pub fn complete(exit_code: i32) -> Self {
        Self::Complete {
            timestamp: now_ms(),
            exit_code,
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            timestamp: now_ms(),
            code: code.into(),
            message: message.into(),
        }
    }

    /// The SSE event name for this payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Stdout { .. } => "stdout",
            Self::Stderr { .. } => "stderr",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let input = ControlRequest::ExecStream {
            id: "abc123".to_string(),
            command: "echo hi".to_string(),
            cwd: Some("/tmp".to_string()),
        };
        let encoded = serde_json::to_string(&input).unwrap();
        assert!(encoded.contains(r#""type":"exec_stream""#));
        let decoded: ControlRequest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, input);
    }

    #[test]
    fn result_uses_camel_case_exit_code() {
        let msg = ControlResponse::Result {
            id: "x".to_string(),
            stdout: "out".to_string(),
            stderr: String::new(),
            exit_code: 0,
        };
        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(encoded.contains(r#""exitCode":0"#));
        let decoded: ControlResponse = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn stream_event_roundtrip() {
        let event = StreamEvent::complete(42);
        let encoded = serde_json::to_string(&ControlResponse::StreamEvent {
            id: "cmd1".to_string(),
            event: event.clone(),
        })
        .unwrap();
        assert!(encoded.contains(r#""type":"stream_event""#));
        assert!(encoded.contains(r#""exitCode":42"#));
        let decoded: ControlResponse = serde_json::from_str(&encoded).unwrap();
        match decoded {
            ControlResponse::StreamEvent { id, event: e } => {
                assert_eq!(id, "cmd1");
                assert_eq!(e, event);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn cwd_omitted_when_none() {
        let input = ControlRequest::Exec {
            id: "a".to_string(),
            command: "pwd".to_string(),
            cwd: None,
        };
        let encoded = serde_json::to_string(&input).unwrap();
        assert!(!encoded.contains("cwd"));
    }
}
