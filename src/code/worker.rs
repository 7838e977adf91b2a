//! Long-lived per-language interpreter workers.
//!
//! One worker process per language hosts every context for that language and
//! speaks newline-delimited JSON over stdin/stdout. The worker executables
//! themselves ship with the image; this module is the client side of their
//! protocol.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::shell::spawn::which;

/// Requests sent to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    CreateContext {
        id: String,
        #[serde(rename = "contextId")]
        context_id: String,
    },
    DeleteContext {
        id: String,
        #[serde(rename = "contextId")]
        context_id: String,
    },
    Exec {
        id: String,
        #[serde(rename = "contextId")]
        context_id: String,
        code: String,
    },
    Shutdown { id: String },
}

impl WorkerRequest {
    fn id(&self) -> &str {
        match self {
            Self::CreateContext { id, .. }
            | Self::DeleteContext { id, .. }
            | Self::Exec { id, .. }
            | Self::Shutdown { id } => id,
        }
    }
}

/// Replies received from a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerReply {
    /// Emitted once when the worker boots.
    Ready,
    /// Positive acknowledgement for create/delete/shutdown.
    Ack { id: String },
    /// Incremental interpreter output.
    Stream {
        id: String,
        stream: String,
        data: String,
    },
    /// A value produced by the executed code.
    Result { id: String, data: Value },
    /// Execution finished; `error` is set when the code raised.
    Complete {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Request-level failure.
    Error { id: String, message: String },
}

impl WorkerReply {
    fn id(&self) -> Option<&str> {
        match self {
            Self::Ready => None,
            Self::Ack { id }
            | Self::Stream { id, .. }
            | Self::Result { id, .. }
            | Self::Complete { id, .. }
            | Self::Error { id, .. } => Some(id),
        }
    }

    /// Whether this reply ends its request's exchange.
    fn is_terminal(&self) -> bool {
        matches!(self, Self::Ack { .. } | Self::Complete { .. } | Self::Error { .. })
    }
}

/// Client handle for one language worker process.
pub struct LanguageWorker {
    label: String,
    stdin_tx: mpsc::Sender<String>,
    pending: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<WorkerReply>>>>,
    alive: Arc<AtomicBool>,
    pid: u32,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl LanguageWorker {
    /// Spawn the worker process for `label` with the configured argv.
    ///
    /// The binary is resolved on `$PATH` first so a missing interpreter is a
    /// typed capability error, not a spawn failure. `unavailable` builds that
    /// error (the caller knows which image-variant hint fits its language).
    pub fn spawn(
        label: &str,
        argv: &[String],
        unavailable: impl Fn(String) -> ApiError,
    ) -> Result<Self, ApiError> {
        let Some(binary) = argv.first() else {
            return Err(ApiError::Internal(format!(
                "No worker command configured for {label}"
            )));
        };
        if !binary.starts_with('/') && which(binary).is_none()
            || binary.starts_with('/') && !std::path::Path::new(binary).is_file()
        {
            return Err(unavailable(format!(
                "The {label} interpreter ({binary}) is not available in this image"
            )));
        }

        let mut child = Command::new(binary)
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ApiError::ProcessStartError(format!("Failed to start {label} worker: {e}"))
            })?;
        let pid = child.id().unwrap_or(0);

        let stdin = child.stdin.take().ok_or_else(|| {
            ApiError::ProcessStartError(format!("{label} worker has no stdin"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ApiError::NoStdoutStream(format!("{label} worker has no stdout"))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            ApiError::ProcessStartError(format!("{label} worker has no stderr"))
        })?;

        let pending: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<WorkerReply>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        // stdin writer task
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(64);
        let stdin_task = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = stdin_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // stdout reader: route replies to pending requests
        let label_out = label.to_string();
        let pending_out = Arc::clone(&pending);
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<WorkerReply>(&line) {
                    Ok(reply) => dispatch(&pending_out, reply),
                    Err(e) => {
                        warn!("{label_out} worker sent unparsable line ({e}): {line}");
                    }
                }
            }
        });

        // stderr drainer: worker diagnostics, never execution output
        let label_err = label.to_string();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("{label_err} worker stderr: {line}");
            }
        });

        // exit watcher: fail everything pending
        let label_exit = label.to_string();
        let alive_exit = Arc::clone(&alive);
        let pending_exit = Arc::clone(&pending);
        let exit_task = tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(_) => -1,
            };
            alive_exit.store(false, Ordering::SeqCst);
            let drained: Vec<(String, mpsc::UnboundedSender<WorkerReply>)> = {
                let mut map = pending_exit.lock().expect("pending lock");
                map.drain().collect()
            };
            for (id, tx) in drained {
                let _ = tx.send(WorkerReply::Error {
                    id,
                    message: format!("{label_exit} worker exited with code {code}"),
                });
            }
            warn!("{label_exit} worker exited with code {code}");
        });

        info!("{label} worker started (pid {pid})");
        Ok(Self {
            label: label.to_string(),
            stdin_tx,
            pending,
            alive,
            pid,
            tasks: vec![stdin_task, stdout_task, stderr_task, exit_task],
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Send a request; replies for its id arrive on the returned channel.
    ///
    /// The pending entry is dropped automatically once a terminal reply
    /// (`ack`/`complete`/`error`) has been routed.
    pub async fn request(
        &self,
        request: &WorkerRequest,
    ) -> Result<mpsc::UnboundedReceiver<WorkerReply>, ApiError> {
        if !self.is_alive() {
            return Err(ApiError::Internal(format!(
                "{} worker is not alive",
                self.label
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending
            .lock()
            .expect("pending lock")
            .insert(request.id().to_string(), tx);

        let mut line = serde_json::to_string(request)
            .map_err(|e| ApiError::Internal(format!("Failed to encode worker request: {e}")))?;
        line.push('\n');
        if self.stdin_tx.send(line).await.is_err() {
            self.pending
                .lock()
                .expect("pending lock")
                .remove(request.id());
            return Err(ApiError::Internal(format!(
                "{} worker is not alive",
                self.label
            )));
        }
        Ok(rx)
    }

    /// Stop the worker: polite shutdown request, then SIGKILL as a backstop.
    pub async fn shutdown(&self) {
        let request = WorkerRequest::Shutdown {
            id: uuid::Uuid::new_v4().to_string(),
        };
        if let Ok(mut rx) = self.request(&request).await {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv()).await;
        }
        if self.is_alive() && self.pid > 0 {
            #[allow(clippy::cast_possible_wrap)]
            unsafe {
                libc::kill(self.pid as i32, libc::SIGKILL);
            }
        }
        for task in &self.tasks {
            task.abort();
        }
    }

    /// Test handle that routes replies without a real child process.
    #[cfg(test)]
    pub fn stub() -> (Self, mpsc::Receiver<String>) {
        let (stdin_tx, stdin_rx) = mpsc::channel(64);
        (
            Self {
                label: "stub".to_string(),
                stdin_tx,
                pending: Arc::new(Mutex::new(HashMap::new())),
                alive: Arc::new(AtomicBool::new(true)),
                pid: 0,
                tasks: Vec::new(),
            },
            stdin_rx,
        )
    }

    /// Inject a reply as if the worker had printed it (tests only).
    #[cfg(test)]
    pub fn inject(&self, reply: WorkerReply) {
        dispatch(&self.pending, reply);
    }
}

/// Route one reply to its pending request, dropping the entry on terminal
/// replies. `ready` and unknown-id replies are logged and ignored.
fn dispatch(
    pending: &Arc<Mutex<HashMap<String, mpsc::UnboundedSender<WorkerReply>>>>,
    reply: WorkerReply,
) {
    let Some(id) = reply.id().map(ToString::to_string) else {
        debug!("Worker ready");
        return;
    };
    let terminal = reply.is_terminal();
    let sender = {
        let mut map = pending.lock().expect("pending lock");
        if terminal {
            map.remove(&id)
        } else {
            map.get(&id).cloned()
        }
    };
    match sender {
        Some(tx) => {
            let _ = tx.send(reply);
        }
        None => debug!("Worker reply for unknown request {id}"),
    }
}
