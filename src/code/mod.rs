//! REPL-style code execution contexts.
//!
//! A context is isolated interpreter state inside the long-lived worker for
//! its language: variables set in one context are unobservable from any
//! other, and each execution observes the state the previous execution on the
//! **same** context left behind.
//!
//! Executions on one context are serialized FIFO by a per-context
//! `tokio::sync::Mutex` (tokio mutexes queue waiters in arrival order);
//! different contexts run in parallel.

pub mod worker;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{now_ms, ApiError};
use worker::{LanguageWorker, WorkerReply, WorkerRequest};

/// Supported interpreter languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
}

impl Language {
    /// Parse a request value; anything outside the enumerated set is rejected.
    pub fn parse(s: &str) -> Result<Self, ApiError> {
        match s {
            "python" => Ok(Self::Python),
            "javascript" => Ok(Self::Javascript),
            other => Err(ApiError::Validation(format!(
                "Unsupported language {other:?}; expected \"python\" or \"javascript\""
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Javascript => "javascript",
        }
    }
}

/// One execution context.
pub struct CodeContext {
    pub id: String,
    pub language: Language,
    pub created_at: u64,
    /// FIFO serialization of executions on this context.
    exec_lock: Mutex<()>,
}

/// Serializable context record for API responses.
#[derive(Debug, Clone, Serialize)]
pub struct ContextInfo {
    pub id: String,
    pub language: Language,
    #[serde(rename = "createdAt")]
    pub created_at: u64,
}

/// Aggregated outcome of one execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub results: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Streaming view of one execution, for SSE endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CodeEvent {
    Stdout { data: String },
    Stderr { data: String },
    Result { data: Value },
    Completed {
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl CodeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stdout { .. } => "stdout",
            Self::Stderr { .. } => "stderr",
            Self::Result { .. } => "result",
            Self::Completed { .. } => "completed",
        }
    }
}

/// Creates, serializes, and deletes code contexts; owns the language workers.
///
/// Cloneable — all clones share the same inner maps.
#[derive(Clone)]
pub struct CodeContextRegistry {
    contexts: Arc<RwLock<HashMap<String, Arc<CodeContext>>>>,
    workers: Arc<Mutex<HashMap<Language, Arc<LanguageWorker>>>>,
    python_argv: Vec<String>,
    javascript_argv: Vec<String>,
    execution_timeout: Duration,
}

impl CodeContextRegistry {
    pub fn new(config: &Config) -> Self {
        Self {
            contexts: Arc::new(RwLock::new(HashMap::new())),
            workers: Arc::new(Mutex::new(HashMap::new())),
            python_argv: config.code.python_worker.clone(),
            javascript_argv: config.code.javascript_worker.clone(),
            execution_timeout: Duration::from_millis(config.code.execution_timeout_ms),
        }
    }

    /// Get the live worker for `language`, spawning it on first use (or after
    /// a crash).
    async fn worker(&self, language: Language) -> Result<Arc<LanguageWorker>, ApiError> {
        let mut workers = self.workers.lock().await;
        if let Some(existing) = workers.get(&language) {
            if existing.is_alive() {
                return Ok(Arc::clone(existing));
            }
            workers.remove(&language);
        }

        let spawned = match language {
            Language::Python => LanguageWorker::spawn("python", &self.python_argv, |detail| {
                ApiError::PythonNotAvailable(format!(
                    "{detail}; use a Python-enabled image variant for code.python contexts"
                ))
            })?,
            Language::Javascript => {
                LanguageWorker::spawn("javascript", &self.javascript_argv, |detail| {
                    ApiError::ProcessStartError(format!(
                        "{detail}; use a Node-enabled image variant for code.javascript contexts"
                    ))
                })?
            }
        };
        let worker = Arc::new(spawned);
        workers.insert(language, Arc::clone(&worker));
        Ok(worker)
    }

    /// Create a context for `language` (a request string, validated here).
    pub async fn create(&self, language: &str) -> Result<ContextInfo, ApiError> {
        let language = Language::parse(language)?;
        let worker = self.worker(language).await?;

        let context_id = Uuid::new_v4().to_string();
        let request = WorkerRequest::CreateContext {
            id: Uuid::new_v4().to_string(),
            context_id: context_id.clone(),
        };
        self.await_ack(&worker, &request).await?;

        let context = Arc::new(CodeContext {
            id: context_id.clone(),
            language,
            created_at: now_ms(),
            exec_lock: Mutex::new(()),
        });
        let info = ContextInfo {
            id: context.id.clone(),
            language,
            created_at: context.created_at,
        };
        self.contexts
            .write()
            .await
            .insert(context_id.clone(), context);
        info!("Code context {context_id} created ({})", language.as_str());
        Ok(info)
    }

    pub async fn list(&self) -> Vec<ContextInfo> {
        let contexts = self.contexts.read().await;
        let mut items: Vec<ContextInfo> = contexts
            .values()
            .map(|c| ContextInfo {
                id: c.id.clone(),
                language: c.language,
                created_at: c.created_at,
            })
            .collect();
        items.sort_by_key(|c| c.created_at);
        items
    }

    /// Delete a context: frees the in-worker state and rejects later use.
    pub async fn delete(&self, context_id: &str) -> Result<(), ApiError> {
        let context = {
            let mut contexts = self.contexts.write().await;
            contexts
                .remove(context_id)
                .ok_or_else(|| ApiError::ContextNotFound(context_id.to_string()))?
        };

        let worker = self.worker(context.language).await?;
        let request = WorkerRequest::DeleteContext {
            id: Uuid::new_v4().to_string(),
            context_id: context_id.to_string(),
        };
        self.await_ack(&worker, &request).await?;
        info!("Code context {context_id} deleted");
        Ok(())
    }

    /// Execute `code` on a context, forwarding events as they arrive when a
    /// sink is provided, and returning the aggregate result.
    ///
    /// Holds the context's FIFO mutex for the whole exchange: concurrent
    /// executions on one context observe each other's completed state in
    /// arrival order, never interleaved.
    pub async fn execute(
        &self,
        context_id: &str,
        code: &str,
        events: Option<mpsc::Sender<CodeEvent>>,
    ) -> Result<ExecutionResult, ApiError> {
        let context = {
            let contexts = self.contexts.read().await;
            contexts
                .get(context_id)
                .cloned()
                .ok_or_else(|| ApiError::ContextNotFound(context_id.to_string()))?
        };
        let worker = self.worker(context.language).await?;

        let _guard = context.exec_lock.lock().await;

        // The context may have been deleted while we queued on the mutex.
        if !self.contexts.read().await.contains_key(context_id) {
            return Err(ApiError::ContextNotFound(context_id.to_string()));
        }

        let request = WorkerRequest::Exec {
            id: Uuid::new_v4().to_string(),
            context_id: context_id.to_string(),
            code: code.to_string(),
        };
        let mut rx = worker.request(&request).await?;

        let mut result = ExecutionResult::default();
        let deadline = tokio::time::Instant::now() + self.execution_timeout;
        loop {
            let reply = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .map_err(|_| {
                    ApiError::Timeout(format!(
                        "Code execution exceeded {} ms",
                        self.execution_timeout.as_millis()
                    ))
                })?;
            let Some(reply) = reply else {
                return Err(ApiError::Internal(
                    "Worker closed the reply channel mid-execution".to_string(),
                ));
            };
            match reply {
                WorkerReply::Stream { stream, data, .. } => {
                    let event = if stream == "stderr" {
                        result.stderr.push_str(&data);
                        CodeEvent::Stderr { data }
                    } else {
                        result.stdout.push_str(&data);
                        CodeEvent::Stdout { data }
                    };
                    if let Some(tx) = &events {
                        let _ = tx.send(event).await;
                    }
                }
                WorkerReply::Result { data, .. } => {
                    if let Some(tx) = &events {
                        let _ = tx.send(CodeEvent::Result { data: data.clone() }).await;
                    }
                    result.results.push(data);
                }
                WorkerReply::Complete { error, .. } => {
                    result.error = error.clone();
                    if let Some(tx) = &events {
                        let _ = tx.send(CodeEvent::Completed { error }).await;
                    }
                    return Ok(result);
                }
                WorkerReply::Error { message, .. } => {
                    return Err(ApiError::Internal(message));
                }
                WorkerReply::Ready | WorkerReply::Ack { .. } => {}
            }
        }
    }

    /// Send a request whose only success reply is `ack`.
    async fn await_ack(
        &self,
        worker: &LanguageWorker,
        request: &WorkerRequest,
    ) -> Result<(), ApiError> {
        let mut rx = worker.request(request).await?;
        let reply = tokio::time::timeout(self.execution_timeout, rx.recv())
            .await
            .map_err(|_| ApiError::Timeout("Worker did not acknowledge in time".to_string()))?;
        match reply {
            Some(WorkerReply::Ack { .. }) => Ok(()),
            Some(WorkerReply::Error { message, .. }) => Err(ApiError::Internal(message)),
            other => Err(ApiError::Internal(format!(
                "Unexpected worker reply: {other:?}"
            ))),
        }
    }

    /// Stop every worker (shutdown).
    pub async fn shutdown_all(&self) {
        let workers: Vec<Arc<LanguageWorker>> = {
            let mut map = self.workers.lock().await;
            map.drain().map(|(_, w)| w).collect()
        };
        for worker in workers {
            worker.shutdown().await;
        }
        self.contexts.write().await.clear();
    }

    /// Swap in a stub worker for `language` (tests only).
    #[cfg(test)]
    async fn install_worker(&self, language: Language, worker: Arc<LanguageWorker>) {
        self.workers.lock().await.insert(language, worker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> CodeContextRegistry {
        CodeContextRegistry::new(&Config::default())
    }

    #[test]
    fn language_parsing() {
        assert_eq!(Language::parse("python").unwrap(), Language::Python);
        assert_eq!(Language::parse("javascript").unwrap(), Language::Javascript);
        let err = Language::parse("ruby").unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn missing_python_interpreter_is_a_typed_error() {
        let mut config = Config::default();
        config.code.python_worker = vec!["/no/such/python".to_string()];
        let registry = CodeContextRegistry::new(&config);
        let err = registry.create("python").await.unwrap_err();
        assert_eq!(err.code(), "PYTHON_NOT_AVAILABLE");
        assert!(err.to_string().contains("image variant"));
    }

    #[tokio::test]
    async fn unknown_context_is_rejected() {
        let registry = test_registry();
        let err = registry.execute("ghost", "1 + 1", None).await.unwrap_err();
        assert_eq!(err.code(), "CONTEXT_NOT_FOUND");
        let err = registry.delete("ghost").await.unwrap_err();
        assert_eq!(err.code(), "CONTEXT_NOT_FOUND");
    }

    /// Drives the stub worker: acks create/delete immediately, answers exec
    /// requests with a canned stream/result/complete exchange.
    async fn drive_stub(
        worker: &LanguageWorker,
        mut stdin_rx: tokio::sync::mpsc::Receiver<String>,
    ) {
        while let Some(line) = stdin_rx.recv().await {
            let request: WorkerRequest = serde_json::from_str(line.trim()).unwrap();
            match request {
                WorkerRequest::CreateContext { id, .. }
                | WorkerRequest::DeleteContext { id, .. }
                | WorkerRequest::Shutdown { id } => {
                    worker.inject(WorkerReply::Ack { id });
                }
                WorkerRequest::Exec { id, code, .. } => {
                    worker.inject(WorkerReply::Stream {
                        id: id.clone(),
                        stream: "stdout".to_string(),
                        data: format!("ran: {code}\n"),
                    });
                    worker.inject(WorkerReply::Result {
                        id: id.clone(),
                        data: serde_json::json!(code.len()),
                    });
                    worker.inject(WorkerReply::Complete { id, error: None });
                }
            }
        }
    }

    #[tokio::test]
    async fn execute_aggregates_stream_results_and_completion() {
        let registry = test_registry();
        let (worker, stdin_rx) = LanguageWorker::stub();
        let worker = Arc::new(worker);
        registry
            .install_worker(Language::Javascript, Arc::clone(&worker))
            .await;
        tokio::spawn(async move { drive_stub(&worker, stdin_rx).await });

        let info = registry.create("javascript").await.unwrap();
        assert_eq!(registry.list().await.len(), 1);

        let (tx, mut rx) = mpsc::channel(16);
        let result = registry
            .execute(&info.id, "let x = 1", Some(tx))
            .await
            .unwrap();
        assert_eq!(result.stdout, "ran: let x = 1\n");
        assert!(result.error.is_none());
        assert_eq!(result.results, vec![serde_json::json!(10)]);

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(event.kind());
        }
        assert_eq!(kinds, vec!["stdout", "result", "completed"]);

        registry.delete(&info.id).await.unwrap();
        assert!(registry.list().await.is_empty());
    }
}
