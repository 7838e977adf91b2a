//! Background-process tracking with streaming output fanout.
//!
//! [`ProcessManager`] owns every background process in the sandbox,
//! independent of the request that started it. The process table is shared
//! across sessions by design: a kill issued through session B may terminate a
//! process started by session A.
//!
//! Two launch strategies back one record type (see [`handle::ProcessHandle`]):
//! direct spawn is primary; `nohup` through a session shell is used when the
//! start request names a session so the command observes session env and cwd.
//!
//! ## Listeners
//!
//! Output and status listeners are registries of `mpsc::UnboundedSender`s.
//! Fanout clones the senders under the registry lock and sends after
//! releasing it; a closed receiver loses only its own events. Status
//! listeners observe a terminal status exactly once — transitions are
//! forward-only through starting → running → {completed, failed, killed,
//! error}.

pub mod handle;
pub mod waiters;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{now_ms, ApiError};
use crate::sessions::{Session, SessionRegistry};
use handle::{spawn_direct, ProcessHandle, StreamKind};

/// Directory holding output files for shell-detached processes.
pub const PROC_OUT_DIR: &str = "/tmp/sandboxd-proc";

/// Lifecycle states, ordered starting → running → terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Starting,
    Running,
    Completed,
    Failed,
    Killed,
    Error,
}

impl ProcessStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Killed | Self::Error
        )
    }

    /// Position in the forward-only partial order.
    fn rank(self) -> u8 {
        match self {
            Self::Starting => 0,
            Self::Running => 1,
            _ => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Killed => "killed",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "killed" => Some(Self::Killed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One chunk of decoded process output.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub data: String,
}

/// Mutable portion of a [`ProcessRecord`].
#[derive(Debug)]
struct RecordState {
    status: ProcessStatus,
    pid: Option<i32>,
    end_time: Option<u64>,
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
}

/// A tracked background process.
pub struct ProcessRecord {
    pub id: String,
    pub command: String,
    pub session_id: Option<String>,
    pub started_at: u64,
    handle: Mutex<Option<ProcessHandle>>,
    state: Mutex<RecordState>,
    output_listeners: Mutex<HashMap<u64, mpsc::UnboundedSender<OutputChunk>>>,
    status_listeners: Mutex<HashMap<u64, mpsc::UnboundedSender<ProcessStatus>>>,
    next_listener: AtomicU64,
}

/// Serializable snapshot of a record for API responses.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub id: String,
    pub pid: Option<i32>,
    pub command: String,
    pub status: ProcessStatus,
    #[serde(rename = "startTime")]
    pub start_time: u64,
    #[serde(rename = "endTime", skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(rename = "exitCode", skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl ProcessRecord {
    fn new(command: &str, session_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            command: command.to_string(),
            session_id,
            started_at: now_ms(),
            handle: Mutex::new(None),
            state: Mutex::new(RecordState {
                status: ProcessStatus::Starting,
                pid: None,
                end_time: None,
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
            }),
            output_listeners: Mutex::new(HashMap::new()),
            status_listeners: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    pub fn status(&self) -> ProcessStatus {
        self.state.lock().expect("state lock").status
    }

    pub fn pid(&self) -> Option<i32> {
        self.state.lock().expect("state lock").pid
    }

    /// Accumulated `(stdout, stderr)` buffers.
    pub fn buffers(&self) -> (String, String) {
        let state = self.state.lock().expect("state lock");
        (state.stdout.clone(), state.stderr.clone())
    }

    /// Snapshot for API responses; buffers included only when asked.
    pub fn snapshot(&self, include_output: bool) -> ProcessInfo {
        let state = self.state.lock().expect("state lock");
        ProcessInfo {
            id: self.id.clone(),
            pid: state.pid,
            command: self.command.clone(),
            status: state.status,
            start_time: self.started_at,
            end_time: state.end_time,
            exit_code: state.exit_code,
            session_id: self.session_id.clone(),
            stdout: include_output.then(|| state.stdout.clone()),
            stderr: include_output.then(|| state.stderr.clone()),
        }
    }

    fn set_handle(&self, handle: ProcessHandle) {
        let pid = handle.pid();
        *self.handle.lock().expect("handle lock") = Some(handle);
        self.state.lock().expect("state lock").pid = Some(pid);
    }

    fn signal(&self, sig: i32) {
        if let Some(handle) = self.handle.lock().expect("handle lock").as_ref() {
            handle.signal(sig);
        }
    }

    fn handle_alive(&self) -> bool {
        self.handle
            .lock()
            .expect("handle lock")
            .as_ref()
            .is_some_and(ProcessHandle::is_alive)
    }

    /// Append a chunk to the right buffer and fan it out to listeners.
    fn push_output(&self, stream: StreamKind, data: &str) {
        {
            let mut state = self.state.lock().expect("state lock");
            match stream {
                StreamKind::Stdout => state.stdout.push_str(data),
                StreamKind::Stderr => state.stderr.push_str(data),
            }
        }
        let senders: Vec<mpsc::UnboundedSender<OutputChunk>> = {
            let listeners = self.output_listeners.lock().expect("listener lock");
            listeners.values().cloned().collect()
        };
        for sender in senders {
            let _ = sender.send(OutputChunk {
                stream,
                data: data.to_string(),
            });
        }
    }

    /// Attempt a forward transition. Terminal transitions set the end time
    /// and exit code atomically with the status and notify status listeners
    /// exactly once. Returns whether the transition was applied.
    fn advance(&self, next: ProcessStatus, exit_code: Option<i32>) -> bool {
        let applied = {
            let mut state = self.state.lock().expect("state lock");
            if state.status.is_terminal() || next.rank() <= state.status.rank() {
                false
            } else {
                state.status = next;
                if next.is_terminal() {
                    state.end_time = Some(now_ms());
                    state.exit_code = exit_code;
                }
                true
            }
        };
        if applied {
            let senders: Vec<mpsc::UnboundedSender<ProcessStatus>> = {
                let listeners = self.status_listeners.lock().expect("listener lock");
                listeners.values().cloned().collect()
            };
            for sender in senders {
                let _ = sender.send(next);
            }
        }
        applied
    }

    /// Register a transient output listener. Dropping the subscription
    /// removes the listener; other listeners are unaffected.
    pub fn subscribe_output(self: &Arc<Self>) -> OutputSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.output_listeners
            .lock()
            .expect("listener lock")
            .insert(id, tx);
        OutputSubscription {
            record: Arc::clone(self),
            id,
            rx,
        }
    }

    /// Register a transient status listener (see [`Self::subscribe_output`]).
    pub fn subscribe_status(self: &Arc<Self>) -> StatusSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.status_listeners
            .lock()
            .expect("listener lock")
            .insert(id, tx);
        StatusSubscription {
            record: Arc::clone(self),
            id,
            rx,
        }
    }

    fn end_time(&self) -> Option<u64> {
        self.state.lock().expect("state lock").end_time
    }

    #[cfg(test)]
    fn backdate_end_time(&self, ms_ago: u64) {
        let mut state = self.state.lock().expect("state lock");
        state.end_time = Some(now_ms().saturating_sub(ms_ago));
    }
}

/// RAII output listener registration.
pub struct OutputSubscription {
    record: Arc<ProcessRecord>,
    id: u64,
    pub rx: mpsc::UnboundedReceiver<OutputChunk>,
}

impl Drop for OutputSubscription {
    fn drop(&mut self) {
        self.record
            .output_listeners
            .lock()
            .expect("listener lock")
            .remove(&self.id);
    }
}

/// RAII status listener registration.
pub struct StatusSubscription {
    record: Arc<ProcessRecord>,
    id: u64,
    pub rx: mpsc::UnboundedReceiver<ProcessStatus>,
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        self.record
            .status_listeners
            .lock()
            .expect("listener lock")
            .remove(&self.id);
    }
}

/// Options for starting a background process.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub command: String,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub session_id: Option<String>,
}

/// Manages the shared background-process table.
///
/// Cloneable — all clones share the same inner map.
#[derive(Clone)]
pub struct ProcessManager {
    processes: Arc<RwLock<HashMap<String, Arc<ProcessRecord>>>>,
    shell: String,
    fallback_cwd: String,
    kill_grace: Duration,
    port_poll_interval: Duration,
    tail_poll_interval: Duration,
    completed_max_age: Duration,
}

impl ProcessManager {
    pub fn new(config: &Config) -> Self {
        Self {
            processes: Arc::new(RwLock::new(HashMap::new())),
            shell: config.shell.shell.clone(),
            fallback_cwd: config.shell.workspace_dir.clone(),
            kill_grace: Duration::from_millis(config.process.kill_grace_ms),
            port_poll_interval: Duration::from_millis(config.process.port_poll_interval_ms),
            tail_poll_interval: Duration::from_millis(config.shell.stream_poll_interval_ms),
            completed_max_age: Duration::from_secs(config.process.completed_max_age_secs),
        }
    }

    /// Start a command as a directly-spawned child (the primary strategy).
    pub async fn start_spawned(&self, options: StartOptions) -> Result<Arc<ProcessRecord>, ApiError> {
        let cwd = options
            .cwd
            .filter(|d| std::path::Path::new(d).is_dir())
            .unwrap_or_else(|| {
                if std::path::Path::new(&self.fallback_cwd).is_dir() {
                    self.fallback_cwd.clone()
                } else {
                    "/".to_string()
                }
            });

        let record = Arc::new(ProcessRecord::new(&options.command, options.session_id));
        self.processes
            .write()
            .await
            .insert(record.id.clone(), Arc::clone(&record));

        let mut child = match spawn_direct(&self.shell, &options.command, &cwd, &options.env) {
            Ok(child) => child,
            Err(e) => {
                record.advance(ProcessStatus::Error, None);
                return Err(ApiError::ProcessStartError(format!(
                    "Failed to start process: {e}"
                )));
            }
        };

        #[allow(clippy::cast_possible_wrap)]
        let pgid = child.id().unwrap_or(0) as i32;
        record.set_handle(ProcessHandle::Spawned { pgid });
        record.advance(ProcessStatus::Running, None);

        let Some(stdout) = child.stdout.take() else {
            record.advance(ProcessStatus::Error, None);
            return Err(ApiError::NoStdoutStream(
                "Child has no stdout pipe".to_string(),
            ));
        };
        let Some(stderr) = child.stderr.take() else {
            record.advance(ProcessStatus::Error, None);
            return Err(ApiError::NoStdoutStream(
                "Child has no stderr pipe".to_string(),
            ));
        };

        // Reader tasks: decode chunks, append to buffers, fan out.
        let rec_out = Arc::clone(&record);
        tokio::spawn(async move {
            let mut stdout = stdout;
            let mut tmp = [0u8; 4096];
            loop {
                match stdout.read(&mut tmp).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let data = String::from_utf8_lossy(&tmp[..n]).into_owned();
                        rec_out.push_output(StreamKind::Stdout, &data);
                    }
                }
            }
        });
        let rec_err = Arc::clone(&record);
        tokio::spawn(async move {
            let mut stderr = stderr;
            let mut tmp = [0u8; 4096];
            loop {
                match stderr.read(&mut tmp).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let data = String::from_utf8_lossy(&tmp[..n]).into_owned();
                        rec_err.push_output(StreamKind::Stderr, &data);
                    }
                }
            }
        });

        // Exit watcher: terminal transition fires listeners exactly once.
        let rec_exit = Arc::clone(&record);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    let code = status.code().unwrap_or(-1);
                    let next = if code == 0 {
                        ProcessStatus::Completed
                    } else {
                        ProcessStatus::Failed
                    };
                    if rec_exit.advance(next, Some(code)) {
                        info!("Process {} exited with code {code}", rec_exit.id);
                    }
                }
                Err(e) => {
                    warn!("Process {} wait error: {e}", rec_exit.id);
                    rec_exit.advance(ProcessStatus::Error, None);
                }
            }
        });

        info!(
            "Process {} started (pid {}, spawned): {}",
            record.id,
            pgid,
            truncate(&record.command, 80)
        );
        Ok(record)
    }

    /// Start a command detached through a session shell (`nohup … & echo $!`).
    ///
    /// The command observes the session's environment and working directory.
    /// The shell reaps the child, so the record carries no exit code; exits
    /// are detected by liveness polling.
    pub async fn start_detached(
        &self,
        registry: &SessionRegistry,
        session: &Arc<Session>,
        command: &str,
    ) -> Result<Arc<ProcessRecord>, ApiError> {
        let record = Arc::new(ProcessRecord::new(command, Some(session.id.clone())));
        self.processes
            .write()
            .await
            .insert(record.id.clone(), Arc::clone(&record));

        let out_dir = PathBuf::from(PROC_OUT_DIR);
        let stdout_path = out_dir.join(format!("{}.out", record.id));
        let stderr_path = out_dir.join(format!("{}.err", record.id));

        let launch = format!(
            "mkdir -p {dir} && nohup bash -c {cmd} > {out} 2> {err} < /dev/null & echo $!",
            dir = sh_quote(PROC_OUT_DIR),
            cmd = sh_quote(command),
            out = sh_quote(&stdout_path.to_string_lossy()),
            err = sh_quote(&stderr_path.to_string_lossy()),
        );

        let outcome = registry
            .exec(session, &launch, &HashMap::new(), None, None)
            .await
            .map_err(|e| {
                record.advance(ProcessStatus::Error, None);
                ApiError::ProcessStartError(format!("Failed to launch via session shell: {e}"))
            })?;

        let pid: i32 = match outcome.stdout.trim().parse() {
            Ok(pid) => pid,
            Err(_) => {
                record.advance(ProcessStatus::Error, None);
                return Err(ApiError::ProcessStartError(format!(
                    "Shell returned a non-numeric PID: {:?}",
                    outcome.stdout.trim()
                )));
            }
        };

        record.set_handle(ProcessHandle::Detached {
            pid,
            stdout_path: stdout_path.clone(),
            stderr_path: stderr_path.clone(),
        });
        record.advance(ProcessStatus::Running, None);

        // One task tails the output files and watches liveness.
        let rec = Arc::clone(&record);
        let interval = self.tail_poll_interval;
        tokio::spawn(async move {
            let mut out_offset: u64 = 0;
            let mut err_offset: u64 = 0;
            loop {
                tokio::time::sleep(interval).await;
                if let Some(chunk) = tail_file(&stdout_path, &mut out_offset).await {
                    rec.push_output(StreamKind::Stdout, &chunk);
                }
                if let Some(chunk) = tail_file(&stderr_path, &mut err_offset).await {
                    rec.push_output(StreamKind::Stderr, &chunk);
                }
                if rec.status().is_terminal() {
                    break;
                }
                if !rec.handle_alive() {
                    // Last tail before the terminal transition.
                    if let Some(chunk) = tail_file(&stdout_path, &mut out_offset).await {
                        rec.push_output(StreamKind::Stdout, &chunk);
                    }
                    if let Some(chunk) = tail_file(&stderr_path, &mut err_offset).await {
                        rec.push_output(StreamKind::Stderr, &chunk);
                    }
                    if rec.advance(ProcessStatus::Completed, None) {
                        info!("Process {} (detached) exited", rec.id);
                    }
                    break;
                }
            }
            let _ = tokio::fs::remove_file(&stdout_path).await;
            let _ = tokio::fs::remove_file(&stderr_path).await;
        });

        info!(
            "Process {} started (pid {pid}, detached via session {}): {}",
            record.id,
            session.id,
            truncate(command, 80)
        );
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Result<Arc<ProcessRecord>, ApiError> {
        self.processes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::ProcessNotFound(id.to_string()))
    }

    /// List records, optionally filtered by owning session and/or status.
    pub async fn list(
        &self,
        session_id: Option<&str>,
        status: Option<ProcessStatus>,
    ) -> Vec<ProcessInfo> {
        let processes = self.processes.read().await;
        let mut items: Vec<ProcessInfo> = processes
            .values()
            .filter(|r| session_id.is_none_or(|s| r.session_id.as_deref() == Some(s)))
            .filter(|r| status.is_none_or(|s| r.status() == s))
            .map(|r| r.snapshot(false))
            .collect();
        items.sort_by_key(|r| r.start_time);
        items
    }

    /// Kill a process: SIGTERM now, SIGKILL after the grace period if it is
    /// still alive. Idempotent — killing an already-terminal record succeeds
    /// without reissuing signals.
    pub async fn kill(&self, id: &str) -> Result<(), ApiError> {
        let record = self.get(id).await?;
        if record.status().is_terminal() {
            return Ok(());
        }

        record.signal(libc::SIGTERM);
        record.advance(ProcessStatus::Killed, None);
        info!("Process {id} killed (SIGTERM)");

        let grace = self.kill_grace;
        let rec = Arc::clone(&record);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if rec.handle_alive() {
                rec.signal(libc::SIGKILL);
                debug!("Process {} escalated to SIGKILL", rec.id);
            }
        });
        Ok(())
    }

    /// Drop terminal records older than the configured age.
    pub async fn sweep(&self) -> usize {
        let cutoff = now_ms().saturating_sub(self.completed_max_age.as_millis() as u64);
        let mut processes = self.processes.write().await;
        let before = processes.len();
        processes.retain(|_, record| {
            let status = record.status();
            !(status.is_terminal() && record.end_time().is_some_and(|t| t < cutoff))
        });
        let removed = before - processes.len();
        if removed > 0 {
            info!("Process sweep removed {removed} old record(s)");
        }
        removed
    }

    /// Terminate everything still running (shutdown): SIGTERM all, wait up to
    /// 2 s, SIGKILL the remainder.
    pub async fn kill_all(&self) {
        let records: Vec<Arc<ProcessRecord>> = {
            let processes = self.processes.read().await;
            processes
                .values()
                .filter(|r| !r.status().is_terminal())
                .cloned()
                .collect()
        };
        if records.is_empty() {
            return;
        }

        for record in &records {
            record.signal(libc::SIGTERM);
            record.advance(ProcessStatus::Killed, None);
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if records.iter().all(|r| !r.handle_alive())
                || tokio::time::Instant::now() >= deadline
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        for record in &records {
            if record.handle_alive() {
                record.signal(libc::SIGKILL);
            }
        }
        info!("Killed {} background process(es) on shutdown", records.len());
    }

    /// Cadence used by `waitForPort` probes.
    pub fn port_poll_interval(&self) -> Duration {
        self.port_poll_interval
    }
}

/// Read any bytes past `offset` from a growing output file.
async fn tail_file(path: &std::path::Path, offset: &mut u64) -> Option<String> {
    use tokio::io::AsyncSeekExt;
    let mut file = tokio::fs::File::open(path).await.ok()?;
    file.seek(std::io::SeekFrom::Start(*offset)).await.ok()?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await.ok()?;
    if buf.is_empty() {
        return None;
    }
    *offset += buf.len() as u64;
    Some(String::from_utf8_lossy(&buf).into_owned())
}

/// Escape a string into a single-quoted shell word.
fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// First `max` characters of `s`, with an ellipsis when truncated.
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager() -> ProcessManager {
        ProcessManager::new(&Config::default())
    }

    fn start_opts(command: &str) -> StartOptions {
        StartOptions {
            command: command.to_string(),
            cwd: Some("/tmp".to_string()),
            env: HashMap::new(),
            session_id: None,
        }
    }

    async fn wait_terminal(record: &Arc<ProcessRecord>, timeout: Duration) -> ProcessStatus {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = record.status();
            if status.is_terminal() {
                return status;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "process never reached a terminal status"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[test]
    fn status_transitions_are_forward_only() {
        let record = ProcessRecord::new("true", None);
        assert!(record.advance(ProcessStatus::Running, None));
        assert!(!record.advance(ProcessStatus::Starting, None));
        assert!(record.advance(ProcessStatus::Completed, Some(0)));
        // Terminal is final: no regression, no terminal-to-terminal hop.
        assert!(!record.advance(ProcessStatus::Running, None));
        assert!(!record.advance(ProcessStatus::Failed, Some(1)));
        assert_eq!(record.status(), ProcessStatus::Completed);
    }

    #[test]
    fn terminal_status_sets_end_time_and_exit_code_together() {
        let record = ProcessRecord::new("true", None);
        record.advance(ProcessStatus::Running, None);
        assert!(record.end_time().is_none());
        record.advance(ProcessStatus::Failed, Some(2));
        let info = record.snapshot(false);
        assert!(info.end_time.is_some());
        assert_eq!(info.exit_code, Some(2));
    }

    #[tokio::test]
    async fn spawned_process_completes_with_output() {
        let manager = test_manager();
        let record = manager
            .start_spawned(start_opts("echo out-line; echo err-line >&2; exit 0"))
            .await
            .unwrap();

        let status = wait_terminal(&record, Duration::from_secs(5)).await;
        assert_eq!(status, ProcessStatus::Completed);

        // Readers may still be flushing the final chunks.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let (stdout, stderr) = record.buffers();
        assert_eq!(stdout, "out-line\n");
        assert_eq!(stderr, "err-line\n");
        assert_eq!(record.snapshot(false).exit_code, Some(0));
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed() {
        let manager = test_manager();
        let record = manager.start_spawned(start_opts("exit 9")).await.unwrap();
        let status = wait_terminal(&record, Duration::from_secs(5)).await;
        assert_eq!(status, ProcessStatus::Failed);
        assert_eq!(record.snapshot(false).exit_code, Some(9));
    }

    #[tokio::test]
    async fn kill_is_terminal_and_idempotent() {
        let manager = test_manager();
        let record = manager.start_spawned(start_opts("sleep 30")).await.unwrap();
        assert_eq!(record.status(), ProcessStatus::Running);

        manager.kill(&record.id).await.unwrap();
        assert_eq!(record.status(), ProcessStatus::Killed);

        // Second kill succeeds without signals; status never regresses even
        // after the child actually dies.
        manager.kill(&record.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(record.status(), ProcessStatus::Killed);
    }

    #[tokio::test]
    async fn status_listener_fires_once_per_terminal() {
        let manager = test_manager();
        let record = manager.start_spawned(start_opts("true")).await.unwrap();
        let mut sub = record.subscribe_status();

        let mut terminal_events = 0;
        while let Some(status) = sub.rx.recv().await {
            if status.is_terminal() {
                terminal_events += 1;
                break;
            }
        }
        // Drain anything else that might arrive shortly after.
        tokio::time::sleep(Duration::from_millis(100)).await;
        while let Ok(status) = sub.rx.try_recv() {
            if status.is_terminal() {
                terminal_events += 1;
            }
        }
        assert_eq!(terminal_events, 1);
    }

    #[tokio::test]
    async fn dropped_listener_does_not_break_others() {
        let manager = test_manager();
        let record = manager
            .start_spawned(start_opts("sleep 0.2; echo tick"))
            .await
            .unwrap();

        let doomed = record.subscribe_output();
        let mut survivor = record.subscribe_output();
        drop(doomed);

        let chunk = tokio::time::timeout(Duration::from_secs(5), survivor.rx.recv())
            .await
            .expect("survivor listener timed out")
            .expect("survivor channel closed");
        assert!(chunk.data.contains("tick"));
    }

    #[tokio::test]
    async fn list_filters_by_status_and_session() {
        let manager = test_manager();
        let running = manager.start_spawned(start_opts("sleep 30")).await.unwrap();
        let done = manager.start_spawned(start_opts("true")).await.unwrap();
        wait_terminal(&done, Duration::from_secs(5)).await;

        let all = manager.list(None, None).await;
        assert_eq!(all.len(), 2);

        let completed = manager.list(None, Some(ProcessStatus::Completed)).await;
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, done.id);

        let by_session = manager.list(Some("nope"), None).await;
        assert!(by_session.is_empty());

        manager.kill(&running.id).await.unwrap();
    }

    #[tokio::test]
    async fn sweep_drops_only_old_terminal_records() {
        let manager = test_manager();
        let old = manager.start_spawned(start_opts("true")).await.unwrap();
        let fresh = manager.start_spawned(start_opts("true")).await.unwrap();
        wait_terminal(&old, Duration::from_secs(5)).await;
        wait_terminal(&fresh, Duration::from_secs(5)).await;

        old.backdate_end_time(31 * 60 * 1000);
        let removed = manager.sweep().await;
        assert_eq!(removed, 1);
        assert!(manager.get(&old.id).await.is_err());
        assert!(manager.get(&fresh.id).await.is_ok());
    }

    #[test]
    fn truncate_is_char_safe() {
        assert_eq!(truncate("short", 80), "short");
        let long = "x".repeat(100);
        let out = truncate(&long, 80);
        assert_eq!(out.chars().count(), 81);
        assert!(out.ends_with('…'));
    }
}
