//! Long-lived bash driver with file-based command IPC.
//!
//! One driver owns one shell child for the lifetime of a session. Commands
//! are never parsed out of the shell's output stream; instead each command is
//! written to a script file, sourced with stdout/stderr redirected into
//! capture files, and completion is detected by a marker line
//! (`DONE:<id>` / `STREAM_DONE:<id>`) that the shell prints on its own stdout
//! after the captures are flushed. Command output therefore cannot be
//! confused with the driver's control traffic.
//!
//! ## Completion
//!
//! Every command resolves exactly once: the stdout watcher observing the
//! marker races a per-command timeout, and a once-flag decides the winner.
//! A marker that arrives for an id that is no longer in flight (the command
//! already timed out) is ignored.
//!
//! ## Shell death
//!
//! If the shell child exits, the driver flips its liveness flag, fails all
//! in-flight commands, and every subsequent command fails fast with a
//! "shell is not alive" error. The owning session decides what to do next.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use super::protocol::StreamEvent;
use super::spawn::spawn_session_shell;
use super::tempfiles::CommandFiles;
use crate::error::ApiError;

/// Completion marker for batch commands.
const MARKER_DONE: &str = "DONE";
/// Completion marker for streaming commands.
const MARKER_STREAM_DONE: &str = "STREAM_DONE";

/// How a command's marker wait ended.
enum MarkerOutcome {
    /// The completion marker was observed on the shell's stdout.
    Marker,
    /// The shell child exited before the marker appeared.
    ShellExited,
}

/// Bookkeeping for one in-flight command.
struct Inflight {
    files: CommandFiles,
    done_tx: Option<oneshot::Sender<MarkerOutcome>>,
    /// Once-flag: set by whichever of marker/timeout claims completion.
    completed: Arc<AtomicBool>,
}

/// Result of a completed (non-timed-out) command.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    /// Set when a capture file could not be read back; the stdout/stderr
    /// fields then hold whatever partial bytes were recovered.
    pub capture_error: Option<String>,
}

/// Tunables the driver copies out of the server config.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub shell: String,
    pub command_timeout: Duration,
    pub stream_poll_interval: Duration,
    pub temp_dir: PathBuf,
}

/// A long-lived shell child executing commands via temp-file IPC.
pub struct ShellDriver {
    pid: u32,
    alive: Arc<AtomicBool>,
    stdin_tx: mpsc::Sender<String>,
    inflight: Arc<Mutex<HashMap<String, Inflight>>>,
    exited: Arc<Mutex<Option<i32>>>,
    options: DriverOptions,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ShellDriver {
    /// Spawn the shell child and the driver's background tasks.
    ///
    /// `env` follows session semantics: `Some(v)` sets, `None` unsets from the
    /// inherited image environment. With `isolated` the shell runs in a fresh
    /// PID namespace (`unshare --pid --fork --mount-proc`); a missing unshare
    /// binary is an explicit startup error.
    pub fn spawn(
        label: &str,
        working_dir: &str,
        env: &HashMap<String, Option<String>>,
        isolated: bool,
        options: DriverOptions,
    ) -> Result<Self, ApiError> {
        let mut child = spawn_session_shell(&options.shell, working_dir, env, isolated)?;
        let pid = child.id().unwrap_or(0);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ApiError::ProcessStartError("Failed to take shell stdin".to_string()))?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ApiError::NoStdoutStream("Failed to take shell stdout".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            ApiError::ProcessStartError("Failed to take shell stderr".to_string())
        })?;

        let alive = Arc::new(AtomicBool::new(true));
        let inflight: Arc<Mutex<HashMap<String, Inflight>>> = Arc::new(Mutex::new(HashMap::new()));
        let exited: Arc<Mutex<Option<i32>>> = Arc::new(Mutex::new(None));

        // stdin writer task
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(64);
        let stdin_task = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(script) = stdin_rx.recv().await {
                if stdin.write_all(script.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // stdout watcher task: marker lines resolve in-flight commands
        let label_out = label.to_string();
        let inflight_out = Arc::clone(&inflight);
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Some(id) = parse_marker(&line) else {
                    // Shells occasionally chatter (job-control notices). Never
                    // control traffic, never command output.
                    debug!("Shell {label_out}: unexpected stdout line: {line}");
                    continue;
                };
                let mut map = inflight_out.lock().await;
                if let Some(entry) = map.get_mut(id) {
                    if let Some(tx) = entry.done_tx.take() {
                        let _ = tx.send(MarkerOutcome::Marker);
                    }
                } else {
                    debug!("Shell {label_out}: marker for unknown command {id} (timed out?)");
                }
            }
        });

        // stderr drainer: driver-level stderr is never command output
        let label_err = label.to_string();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("Shell {label_err} stderr: {line}");
            }
        });

        // exit watcher: flips liveness and fails everything in flight
        let label_exit = label.to_string();
        let alive_exit = Arc::clone(&alive);
        let inflight_exit = Arc::clone(&inflight);
        let exited_exit = Arc::clone(&exited);
        let exit_task = tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    warn!("Shell {label_exit}: wait error: {e}");
                    -1
                }
            };
            alive_exit.store(false, Ordering::SeqCst);
            *exited_exit.lock().await = Some(code);
            let mut map = inflight_exit.lock().await;
            for (_, entry) in map.iter_mut() {
                if let Some(tx) = entry.done_tx.take() {
                    let _ = tx.send(MarkerOutcome::ShellExited);
                }
            }
            info!("Shell {label_exit} exited with code {code}");
        });

        info!(
            "Shell {label} ready (pid {pid}, isolated={isolated}, cwd {working_dir})"
        );

        Ok(Self {
            pid,
            alive,
            stdin_tx,
            inflight,
            exited,
            options,
            tasks: vec![stdin_task, stdout_task, stderr_task, exit_task],
        })
    }

    /// OS pid of the shell child (also its process group id).
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the shell child is still running.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Ids of commands currently in flight (consulted by the temp sweeper).
    pub async fn in_flight_ids(&self) -> HashSet<String> {
        self.inflight.lock().await.keys().cloned().collect()
    }

    /// Execute a command to completion with the default timeout.
    pub async fn exec(&self, command: &str, cwd: Option<&str>) -> Result<ExecOutcome, ApiError> {
        self.exec_with_timeout(command, cwd, self.options.command_timeout)
            .await
    }

    /// Execute a command to completion.
    ///
    /// The command body is written to a script file and sourced by the shell,
    /// so state mutations (`cd`, `export`, function definitions) persist into
    /// later commands. `cwd` runs this one command from another directory and
    /// restores the previous one afterwards; a failed `cd` reports exit code 1
    /// with a "Failed to change directory" stderr without moving the shell.
    pub async fn exec_with_timeout(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Duration,
    ) -> Result<ExecOutcome, ApiError> {
        let (id, files, rx, started) = self.submit(command, cwd, MARKER_DONE).await?;

        let outcome = tokio::select! {
            marker = rx => match marker {
                Ok(MarkerOutcome::Marker) => {
                    let mut outcome = read_captures(&files).await;
                    #[allow(clippy::cast_possible_truncation)]
                    {
                        outcome.duration_ms = started.elapsed().as_millis() as u64;
                    }
                    Ok(outcome)
                }
                Ok(MarkerOutcome::ShellExited) | Err(_) => Err(ApiError::Internal(
                    "shell is not alive: exited during command".to_string(),
                )),
            },
            () = tokio::time::sleep(timeout) => Err(ApiError::Timeout(format!(
                "Command timed out after {} ms",
                timeout.as_millis()
            ))),
        };

        self.finish(&id, &files).await;
        outcome
    }

    /// Execute a command, streaming incremental output.
    ///
    /// A poller reads the growing capture files every
    /// `stream_poll_interval` and emits `stdout`/`stderr` events keyed by the
    /// bytes already delivered. Polling stops when the completion marker is
    /// observed; the unemitted tail is always flushed before the final
    /// `complete` (or `error`) event. The final outcome is also returned.
    pub async fn exec_stream(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Duration,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<ExecOutcome, ApiError> {
        let (id, files, rx, started) = self.submit(command, cwd, MARKER_STREAM_DONE).await?;

        let _ = events.send(StreamEvent::start()).await;

        // Poller: incremental reads until told to stop, then one final tail.
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let poll_files = files.clone();
        let poll_events = events.clone();
        let poll_interval = self.options.stream_poll_interval;
        let poller = tokio::spawn(async move {
            let mut stdout_offset: u64 = 0;
            let mut stderr_offset: u64 = 0;
            loop {
                let stopping = tokio::select! {
                    () = tokio::time::sleep(poll_interval) => false,
                    _ = &mut stop_rx => true,
                };
                if let Some(chunk) = read_from(&poll_files.stdout, &mut stdout_offset).await {
                    let _ = poll_events.send(StreamEvent::stdout(chunk)).await;
                }
                if let Some(chunk) = read_from(&poll_files.stderr, &mut stderr_offset).await {
                    let _ = poll_events.send(StreamEvent::stderr(chunk)).await;
                }
                if stopping {
                    break;
                }
            }
        });

        let outcome = tokio::select! {
            marker = rx => match marker {
                Ok(MarkerOutcome::Marker) => {
                    let _ = stop_tx.send(());
                    let _ = poller.await;
                    let mut outcome = read_captures(&files).await;
                    #[allow(clippy::cast_possible_truncation)]
                    {
                        outcome.duration_ms = started.elapsed().as_millis() as u64;
                    }
                    let _ = events.send(StreamEvent::complete(outcome.exit_code)).await;
                    Ok(outcome)
                }
                Ok(MarkerOutcome::ShellExited) | Err(_) => {
                    poller.abort();
                    let err = ApiError::Internal(
                        "shell is not alive: exited during command".to_string(),
                    );
                    let _ = events
                        .send(StreamEvent::error(err.code(), err.to_string()))
                        .await;
                    Err(err)
                }
            },
            () = tokio::time::sleep(timeout) => {
                poller.abort();
                let err = ApiError::Timeout(format!(
                    "Command timed out after {} ms",
                    timeout.as_millis()
                ));
                let _ = events
                    .send(StreamEvent::error(err.code(), err.to_string()))
                    .await;
                Err(err)
            }
        };

        self.finish(&id, &files).await;
        outcome
    }

    /// Register a command, write its files, and hand the control script to the
    /// shell. Returns the command id, files, marker receiver, and start time.
    async fn submit(
        &self,
        command: &str,
        cwd: Option<&str>,
        marker: &str,
    ) -> Result<
        (
            String,
            CommandFiles,
            oneshot::Receiver<MarkerOutcome>,
            Instant,
        ),
        ApiError,
    > {
        if !self.is_alive() {
            return Err(ApiError::Internal("shell is not alive".to_string()));
        }

        let id = new_command_id();
        let files = CommandFiles::new(&self.options.temp_dir, &id);
        files
            .create(command)
            .await
            .map_err(|e| ApiError::Internal(format!("Failed to stage command files: {e}")))?;

        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut map = self.inflight.lock().await;
            map.insert(
                id.clone(),
                Inflight {
                    files: files.clone(),
                    done_tx: Some(done_tx),
                    completed: Arc::new(AtomicBool::new(false)),
                },
            );
        }

        let script = control_script(&files, cwd, marker, &id);
        if self.stdin_tx.send(script).await.is_err() {
            self.inflight.lock().await.remove(&id);
            files.cleanup().await;
            return Err(ApiError::Internal("shell is not alive".to_string()));
        }

        Ok((id, files, done_rx, Instant::now()))
    }

    /// Claim completion (once-flag), drop the in-flight entry, delete files.
    async fn finish(&self, id: &str, files: &CommandFiles) {
        let claimed = {
            let mut map = self.inflight.lock().await;
            match map.remove(id) {
                Some(entry) => entry
                    .completed
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok(),
                None => false,
            }
        };
        if claimed {
            files.cleanup().await;
        }
    }

    /// Gracefully stop the shell: SIGTERM to the process group, wait up to 3 s,
    /// then SIGKILL. Background tasks are aborted afterwards.
    pub async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);

        #[allow(clippy::cast_possible_wrap)]
        let pgid = self.pid as i32;
        if pgid > 0 && self.exited.lock().await.is_none() {
            unsafe {
                libc::kill(-pgid, libc::SIGTERM);
            }
            let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
            loop {
                if self.exited.lock().await.is_some() {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    unsafe {
                        libc::kill(-pgid, libc::SIGKILL);
                    }
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        // Orphaned command files are picked up here rather than by the sweeper.
        let leftovers: Vec<CommandFiles> = {
            let mut map = self.inflight.lock().await;
            map.drain().map(|(_, entry)| entry.files).collect()
        };
        for files in leftovers {
            files.cleanup().await;
        }

        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Parse a marker line. Returns the command id for `DONE:<id>` and
/// `STREAM_DONE:<id>` lines, `None` otherwise.
fn parse_marker(line: &str) -> Option<&str> {
    let line = line.trim_end();
    for prefix in [MARKER_STREAM_DONE, MARKER_DONE] {
        if let Some(rest) = line.strip_prefix(prefix) {
            if let Some(id) = rest.strip_prefix(':') {
                if !id.is_empty() && id.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Some(id);
                }
            }
        }
    }
    None
}

/// A fresh 128-bit command id as 32 hex characters.
pub fn new_command_id() -> String {
    use std::fmt::Write;
    let bytes: [u8; 16] = rand::random();
    let mut id = String::with_capacity(32);
    for b in bytes {
        let _ = write!(id, "{b:02x}");
    }
    id
}

/// Escape a string into a single-quoted shell word.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Build the control script handed to the shell's stdin for one command.
///
/// The script sources the command file with both streams redirected to the
/// capture files, writes `$?` to the exit file, and prints the marker line on
/// the shell's own stdout. With a cwd override the previous directory is
/// restored after the command; a failed `cd` reports exit 1 and a
/// "Failed to change directory" stderr without running the command.
fn control_script(files: &CommandFiles, cwd: Option<&str>, marker: &str, id: &str) -> String {
    let script = shell_quote(&files.script.to_string_lossy());
    let out = shell_quote(&files.stdout.to_string_lossy());
    let err = shell_quote(&files.stderr.to_string_lossy());
    let exit = shell_quote(&files.exit.to_string_lossy());

    match cwd {
        Some(dir) => {
            let dir_q = shell_quote(dir);
            format!(
                "__sbx_prev_dir=\"$PWD\"\n\
                 if cd {dir_q} 2>> {err}; then\n\
                 source {script} > {out} 2>> {err}\n\
                 echo $? > {exit}\n\
                 cd \"$__sbx_prev_dir\"\n\
                 else\n\
                 echo \"Failed to change directory to {dir}\" >> {err}\n\
                 echo 1 > {exit}\n\
                 fi\n\
                 echo {marker}:{id}\n"
            )
        }
        None => format!(
            "source {script} > {out} 2> {err}\n\
             echo $? > {exit}\n\
             echo {marker}:{id}\n"
        ),
    }
}

/// Read all three capture files into an [`ExecOutcome`].
///
/// A capture that cannot be read back (the caller may have deleted its own
/// directory) degrades to the partial bytes recovered plus a capture error;
/// it never poisons the driver.
async fn read_captures(files: &CommandFiles) -> ExecOutcome {
    let mut capture_error = None;

    let stdout = match tokio::fs::read(&files.stdout).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            capture_error = Some(format!("stdout capture unreadable: {e}"));
            String::new()
        }
    };
    let stderr = match tokio::fs::read(&files.stderr).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            capture_error.get_or_insert_with(|| format!("stderr capture unreadable: {e}"));
            String::new()
        }
    };
    let exit_code = match tokio::fs::read_to_string(&files.exit).await {
        Ok(text) => match text.trim().parse::<i32>() {
            Ok(code) => code,
            Err(_) => {
                capture_error.get_or_insert_with(|| "exit capture unparsable".to_string());
                -1
            }
        },
        Err(e) => {
            capture_error.get_or_insert_with(|| format!("exit capture unreadable: {e}"));
            -1
        }
    };

    ExecOutcome {
        exit_code,
        stdout,
        stderr,
        duration_ms: 0,
        capture_error,
    }
}

/// Read any bytes past `offset` from `path`, advancing the offset.
async fn read_from(path: &std::path::Path, offset: &mut u64) -> Option<String> {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn test_options(temp: &std::path::Path) -> DriverOptions {
        DriverOptions {
            shell: "/bin/bash".to_string(),
            command_timeout: Duration::from_secs(10),
            stream_poll_interval: Duration::from_millis(50),
            temp_dir: temp.to_path_buf(),
        }
    }

    fn test_driver(temp: &std::path::Path) -> ShellDriver {
        ShellDriver::spawn("test", "/tmp", &HashMap::new(), false, test_options(temp))
            .expect("spawn bash")
    }

    #[test]
    fn marker_parsing() {
        assert_eq!(parse_marker("DONE:abc123"), Some("abc123"));
        assert_eq!(parse_marker("STREAM_DONE:deadbeef\n"), Some("deadbeef"));
        assert_eq!(parse_marker("DONE:"), None);
        assert_eq!(parse_marker("DONE:not hex!"), None);
        assert_eq!(parse_marker("echo DONE"), None);
        assert_eq!(parse_marker("random output"), None);
    }

    #[test]
    fn command_ids_are_128_bit_hex() {
        let a = new_command_id();
        let b = new_command_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn quoting_survives_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn control_script_shape() {
        let files = CommandFiles::new(std::path::Path::new("/tmp/t"), "aa11");
        let script = control_script(&files, None, MARKER_DONE, "aa11");
        assert!(script.contains("source '/tmp/t/cmd-aa11.sh'"));
        assert!(script.contains("echo $? > '/tmp/t/cmd-aa11.exit'"));
        assert!(script.ends_with("echo DONE:aa11\n"));

        let script = control_script(&files, Some("/srv"), MARKER_STREAM_DONE, "aa11");
        assert!(script.contains("if cd '/srv'"));
        assert!(script.contains("Failed to change directory to /srv"));
        assert!(script.contains("cd \"$__sbx_prev_dir\""));
        assert!(script.ends_with("echo STREAM_DONE:aa11\n"));
    }

    #[tokio::test]
    async fn exec_captures_output_and_exit() {
        let temp = tempfile::tempdir().unwrap();
        let driver = test_driver(temp.path());

        let outcome = driver.exec("echo hello; echo oops >&2", None).await.unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.stdout, "hello\n");
        assert_eq!(outcome.stderr, "oops\n");
        assert!(outcome.capture_error.is_none());

        // Subshell exit: `exit` at the top level would kill the sourced shell.
        let outcome = driver.exec("(exit 3)", None).await.unwrap();
        assert_eq!(outcome.exit_code, 3);

        driver.shutdown().await;
    }

    #[tokio::test]
    async fn state_persists_across_commands() {
        let temp = tempfile::tempdir().unwrap();
        let driver = test_driver(temp.path());

        driver.exec("export DRIVER_TEST_VAR=alpha", None).await.unwrap();
        let outcome = driver.exec("echo $DRIVER_TEST_VAR", None).await.unwrap();
        assert_eq!(outcome.stdout, "alpha\n");

        driver.shutdown().await;
    }

    #[tokio::test]
    async fn cwd_override_restores_previous_dir() {
        let temp = tempfile::tempdir().unwrap();
        let driver = test_driver(temp.path());

        let over = driver.exec("pwd", Some("/")).await.unwrap();
        assert_eq!(over.stdout, "/\n");

        // The shell itself never moved.
        let base = driver.exec("pwd", None).await.unwrap();
        assert_eq!(base.stdout, "/tmp\n");

        driver.shutdown().await;
    }

    #[tokio::test]
    async fn cwd_override_failure_reports_without_moving() {
        let temp = tempfile::tempdir().unwrap();
        let driver = test_driver(temp.path());

        let outcome = driver
            .exec("echo never-runs", Some("/definitely/not/here"))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 1);
        assert!(outcome.stderr.contains("Failed to change directory"));
        assert!(!outcome.stdout.contains("never-runs"));

        let base = driver.exec("pwd", None).await.unwrap();
        assert_eq!(base.stdout, "/tmp\n");

        driver.shutdown().await;
    }

    #[tokio::test]
    async fn timeout_resolves_once_and_cleans_files() {
        let temp = tempfile::tempdir().unwrap();
        let driver = test_driver(temp.path());

        let err = driver
            .exec_with_timeout("sleep 5", None, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TIMEOUT");

        // Once reported, the command is no longer in flight and its temp
        // files are gone.
        assert!(driver.in_flight_ids().await.is_empty());
        let mut entries = tokio::fs::read_dir(temp.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());

        driver.shutdown().await;
    }

    #[tokio::test]
    async fn streaming_emits_chunks_then_complete() {
        let temp = tempfile::tempdir().unwrap();
        let driver = test_driver(temp.path());

        let (tx, mut rx) = mpsc::channel(64);
        let outcome = driver
            .exec_stream(
                "echo first; sleep 0.3; echo second; echo err-line >&2",
                None,
                Duration::from_secs(10),
                tx,
            )
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);

        let mut stdout_data = String::new();
        let mut stderr_data = String::new();
        let mut saw_start = false;
        let mut completion: Option<i32> = None;
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Start { .. } => saw_start = true,
                StreamEvent::Stdout { data, .. } => stdout_data.push_str(&data),
                StreamEvent::Stderr { data, .. } => stderr_data.push_str(&data),
                StreamEvent::Complete { exit_code, .. } => completion = Some(exit_code),
                StreamEvent::Error { .. } => panic!("unexpected error event"),
            }
        }
        assert!(saw_start);
        assert_eq!(stdout_data, "first\nsecond\n");
        assert_eq!(stderr_data, "err-line\n");
        assert_eq!(completion, Some(0));

        driver.shutdown().await;
    }

    #[tokio::test]
    async fn dead_shell_fails_fast() {
        let temp = tempfile::tempdir().unwrap();
        let driver = test_driver(temp.path());

        driver.shutdown().await;
        // Give the exit watcher a beat to observe the death.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let err = driver.exec("echo nope", None).await.unwrap_err();
        assert!(err.to_string().contains("shell is not alive"));
    }
}
