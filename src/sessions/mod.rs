//! Session lifecycle and per-session execution ordering.
//!
//! [`SessionRegistry`] is the single authority for creating, accessing, and
//! destroying shell sessions. A session couples one [`ShellDriver`] with its
//! configured environment, working directory, and a `tokio::sync::Mutex` that
//! serializes every command routed through that driver. Operations on
//! different sessions run in parallel; operations on one session run in
//! strict arrival order (tokio mutexes queue FIFO).
//!
//! ## Environment precedence
//!
//! per-command env > session env (set via `set_env`) > image env. A `null`
//! value unsets at its layer: at session start it removes the variable from
//! the inherited image environment, in `set_env` it `unset`s it in the live
//! shell, and per-command it masks it via `env -u` for that command only.
//!
//! ## Working directory
//!
//! Resolved at creation time, never eagerly: the requested directory if it
//! exists, else the user home; the lazily-created default session prefers
//! the configured workspace dir, then home, then `/`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::info;

use crate::config::Config;
use crate::error::{now_ms, ApiError};
use crate::shell::protocol::StreamEvent;
use crate::shell::{DriverOptions, ExecOutcome, ShellDriver};

/// Id of the lazily-created default session.
pub const DEFAULT_SESSION_ID: &str = "default";

/// One shell session: a driver plus its configuration and execution mutex.
pub struct Session {
    pub id: String,
    pub created_at: u64,
    pub cwd: String,
    pub isolated: bool,
    driver: ShellDriver,
    /// Session-level env layer, mutated by `set_env`.
    env: Mutex<HashMap<String, Option<String>>>,
    /// Serializes all commands through this session's driver.
    exec_lock: Mutex<()>,
    destroyed: AtomicBool,
}

/// Summary row returned by list/create endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(rename = "createdAt")]
    pub created_at: u64,
    pub cwd: String,
    pub isolated: bool,
    pub alive: bool,
}

impl Session {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            created_at: self.created_at,
            cwd: self.cwd.clone(),
            isolated: self.isolated,
            alive: self.driver.is_alive(),
        }
    }

    fn destroyed_error(&self) -> ApiError {
        ApiError::SessionNotFound(format!("{} (session destroyed)", self.id))
    }
}

/// Manages the pool of shell sessions.
///
/// Cloneable — all clones share the same inner map.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    shell: String,
    workspace_dir: String,
    driver_options: DriverOptions,
    default_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(config: &Config) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            shell: config.shell.shell.clone(),
            workspace_dir: config.shell.workspace_dir.clone(),
            driver_options: DriverOptions {
                shell: config.shell.shell.clone(),
                command_timeout: Duration::from_millis(config.shell.command_timeout_ms),
                stream_poll_interval: Duration::from_millis(config.shell.stream_poll_interval_ms),
                temp_dir: std::path::PathBuf::from(crate::shell::tempfiles::TEMP_DIR),
            },
            default_timeout: Duration::from_millis(config.shell.command_timeout_ms),
        }
    }

    /// Registry with an alternate temp dir, for tests.
    #[cfg(test)]
    pub fn with_temp_dir(config: &Config, temp_dir: &Path) -> Self {
        let mut registry = Self::new(config);
        registry.driver_options.temp_dir = temp_dir.to_path_buf();
        registry
    }

    /// Create a session. Fails with `SESSION_ALREADY_EXISTS` on a duplicate id.
    ///
    /// Holds the write lock across the check-and-insert to prevent TOCTOU
    /// races. `env` values of `None` are unset from the image environment at
    /// shell start.
    pub async fn create(
        &self,
        id: &str,
        env: HashMap<String, Option<String>>,
        cwd: Option<&str>,
        isolated: bool,
    ) -> Result<SessionInfo, ApiError> {
        if id.is_empty() {
            return Err(ApiError::InvalidRequest(
                "Session id must not be empty".to_string(),
            ));
        }
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(id) {
            return Err(ApiError::SessionAlreadyExists(id.to_string()));
        }

        let cwd = self.resolve_cwd(cwd);
        let driver = ShellDriver::spawn(id, &cwd, &env, isolated, self.driver_options.clone())?;
        let session = Arc::new(Session {
            id: id.to_string(),
            created_at: now_ms(),
            cwd,
            isolated,
            driver,
            env: Mutex::new(env),
            exec_lock: Mutex::new(()),
            destroyed: AtomicBool::new(false),
        });
        let info = session.info();
        sessions.insert(id.to_string(), session);
        info!("Session {id} created, total: {}", sessions.len());
        Ok(info)
    }

    /// Resolve the working directory for a new session.
    ///
    /// The requested directory wins when it exists; otherwise the user home.
    /// Without a request: workspace dir, then home, then `/`.
    fn resolve_cwd(&self, requested: Option<&str>) -> String {
        match requested {
            Some(dir) if Path::new(dir).is_dir() => dir.to_string(),
            Some(_) => home_dir(),
            None => {
                if Path::new(&self.workspace_dir).is_dir() {
                    self.workspace_dir.clone()
                } else {
                    let home = home_dir();
                    if Path::new(&home).is_dir() {
                        home
                    } else {
                        "/".to_string()
                    }
                }
            }
        }
    }

    /// Get a session by id, or the lazily-created default when `id` is `None`.
    pub async fn get_or_default(&self, id: Option<&str>) -> Result<Arc<Session>, ApiError> {
        match id {
            Some(id) => self.get(id).await,
            None => {
                if let Some(session) = self.sessions.read().await.get(DEFAULT_SESSION_ID) {
                    return Ok(Arc::clone(session));
                }
                match self
                    .create(DEFAULT_SESSION_ID, HashMap::new(), None, false)
                    .await
                {
                    Ok(_) => {}
                    // Lost a creation race — someone else made it.
                    Err(ApiError::SessionAlreadyExists(_)) => {}
                    Err(e) => return Err(e),
                }
                self.get(DEFAULT_SESSION_ID).await
            }
        }
    }

    pub async fn get(&self, id: &str) -> Result<Arc<Session>, ApiError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::SessionNotFound(id.to_string()))
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .await
            .values()
            .map(|s| s.info())
            .collect()
    }

    /// Destroy a session: drop it from the map, then stop its shell
    /// (SIGTERM → 3 s grace → SIGKILL). Commands already queued on the
    /// session mutex observe a session-destroyed error instead of running.
    pub async fn delete(&self, id: &str) -> Result<(), ApiError> {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions
                .remove(id)
                .ok_or_else(|| ApiError::SessionNotFound(id.to_string()))?
        };
        session.destroyed.store(true, Ordering::SeqCst);
        session.driver.shutdown().await;
        info!("Session {id} destroyed");
        Ok(())
    }

    /// Run a command on a session with per-command env/cwd overrides.
    pub async fn exec(
        &self,
        session: &Session,
        command: &str,
        env: &HashMap<String, Option<String>>,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ExecOutcome, ApiError> {
        let _guard = session.exec_lock.lock().await;
        if session.destroyed.load(Ordering::SeqCst) {
            return Err(session.destroyed_error());
        }
        let wrapped = wrap_command_env(command, env);
        session
            .driver
            .exec_with_timeout(&wrapped, cwd, timeout.unwrap_or(self.default_timeout))
            .await
            .map_err(|e| self.map_driver_error(session, e))
    }

    /// Streaming variant of [`Self::exec`].
    pub async fn exec_stream(
        &self,
        session: &Session,
        command: &str,
        env: &HashMap<String, Option<String>>,
        cwd: Option<&str>,
        timeout: Option<Duration>,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<ExecOutcome, ApiError> {
        let _guard = session.exec_lock.lock().await;
        if session.destroyed.load(Ordering::SeqCst) {
            return Err(session.destroyed_error());
        }
        let wrapped = wrap_command_env(command, env);
        session
            .driver
            .exec_stream(
                &wrapped,
                cwd,
                timeout.unwrap_or(self.default_timeout),
                events,
            )
            .await
            .map_err(|e| self.map_driver_error(session, e))
    }

    /// Update the session env layer and apply it to the live shell.
    ///
    /// `Some(value)` exports, `None` unsets. Runs under the session mutex so
    /// the mutation is ordered against other commands.
    pub async fn set_env(
        &self,
        session: &Session,
        vars: HashMap<String, Option<String>>,
    ) -> Result<(), ApiError> {
        let _guard = session.exec_lock.lock().await;
        if session.destroyed.load(Ordering::SeqCst) {
            return Err(session.destroyed_error());
        }

        let mut script = String::new();
        for (key, value) in &vars {
            if !is_valid_env_name(key) {
                return Err(ApiError::Validation(format!(
                    "Invalid environment variable name: {key:?}"
                )));
            }
            match value {
                Some(v) => {
                    script.push_str(&format!("export {key}={}\n", shell_quote(v)));
                }
                None => {
                    script.push_str(&format!("unset {key}\n"));
                }
            }
        }
        if script.is_empty() {
            return Ok(());
        }

        session
            .driver
            .exec_with_timeout(&script, None, self.default_timeout)
            .await
            .map_err(|e| self.map_driver_error(session, e))?;

        session.env.lock().await.extend(vars);
        Ok(())
    }

    /// Snapshot of the session env layer.
    pub async fn env_of(&self, session: &Session) -> HashMap<String, Option<String>> {
        session.env.lock().await.clone()
    }

    /// In-flight command ids across every session (temp-sweeper input).
    pub async fn all_in_flight_ids(&self) -> std::collections::HashSet<String> {
        let sessions: Vec<Arc<Session>> =
            self.sessions.read().await.values().cloned().collect();
        let mut ids = std::collections::HashSet::new();
        for session in sessions {
            ids.extend(session.driver.in_flight_ids().await);
        }
        ids
    }

    /// The driver temp dir and max temp-file age, for the sweeper task.
    pub fn temp_dir(&self) -> &Path {
        &self.driver_options.temp_dir
    }

    /// Stop every session's shell (used during shutdown).
    pub async fn shutdown_all(&self) {
        let sessions: Vec<(String, Arc<Session>)> = {
            let mut map = self.sessions.write().await;
            map.drain().collect()
        };
        let count = sessions.len();
        for (id, session) in sessions {
            session.destroyed.store(true, Ordering::SeqCst);
            session.driver.shutdown().await;
            info!("Session {id} stopped (shutdown)");
        }
        if count > 0 {
            info!("Shut down {count} session(s)");
        }
    }

    /// A dead shell poisons only its own session; surface that as a
    /// session-scoped error rather than a bare internal one.
    fn map_driver_error(&self, session: &Session, e: ApiError) -> ApiError {
        if session.destroyed.load(Ordering::SeqCst) {
            session.destroyed_error()
        } else {
            e
        }
    }

    /// Default shell binary (reported by info-style endpoints).
    pub fn shell(&self) -> &str {
        &self.shell
    }
}

/// The user home directory, `/root` as a last resort.
fn home_dir() -> String {
    std::env::var("HOME").unwrap_or_else(|_| "/root".to_string())
}

/// `KEY` must look like a POSIX environment variable name.
fn is_valid_env_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Escape a string into a single-quoted shell word.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Wrap a command with its per-command env overrides.
///
/// `None` values mask via `env -u NAME`; `Some` values are passed as
/// `NAME=value` words. The command body runs under `bash -c`, so the
/// overrides apply to this command only and never leak into session state.
pub fn wrap_command_env(command: &str, env: &HashMap<String, Option<String>>) -> String {
    if env.is_empty() {
        return command.to_string();
    }

    let mut parts = vec!["env".to_string()];
    // Deterministic ordering keeps the wrapper stable and testable.
    let mut keys: Vec<&String> = env.keys().collect();
    keys.sort();
    for key in &keys {
        if env[*key].is_none() {
            parts.push("-u".to_string());
            parts.push((*key).clone());
        }
    }
    for key in &keys {
        if let Some(value) = &env[*key] {
            parts.push(format!("{key}={}", shell_quote(value)));
        }
    }
    parts.push("bash".to_string());
    parts.push("-c".to_string());
    parts.push(shell_quote(command));
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_registry(temp: &Path) -> SessionRegistry {
        SessionRegistry::with_temp_dir(&Config::default(), temp)
    }

    #[test]
    fn env_name_validation() {
        assert!(is_valid_env_name("PATH"));
        assert!(is_valid_env_name("_private"));
        assert!(is_valid_env_name("VAR_2"));
        assert!(!is_valid_env_name("2VAR"));
        assert!(!is_valid_env_name("BAD-NAME"));
        assert!(!is_valid_env_name(""));
    }

    #[test]
    fn env_wrapper_shapes() {
        let mut env = HashMap::new();
        assert_eq!(wrap_command_env("echo hi", &env), "echo hi");

        env.insert("OVERRIDE".to_string(), Some("command".to_string()));
        env.insert("MASKED".to_string(), None);
        let wrapped = wrap_command_env("echo $OVERRIDE", &env);
        assert_eq!(
            wrapped,
            "env -u MASKED OVERRIDE='command' bash -c 'echo $OVERRIDE'"
        );
    }

    #[test]
    fn env_wrapper_quotes_values() {
        let mut env = HashMap::new();
        env.insert("V".to_string(), Some("it's a value".to_string()));
        let wrapped = wrap_command_env("true", &env);
        assert!(wrapped.contains(r"V='it'\''s a value'"));
    }

    #[tokio::test]
    async fn create_get_delete_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        let registry = test_registry(temp.path());

        let info = registry
            .create("s1", HashMap::new(), Some("/tmp"), false)
            .await
            .unwrap();
        assert_eq!(info.id, "s1");
        assert_eq!(info.cwd, "/tmp");
        assert!(info.alive);

        let err = registry
            .create("s1", HashMap::new(), None, false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SESSION_ALREADY_EXISTS");

        assert_eq!(registry.list().await.len(), 1);
        registry.delete("s1").await.unwrap();
        assert!(registry.list().await.is_empty());
        assert_eq!(
            registry.delete("s1").await.unwrap_err().code(),
            "SESSION_NOT_FOUND"
        );
    }

    #[tokio::test]
    async fn missing_cwd_falls_back_to_home() {
        let temp = tempfile::tempdir().unwrap();
        let registry = test_registry(temp.path());

        let info = registry
            .create("s1", HashMap::new(), Some("/no/such/dir"), false)
            .await
            .unwrap();
        assert_eq!(info.cwd, home_dir());

        let session = registry.get("s1").await.unwrap();
        let outcome = registry
            .exec(&session, "pwd", &HashMap::new(), None, None)
            .await
            .unwrap();
        assert_eq!(outcome.stdout.trim_end(), home_dir());

        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn env_precedence_layers() {
        let temp = tempfile::tempdir().unwrap();
        let registry = test_registry(temp.path());
        registry
            .create("s1", HashMap::new(), Some("/tmp"), false)
            .await
            .unwrap();
        let session = registry.get("s1").await.unwrap();

        let mut session_env = HashMap::new();
        session_env.insert("OVERRIDE".to_string(), Some("session".to_string()));
        registry.set_env(&session, session_env).await.unwrap();

        let outcome = registry
            .exec(&session, "echo $OVERRIDE", &HashMap::new(), None, None)
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "session\n");

        let mut cmd_env = HashMap::new();
        cmd_env.insert("OVERRIDE".to_string(), Some("command".to_string()));
        let outcome = registry
            .exec(&session, "echo $OVERRIDE", &cmd_env, None, None)
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "command\n");

        // The per-command layer never sticks.
        let outcome = registry
            .exec(&session, "echo $OVERRIDE", &HashMap::new(), None, None)
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "session\n");

        // A null per-command value masks the session value for one command.
        let mut mask_env = HashMap::new();
        mask_env.insert("OVERRIDE".to_string(), None);
        let outcome = registry
            .exec(&session, "echo check:$OVERRIDE", &mask_env, None, None)
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "check:\n");

        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let temp = tempfile::tempdir().unwrap();
        let registry = test_registry(temp.path());
        registry
            .create("a", HashMap::new(), Some("/tmp"), false)
            .await
            .unwrap();
        registry
            .create("b", HashMap::new(), Some("/tmp"), false)
            .await
            .unwrap();

        let a = registry.get("a").await.unwrap();
        let b = registry.get("b").await.unwrap();

        registry
            .exec(&a, "export PTY_TEST_VAR=A", &HashMap::new(), None, None)
            .await
            .unwrap();
        let outcome = registry
            .exec(&b, "echo check:$PTY_TEST_VAR", &HashMap::new(), None, None)
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "check:\n");

        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn same_session_commands_run_in_arrival_order() {
        let temp = tempfile::tempdir().unwrap();
        let registry = test_registry(temp.path());
        registry
            .create("s1", HashMap::new(), Some("/tmp"), false)
            .await
            .unwrap();
        let session = registry.get("s1").await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));

        let r1 = registry.clone();
        let s1 = Arc::clone(&session);
        let o1 = Arc::clone(&order);
        let first = tokio::spawn(async move {
            r1.exec(&s1, "sleep 0.3; echo first", &HashMap::new(), None, None)
                .await
                .unwrap();
            o1.lock().await.push("first");
        });

        // Let the first command take the session mutex.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let r2 = registry.clone();
        let s2 = Arc::clone(&session);
        let o2 = Arc::clone(&order);
        let second = tokio::spawn(async move {
            r2.exec(&s2, "echo second", &HashMap::new(), None, None)
                .await
                .unwrap();
            o2.lock().await.push("second");
        });

        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(*order.lock().await, vec!["first", "second"]);

        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn destroyed_session_rejects_exec() {
        let temp = tempfile::tempdir().unwrap();
        let registry = test_registry(temp.path());
        registry
            .create("s1", HashMap::new(), Some("/tmp"), false)
            .await
            .unwrap();
        let session = registry.get("s1").await.unwrap();
        registry.delete("s1").await.unwrap();

        let err = registry
            .exec(&session, "echo hi", &HashMap::new(), None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SESSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn session_survives_cwd_deletion() {
        let temp = tempfile::tempdir().unwrap();
        let registry = test_registry(temp.path());

        let doomed = tempfile::tempdir().unwrap();
        let doomed_path = doomed.path().to_string_lossy().into_owned();
        registry
            .create("s1", HashMap::new(), Some(&doomed_path), false)
            .await
            .unwrap();
        let session = registry.get("s1").await.unwrap();

        drop(doomed); // cwd is gone; the shell keeps its inode

        let outcome = registry
            .exec(&session, "cd /; pwd", &HashMap::new(), None, None)
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "/\n");

        registry.shutdown_all().await;
    }
}
