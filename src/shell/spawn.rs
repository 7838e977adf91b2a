//! Shell child spawning for the driver.
//!
//! The shell becomes a process group leader via `setpgid(0, 0)` so signals
//! sent to `-pgid` reach the whole tree. With PID isolation the shell is
//! wrapped in `unshare --pid --fork --mount-proc`; a missing `unshare` binary
//! fails the spawn explicitly rather than silently degrading.

use std::collections::HashMap;
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::error::ApiError;

/// Spawn the long-lived shell child for a session.
///
/// `env` entries with `Some(value)` are set on top of the inherited (image)
/// environment; entries with `None` are removed from it before the shell
/// starts. The returned [`Child`] has `kill_on_drop(true)`.
pub fn spawn_session_shell(
    shell: &str,
    working_dir: &str,
    env: &HashMap<String, Option<String>>,
    isolated: bool,
) -> Result<Child, ApiError> {
    let mut cmd = if isolated {
        let unshare = which("unshare").ok_or_else(|| {
            ApiError::ProcessStartError(
                "PID isolation requested but the unshare binary is not available".to_string(),
            )
        })?;
        let mut cmd = Command::new(unshare);
        cmd.args(["--pid", "--fork", "--mount-proc"]).arg(shell);
        cmd
    } else {
        Command::new(shell)
    };

    cmd.current_dir(working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, value) in env {
        match value {
            Some(v) => {
                cmd.env(key, v);
            }
            None => {
                cmd.env_remove(key);
            }
        }
    }

    // SAFETY: setpgid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }

    cmd.spawn()
        .map_err(|e| ApiError::ProcessStartError(format!("Failed to spawn shell {shell}: {e}")))
}

/// Resolve a binary on `$PATH`. Returns the full path, or `None`.
pub fn which(binary: &str) -> Option<String> {
    let path = std::env::var("PATH").ok()?;
    for dir in path.split(':') {
        if dir.is_empty() {
            continue;
        }
        let candidate = std::path::Path::new(dir).join(binary);
        if candidate.is_file() {
            return Some(candidate.to_string_lossy().into_owned());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn which_finds_sh() {
        // /bin/sh exists on any Linux image this server targets.
        assert!(which("sh").is_some());
    }

    #[test]
    fn which_misses_nonsense() {
        assert!(which("definitely-not-a-real-binary-xyz").is_none());
    }
}
