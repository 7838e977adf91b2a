//! The two ways a background process can be launched.
//!
//! [`ProcessHandle`] is a tagged variant over a directly-spawned child (owned
//! pipes, real exit code) and a shell-detached process (`nohup` through a
//! session shell, PID captured via `echo $!`, output tailed from files). Both
//! expose the same signalling surface; the manager owns everything else.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use serde::Serialize;
use tokio::process::{Child, Command};

/// Which output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Launch-strategy variant for a tracked background process.
#[derive(Debug)]
pub enum ProcessHandle {
    /// Directly-spawned child. The manager's exit watcher holds the `Child`;
    /// only the process group id lives here for signalling.
    Spawned { pgid: i32 },
    /// `nohup`-launched through a session shell. The shell reaps it, so exits
    /// are detected by liveness polling and output is tailed from files.
    Detached {
        pid: i32,
        stdout_path: PathBuf,
        stderr_path: PathBuf,
    },
}

impl ProcessHandle {
    pub fn pid(&self) -> i32 {
        match self {
            Self::Spawned { pgid } => *pgid,
            Self::Detached { pid, .. } => *pid,
        }
    }

    /// Deliver a signal. Spawned children get it as a process group
    /// (`kill(-pgid, sig)`); detached PIDs get it directly.
    pub fn signal(&self, sig: i32) {
        match self {
            Self::Spawned { pgid } => {
                if *pgid > 0 {
                    unsafe {
                        libc::kill(-pgid, sig);
                    }
                }
            }
            Self::Detached { pid, .. } => {
                if *pid > 0 {
                    unsafe {
                        libc::kill(*pid, sig);
                    }
                }
            }
        }
    }

    /// Liveness probe via `kill(pid, 0)`. Used for detached processes, whose
    /// exit the session shell reaps on our behalf.
    pub fn is_alive(&self) -> bool {
        let pid = self.pid();
        if pid <= 0 {
            return false;
        }
        unsafe { libc::kill(pid, 0) == 0 }
    }
}

/// Spawn a command directly as `<shell> -c <command>` with piped stdio.
///
/// The child becomes a process group leader (`setpgid(0,0)`) so kill reaches
/// its whole tree, and carries `kill_on_drop` as a leak backstop.
pub fn spawn_direct(
    shell: &str,
    command: &str,
    cwd: &str,
    env: &HashMap<String, String>,
) -> std::io::Result<Child> {
    let mut cmd = Command::new(shell);
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd.envs(env);
    // SAFETY: setpgid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
    cmd.spawn()
}
