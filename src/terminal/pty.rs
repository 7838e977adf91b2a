//! PTY plumbing for terminal sessions.
//!
//! A [`Pty`] owns the master side of a pseudo-terminal for the lifetime of a
//! terminal session; the slave side exists only long enough to wire up the
//! shell child. All three of the child's stdio streams point at the slave, so
//! the master carries one merged byte stream both ways.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::process::Stdio;

use nix::pty::Winsize;
use tokio::process::{Child, Command};

fn winsize(rows: u16, cols: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

fn os_err(errno: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(errno as i32)
}

/// The master side of an allocated pseudo-terminal.
pub struct Pty {
    master: OwnedFd,
}

impl Pty {
    /// Allocate a PTY at the given geometry and launch `shell` on its slave
    /// side. The slave fd is dropped once the child holds it; only the master
    /// survives, for I/O and resize.
    pub fn open(
        shell: &str,
        working_dir: &str,
        rows: u16,
        cols: u16,
    ) -> std::io::Result<(Self, Child)> {
        let pair = nix::pty::openpty(&winsize(rows, cols), None).map_err(os_err)?;
        let child = launch_on_slave(&pair.slave, shell, working_dir)?;
        Ok((Self { master: pair.master }, child))
    }

    pub fn master(&self) -> &OwnedFd {
        &self.master
    }

    /// Apply new geometry to the terminal (`TIOCSWINSZ` on the master).
    pub fn set_winsize(&self, rows: u16, cols: u16) -> std::io::Result<()> {
        let size = winsize(rows, cols);
        // SAFETY: TIOCSWINSZ reads a Winsize from the pointer; `size` outlives
        // the call and the fd is owned by `self`.
        let rc = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &size) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

/// Spawn an interactive shell whose world is the PTY slave.
fn launch_on_slave(slave: &OwnedFd, shell: &str, working_dir: &str) -> std::io::Result<Child> {
    let slave_fd = slave.as_raw_fd();

    let mut cmd = Command::new(shell);
    cmd.arg("-i")
        .env("TERM", "xterm-256color")
        .current_dir(working_dir)
        .kill_on_drop(true)
        // Stdio is rewired in the child; no pipes wanted from tokio.
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // SAFETY: adopt_controlling_tty only performs async-signal-safe syscalls.
    unsafe {
        cmd.pre_exec(move || adopt_controlling_tty(slave_fd));
    }
    cmd.spawn()
}

/// Runs between fork and exec: make the child a session leader, give it the
/// PTY slave as controlling terminal, and point stdin/stdout/stderr at it.
fn adopt_controlling_tty(slave_fd: RawFd) -> std::io::Result<()> {
    unsafe {
        if libc::setsid() < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) < 0 {
            return Err(std::io::Error::last_os_error());
        }
        for stdio_fd in 0..3 {
            if libc::dup2(slave_fd, stdio_fd) < 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        // The slave now lives on as fds 0-2; the original is surplus.
        if slave_fd > 2 {
            libc::close(slave_fd);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_spawns_shell_and_resizes() {
        let (pty, mut child) = Pty::open("/bin/sh", "/tmp", 24, 80).expect("open pty");
        assert!(pty.master().as_raw_fd() >= 0);
        pty.set_winsize(40, 120).expect("resize");
        let _ = child.start_kill();
    }
}
