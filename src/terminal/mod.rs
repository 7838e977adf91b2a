//! Interactive PTY terminals multiplexed over websockets.
//!
//! A [`PtySession`] owns one PTY and the shell running on its slave side.
//! Output from the master is appended to a bounded replay buffer and
//! broadcast to every attached peer; a new peer first receives the replay,
//! then live traffic, so reconnects pick up where they left off. The session
//! outlives its peers: only an idle grace period after the last detach (or
//! shell exit) tears it down.

pub mod pty;

use std::collections::{HashMap, VecDeque};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::ApiError;

/// Bounded ring of recent PTY output.
pub struct ReplayBuffer {
    buf: VecDeque<u8>,
    cap: usize,
}

impl ReplayBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap.min(4096)),
            cap,
        }
    }

    /// Append output, evicting the oldest bytes past capacity.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend(data);
        while self.buf.len() > self.cap {
            self.buf.pop_front();
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.buf.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// One live terminal session.
pub struct PtySession {
    pub id: String,
    pty: pty::Pty,
    pid: u32,
    geometry: Mutex<(u16, u16)>,
    replay: Mutex<ReplayBuffer>,
    peers: Mutex<HashMap<u64, mpsc::Sender<Vec<u8>>>>,
    next_peer: AtomicU64,
    /// Set when the last peer leaves; cleared on attach.
    empty_since: Mutex<Option<Instant>>,
    alive: Arc<AtomicBool>,
    input_tx: mpsc::Sender<Vec<u8>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl PtySession {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Queue user input for the PTY master.
    pub async fn write_input(&self, data: Vec<u8>) -> Result<(), ApiError> {
        self.input_tx
            .send(data)
            .await
            .map_err(|_| ApiError::Internal("Terminal input channel closed".to_string()))
    }

    /// Resize the terminal.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), ApiError> {
        self.pty
            .set_winsize(rows, cols)
            .map_err(|e| ApiError::Internal(format!("PTY resize failed: {e}")))?;
        *self.geometry.lock().expect("geometry lock") = (rows, cols);
        Ok(())
    }

    /// Register a peer. Returns the replay snapshot (emitted to the peer
    /// before any live traffic) and the live-output receiver.
    pub fn attach(self: &Arc<Self>, buffer: usize) -> (Vec<u8>, PeerHandle) {
        let (tx, rx) = mpsc::channel(buffer);
        let peer_id = self.next_peer.fetch_add(1, Ordering::Relaxed);
        self.peers.lock().expect("peers lock").insert(peer_id, tx);
        *self.empty_since.lock().expect("empty lock") = None;
        let replay = self.replay.lock().expect("replay lock").snapshot();
        debug!("Terminal {}: peer {peer_id} attached", self.id);
        (
            replay,
            PeerHandle {
                session: Arc::clone(self),
                peer_id,
                rx,
            },
        )
    }

    /// Broadcast one output chunk to every peer. A peer whose channel is full
    /// loses that chunk; a closed peer is ignored (its handle cleans up).
    fn broadcast(&self, data: &[u8]) {
        let senders: Vec<(u64, mpsc::Sender<Vec<u8>>)> = {
            let peers = self.peers.lock().expect("peers lock");
            peers.iter().map(|(id, tx)| (*id, tx.clone())).collect()
        };
        for (peer_id, tx) in senders {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(data.to_vec()) {
                debug!(
                    "Terminal {}: peer {peer_id} lagging, dropped {} byte(s)",
                    self.id,
                    data.len()
                );
            }
        }
    }

    fn detach(&self, peer_id: u64) {
        let mut peers = self.peers.lock().expect("peers lock");
        peers.remove(&peer_id);
        if peers.is_empty() {
            *self.empty_since.lock().expect("empty lock") = Some(Instant::now());
        }
        debug!("Terminal {}: peer {peer_id} detached", self.id);
    }

    /// Kill the shell and end all peer streams.
    fn teardown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        #[allow(clippy::cast_possible_wrap)]
        let pid = self.pid as i32;
        if pid > 0 {
            unsafe {
                libc::kill(pid, libc::SIGHUP);
                libc::kill(pid, libc::SIGKILL);
            }
        }
        // Dropping the senders closes every peer's stream; the WS handlers
        // answer with a normal (1000) close frame.
        self.peers.lock().expect("peers lock").clear();
        for task in self.tasks.lock().expect("tasks lock").drain(..) {
            task.abort();
        }
    }

    fn idle_for(&self) -> Option<Duration> {
        self.empty_since
            .lock()
            .expect("empty lock")
            .map(|t| t.elapsed())
    }

    fn has_peers(&self) -> bool {
        !self.peers.lock().expect("peers lock").is_empty()
    }
}

/// RAII peer registration; dropping detaches from the session.
pub struct PeerHandle {
    session: Arc<PtySession>,
    peer_id: u64,
    pub rx: mpsc::Receiver<Vec<u8>>,
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        self.session.detach(self.peer_id);
    }
}

/// Owns every terminal session in the sandbox.
///
/// Cloneable — all clones share the same inner map.
#[derive(Clone)]
pub struct PtyMultiplexer {
    sessions: Arc<RwLock<HashMap<String, Arc<PtySession>>>>,
    shell: String,
    workspace_dir: String,
    replay_bytes: usize,
    idle_grace: Duration,
    default_rows: u16,
    default_cols: u16,
}

impl PtyMultiplexer {
    pub fn new(config: &Config) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            shell: config.shell.shell.clone(),
            workspace_dir: config.shell.workspace_dir.clone(),
            replay_bytes: config.terminal.replay_buffer_bytes,
            idle_grace: Duration::from_secs(config.terminal.idle_grace_secs),
            default_rows: config.terminal.default_rows,
            default_cols: config.terminal.default_cols,
        }
    }

    /// Fetch a live session by id, or create one (fresh id when `None`).
    pub async fn get_or_create(&self, id: Option<&str>) -> Result<Arc<PtySession>, ApiError> {
        let id = id
            .map(ToString::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&id) {
            if existing.is_alive() {
                return Ok(Arc::clone(existing));
            }
            existing.teardown();
            sessions.remove(&id);
        }

        let session = self.create_session(&id)?;
        sessions.insert(id, Arc::clone(&session));
        Ok(session)
    }

    fn create_session(&self, id: &str) -> Result<Arc<PtySession>, ApiError> {
        let cwd = if std::path::Path::new(&self.workspace_dir).is_dir() {
            self.workspace_dir.clone()
        } else {
            std::env::var("HOME").unwrap_or_else(|_| "/".to_string())
        };
        let (pty, mut child) =
            pty::Pty::open(&self.shell, &cwd, self.default_rows, self.default_cols)
                .map_err(|e| {
                    ApiError::ProcessStartError(format!("Failed to open PTY shell: {e}"))
                })?;
        let pid = child.id().unwrap_or(0);

        let master_raw: RawFd = pty.master().as_raw_fd();
        let writer_fd: RawFd = unsafe { libc::dup(master_raw) };
        if writer_fd < 0 {
            return Err(ApiError::Internal(format!(
                "dup() failed for PTY writer: {}",
                std::io::Error::last_os_error()
            )));
        }
        let reader_fd: RawFd = unsafe { libc::dup(master_raw) };
        if reader_fd < 0 {
            unsafe {
                libc::close(writer_fd);
            }
            return Err(ApiError::Internal(format!(
                "dup() failed for PTY reader: {}",
                std::io::Error::last_os_error()
            )));
        }

        // SAFETY: we own these descriptors via dup.
        let master_write =
            tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(writer_fd) });
        let master_read =
            tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(reader_fd) });

        let alive = Arc::new(AtomicBool::new(true));

        // input writer task: peer bytes → PTY master
        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(64);
        let input_task = tokio::spawn(async move {
            let mut writer = master_write;
            while let Some(data) = input_rx.recv().await {
                if writer.write_all(&data).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        let session = Arc::new(PtySession {
            id: id.to_string(),
            pty,
            pid,
            geometry: Mutex::new((self.default_rows, self.default_cols)),
            replay: Mutex::new(ReplayBuffer::new(self.replay_bytes)),
            peers: Mutex::new(HashMap::new()),
            next_peer: AtomicU64::new(1),
            empty_since: Mutex::new(Some(Instant::now())),
            alive: Arc::clone(&alive),
            input_tx,
            tasks: Mutex::new(vec![input_task]),
        });

        // output reader task: PTY master → replay + broadcast
        let reader_session = Arc::clone(&session);
        let output_task = tokio::spawn(async move {
            let mut reader = master_read;
            let mut tmp = [0u8; 4096];
            loop {
                match reader.read(&mut tmp).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        reader_session
                            .replay
                            .lock()
                            .expect("replay lock")
                            .push(&tmp[..n]);
                        reader_session.broadcast(&tmp[..n]);
                    }
                }
            }
            debug!("Terminal {}: PTY output closed", reader_session.id);
        });

        // exit watcher: a dead shell flips liveness; the sweep reaps it
        let id_exit = id.to_string();
        let exit_task = tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    info!(
                        "Terminal {id_exit}: shell exited with code {}",
                        status.code().unwrap_or(-1)
                    );
                }
                Err(e) => warn!("Terminal {id_exit}: wait error: {e}"),
            }
            alive.store(false, Ordering::SeqCst);
        });

        session
            .tasks
            .lock()
            .expect("tasks lock")
            .extend([output_task, exit_task]);

        info!(
            "Terminal {} created (pid {pid}, {}x{})",
            id, self.default_rows, self.default_cols
        );
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<PtySession>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Reap sessions that are dead or have been peerless past the grace
    /// period. Returns the ids removed.
    pub async fn sweep(&self) -> Vec<String> {
        let mut sessions = self.sessions.write().await;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, session)| {
                !session.is_alive()
                    || (!session.has_peers()
                        && session.idle_for().is_some_and(|idle| idle >= self.idle_grace))
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(session) = sessions.remove(id) {
                session.teardown();
                info!("Terminal {id} reaped");
            }
        }
        expired
    }

    /// Close every terminal (shutdown). Peer streams end, which the WS layer
    /// turns into normal (1000) close frames.
    pub async fn shutdown_all(&self) {
        let sessions: Vec<(String, Arc<PtySession>)> = {
            let mut map = self.sessions.write().await;
            map.drain().collect()
        };
        for (id, session) in sessions {
            session.teardown();
            info!("Terminal {id} closed (shutdown)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_multiplexer(idle_grace_secs: u64) -> PtyMultiplexer {
        let mut config = Config::default();
        config.terminal.idle_grace_secs = idle_grace_secs;
        config.shell.workspace_dir = "/tmp".to_string();
        PtyMultiplexer::new(&config)
    }

    #[test]
    fn replay_buffer_trims_to_capacity() {
        let mut replay = ReplayBuffer::new(8);
        replay.push(b"0123");
        assert_eq!(replay.snapshot(), b"0123");
        replay.push(b"456789");
        assert_eq!(replay.len(), 8);
        assert_eq!(replay.snapshot(), b"23456789");
        assert!(!replay.is_empty());
    }

    async fn read_until(
        handle: &mut PeerHandle,
        needle: &[u8],
        timeout: Duration,
    ) -> Vec<u8> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut seen = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, handle.rx.recv()).await {
                Ok(Some(chunk)) => {
                    seen.extend_from_slice(&chunk);
                    if seen.windows(needle.len()).any(|w| w == needle) {
                        return seen;
                    }
                }
                Ok(None) => panic!("peer stream closed before {needle:?} appeared"),
                Err(_) => panic!("timed out waiting for {needle:?}; saw {seen:?}"),
            }
        }
    }

    #[tokio::test]
    async fn peers_share_broadcasts_and_late_peers_get_replay() {
        let multiplexer = test_multiplexer(60);
        let session = multiplexer.get_or_create(Some("t1")).await.unwrap();

        let (replay_a, mut peer_a) = session.attach(256);
        assert!(replay_a.is_empty());

        session
            .write_input(b"echo pty-broadcast-check\n".to_vec())
            .await
            .unwrap();
        read_until(&mut peer_a, b"pty-broadcast-check", Duration::from_secs(10)).await;

        // A late peer sees the same output in its replay snapshot.
        let (replay_b, _peer_b) = session.attach(256);
        let replay_text = String::from_utf8_lossy(&replay_b).into_owned();
        assert!(
            replay_text.contains("pty-broadcast-check"),
            "replay missing output: {replay_text:?}"
        );

        multiplexer.shutdown_all().await;
    }

    #[tokio::test]
    async fn resize_applies() {
        let multiplexer = test_multiplexer(60);
        let session = multiplexer.get_or_create(None).await.unwrap();
        session.resize(40, 132).unwrap();
        assert_eq!(*session.geometry.lock().unwrap(), (40, 132));
        multiplexer.shutdown_all().await;
    }

    #[tokio::test]
    async fn idle_sessions_are_reaped_after_grace() {
        let multiplexer = test_multiplexer(0);
        let session = multiplexer.get_or_create(Some("t2")).await.unwrap();

        {
            let (_replay, _peer) = session.attach(16);
            // Attached sessions are never reaped.
            assert!(multiplexer.sweep().await.is_empty());
        }

        // Peer handle dropped; zero grace means the next sweep reaps it.
        let reaped = multiplexer.sweep().await;
        assert_eq!(reaped, vec!["t2".to_string()]);
        assert!(multiplexer.get("t2").await.is_none());
    }
}
