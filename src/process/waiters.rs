//! Readiness predicates: `waitForLog` and `waitForPort`.
//!
//! Both are transient waits with hard timeouts. A process that reaches a
//! terminal status first fails the wait with a "process exited" error rather
//! than letting the caller burn the whole timeout.

use std::time::Duration;

use tokio::net::TcpStream;

use super::{OutputChunk, ProcessManager};
use crate::error::ApiError;
use crate::process::handle::StreamKind;

/// Literal-or-regex line matcher.
///
/// The literal interpretation wins: a pattern like `Ready (stderr)` matches
/// that exact substring even though as a regex the parentheses would form a
/// group. Patterns that fail to compile as regex degrade to literal-only.
pub struct LogMatcher {
    literal: String,
    regex: Option<regex::Regex>,
}

impl LogMatcher {
    pub fn new(pattern: &str) -> Self {
        Self {
            literal: pattern.to_string(),
            regex: regex::Regex::new(pattern).ok(),
        }
    }

    pub fn matches(&self, line: &str) -> bool {
        line.contains(&self.literal)
            || self.regex.as_ref().is_some_and(|re| re.is_match(line))
    }
}

/// Per-stream partial-line assembly for chunked output.
#[derive(Default)]
struct LineAssembler {
    stdout_carry: String,
    stderr_carry: String,
}

impl LineAssembler {
    /// Feed a chunk; returns the complete lines it closed.
    fn feed(&mut self, chunk: &OutputChunk) -> Vec<String> {
        let carry = match chunk.stream {
            StreamKind::Stdout => &mut self.stdout_carry,
            StreamKind::Stderr => &mut self.stderr_carry,
        };
        carry.push_str(&chunk.data);
        let mut lines = Vec::new();
        while let Some(pos) = carry.find('\n') {
            let line: String = carry.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }

    /// Remaining unterminated tails (checked when the process ends).
    fn tails(&self) -> [&str; 2] {
        [self.stdout_carry.as_str(), self.stderr_carry.as_str()]
    }
}

impl ProcessManager {
    /// Wait until a line matching `pattern` appears on the process's stdout
    /// **or** stderr.
    ///
    /// Output already buffered before the call is scanned first, so a marker
    /// printed before the wait began still matches. Resolves with the
    /// matching line; fails with `PROCESS_EXITED_BEFORE_READY` when the
    /// process ends first, or `TIMEOUT`.
    pub async fn wait_for_log(
        &self,
        process_id: &str,
        pattern: &str,
        timeout: Duration,
    ) -> Result<String, ApiError> {
        let record = self.get(process_id).await?;
        let matcher = LogMatcher::new(pattern);

        // Subscribe before scanning so no chunk can fall between the two.
        let mut output = record.subscribe_output();
        let mut status = record.subscribe_status();

        let (stdout, stderr) = record.buffers();
        for line in stdout.lines().chain(stderr.lines()) {
            if matcher.matches(line) {
                return Ok(line.to_string());
            }
        }
        if record.status().is_terminal() {
            return Err(ApiError::ProcessExitedBeforeReady(format!(
                "Process {process_id} exited before log pattern {pattern:?} appeared"
            )));
        }

        let mut assembler = LineAssembler::default();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            tokio::select! {
                chunk = output.rx.recv() => {
                    let Some(chunk) = chunk else {
                        return Err(ApiError::Internal(
                            "Output listener channel closed".to_string(),
                        ));
                    };
                    for line in assembler.feed(&chunk) {
                        if matcher.matches(&line) {
                            return Ok(line);
                        }
                    }
                }
                terminal = status.rx.recv() => {
                    if terminal.is_some_and(|s| s.is_terminal()) {
                        // Drain chunks that raced the status event.
                        while let Ok(chunk) = output.rx.try_recv() {
                            for line in assembler.feed(&chunk) {
                                if matcher.matches(&line) {
                                    return Ok(line);
                                }
                            }
                        }
                        for tail in assembler.tails() {
                            if !tail.is_empty() && matcher.matches(tail) {
                                return Ok(tail.to_string());
                            }
                        }
                        return Err(ApiError::ProcessExitedBeforeReady(format!(
                            "Process {process_id} exited before log pattern {pattern:?} appeared"
                        )));
                    }
                }
                () = tokio::time::sleep_until(deadline) => {
                    return Err(ApiError::Timeout(format!(
                        "Log pattern {pattern:?} did not appear within {} ms",
                        timeout.as_millis()
                    )));
                }
            }
        }
    }

    /// Wait until `127.0.0.1:<port>` accepts a TCP connection.
    ///
    /// Polls at the configured cadence; fails with
    /// `PROCESS_EXITED_BEFORE_READY` when the process ends first, or
    /// `TIMEOUT`.
    pub async fn wait_for_port(
        &self,
        process_id: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<u16, ApiError> {
        let record = self.get(process_id).await?;
        let deadline = tokio::time::Instant::now() + timeout;
        let interval = self.port_poll_interval();

        loop {
            if record.status().is_terminal() {
                return Err(ApiError::ProcessExitedBeforeReady(format!(
                    "Process {process_id} exited before port {port} opened"
                )));
            }
            let probe = tokio::time::timeout(
                interval,
                TcpStream::connect(("127.0.0.1", port)),
            )
            .await;
            if matches!(probe, Ok(Ok(_))) {
                return Ok(port);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ApiError::Timeout(format!(
                    "Port {port} did not open within {} ms",
                    timeout.as_millis()
                )));
            }
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::process::StartOptions;
    use std::collections::HashMap;

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

    #[test]
    fn matcher_prefers_literal_interpretation() {
        let matcher = LogMatcher::new("Ready (stderr)");
        assert!(matcher.matches("service says: Ready (stderr) now"));
        // Regex-only patterns still work.
        let matcher = LogMatcher::new(r"listening on port \d+");
        assert!(matcher.matches("listening on port 8080"));
        assert!(!matcher.matches("listening on port none"));
    }

    #[test]
    fn assembler_joins_split_lines() {
        let mut assembler = LineAssembler::default();
        let lines = assembler.feed(&OutputChunk {
            stream: StreamKind::Stdout,
            data: "par".to_string(),
        });
        assert!(lines.is_empty());
        let lines = assembler.feed(&OutputChunk {
            stream: StreamKind::Stdout,
            data: "tial line\nnext ".to_string(),
        });
        assert_eq!(lines, vec!["partial line"]);
        // Streams carry independently.
        let lines = assembler.feed(&OutputChunk {
            stream: StreamKind::Stderr,
            data: "err line\n".to_string(),
        });
        assert_eq!(lines, vec!["err line"]);
    }

    #[tokio::test]
    async fn wait_for_log_matches_stderr() {
        let manager = test_manager();
        let record = manager
            .start_spawned(start_opts(
                "sleep 0.3; echo 'Ready (stderr)' >&2; sleep 2",
            ))
            .await
            .unwrap();

        let line = manager
            .wait_for_log(&record.id, "Ready (stderr)", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(line.contains("Ready (stderr)"));

        manager.kill(&record.id).await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_log_scans_existing_buffer() {
        let manager = test_manager();
        let record = manager
            .start_spawned(start_opts("echo already-there; sleep 2"))
            .await
            .unwrap();

        // Let the output land in the buffer before we start waiting.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let line = manager
            .wait_for_log(&record.id, "already-there", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(line, "already-there");

        manager.kill(&record.id).await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_log_rejects_on_exit_not_timeout() {
        let manager = test_manager();
        let record = manager.start_spawned(start_opts("true")).await.unwrap();

        let err = manager
            .wait_for_log(&record.id, "never-printed", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PROCESS_EXITED_BEFORE_READY");
    }

    #[tokio::test]
    async fn wait_for_log_times_out() {
        let manager = test_manager();
        let record = manager
            .start_spawned(start_opts("sleep 5"))
            .await
            .unwrap();

        let err = manager
            .wait_for_log(&record.id, "never", Duration::from_millis(400))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TIMEOUT");

        manager.kill(&record.id).await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_port_connects() {
        let manager = test_manager();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let record = manager.start_spawned(start_opts("sleep 5")).await.unwrap();
        let got = manager
            .wait_for_port(&record.id, port, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(got, port);

        manager.kill(&record.id).await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_port_rejects_when_process_dies() {
        let manager = test_manager();
        let record = manager.start_spawned(start_opts("true")).await.unwrap();
        // An unused ephemeral-range port that nothing listens on.
        let err = manager
            .wait_for_port(&record.id, 59999, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PROCESS_EXITED_BEFORE_READY");
    }
}
