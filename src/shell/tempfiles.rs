//! Per-command temp files and the orphan sweeper.
//!
//! Every command owns four files under the driver directory: the script to
//! source plus stdout/stderr/exit captures. Files are deleted on command
//! completion; the periodic sweeper only reclaims files that are older than
//! the configured age **and** whose command id is no longer in-flight.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

/// Directory under which all command temp files live.
pub const TEMP_DIR: &str = "/tmp/sandboxd-cmd";

/// The temp-file quartet for one in-flight command.
#[derive(Debug, Clone)]
pub struct CommandFiles {
    pub script: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub exit: PathBuf,
}

impl CommandFiles {
    /// Paths for command `id` under `dir`.
    pub fn new(dir: &Path, id: &str) -> Self {
        Self {
            script: dir.join(format!("cmd-{id}.sh")),
            stdout: dir.join(format!("cmd-{id}.out")),
            stderr: dir.join(format!("cmd-{id}.err")),
            exit: dir.join(format!("cmd-{id}.exit")),
        }
    }

    /// Create the script file with the command body and empty capture files.
    pub async fn create(&self, command: &str) -> std::io::Result<()> {
        if let Some(parent) = self.script.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.script, command).await?;
        tokio::fs::write(&self.stdout, b"").await?;
        tokio::fs::write(&self.stderr, b"").await?;
        tokio::fs::write(&self.exit, b"").await?;
        Ok(())
    }

    /// Remove all four files. Missing files are fine.
    pub async fn cleanup(&self) {
        for path in [&self.script, &self.stdout, &self.stderr, &self.exit] {
            if let Err(e) = tokio::fs::remove_file(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!("Failed to remove temp file {}: {e}", path.display());
                }
            }
        }
    }
}

/// Extract the command id from a temp file name (`cmd-<id>.<ext>`).
fn command_id_of(file_name: &str) -> Option<&str> {
    let rest = file_name.strip_prefix("cmd-")?;
    let dot = rest.rfind('.')?;
    Some(&rest[..dot])
}

/// Delete temp files older than `max_age` whose id is not in `in_flight`.
///
/// Returns the number of files removed.
pub async fn sweep(dir: &Path, max_age: Duration, in_flight: &HashSet<String>) -> usize {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    let now = SystemTime::now();
    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(id) = command_id_of(name) else {
            continue;
        };
        if in_flight.contains(id) {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        let age = meta
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => warn!("Temp sweep failed on {}: {e}", entry.path().display()),
        }
    }
    if removed > 0 {
        debug!("Temp sweep removed {removed} orphaned file(s)");
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_id_parsing() {
        assert_eq!(command_id_of("cmd-abc123.out"), Some("abc123"));
        assert_eq!(command_id_of("cmd-abc123.sh"), Some("abc123"));
        assert_eq!(command_id_of("unrelated.txt"), None);
        assert_eq!(command_id_of("cmd-noext"), None);
    }

    #[tokio::test]
    async fn create_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let files = CommandFiles::new(dir.path(), "deadbeef");
        files.create("echo hello").await.unwrap();
        assert_eq!(
            tokio::fs::read_to_string(&files.script).await.unwrap(),
            "echo hello"
        );
        assert!(files.stdout.exists());
        assert!(files.exit.exists());

        files.cleanup().await;
        assert!(!files.script.exists());
        assert!(!files.stdout.exists());
        // Double cleanup is harmless
        files.cleanup().await;
    }

    #[tokio::test]
    async fn sweep_skips_in_flight_and_young() {
        let dir = tempfile::tempdir().unwrap();
        let old = CommandFiles::new(dir.path(), "oldcmd");
        old.create("true").await.unwrap();
        let live = CommandFiles::new(dir.path(), "livecmd");
        live.create("true").await.unwrap();

        let mut in_flight = HashSet::new();
        in_flight.insert("livecmd".to_string());

        // Everything is younger than a minute, nothing is removed.
        let removed = sweep(dir.path(), Duration::from_secs(60), &in_flight).await;
        assert_eq!(removed, 0);

        // With a zero max-age only the non-in-flight quartet goes.
        let removed = sweep(dir.path(), Duration::ZERO, &in_flight).await;
        assert_eq!(removed, 4);
        assert!(!old.script.exists());
        assert!(live.script.exists());
    }
}
