//! Well-known in-container helper services.
//!
//! `POST /api/init` starts the services listed in the `[[helpers]]` config
//! through the [`ProcessManager`], idempotently: a helper whose process is
//! still running is left alone. `GET /ws/{name}` resolves a helper's local WS
//! port for the bridge in `crate::ws`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::config::HelperConfig;
use crate::error::ApiError;
use crate::process::{ProcessManager, ProcessStatus, StartOptions};

/// Tracks helper-service processes by helper name.
#[derive(Clone)]
pub struct HelperServices {
    helpers: Vec<HelperConfig>,
    /// helper name → process id of its last start.
    running: Arc<Mutex<HashMap<String, String>>>,
}

impl HelperServices {
    pub fn new(helpers: Vec<HelperConfig>) -> Self {
        Self {
            helpers,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start every configured helper that is not already running. Returns the
    /// names started by this call.
    pub async fn init(&self, processes: &ProcessManager) -> Result<Vec<String>, ApiError> {
        let mut running = self.running.lock().await;
        let mut started = Vec::new();

        for helper in &self.helpers {
            if let Some(process_id) = running.get(&helper.name) {
                if let Ok(record) = processes.get(process_id).await {
                    if !record.status().is_terminal() {
                        continue;
                    }
                }
            }

            let record = processes
                .start_spawned(StartOptions {
                    command: helper.command.clone(),
                    cwd: None,
                    env: HashMap::new(),
                    session_id: None,
                })
                .await?;
            if record.status() == ProcessStatus::Error {
                return Err(ApiError::ProcessStartError(format!(
                    "Helper {} failed to start",
                    helper.name
                )));
            }
            running.insert(helper.name.clone(), record.id.clone());
            info!("Helper {} started (process {})", helper.name, record.id);
            started.push(helper.name.clone());
        }

        Ok(started)
    }

    /// Local WS port for a named helper.
    pub fn port_of(&self, name: &str) -> Option<u16> {
        self.helpers.iter().find(|h| h.name == name).map(|h| h.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn helper(name: &str, command: &str, port: u16) -> HelperConfig {
        HelperConfig {
            name: name.to_string(),
            command: command.to_string(),
            port,
        }
    }

    #[test]
    fn port_lookup() {
        let services = HelperServices::new(vec![helper("inspector", "sleep 60", 9229)]);
        assert_eq!(services.port_of("inspector"), Some(9229));
        assert_eq!(services.port_of("nope"), None);
    }

    #[tokio::test]
    async fn init_is_idempotent_for_running_helpers() {
        let manager = ProcessManager::new(&Config::default());
        let services = HelperServices::new(vec![helper("svc", "sleep 30", 9000)]);

        let first = services.init(&manager).await.unwrap();
        assert_eq!(first, vec!["svc".to_string()]);

        let second = services.init(&manager).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(manager.list(None, None).await.len(), 1);

        manager.kill_all().await;
    }

    #[tokio::test]
    async fn init_restarts_dead_helpers() {
        let manager = ProcessManager::new(&Config::default());
        let services = HelperServices::new(vec![helper("svc", "true", 9000)]);

        services.init(&manager).await.unwrap();
        // Let the one-shot helper exit.
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;

        let restarted = services.init(&manager).await.unwrap();
        assert_eq!(restarted, vec!["svc".to_string()]);

        manager.kill_all().await;
    }
}
