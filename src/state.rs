//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::bucket::BucketMounter;
use crate::code::CodeContextRegistry;
use crate::config::Config;
use crate::ports::proxy::ProxyClient;
use crate::ports::PortRegistry;
use crate::process::ProcessManager;
use crate::services::HelperServices;
use crate::sessions::SessionRegistry;
use crate::terminal::PtyMultiplexer;

/// Shared application state for the sandboxd server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime reporting).
    pub start_time: Instant,
    /// Shell sessions with per-session execution mutexes.
    pub sessions: SessionRegistry,
    /// Shared background-process table.
    pub processes: ProcessManager,
    /// Code-interpreter contexts and their language workers.
    pub code: CodeContextRegistry,
    /// Declared externally-reachable ports.
    pub ports: PortRegistry,
    /// Interactive PTY terminals.
    pub terminals: PtyMultiplexer,
    /// Well-known helper services for `/api/init` and `/ws/{name}`.
    pub helpers: HelperServices,
    /// Bucket mounting via FUSE.
    pub buckets: BucketMounter,
    /// HTTP client used by the port proxy.
    pub proxy_client: ProxyClient,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let sessions = SessionRegistry::new(&config);
        let processes = ProcessManager::new(&config);
        let code = CodeContextRegistry::new(&config);
        let ports = PortRegistry::new(&config);
        let terminals = PtyMultiplexer::new(&config);
        let helpers = HelperServices::new(config.helpers.clone());
        let buckets = BucketMounter::new(&config);
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            sessions,
            processes,
            code,
            ports,
            terminals,
            helpers,
            buckets,
            proxy_client: crate::ports::proxy::new_client(),
        }
    }
}
