//! Exposed-port registry.
//!
//! Exposing a port is the declaration that makes it reachable through the
//! proxy. Validation covers the numeric range, a reserved set (well-known
//! system ports, common databases, and this server's own control port), and
//! active-duplicate conflicts. Unexposed records go inactive and are
//! reclaimed by a periodic sweep.

pub mod proxy;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::Config;
use crate::error::{now_ms, ApiError};

/// Ports that can never be exposed, regardless of the control port.
const RESERVED_PORTS: &[u16] = &[
    22,    // ssh
    25,    // smtp
    53,    // dns
    80,    // http
    443,   // https
    2375,  // docker
    2376,  // docker tls
    3306,  // mysql
    5432,  // postgres
    6379,  // redis
    6443,  // kubernetes api
    8080,  // common alt-http
    27017, // mongodb
];

/// Exposure state of a port record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortStatus {
    Active,
    Inactive,
}

/// One exposed-port record.
#[derive(Debug, Clone, Serialize)]
pub struct ExposedPort {
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "exposedAt")]
    pub exposed_at: u64,
    pub status: PortStatus,
    /// When the record went inactive (sweep input).
    #[serde(skip)]
    deactivated_at: Option<u64>,
}

/// Tracks which container ports are declared externally reachable.
///
/// Cloneable — all clones share the same inner map.
#[derive(Clone)]
pub struct PortRegistry {
    ports: Arc<RwLock<HashMap<u16, ExposedPort>>>,
    control_port: u16,
    inactive_max_age: Duration,
}

impl PortRegistry {
    pub fn new(config: &Config) -> Self {
        Self {
            ports: Arc::new(RwLock::new(HashMap::new())),
            control_port: config.control_port(),
            inactive_max_age: Duration::from_secs(config.ports.inactive_max_age_secs),
        }
    }

    /// Validate a port number against range and the reserved set.
    pub fn validate(&self, port: u16) -> Result<(), ApiError> {
        if port < 1024 {
            return Err(ApiError::InvalidPort(format!(
                "Port {port} is outside the user range (1024-65535)"
            )));
        }
        if RESERVED_PORTS.contains(&port) || port == self.control_port {
            return Err(ApiError::InvalidPort(format!("Port {port} is reserved")));
        }
        Ok(())
    }

    /// Expose a port. Conflicts when an active record already exists;
    /// re-exposing an inactive port reactivates it.
    pub async fn expose(&self, port: u16, name: Option<String>) -> Result<ExposedPort, ApiError> {
        self.validate(port)?;
        let mut ports = self.ports.write().await;
        if ports
            .get(&port)
            .is_some_and(|p| p.status == PortStatus::Active)
        {
            return Err(ApiError::PortAlreadyExposed(port));
        }
        let record = ExposedPort {
            port,
            name,
            exposed_at: now_ms(),
            status: PortStatus::Active,
            deactivated_at: None,
        };
        ports.insert(port, record.clone());
        info!("Port {port} exposed");
        Ok(record)
    }

    /// Mark a port inactive. The record lingers until the sweep reclaims it.
    pub async fn unexpose(&self, port: u16) -> Result<(), ApiError> {
        let mut ports = self.ports.write().await;
        match ports.get_mut(&port) {
            Some(record) => {
                record.status = PortStatus::Inactive;
                record.deactivated_at = Some(now_ms());
                info!("Port {port} unexposed");
                Ok(())
            }
            None => Err(ApiError::PortNotFound(port)),
        }
    }

    /// Whether requests may be proxied to this port right now.
    pub async fn is_active(&self, port: u16) -> bool {
        self.ports
            .read()
            .await
            .get(&port)
            .is_some_and(|p| p.status == PortStatus::Active)
    }

    pub async fn list(&self) -> Vec<ExposedPort> {
        let ports = self.ports.read().await;
        let mut items: Vec<ExposedPort> = ports.values().cloned().collect();
        items.sort_by_key(|p| p.port);
        items
    }

    /// Reclaim inactive records older than the configured age.
    pub async fn sweep(&self) -> usize {
        let cutoff = now_ms().saturating_sub(self.inactive_max_age.as_millis() as u64);
        let mut ports = self.ports.write().await;
        let before = ports.len();
        ports.retain(|_, record| {
            !(record.status == PortStatus::Inactive
                && record.deactivated_at.is_some_and(|t| t < cutoff))
        });
        let removed = before - ports.len();
        if removed > 0 {
            info!("Port sweep reclaimed {removed} inactive record(s)");
        }
        removed
    }

    #[cfg(test)]
    async fn backdate_deactivation(&self, port: u16, ms_ago: u64) {
        let mut ports = self.ports.write().await;
        if let Some(record) = ports.get_mut(&port) {
            record.deactivated_at = Some(now_ms().saturating_sub(ms_ago));
        }
    }
}
