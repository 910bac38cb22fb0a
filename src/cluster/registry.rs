//! Server registry: registration by heartbeat, liveness sweeps, error counters

use super::log::ClusterLog;
use super::server::{Heartbeat, ServerInfo, ServerStatus};
use super::ClusterError;
use crate::metadata::MetadataStore;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A server known before it first reports in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSeed {
    pub name: String,
    pub hostname: String,
    pub port: u16,
    #[serde(default)]
    pub failure_domain: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Silence after which a server is considered offline
    pub heartbeat_timeout_secs: u64,

    /// How often the monitor sweeps for silent servers
    pub sweep_interval_secs: u64,

    /// Entries kept by the cluster log
    pub log_capacity: usize,

    pub bootstrap: Vec<ServerSeed>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 30,
            sweep_interval_secs: 10,
            log_capacity: 10_000,
            bootstrap: Vec::new(),
        }
    }
}

pub struct ServerRegistry {
    servers: DashMap<String, ServerInfo>,
    config: RegistryConfig,
    log: Arc<ClusterLog>,
}

impl ServerRegistry {
    pub fn new(config: RegistryConfig, log: Arc<ClusterLog>) -> Self {
        let servers = DashMap::new();
        for seed in &config.bootstrap {
            servers.insert(
                seed.name.clone(),
                ServerInfo::new(&seed.name, &seed.hostname, seed.port, seed.failure_domain.as_deref()),
            );
        }

        Self { servers, config, log }
    }

    pub fn log(&self) -> &Arc<ClusterLog> {
        &self.log
    }

    /// Record a heartbeat, registering the server on first contact
    pub fn heartbeat(&self, hb: Heartbeat) -> Result<ServerStatus, ClusterError> {
        let now = Utc::now();
        let mut server = self
            .servers
            .entry(hb.name.clone())
            .or_insert_with(|| ServerInfo::new(&hb.name, &hb.hostname, hb.port, hb.failure_domain.as_deref()));

        if server.decommissioned {
            return Err(ClusterError::Decommissioned(hb.name));
        }

        let previous = server.status;
        let first_contact = server.last_heartbeat.is_none();

        server.hostname = hb.hostname;
        server.port = hb.port;
        if let Some(domain) = hb.failure_domain {
            server.failure_domain = domain;
        }
        server.free_space = hb.free_space;
        server.used_space = hb.used_space;
        server.uptime_secs = hb.uptime_secs;
        server.last_heartbeat = Some(now);

        // Attention flags survive heartbeats until cleared
        let status = match hb.status {
            ServerStatus::Online if previous == ServerStatus::NeedsAttention => ServerStatus::NeedsAttention,
            reported => reported,
        };
        server.status = status;
        drop(server);

        if first_contact {
            info!(server = %hb.name, ?status, "Server registered");
            self.log.info(Some(&hb.name), "Server registered");
        } else if previous != status {
            if previous.is_offline() {
                info!(server = %hb.name, ?status, "Server recovered");
                self.log.info(Some(&hb.name), "Server recovered");
            } else {
                debug!(server = %hb.name, ?previous, ?status, "Server status changed");
            }
        }

        Ok(status)
    }

    /// Mark servers silent for longer than the heartbeat timeout as offline
    ///
    /// Returns the names that transitioned.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = ChronoDuration::seconds(self.config.heartbeat_timeout_secs as i64);
        let mut transitioned = Vec::new();

        for mut server in self.servers.iter_mut() {
            if server.decommissioned || server.status.is_offline() {
                continue;
            }
            let last_seen = server.last_heartbeat.unwrap_or(server.registered_at);
            if now - last_seen <= timeout {
                continue;
            }

            server.status = if server.status == ServerStatus::Error {
                ServerStatus::OfflineError
            } else {
                ServerStatus::Offline
            };
            transitioned.push(server.name.clone());
        }

        transitioned.sort();
        for name in &transitioned {
            warn!(server = %name, "Server missed heartbeats, marking offline");
            self.log.warning(Some(name), "Server missed heartbeats and is offline");
        }
        transitioned
    }

    /// Sweep on a fixed cadence until `shutdown` flips to true
    pub fn spawn_monitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.sweep(Utc::now());
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Registry monitor shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }

    pub fn set_status(&self, name: &str, status: ServerStatus) -> Result<(), ClusterError> {
        let mut server = self
            .servers
            .get_mut(name)
            .ok_or_else(|| ClusterError::UnknownServer(name.to_string()))?;
        let previous = server.status;
        server.status = status;
        drop(server);

        if previous != status {
            info!(server = name, ?previous, ?status, "Server status set");
            self.log.info(Some(name), format!("Status changed to {:?}", status));
        }
        Ok(())
    }

    /// Count a failed operation against a server
    pub fn record_error(&self, name: &str, message: &str) {
        if let Some(mut server) = self.servers.get_mut(name) {
            server.errors += 1;
            server.last_error = Some(message.to_string());
            if server.status == ServerStatus::Online {
                server.status = ServerStatus::NeedsAttention;
            }
        }
        self.log.error(Some(name), message);
    }

    pub fn record_warning(&self, name: &str, message: &str) {
        if let Some(mut server) = self.servers.get_mut(name) {
            server.warnings += 1;
        }
        self.log.warning(Some(name), message);
    }

    /// Acknowledge a server's errors and warnings
    pub fn clear_errors(&self, name: &str) -> Result<(), ClusterError> {
        let mut server = self
            .servers
            .get_mut(name)
            .ok_or_else(|| ClusterError::UnknownServer(name.to_string()))?;
        server.errors = 0;
        server.warnings = 0;
        server.last_error = None;
        if server.status == ServerStatus::NeedsAttention {
            server.status = ServerStatus::Online;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<ServerInfo, ClusterError> {
        self.servers
            .get(name)
            .map(|s| s.clone())
            .ok_or_else(|| ClusterError::UnknownServer(name.to_string()))
    }

    /// All servers, decommissioned included, sorted by name
    pub fn list(&self) -> Vec<ServerInfo> {
        let mut servers: Vec<ServerInfo> = self.servers.iter().map(|s| s.clone()).collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        servers
    }

    /// Servers eligible for new fragments
    pub fn live_servers(&self) -> Vec<ServerInfo> {
        self.list().into_iter().filter(|s| s.accepts_fragments()).collect()
    }

    pub fn is_reachable(&self, name: &str) -> bool {
        self.servers
            .get(name)
            .map(|s| s.status.is_reachable() && !s.decommissioned)
            .unwrap_or(false)
    }

    /// Retire a server once metadata shows nothing left on it
    pub fn decommission(&self, name: &str, metadata: &MetadataStore) -> Result<ServerInfo, ClusterError> {
        if !self.servers.contains_key(name) {
            return Err(ClusterError::UnknownServer(name.to_string()));
        }

        let remaining = metadata.fragments_on_server(name).len();
        if remaining > 0 {
            return Err(ClusterError::EvacuationIncomplete {
                server: name.to_string(),
                remaining,
            });
        }

        let mut server = self
            .servers
            .get_mut(name)
            .ok_or_else(|| ClusterError::UnknownServer(name.to_string()))?;
        server.decommissioned = true;
        server.status = ServerStatus::Offline;
        let info = server.clone();
        drop(server);

        info!(server = name, "Server decommissioned");
        self.log.info(Some(name), "Server decommissioned");
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ServerRegistry {
        ServerRegistry::new(RegistryConfig::default(), Arc::new(ClusterLog::new(100)))
    }

    #[test]
    fn test_first_heartbeat_registers() {
        let registry = registry();
        let status = registry.heartbeat(Heartbeat::online("srv-1", "host-a", 1_000)).unwrap();

        assert_eq!(status, ServerStatus::Online);
        let server = registry.get("srv-1").unwrap();
        assert_eq!(server.failure_domain, "host-a");
        assert_eq!(server.free_space, 1_000);
        assert_eq!(registry.live_servers().len(), 1);
    }

    #[test]
    fn test_sweep_marks_silent_servers_offline_and_heartbeat_recovers() {
        let registry = registry();
        registry.heartbeat(Heartbeat::online("srv-1", "host-a", 1_000)).unwrap();
        registry.heartbeat(Heartbeat::online("srv-2", "host-b", 1_000)).unwrap();

        let later = Utc::now() + ChronoDuration::seconds(120);
        assert_eq!(registry.sweep(later), vec!["srv-1".to_string(), "srv-2".to_string()]);
        assert_eq!(registry.get("srv-1").unwrap().status, ServerStatus::Offline);
        assert!(registry.live_servers().is_empty());
        assert!(registry.sweep(later).is_empty());

        registry.heartbeat(Heartbeat::online("srv-1", "host-a", 1_000)).unwrap();
        assert_eq!(registry.get("srv-1").unwrap().status, ServerStatus::Online);
    }

    #[test]
    fn test_errors_flag_server_until_cleared() {
        let registry = registry();
        registry.heartbeat(Heartbeat::online("srv-1", "host-a", 1_000)).unwrap();

        registry.record_error("srv-1", "timed out");
        let server = registry.get("srv-1").unwrap();
        assert_eq!(server.errors, 1);
        assert_eq!(server.status, ServerStatus::NeedsAttention);

        registry.heartbeat(Heartbeat::online("srv-1", "host-a", 1_000)).unwrap();
        assert_eq!(registry.get("srv-1").unwrap().status, ServerStatus::NeedsAttention);

        registry.clear_errors("srv-1").unwrap();
        assert_eq!(registry.get("srv-1").unwrap().status, ServerStatus::Online);
        assert_eq!(registry.log().recent(10).iter().filter(|e| e.message == "timed out").count(), 1);
    }

    #[test]
    fn test_bootstrap_servers_start_unknown() {
        let config = RegistryConfig {
            bootstrap: vec![ServerSeed {
                name: "srv-1".into(),
                hostname: "host-a".into(),
                port: 7000,
                failure_domain: Some("rack-1".into()),
            }],
            ..RegistryConfig::default()
        };
        let registry = ServerRegistry::new(config, Arc::new(ClusterLog::default()));

        let server = registry.get("srv-1").unwrap();
        assert_eq!(server.status, ServerStatus::Unknown);
        assert_eq!(server.failure_domain, "rack-1");
        assert!(registry.live_servers().is_empty());
    }

    #[test]
    fn test_decommission_requires_empty_server() {
        let registry = registry();
        registry.heartbeat(Heartbeat::online("srv-1", "host-a", 1_000)).unwrap();

        let metadata = MetadataStore::new();
        let server = registry.decommission("srv-1", &metadata).unwrap();
        assert!(server.decommissioned);
        assert!(matches!(
            registry.heartbeat(Heartbeat::online("srv-1", "host-a", 1_000)),
            Err(ClusterError::Decommissioned(_))
        ));
        assert!(matches!(
            registry.decommission("srv-9", &metadata),
            Err(ClusterError::UnknownServer(_))
        ));
    }
}
