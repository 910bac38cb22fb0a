//! Server records and heartbeats

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Online,
    Offline,
    Starting,
    Stopping,
    NeedsAttention,
    Error,
    OfflineError,
    Unknown,
}

impl ServerStatus {
    /// Server answers requests
    pub fn is_reachable(&self) -> bool {
        matches!(
            self,
            ServerStatus::Online | ServerStatus::NeedsAttention | ServerStatus::Starting | ServerStatus::Stopping
        )
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, ServerStatus::Offline | ServerStatus::OfflineError)
    }
}

/// Registry view of one fragment server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub hostname: String,
    pub port: u16,

    /// Servers sharing a failure domain are assumed to fail together
    pub failure_domain: String,

    pub status: ServerStatus,
    pub free_space: u64,
    pub used_space: u64,
    pub uptime_secs: u64,
    pub warnings: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    pub decommissioned: bool,
}

impl ServerInfo {
    pub fn new(name: &str, hostname: &str, port: u16, failure_domain: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            hostname: hostname.to_string(),
            port,
            failure_domain: failure_domain.unwrap_or(hostname).to_string(),
            status: ServerStatus::Unknown,
            free_space: 0,
            used_space: 0,
            uptime_secs: 0,
            warnings: 0,
            errors: 0,
            last_error: None,
            last_heartbeat: None,
            registered_at: Utc::now(),
            decommissioned: false,
        }
    }

    /// Eligible to receive new fragments
    pub fn accepts_fragments(&self) -> bool {
        self.status == ServerStatus::Online && !self.decommissioned
    }

    pub fn total_space(&self) -> u64 {
        self.free_space + self.used_space
    }
}

/// Liveness report sent by a fragment server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub name: String,
    pub hostname: String,
    pub port: u16,

    /// Defaults to the hostname
    #[serde(default)]
    pub failure_domain: Option<String>,

    /// Self-reported state (Starting, Online, Stopping)
    pub status: ServerStatus,

    pub free_space: u64,
    pub used_space: u64,
    pub uptime_secs: u64,
}

impl Heartbeat {
    pub fn online(name: &str, hostname: &str, free_space: u64) -> Self {
        Self {
            name: name.to_string(),
            hostname: hostname.to_string(),
            port: 0,
            failure_domain: None,
            status: ServerStatus::Online,
            free_space,
            used_space: 0,
            uptime_secs: 0,
        }
    }

    pub fn in_domain(mut self, domain: &str) -> Self {
        self.failure_domain = Some(domain.to_string());
        self
    }
}
