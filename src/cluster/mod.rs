//! Cluster/Server Registry - fragment servers, liveness, statistics, logs

mod log;
mod registry;
mod server;
mod stats;

pub use log::{ClusterLog, LogEntry, LogLevel};
pub use registry::{RegistryConfig, ServerRegistry, ServerSeed};
pub use server::{Heartbeat, ServerInfo, ServerStatus};
pub use stats::{Alert, AlertSeverity, ClusterSnapshot, ClusterStats, HistoricalPoint, RangeType, StatKind};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Unknown server: {0}")]
    UnknownServer(String),

    #[error("Server {0} is decommissioned")]
    Decommissioned(String),

    #[error("Server {server} still holds {remaining} fragment(s)")]
    EvacuationIncomplete { server: String, remaining: usize },

    #[error("Invalid range: {0}")]
    InvalidRange(String),
}
