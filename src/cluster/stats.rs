//! Cluster statistics: current totals, sampled history, alerts

use super::registry::ServerRegistry;
use super::server::ServerStatus;
use super::ClusterError;
use crate::metadata::MetadataStore;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Free space below this share of a server's total raises an alert
const LOW_SPACE_RATIO: f64 = 0.1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub taken_at: DateTime<Utc>,
    pub num_of_files: u64,
    pub num_of_folders: u64,

    /// Bytes in parity fragments
    pub replica_used: u64,

    /// Bytes in data fragments
    pub non_replica_used: u64,

    pub logical_bytes: u64,
    pub servers_total: usize,
    pub servers_online: usize,
    pub free_space: u64,
    pub used_space: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatKind {
    NumOfFiles,
    ReplicaUsed,
    NonReplicaUsed,
}

/// Bucket width of a historical view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeType {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl RangeType {
    fn bucket(&self) -> ChronoDuration {
        match self {
            RangeType::Hourly => ChronoDuration::hours(1),
            RangeType::Daily => ChronoDuration::days(1),
            RangeType::Weekly => ChronoDuration::days(7),
            RangeType::Monthly => ChronoDuration::days(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalPoint {
    pub bucket_start: DateTime<Utc>,
    pub value: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub server_name: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    taken_at: DateTime<Utc>,
    num_of_files: u64,
    replica_used: u64,
    non_replica_used: u64,
}

impl Sample {
    fn value(&self, kind: StatKind) -> u64 {
        match kind {
            StatKind::NumOfFiles => self.num_of_files,
            StatKind::ReplicaUsed => self.replica_used,
            StatKind::NonReplicaUsed => self.non_replica_used,
        }
    }
}

pub struct ClusterStats {
    metadata: Arc<MetadataStore>,
    registry: Arc<ServerRegistry>,
    samples: Mutex<VecDeque<Sample>>,
    max_samples: usize,
}

impl ClusterStats {
    pub fn new(metadata: Arc<MetadataStore>, registry: Arc<ServerRegistry>, max_samples: usize) -> Self {
        Self {
            metadata,
            registry,
            samples: Mutex::new(VecDeque::new()),
            max_samples: max_samples.max(1),
        }
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        let usage = self.metadata.usage();
        let servers: Vec<_> = self.registry.list().into_iter().filter(|s| !s.decommissioned).collect();

        ClusterSnapshot {
            taken_at: Utc::now(),
            num_of_files: usage.files,
            num_of_folders: usage.folders,
            replica_used: usage.parity_bytes,
            non_replica_used: usage.data_bytes,
            logical_bytes: usage.logical_bytes,
            servers_total: servers.len(),
            servers_online: servers.iter().filter(|s| s.status.is_reachable()).count(),
            free_space: servers.iter().map(|s| s.free_space).sum(),
            used_space: servers.iter().map(|s| s.used_space).sum(),
        }
    }

    /// Take a snapshot and append it to the history
    pub fn record_sample(&self) -> ClusterSnapshot {
        let snapshot = self.snapshot();
        self.push_sample(Sample {
            taken_at: snapshot.taken_at,
            num_of_files: snapshot.num_of_files,
            replica_used: snapshot.replica_used,
            non_replica_used: snapshot.non_replica_used,
        });
        snapshot
    }

    fn push_sample(&self, sample: Sample) {
        let mut samples = self.samples.lock();
        if samples.len() >= self.max_samples {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// Last sampled value per bucket between `start` and `end`
    ///
    /// Buckets without samples are omitted.
    pub fn historical(
        &self,
        kind: StatKind,
        range: RangeType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HistoricalPoint>, ClusterError> {
        if start > end {
            return Err(ClusterError::InvalidRange(format!("{} is after {}", start, end)));
        }

        let width = range.bucket();
        let mut buckets: BTreeMap<i64, (DateTime<Utc>, u64)> = BTreeMap::new();
        for sample in self.samples.lock().iter() {
            if sample.taken_at < start || sample.taken_at > end {
                continue;
            }
            let n = (sample.taken_at - start).num_seconds() / width.num_seconds();
            let slot = buckets.entry(n).or_insert((sample.taken_at, sample.value(kind)));
            if sample.taken_at >= slot.0 {
                *slot = (sample.taken_at, sample.value(kind));
            }
        }

        Ok(buckets
            .into_iter()
            .map(|(n, (_, value))| HistoricalPoint {
                bucket_start: start + ChronoDuration::seconds(n * width.num_seconds()),
                value,
            })
            .collect())
    }

    /// Servers that need an operator's attention
    pub fn alerts(&self) -> Vec<Alert> {
        let mut alerts = Vec::new();
        for server in self.registry.list().into_iter().filter(|s| !s.decommissioned) {
            let status_alert = match server.status {
                ServerStatus::Offline | ServerStatus::OfflineError => {
                    Some((AlertSeverity::Critical, "Server is offline".to_string()))
                }
                ServerStatus::Error => Some((
                    AlertSeverity::Critical,
                    server.last_error.clone().unwrap_or_else(|| "Server reported an error".into()),
                )),
                ServerStatus::NeedsAttention => Some((
                    AlertSeverity::Warning,
                    format!("{} error(s), last: {}", server.errors, server.last_error.as_deref().unwrap_or("-")),
                )),
                _ => None,
            };
            if let Some((severity, message)) = status_alert {
                alerts.push(Alert {
                    severity,
                    server_name: server.name.clone(),
                    message,
                });
            }

            let total = server.total_space();
            if total > 0 && (server.free_space as f64) < total as f64 * LOW_SPACE_RATIO {
                alerts.push(Alert {
                    severity: AlertSeverity::Warning,
                    server_name: server.name.clone(),
                    message: format!("Low free space: {} of {} bytes", server.free_space, total),
                });
            }
        }
        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterLog, Heartbeat, RegistryConfig};

    fn stats() -> (ClusterStats, Arc<ServerRegistry>) {
        let registry = Arc::new(ServerRegistry::new(RegistryConfig::default(), Arc::new(ClusterLog::default())));
        let stats = ClusterStats::new(Arc::new(MetadataStore::new()), registry.clone(), 100);
        (stats, registry)
    }

    fn sample(at: DateTime<Utc>, files: u64) -> Sample {
        Sample {
            taken_at: at,
            num_of_files: files,
            replica_used: files * 10,
            non_replica_used: files * 20,
        }
    }

    #[test]
    fn test_historical_keeps_last_sample_per_bucket() {
        let (stats, _) = stats();
        let start = Utc::now() - ChronoDuration::hours(3);
        stats.push_sample(sample(start + ChronoDuration::minutes(5), 1));
        stats.push_sample(sample(start + ChronoDuration::minutes(50), 2));
        stats.push_sample(sample(start + ChronoDuration::minutes(130), 5));

        let points = stats
            .historical(StatKind::NumOfFiles, RangeType::Hourly, start, Utc::now())
            .unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].value, 2);
        assert_eq!(points[0].bucket_start, start);
        assert_eq!(points[1].value, 5);
        assert_eq!(points[1].bucket_start, start + ChronoDuration::hours(2));

        let replica = stats
            .historical(StatKind::ReplicaUsed, RangeType::Daily, start, Utc::now())
            .unwrap();
        assert_eq!(replica, vec![HistoricalPoint { bucket_start: start, value: 50 }]);
    }

    #[test]
    fn test_inverted_range_rejected() {
        let (stats, _) = stats();
        let now = Utc::now();
        assert!(matches!(
            stats.historical(StatKind::NumOfFiles, RangeType::Hourly, now, now - ChronoDuration::hours(1)),
            Err(ClusterError::InvalidRange(_))
        ));
    }

    #[test]
    fn test_alerts_for_offline_and_full_servers() {
        let (stats, registry) = stats();
        let mut full = Heartbeat::online("srv-1", "host-a", 5);
        full.used_space = 995;
        registry.heartbeat(full).unwrap();
        registry.heartbeat(Heartbeat::online("srv-2", "host-b", 1_000)).unwrap();
        registry.set_status("srv-2", ServerStatus::Offline).unwrap();

        let alerts = stats.alerts();
        assert_eq!(alerts.len(), 2);
        assert!(alerts
            .iter()
            .any(|a| a.server_name == "srv-1" && a.severity == AlertSeverity::Warning));
        assert!(alerts
            .iter()
            .any(|a| a.server_name == "srv-2" && a.severity == AlertSeverity::Critical));
    }

    #[test]
    fn test_snapshot_counts_servers() {
        let (stats, registry) = stats();
        registry.heartbeat(Heartbeat::online("srv-1", "host-a", 1_000)).unwrap();

        let snapshot = stats.record_sample();
        assert_eq!(snapshot.servers_total, 1);
        assert_eq!(snapshot.servers_online, 1);
        assert_eq!(snapshot.free_space, 1_000);
        assert_eq!(snapshot.num_of_files, 0);
    }
}
