//! Tessera Core - erasure-coded multi-node object storage
//!
//! This crate provides the storage core for a cluster of fragment servers:
//! files are erasure coded, sealed and spread across failure domains, and a
//! background maintenance engine verifies, repairs and cleans up what the
//! servers hold against the metadata store.

pub mod cluster;
pub mod codec;
pub mod crypto;
pub mod files;
pub mod maintenance;
pub mod metadata;
pub mod placement;
pub mod rotation;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

use cluster::{ClusterLog, ClusterStats, Heartbeat, RegistryConfig, ServerRegistry, ServerStatus};
use crypto::{EncryptionKey, KeyRing};
use files::{FileService, FragmentIo, RedundancyLevel};
use maintenance::{MaintenanceConfig, MaintenanceEngine};
use metadata::MetadataStore;
use placement::{PlacementConfig, PlacementPlanner};
use rotation::KeyRotationService;
use storage::{FragmentBackend, FragmentBackends, RetryPolicy};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Main error type for Tessera operations
#[derive(Error, Debug)]
pub enum TesseraError {
    #[error("Codec error: {0}")]
    Codec(#[from] codec::CodecError),

    #[error("Placement error: {0}")]
    Placement(#[from] placement::PlacementError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] metadata::MetadataError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Cryptographic error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] cluster::ClusterError),

    #[error("File error: {0}")]
    File(#[from] files::FileError),

    #[error("Maintenance error: {0}")]
    Maintenance(#[from] maintenance::MaintenanceError),

    #[error("Rotation error: {0}")]
    Rotation(#[from] rotation::RotationError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TesseraError>;

/// Core configuration for a Tessera node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseraConfig {
    /// Metadata snapshot and job journal live here; in memory when unset
    pub data_path: Option<PathBuf>,

    /// Redundancy for uploads that do not ask for one
    pub redundancy: RedundancyLevel,

    pub placement: PlacementConfig,

    pub registry: RegistryConfig,

    pub maintenance: MaintenanceConfig,

    /// Retry budget for foreground fragment I/O
    pub retry: RetryPolicy,

    /// Samples kept for historical statistics
    pub stats_samples: usize,

    /// How often a statistics sample is taken
    pub stats_interval_secs: u64,

    /// How often time-limited versions past their window are dropped
    pub retention_interval_secs: u64,

    /// `tracing` filter directive, overridden by `RUST_LOG`
    pub log_filter: String,
}

impl Default for TesseraConfig {
    fn default() -> Self {
        Self {
            data_path: None,
            redundancy: RedundancyLevel::default(),
            placement: PlacementConfig::default(),
            registry: RegistryConfig::default(),
            maintenance: MaintenanceConfig::default(),
            retry: RetryPolicy::default(),
            stats_samples: 24 * 31,
            stats_interval_secs: 60 * 60,
            retention_interval_secs: 15 * 60,
            log_filter: "info".to_string(),
        }
    }
}

impl TesseraConfig {
    /// Read a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| TesseraError::Config(e.to_string()))
    }
}

/// Install a `tracing` subscriber; `RUST_LOG` takes precedence over `filter`
pub fn init_tracing(filter: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
}

/// All components of one storage node, wired together
pub struct TesseraNode {
    pub config: TesseraConfig,
    metadata: Arc<MetadataStore>,
    registry: Arc<ServerRegistry>,
    backends: Arc<FragmentBackends>,
    keyring: Arc<KeyRing>,
    files: Arc<FileService>,
    maintenance: MaintenanceEngine,
    rotation: Arc<KeyRotationService>,
    stats: Arc<ClusterStats>,
    shutdown: watch::Sender<bool>,
}

impl TesseraNode {
    /// Open a node; fragments are sealed under `master_key` until the first rotation
    pub fn open(config: TesseraConfig, master_key: EncryptionKey) -> Result<Self> {
        config.redundancy.validate()?;

        let metadata = Arc::new(match &config.data_path {
            Some(path) => MetadataStore::open(path.join("metadata.json"))?,
            None => MetadataStore::new(),
        });
        let db = maintenance::open_db(config.data_path.as_ref().map(|p| p.join("state")).as_deref())?;

        let log = Arc::new(ClusterLog::new(config.registry.log_capacity));
        let registry = Arc::new(ServerRegistry::new(config.registry.clone(), log));
        let backends = Arc::new(FragmentBackends::new());
        let keyring = Arc::new(KeyRing::new(master_key));

        let io = FragmentIo::new(backends.clone(), keyring.clone(), registry.clone(), config.retry);
        let files = Arc::new(FileService::new(
            metadata.clone(),
            io.clone(),
            PlacementPlanner::new(config.placement.clone()),
            config.redundancy,
        ));
        let maintenance = MaintenanceEngine::with_db(files.clone(), config.maintenance.clone(), &db)?;
        let rotation = Arc::new(KeyRotationService::new(metadata.clone(), io, &db)?);
        let stats = Arc::new(ClusterStats::new(metadata.clone(), registry.clone(), config.stats_samples));
        let (shutdown, _) = watch::channel(false);

        info!(persistent = config.data_path.is_some(), "Tessera node opened");
        Ok(Self {
            config,
            metadata,
            registry,
            backends,
            keyring,
            files,
            maintenance,
            rotation,
            stats,
            shutdown,
        })
    }

    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.metadata
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub fn keyring(&self) -> &Arc<KeyRing> {
        &self.keyring
    }

    pub fn files(&self) -> &Arc<FileService> {
        &self.files
    }

    pub fn maintenance(&self) -> &MaintenanceEngine {
        &self.maintenance
    }

    pub fn rotation(&self) -> &Arc<KeyRotationService> {
        &self.rotation
    }

    pub fn stats(&self) -> &Arc<ClusterStats> {
        &self.stats
    }

    /// Register a fragment server and report its first heartbeat
    pub async fn attach_server(
        &self,
        backend: Arc<dyn FragmentBackend>,
        hostname: &str,
        failure_domain: Option<&str>,
    ) -> Result<ServerStatus> {
        let usage = backend.usage().await?;
        let mut heartbeat = Heartbeat::online(backend.server_name(), hostname, usage.free_bytes());
        heartbeat.used_space = usage.used_bytes;
        heartbeat.failure_domain = failure_domain.map(str::to_string);

        self.backends.register(backend);
        Ok(self.registry.heartbeat(heartbeat)?)
    }

    /// Heartbeat every attached server from its reported usage
    ///
    /// Servers that do not answer are left for the liveness sweep.
    pub async fn refresh_heartbeats(&self) {
        for name in self.backends.names() {
            let (Ok(backend), Ok(info)) = (self.backends.get(&name), self.registry.get(&name)) else {
                continue;
            };
            if info.decommissioned {
                continue;
            }
            match backend.usage().await {
                Ok(usage) => {
                    let heartbeat = Heartbeat {
                        name: name.clone(),
                        hostname: info.hostname,
                        port: info.port,
                        failure_domain: Some(info.failure_domain),
                        status: ServerStatus::Online,
                        free_space: usage.free_bytes(),
                        used_space: usage.used_bytes,
                        uptime_secs: (Utc::now() - info.registered_at).num_seconds().max(0) as u64,
                    };
                    if let Err(e) = self.registry.heartbeat(heartbeat) {
                        debug!(server = %name, error = %e, "Heartbeat rejected");
                    }
                }
                Err(e) => debug!(server = %name, error = %e, "Server did not report usage"),
            }
        }
    }

    /// `POST maintenance/stitch` without a file: change the upload default
    pub fn set_default_redundancy(&self, level: RedundancyLevel) -> Result<()> {
        Ok(self.files.set_default_redundancy(level)?)
    }

    /// Move a server's fragments elsewhere, then retire it
    pub async fn decommission_server(&self, name: &str) -> Result<files::EvacuationReport> {
        let report = self.files.evacuate_server(name).await?;
        self.registry.decommission(name, &self.metadata)?;
        self.backends.remove(name);
        Ok(report)
    }

    /// Drop versions past their retention window and remove their fragments
    ///
    /// Returns the number of fragment records released.
    pub async fn prune_expired_versions(&self) -> Result<usize> {
        prune_expired(&self.metadata, self.files.fragment_io()).await
    }

    /// Start the liveness monitor, maintenance scheduler, statistics sampler
    /// and retention pruner
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self.registry.clone().spawn_monitor(self.shutdown.subscribe())];
        if let Some(scheduler) = self.maintenance.spawn_scheduler(self.shutdown.subscribe()) {
            handles.push(scheduler);
        }

        let stats = self.stats.clone();
        let mut shutdown = self.shutdown.subscribe();
        let period = Duration::from_secs(self.config.stats_interval_secs.max(1));
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        stats.record_sample();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Statistics sampler shutting down");
                            break;
                        }
                    }
                }
            }
        }));

        let metadata = self.metadata.clone();
        let io = self.files.fragment_io().clone();
        let mut shutdown = self.shutdown.subscribe();
        let period = Duration::from_secs(self.config.retention_interval_secs.max(1));
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = prune_expired(&metadata, &io).await {
                            warn!(error = %e, "Retention pruning failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Retention pruner shutting down");
                            break;
                        }
                    }
                }
            }
        }));
        handles
    }

    /// Ask background tasks to stop
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        info!("Tessera node shutting down");
    }
}

async fn prune_expired(metadata: &MetadataStore, io: &FragmentIo) -> Result<usize> {
    let released = metadata.prune_expired_versions(Utc::now())?;
    if released.is_empty() {
        return Ok(0);
    }
    let removed = io.discard(&released).await;
    info!(released = released.len(), removed, "Pruned expired versions");
    Ok(released.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::{Caller, UploadRequest};
    use crate::metadata::VersioningMode;
    use crate::storage::{LocalFragmentStore, MemoryFragmentStore};
    use tempfile::TempDir;

    #[test]
    fn test_config_round_trips_through_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tessera.json");
        std::fs::write(&path, r#"{"log_filter": "debug", "redundancy": {"data_shards": 3, "parity_shards": 2, "key_threshold": 2}}"#)
            .unwrap();

        let config = TesseraConfig::load(&path).unwrap();
        assert_eq!(config.log_filter, "debug");
        assert_eq!(config.redundancy, RedundancyLevel::new(3, 2, 2));
        assert_eq!(config.registry.heartbeat_timeout_secs, 30);

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(TesseraConfig::load(&path), Err(TesseraError::Config(_))));
    }

    #[test]
    fn test_invalid_redundancy_rejected_at_open() {
        let config = TesseraConfig {
            redundancy: RedundancyLevel::new(4, 2, 0),
            ..TesseraConfig::default()
        };
        assert!(TesseraNode::open(config, EncryptionKey::generate()).is_err());
    }

    #[tokio::test]
    async fn test_node_with_local_servers_survives_restart() {
        let dir = TempDir::new().unwrap();
        let key = EncryptionKey::generate();
        let config = TesseraConfig {
            data_path: Some(dir.path().join("node")),
            redundancy: RedundancyLevel::new(2, 1, 2),
            ..TesseraConfig::default()
        };

        let file_id = {
            let node = TesseraNode::open(config.clone(), key.clone()).unwrap();
            node.metadata().register_user("alice").unwrap();
            for i in 0..3 {
                let store = LocalFragmentStore::open(format!("disk-{}", i), dir.path().join(format!("disk-{}", i)), 1 << 20)
                    .await
                    .unwrap();
                node.attach_server(Arc::new(store), &format!("host-{}", i), None).await.unwrap();
            }
            let entry = node
                .files()
                .upload(&Caller::user("alice"), UploadRequest::new(None, "hello.txt", b"hello tessera".to_vec()))
                .await
                .unwrap();
            entry.file_id
        };

        let node = TesseraNode::open(config, key).unwrap();
        for i in 0..3 {
            let store = LocalFragmentStore::open(format!("disk-{}", i), dir.path().join(format!("disk-{}", i)), 1 << 20)
                .await
                .unwrap();
            node.attach_server(Arc::new(store), &format!("host-{}", i), None).await.unwrap();
        }
        let data = node.files().read(&Caller::user("alice"), file_id, None).await.unwrap();
        assert_eq!(data, b"hello tessera".to_vec());
    }

    #[tokio::test]
    async fn test_decommission_moves_fragments_first() {
        let node = TesseraNode::open(TesseraConfig::default(), EncryptionKey::generate()).unwrap();
        node.metadata().register_user("alice").unwrap();
        for i in 0..7 {
            let store = MemoryFragmentStore::new(format!("srv-{}", i), 1 << 24);
            node.attach_server(Arc::new(store), &format!("host-{}", i), None).await.unwrap();
        }
        let entry = node
            .files()
            .upload(&Caller::user("alice"), UploadRequest::new(None, "a.bin", vec![4u8; 10_000]))
            .await
            .unwrap();
        let victim = entry.current_version().unwrap().fragments[0].server_name.clone();

        let report = node.decommission_server(&victim).await.unwrap();
        assert_eq!(report.moved, 1);
        assert!(node.registry().get(&victim).unwrap().decommissioned);

        node.refresh_heartbeats().await;
        let data = node.files().read(&Caller::user("alice"), entry.file_id, None).await.unwrap();
        assert_eq!(data, vec![4u8; 10_000]);
    }

    #[tokio::test]
    async fn test_idle_file_drops_expired_versions() {
        let node = TesseraNode::open(TesseraConfig::default(), EncryptionKey::generate()).unwrap();
        node.metadata().register_user("alice").unwrap();
        let mut stores = Vec::new();
        for i in 0..6 {
            let store = Arc::new(MemoryFragmentStore::new(format!("srv-{}", i), 1 << 24));
            node.attach_server(store.clone(), &format!("host-{}", i), None).await.unwrap();
            stores.push(store);
        }

        let alice = Caller::user("alice");
        let request = |data: Vec<u8>| UploadRequest {
            versioning_mode: Some(VersioningMode::TimeLimited { retain_secs: 1 }),
            ..UploadRequest::new(None, "log.txt", data)
        };
        node.files().upload(&alice, request(vec![1u8; 2_000])).await.unwrap();
        let entry = node.files().upload(&alice, request(vec![2u8; 2_000])).await.unwrap();
        assert_eq!(entry.versions.len(), 2);
        assert_eq!(node.prune_expired_versions().await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert_eq!(node.prune_expired_versions().await.unwrap(), 6);

        let pruned = node.metadata().entry(entry.file_id).unwrap();
        assert_eq!(pruned.versions.len(), 1);
        let mut held = 0;
        for store in &stores {
            held += store.list().await.unwrap().len();
        }
        assert_eq!(held, 6);
        assert_eq!(node.files().read(&alice, entry.file_id, None).await.unwrap(), vec![2u8; 2_000]);
    }

    #[tokio::test]
    async fn test_background_tasks_stop_on_shutdown() {
        let node = TesseraNode::open(TesseraConfig::default(), EncryptionKey::generate()).unwrap();
        let handles = node.spawn_background();
        assert_eq!(handles.len(), 4);

        node.shutdown();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        }
    }
}
