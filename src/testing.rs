//! Simulated clusters for unit tests

use crate::cluster::{ClusterLog, Heartbeat, RegistryConfig, ServerRegistry};
use crate::crypto::{EncryptionKey, KeyRing};
use crate::files::{FileService, FragmentIo, RedundancyLevel};
use crate::metadata::MetadataStore;
use crate::placement::PlacementPlanner;
use crate::storage::{FragmentBackends, MemoryFragmentStore, RetryPolicy};

use std::collections::BTreeMap;
use std::sync::Arc;

pub(crate) const SERVER_CAPACITY: u64 = 1 << 30;

pub(crate) fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
        attempt_timeout_ms: 1_000,
    }
}

pub(crate) struct SimCluster {
    pub metadata: Arc<MetadataStore>,
    pub registry: Arc<ServerRegistry>,
    pub backends: Arc<FragmentBackends>,
    pub keyring: Arc<KeyRing>,
    pub io: FragmentIo,
    stores: BTreeMap<String, Arc<MemoryFragmentStore>>,
}

impl SimCluster {
    /// `servers` memory-backed servers `srv-0..`, each in its own domain, owner `alice` registered
    pub fn new(servers: usize) -> Self {
        let metadata = Arc::new(MetadataStore::new());
        metadata.register_user("alice").unwrap();

        let registry = Arc::new(ServerRegistry::new(
            RegistryConfig::default(),
            Arc::new(ClusterLog::new(1_000)),
        ));
        let backends = Arc::new(FragmentBackends::new());
        let keyring = Arc::new(KeyRing::new(EncryptionKey::generate()));

        let mut stores = BTreeMap::new();
        for i in 0..servers {
            let name = format!("srv-{}", i);
            let store = Arc::new(MemoryFragmentStore::new(name.clone(), SERVER_CAPACITY));
            backends.register(store.clone());
            registry
                .heartbeat(Heartbeat::online(&name, &format!("host-{}", i), SERVER_CAPACITY))
                .unwrap();
            stores.insert(name, store);
        }

        let io = FragmentIo::new(backends.clone(), keyring.clone(), registry.clone(), fast_retry());
        Self {
            metadata,
            registry,
            backends,
            keyring,
            io,
            stores,
        }
    }

    pub fn store(&self, name: &str) -> Arc<MemoryFragmentStore> {
        self.stores[name].clone()
    }

    pub fn stores(&self) -> impl Iterator<Item = &Arc<MemoryFragmentStore>> {
        self.stores.values()
    }

    pub fn files(&self) -> FileService {
        FileService::new(
            self.metadata.clone(),
            self.io.clone(),
            PlacementPlanner::default(),
            RedundancyLevel::default(),
        )
    }
}
