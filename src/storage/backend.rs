//! Fragment backend trait and the name → backend pool

use super::StorageError;
use crate::crypto::ContentHash;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What a server reports about one fragment it holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFragment {
    pub fragment_id: String,

    pub size_bytes: u64,

    /// Hash of the bytes on disk (the sealed blob)
    pub checksum: ContentHash,

    pub stored_at: DateTime<Utc>,
}

/// Capacity figures reported by a server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageUsage {
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub fragment_count: u64,
}

impl StorageUsage {
    pub fn free_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.used_bytes)
    }
}

/// A server that stores sealed fragments
#[async_trait]
pub trait FragmentBackend: Send + Sync {
    /// Name of the server in the cluster registry
    fn server_name(&self) -> &str;

    /// Store a fragment; storing identical bytes again is a no-op
    async fn put(&self, fragment_id: &str, data: &[u8]) -> Result<StoredFragment, StorageError>;

    async fn get(&self, fragment_id: &str) -> Result<Vec<u8>, StorageError>;

    /// Report a fragment without transferring it
    async fn stat(&self, fragment_id: &str) -> Result<Option<StoredFragment>, StorageError>;

    /// Remove a fragment; returns whether it existed
    async fn delete(&self, fragment_id: &str) -> Result<bool, StorageError>;

    async fn list(&self) -> Result<Vec<StoredFragment>, StorageError>;

    async fn usage(&self) -> Result<StorageUsage, StorageError>;
}

/// Backends of every known server, keyed by server name
#[derive(Default)]
pub struct FragmentBackends {
    backends: DashMap<String, Arc<dyn FragmentBackend>>,
}

impl FragmentBackends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, backend: Arc<dyn FragmentBackend>) {
        self.backends
            .insert(backend.server_name().to_string(), backend);
    }

    pub fn remove(&self, server_name: &str) -> Option<Arc<dyn FragmentBackend>> {
        self.backends.remove(server_name).map(|(_, b)| b)
    }

    pub fn get(&self, server_name: &str) -> Result<Arc<dyn FragmentBackend>, StorageError> {
        self.backends
            .get(server_name)
            .map(|b| Arc::clone(b.value()))
            .ok_or_else(|| StorageError::UnknownServer(server_name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.iter().map(|b| b.key().clone()).collect();
        names.sort();
        names
    }
}
