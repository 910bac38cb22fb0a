//! In-memory fragment store with fault injection
//!
//! Used for simulated clusters: a server can be taken unreachable, slowed
//! down, or have a fragment's bytes flipped underneath the index.

use super::{FragmentBackend, StorageError, StorageUsage, StoredFragment};
use crate::crypto::ContentHash;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

pub struct MemoryFragmentStore {
    name: String,
    capacity_bytes: u64,
    fragments: RwLock<BTreeMap<String, (StoredFragment, Vec<u8>)>>,
    reachable: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryFragmentStore {
    pub fn new(name: impl Into<String>, capacity_bytes: u64) -> Self {
        Self {
            name: name.into(),
            capacity_bytes,
            fragments: RwLock::new(BTreeMap::new()),
            reachable: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Simulate the server going down (or coming back)
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Delay every operation by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Flip the first byte of a stored fragment without updating its checksum
    pub fn corrupt(&self, fragment_id: &str) -> bool {
        match self.fragments.write().get_mut(fragment_id) {
            Some((_, data)) if !data.is_empty() => {
                data[0] ^= 0xff;
                true
            }
            _ => false,
        }
    }

    /// Drop a fragment behind the index's back, as a failed disk would
    pub fn lose(&self, fragment_id: &str) -> bool {
        self.fragments.write().remove(fragment_id).is_some()
    }

    async fn simulate(&self) -> Result<(), StorageError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(StorageError::Unreachable(self.name.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl FragmentBackend for MemoryFragmentStore {
    fn server_name(&self) -> &str {
        &self.name
    }

    async fn put(&self, fragment_id: &str, data: &[u8]) -> Result<StoredFragment, StorageError> {
        self.simulate().await?;

        let checksum = ContentHash::hash(data);
        let mut fragments = self.fragments.write();

        if let Some((existing, _)) = fragments.get(fragment_id) {
            if existing.checksum == checksum {
                return Ok(existing.clone());
            }
        }

        let used: u64 = fragments
            .iter()
            .filter(|(id, _)| id.as_str() != fragment_id)
            .map(|(_, (f, _))| f.size_bytes)
            .sum();
        let size = data.len() as u64;
        if used + size > self.capacity_bytes {
            return Err(StorageError::InsufficientSpace {
                server: self.name.clone(),
                needed: size,
                available: self.capacity_bytes.saturating_sub(used),
            });
        }

        let stored = StoredFragment {
            fragment_id: fragment_id.to_string(),
            size_bytes: size,
            checksum,
            stored_at: chrono::Utc::now(),
        };
        fragments.insert(fragment_id.to_string(), (stored.clone(), data.to_vec()));
        Ok(stored)
    }

    async fn get(&self, fragment_id: &str) -> Result<Vec<u8>, StorageError> {
        self.simulate().await?;
        self.fragments
            .read()
            .get(fragment_id)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| StorageError::FragmentNotFound(fragment_id.to_string()))
    }

    async fn stat(&self, fragment_id: &str) -> Result<Option<StoredFragment>, StorageError> {
        self.simulate().await?;
        Ok(self.fragments.read().get(fragment_id).map(|(f, _)| f.clone()))
    }

    async fn delete(&self, fragment_id: &str) -> Result<bool, StorageError> {
        self.simulate().await?;
        Ok(self.fragments.write().remove(fragment_id).is_some())
    }

    async fn list(&self) -> Result<Vec<StoredFragment>, StorageError> {
        self.simulate().await?;
        Ok(self.fragments.read().values().map(|(f, _)| f.clone()).collect())
    }

    async fn usage(&self) -> Result<StorageUsage, StorageError> {
        self.simulate().await?;
        let fragments = self.fragments.read();
        Ok(StorageUsage {
            capacity_bytes: self.capacity_bytes,
            used_bytes: fragments.values().map(|(f, _)| f.size_bytes).sum(),
            fragment_count: fragments.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_server_rejects_everything() {
        let store = MemoryFragmentStore::new("srv-1", 1024);
        store.put("frag-a", b"data").await.unwrap();

        store.set_reachable(false);
        assert!(matches!(store.get("frag-a").await, Err(StorageError::Unreachable(_))));
        assert!(matches!(store.list().await, Err(StorageError::Unreachable(_))));

        store.set_reachable(true);
        assert_eq!(store.get("frag-a").await.unwrap(), b"data".to_vec());
    }

    #[tokio::test]
    async fn test_corrupt_keeps_recorded_checksum() {
        let store = MemoryFragmentStore::new("srv-1", 1024);
        let stored = store.put("frag-a", b"data").await.unwrap();

        assert!(store.corrupt("frag-a"));
        let bytes = store.get("frag-a").await.unwrap();
        assert!(!stored.checksum.verify(&bytes));
        assert_eq!(store.stat("frag-a").await.unwrap(), Some(stored));
    }

    #[tokio::test]
    async fn test_capacity_counts_replacement_once() {
        let store = MemoryFragmentStore::new("srv-1", 8);
        store.put("frag-a", b"12345678").await.unwrap();
        store.put("frag-a", b"87654321").await.unwrap();

        assert!(matches!(
            store.put("frag-b", b"x").await,
            Err(StorageError::InsufficientSpace { .. })
        ));
    }
}
