//! On-disk fragment store - one directory per server

use super::{FragmentBackend, StorageError, StorageUsage, StoredFragment};
use crate::crypto::ContentHash;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

const INDEX_FILE: &str = "index.json";

/// Fragment server storing blobs under `<root>/fragments/<xx>/<fragment_id>`
pub struct LocalFragmentStore {
    name: String,

    /// Base path for storage
    root: PathBuf,

    /// Maximum bytes this server will hold
    capacity_bytes: u64,

    /// Index of stored fragments
    index: Mutex<HashMap<String, StoredFragment>>,
}

impl LocalFragmentStore {
    /// Open (or create) a store rooted at `root`, loading any existing index
    pub async fn open(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        capacity_bytes: u64,
    ) -> Result<Self, StorageError> {
        let name = name.into();
        let root = root.into();

        tokio::fs::create_dir_all(root.join("fragments")).await?;

        let index_path = root.join(INDEX_FILE);
        let index: HashMap<String, StoredFragment> = if tokio::fs::try_exists(&index_path).await? {
            let raw = tokio::fs::read_to_string(&index_path).await?;
            serde_json::from_str(&raw).map_err(|e| StorageError::Serialization(e.to_string()))?
        } else {
            HashMap::new()
        };

        info!(server = %name, fragments = index.len(), path = %root.display(), "Opened fragment store");

        Ok(Self {
            name,
            root,
            capacity_bytes,
            index: Mutex::new(index),
        })
    }

    fn fragment_path(&self, fragment_id: &str) -> PathBuf {
        let shard_dir = fragment_id.get(..2).unwrap_or(fragment_id);
        self.root.join("fragments").join(shard_dir).join(fragment_id)
    }

    async fn save_index(&self, index: &HashMap<String, StoredFragment>) -> Result<(), StorageError> {
        let data = serde_json::to_string_pretty(index)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        write_atomically(&self.root.join(INDEX_FILE), data.as_bytes()).await
    }

    fn used_bytes(index: &HashMap<String, StoredFragment>) -> u64 {
        index.values().map(|f| f.size_bytes).sum()
    }
}

#[async_trait]
impl FragmentBackend for LocalFragmentStore {
    fn server_name(&self) -> &str {
        &self.name
    }

    async fn put(&self, fragment_id: &str, data: &[u8]) -> Result<StoredFragment, StorageError> {
        let checksum = ContentHash::hash(data);
        let mut index = self.index.lock().await;

        let previous_size = match index.get(fragment_id) {
            Some(existing) if existing.checksum == checksum => {
                debug!(server = %self.name, fragment_id, "Fragment already stored");
                return Ok(existing.clone());
            }
            Some(existing) => existing.size_bytes,
            None => 0,
        };

        let used = Self::used_bytes(&index) - previous_size;
        let size = data.len() as u64;
        if used + size > self.capacity_bytes {
            return Err(StorageError::InsufficientSpace {
                server: self.name.clone(),
                needed: size,
                available: self.capacity_bytes.saturating_sub(used),
            });
        }

        let path = self.fragment_path(fragment_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_atomically(&path, data).await?;

        let fragment = StoredFragment {
            fragment_id: fragment_id.to_string(),
            size_bytes: size,
            checksum,
            stored_at: chrono::Utc::now(),
        };
        index.insert(fragment_id.to_string(), fragment.clone());
        self.save_index(&index).await?;

        Ok(fragment)
    }

    async fn get(&self, fragment_id: &str) -> Result<Vec<u8>, StorageError> {
        if !self.index.lock().await.contains_key(fragment_id) {
            return Err(StorageError::FragmentNotFound(fragment_id.to_string()));
        }

        match tokio::fs::read(self.fragment_path(fragment_id)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::FragmentNotFound(fragment_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn stat(&self, fragment_id: &str) -> Result<Option<StoredFragment>, StorageError> {
        Ok(self.index.lock().await.get(fragment_id).cloned())
    }

    async fn delete(&self, fragment_id: &str) -> Result<bool, StorageError> {
        let mut index = self.index.lock().await;
        if index.remove(fragment_id).is_none() {
            return Ok(false);
        }

        match tokio::fs::remove_file(self.fragment_path(fragment_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.save_index(&index).await?;

        Ok(true)
    }

    async fn list(&self) -> Result<Vec<StoredFragment>, StorageError> {
        let mut fragments: Vec<StoredFragment> = self.index.lock().await.values().cloned().collect();
        fragments.sort_by(|a, b| a.fragment_id.cmp(&b.fragment_id));
        Ok(fragments)
    }

    async fn usage(&self) -> Result<StorageUsage, StorageError> {
        let index = self.index.lock().await;
        Ok(StorageUsage {
            capacity_bytes: self.capacity_bytes,
            used_bytes: Self::used_bytes(&index),
            fragment_count: index.len() as u64,
        })
    }
}

/// Write to a sibling temp file then rename over the target
pub(crate) async fn write_atomically(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_store_retrieve_fragment() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalFragmentStore::open("srv-1", temp_dir.path(), 1_000_000).await.unwrap();

        let stored = store.put("frag-001", b"sealed bytes").await.unwrap();
        assert_eq!(stored.size_bytes, 12);
        assert!(stored.checksum.verify(b"sealed bytes"));

        assert_eq!(store.get("frag-001").await.unwrap(), b"sealed bytes".to_vec());
        assert_eq!(store.usage().await.unwrap().used_bytes, 12);
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalFragmentStore::open("srv-1", temp_dir.path(), 1_000).await.unwrap();

        let first = store.put("frag-001", b"abc").await.unwrap();
        let second = store.put("frag-001", b"abc").await.unwrap();
        assert_eq!(first, second);

        store.put("frag-001", b"abcdef").await.unwrap();
        let usage = store.usage().await.unwrap();
        assert_eq!(usage.used_bytes, 6);
        assert_eq!(usage.fragment_count, 1);
    }

    #[tokio::test]
    async fn test_delete_fragment() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalFragmentStore::open("srv-1", temp_dir.path(), 1_000_000).await.unwrap();

        store.put("frag-001", b"data").await.unwrap();
        assert!(store.delete("frag-001").await.unwrap());
        assert!(!store.delete("frag-001").await.unwrap());

        assert!(matches!(
            store.get("frag-001").await,
            Err(StorageError::FragmentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_storage_limit() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalFragmentStore::open("srv-1", temp_dir.path(), 100).await.unwrap();

        let result = store.put("frag-001", &[0u8; 200]).await;
        assert!(matches!(result, Err(StorageError::InsufficientSpace { .. })));
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = LocalFragmentStore::open("srv-1", temp_dir.path(), 1_000).await.unwrap();
            store.put("frag-a", b"one").await.unwrap();
            store.put("frag-b", b"two").await.unwrap();
        }

        let reopened = LocalFragmentStore::open("srv-1", temp_dir.path(), 1_000).await.unwrap();
        let ids: Vec<String> = reopened.list().await.unwrap().into_iter().map(|f| f.fragment_id).collect();
        assert_eq!(ids, vec!["frag-a".to_string(), "frag-b".to_string()]);
        assert_eq!(reopened.get("frag-b").await.unwrap(), b"two".to_vec());
    }
}
