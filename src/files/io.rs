//! Sealed fragment I/O against fragment servers

use super::FileError;
use crate::cluster::ServerRegistry;
use crate::codec::Fragment;
use crate::crypto::{ContentHash, KeyId, KeyRing};
use crate::metadata::FragmentRecord;
use crate::storage::{with_retry, FragmentBackends, RetryPolicy, StorageError, StoredFragment};

use futures::future::join_all;
use std::sync::Arc;
use tracing::debug;

/// What reading one recorded fragment produced
#[derive(Debug)]
pub enum FetchOutcome {
    /// Bytes match both recorded checksums
    Intact(Fragment),

    /// The server returned bytes that fail verification
    ///
    /// The fragment carries the recorded checksum so the codec rejects it
    /// and can tell corruption apart from loss.
    Corrupt { fragment: Fragment, reason: String },

    /// The server answered but does not hold the fragment
    Missing,

    /// The server could not be asked
    Unavailable(StorageError),
}

impl FetchOutcome {
    /// The fragment to hand to the codec, if the server returned bytes
    pub fn into_fragment(self) -> Option<Fragment> {
        match self {
            FetchOutcome::Intact(fragment) | FetchOutcome::Corrupt { fragment, .. } => Some(fragment),
            FetchOutcome::Missing | FetchOutcome::Unavailable(_) => None,
        }
    }

    pub fn is_intact(&self) -> bool {
        matches!(self, FetchOutcome::Intact(_))
    }
}

#[derive(Clone)]
pub struct FragmentIo {
    backends: Arc<FragmentBackends>,
    keyring: Arc<KeyRing>,
    registry: Arc<ServerRegistry>,
    retry: RetryPolicy,
}

impl FragmentIo {
    pub fn new(
        backends: Arc<FragmentBackends>,
        keyring: Arc<KeyRing>,
        registry: Arc<ServerRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backends,
            keyring,
            registry,
            retry,
        }
    }

    /// Same servers and keys under a different retry budget
    pub fn with_retry_policy(&self, retry: RetryPolicy) -> Self {
        Self {
            retry,
            ..self.clone()
        }
    }

    pub fn keyring(&self) -> &Arc<KeyRing> {
        &self.keyring
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn seal(&self, fragment_id: &str, plaintext: &[u8]) -> Result<(KeyId, Vec<u8>), FileError> {
        Ok(self.keyring.seal(fragment_id, plaintext)?)
    }

    /// Write already-sealed bytes
    pub async fn put(&self, server: &str, fragment_id: &str, sealed: &[u8]) -> Result<StoredFragment, StorageError> {
        let backend = self.backends.get(server)?;
        let backend = &backend;
        with_retry(&self.retry, server, move || backend.put(fragment_id, sealed)).await
    }

    /// Raw sealed bytes as held by the server
    pub async fn get_sealed(&self, server: &str, fragment_id: &str) -> Result<Vec<u8>, StorageError> {
        let backend = self.backends.get(server)?;
        let backend = &backend;
        with_retry(&self.retry, server, move || backend.get(fragment_id)).await
    }

    /// Read, verify and unseal one recorded fragment
    pub async fn fetch(&self, record: &FragmentRecord) -> FetchOutcome {
        let sealed = match self.get_sealed(&record.server_name, &record.fragment_id).await {
            Ok(bytes) => bytes,
            Err(StorageError::FragmentNotFound(_)) => return FetchOutcome::Missing,
            Err(e) => return FetchOutcome::Unavailable(e),
        };

        if ContentHash::hash(&sealed) != record.sealed_checksum {
            return corrupt(record, sealed, "sealed checksum mismatch");
        }

        let plaintext = match self.keyring.open(&record.fragment_id, &sealed) {
            Ok(plaintext) => plaintext,
            Err(e) => return corrupt(record, sealed, &e.to_string()),
        };

        let fragment = Fragment::with_recorded_checksum(record.index, plaintext, record.checksum);
        if !fragment.is_intact() {
            return FetchOutcome::Corrupt {
                fragment,
                reason: "fragment checksum mismatch".into(),
            };
        }
        FetchOutcome::Intact(fragment)
    }

    /// Fetch every record concurrently, preserving order
    pub async fn fetch_all(&self, records: &[FragmentRecord]) -> Vec<(FragmentRecord, FetchOutcome)> {
        let outcomes = join_all(records.iter().map(|r| self.fetch(r))).await;
        records.iter().cloned().zip(outcomes).collect()
    }

    pub async fn remove(&self, server: &str, fragment_id: &str) -> Result<bool, StorageError> {
        let backend = self.backends.get(server)?;
        let backend = &backend;
        with_retry(&self.retry, server, move || backend.delete(fragment_id)).await
    }

    pub async fn list(&self, server: &str) -> Result<Vec<StoredFragment>, StorageError> {
        let backend = self.backends.get(server)?;
        let backend = &backend;
        with_retry(&self.retry, server, move || backend.list()).await
    }

    /// Best-effort removal; failures leave orphans for the maintenance engine
    pub async fn discard(&self, records: &[FragmentRecord]) -> usize {
        let results = join_all(records.iter().map(|r| self.remove(&r.server_name, &r.fragment_id))).await;
        let mut removed = 0;
        for (record, result) in records.iter().zip(results) {
            match result {
                Ok(_) => removed += 1,
                Err(e) => debug!(fragment_id = %record.fragment_id, server = %record.server_name, error = %e, "Left fragment behind"),
            }
        }
        removed
    }
}

fn corrupt(record: &FragmentRecord, sealed: Vec<u8>, reason: &str) -> FetchOutcome {
    FetchOutcome::Corrupt {
        fragment: Fragment::with_recorded_checksum(record.index, sealed, record.checksum),
        reason: reason.to_string(),
    }
}
