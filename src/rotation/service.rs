//! Key rotation driver with a sled-persisted cursor

use super::RotationError;
use crate::crypto::{ContentHash, EncryptionKey, KeyId};
use crate::files::FragmentIo;
use crate::metadata::{
    fragment_id, new_write_tag, EntryId, ExpectedFragment, MetadataError, MetadataStore, Reseal, VersionScope,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const STATE_TREE: &str = "rotation";
const CURSOR_KEY: &[u8] = b"cursor";

/// Passes over the fragment set before giving up on stragglers
const MAX_PASSES: usize = 3;

/// Position of an in-flight rotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationCursor {
    pub target_key: KeyId,
    pub previous_key: KeyId,

    /// Last fragment fully re-sealed, as `(file_id, version_no, index)`
    pub last_completed: Option<(EntryId, u64, usize)>,
    pub resealed: u64,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationReport {
    pub target_key: KeyId,
    pub retired_key: KeyId,
    pub resealed: u64,
}

pub struct KeyRotationService {
    metadata: Arc<MetadataStore>,
    io: FragmentIo,
    state: sled::Tree,
    running: Mutex<()>,
}

impl KeyRotationService {
    pub fn new(metadata: Arc<MetadataStore>, io: FragmentIo, db: &sled::Db) -> Result<Self, RotationError> {
        Ok(Self {
            metadata,
            io,
            state: db.open_tree(STATE_TREE)?,
            running: Mutex::new(()),
        })
    }

    /// The persisted cursor, if a rotation has not finished
    pub fn cursor(&self) -> Result<Option<RotationCursor>, RotationError> {
        match self.state.get(CURSOR_KEY)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_cursor(&self, cursor: &RotationCursor) -> Result<(), RotationError> {
        self.state.insert(CURSOR_KEY, bincode::serialize(cursor)?)?;
        Ok(())
    }

    /// Install `new_key` as the active key and re-seal everything under it
    pub async fn rotate(&self, new_key: EncryptionKey) -> Result<RotationReport, RotationError> {
        let _running = self.running.lock().await;
        if let Some(cursor) = self.cursor()? {
            return Err(RotationError::AlreadyInProgress(cursor.target_key));
        }

        let keyring = self.io.keyring();
        let previous_key = keyring.active_id();
        let target_key = keyring.install(new_key);
        let cursor = RotationCursor {
            target_key,
            previous_key,
            last_completed: None,
            resealed: 0,
            started_at: Utc::now(),
        };
        self.save_cursor(&cursor)?;
        info!(from = %previous_key, to = %target_key, "Key rotation started");

        self.run(cursor).await
    }

    /// Continue a rotation from its persisted cursor
    ///
    /// Both keys must be in the ring again (see `KeyRing::insert`).
    pub async fn resume(&self) -> Result<RotationReport, RotationError> {
        let _running = self.running.lock().await;
        let cursor = self.cursor()?.ok_or(RotationError::NothingToResume)?;

        let keyring = self.io.keyring();
        for key in [cursor.target_key, cursor.previous_key] {
            if !keyring.contains(key) {
                return Err(crate::crypto::CryptoError::UnknownKey(key).into());
            }
        }
        if keyring.active_id() != cursor.target_key {
            return Err(RotationError::State(format!(
                "active key is {}, rotation targets {}",
                keyring.active_id(),
                cursor.target_key
            )));
        }

        info!(to = %cursor.target_key, position = ?cursor.last_completed, "Resuming key rotation");
        self.run(cursor).await
    }

    async fn run(&self, mut cursor: RotationCursor) -> Result<RotationReport, RotationError> {
        for pass in 0..MAX_PASSES {
            self.reseal_pass(&mut cursor).await?;

            let remaining = self
                .metadata
                .expected_fragments(VersionScope::AllRetained)
                .into_iter()
                .filter(|f| f.record.key_id != cursor.target_key)
                .count();
            if remaining == 0 {
                return self.complete(cursor);
            }

            // committed behind the cursor by uploads sealed before the switch
            debug!(pass, remaining, "Fragments still under old keys, starting another pass");
            cursor.last_completed = None;
            self.save_cursor(&cursor)?;
        }

        Err(RotationError::State(format!(
            "fragments still sealed under old keys after {} passes",
            MAX_PASSES
        )))
    }

    async fn reseal_pass(&self, cursor: &mut RotationCursor) -> Result<(), RotationError> {
        let fragments = self.metadata.expected_fragments(VersionScope::AllRetained);
        for fragment in fragments {
            let position = (fragment.file_id, fragment.version_no, fragment.record.index);
            if cursor.last_completed.map_or(false, |done| position <= done) {
                continue;
            }

            if fragment.record.key_id != cursor.target_key && self.reseal(&fragment, cursor.target_key).await? {
                cursor.resealed += 1;
            }
            cursor.last_completed = Some(position);
            self.save_cursor(cursor)?;
        }
        Ok(())
    }

    /// Re-seal one fragment; false when it changed or vanished underneath us
    ///
    /// The new copy is written under a fresh ID and committed before the old
    /// copy is removed, so a crash at any point leaves the recorded copy
    /// readable.
    async fn reseal(&self, fragment: &ExpectedFragment, target: KeyId) -> Result<bool, RotationError> {
        let record = &fragment.record;
        let stalled = |reason: String| RotationError::Stalled {
            fragment_id: record.fragment_id.clone(),
            server: record.server_name.clone(),
            reason,
        };

        let sealed = self
            .io
            .get_sealed(&record.server_name, &record.fragment_id)
            .await
            .map_err(|e| stalled(e.to_string()))?;
        let keyring = self.io.keyring();
        let plaintext = if ContentHash::hash(&sealed) == record.sealed_checksum {
            keyring.open(&record.fragment_id, &sealed)?
        } else {
            // rewritten in place by an interrupted rotation
            match keyring.open(&record.fragment_id, &sealed) {
                Ok(plaintext) if ContentHash::hash(&plaintext) == record.checksum => plaintext,
                _ => return Err(stalled("sealed checksum mismatch".into())),
            }
        };

        let new_id = fragment_id(&fragment.file_id, fragment.version_no, &new_write_tag(), record.index);
        let _intent = self.metadata.reserve_fragments([new_id.clone()]);
        let resealed = keyring.seal_with(target, &new_id, &plaintext)?;
        let stored = self
            .io
            .put(&record.server_name, &new_id, &resealed)
            .await
            .map_err(|e| stalled(e.to_string()))?;

        let swap = Reseal {
            file_id: fragment.file_id,
            version_no: fragment.version_no,
            index: record.index,
            server_name: record.server_name.clone(),
            previous_fragment_id: record.fragment_id.clone(),
            expected_key: record.key_id,
            new_fragment_id: new_id.clone(),
            key_id: target,
            sealed_checksum: stored.checksum,
            size: stored.size_bytes,
        };
        let (committed, stale_id) = match self.metadata.update_fragment_seal(&swap) {
            Ok(_) => (true, &record.fragment_id),
            Err(
                MetadataError::NotFound(_)
                | MetadataError::VersionNotFound { .. }
                | MetadataError::FragmentNotFound(_)
                | MetadataError::MetadataConflict { .. },
            ) => {
                warn!(fragment_id = %record.fragment_id, "Fragment changed during rotation, skipping");
                (false, &new_id)
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = self.io.remove(&record.server_name, stale_id).await {
            // left for the orphaned-shards check
            debug!(fragment_id = %stale_id, server = %record.server_name, error = %e, "Stale copy left behind");
        }
        Ok(committed)
    }

    fn complete(&self, cursor: RotationCursor) -> Result<RotationReport, RotationError> {
        let keyring = self.io.keyring();
        if keyring.contains(cursor.previous_key) && cursor.previous_key != cursor.target_key {
            keyring.retire(cursor.previous_key)?;
        }
        self.state.remove(CURSOR_KEY)?;

        info!(
            retired = %cursor.previous_key,
            active = %cursor.target_key,
            resealed = cursor.resealed,
            "Key rotation complete"
        );
        Ok(RotationReport {
            target_key: cursor.target_key,
            retired_key: cursor.previous_key,
            resealed: cursor.resealed,
        })
    }
}
