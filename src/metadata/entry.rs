//! File/folder entries, their versions, and fragment location records

use crate::codec::{ErasureConfig, FragmentLayout};
use crate::crypto::{ContentHash, KeyId};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Identifier of a file or folder (immutable)
pub type EntryId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    File,
    Folder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Active,
    Deleted,
    Corrupt,
    Quarantined,
}

/// What happens to older versions when a new one is committed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersioningMode {
    /// Retain every version
    #[default]
    KeepAll,
    /// Only the newest version is retained
    Overwrite,
    /// Older versions are retained for `retain_secs` after they were created
    TimeLimited { retain_secs: u64 },
}

/// Where one fragment of one version lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentRecord {
    pub fragment_id: String,
    pub index: usize,
    pub is_parity: bool,
    pub server_name: String,

    /// Hash of the plaintext fragment produced by the codec
    pub checksum: ContentHash,

    /// Hash of the sealed bytes the server holds
    pub sealed_checksum: ContentHash,

    /// Key-ring entry the fragment is sealed under
    pub key_id: KeyId,

    /// Sealed size in bytes
    pub size: u64,
}

/// Fragment ID for one write of `(file_id, version_no, index)`
///
/// Every write attempt uses its own `write_tag`, so two writers racing for
/// the same version slot never store under the same ID.
pub fn fragment_id(file_id: &EntryId, version_no: u64, write_tag: &str, index: usize) -> String {
    format!("{}-v{}-{}-frag-{:02}", file_id, version_no, write_tag, index)
}

/// Fresh tag for [`fragment_id`]
pub fn new_write_tag() -> String {
    let mut tag = Uuid::new_v4().simple().to_string();
    tag.truncate(12);
    tag
}

/// Whether `id` names fragment `index` of `(file_id, version_no)` under any tag
pub fn is_fragment_of(id: &str, file_id: &EntryId, version_no: u64, index: usize) -> bool {
    let prefix = format!("{}-v{}-", file_id, version_no);
    let suffix = format!("-frag-{:02}", index);
    id.len() > prefix.len() + suffix.len() && id.starts_with(&prefix) && id.ends_with(&suffix)
}

/// One committed content version of a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version_no: u64,
    pub data_version_no: u64,
    pub layout: FragmentLayout,
    pub fragments: Vec<FragmentRecord>,
    pub created_at: DateTime<Utc>,
}

impl VersionRecord {
    /// Bytes stored across all fragments
    pub fn stored_size(&self) -> u64 {
        self.fragments.iter().map(|f| f.size).sum()
    }

    pub fn fragment(&self, index: usize) -> Option<&FragmentRecord> {
        self.fragments.iter().find(|f| f.index == index)
    }

    pub(crate) fn fragment_mut(&mut self, index: usize) -> Option<&mut FragmentRecord> {
        self.fragments.iter_mut().find(|f| f.index == index)
    }
}

/// A file or folder record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub file_id: EntryId,
    pub entry_type: EntryType,

    /// `None` for entries in the root folder
    pub parent_folder_id: Option<EntryId>,

    pub owner_id: String,
    pub file_name: String,

    /// Bumped by every committed change to the entry
    pub version_no: u64,

    /// Bumped by every content write
    pub data_version_no: u64,

    /// Bytes stored for the current version, redundancy included
    pub size: u64,

    /// Bytes of the current version after decoding
    pub actual_size: u64,

    pub checksum: Option<ContentHash>,
    pub frag_count: usize,
    pub parity_count: usize,
    pub versioning_mode: VersioningMode,
    pub password_protected: bool,

    /// Argon2 PHC string when `password_protected`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,

    pub status: EntryStatus,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,

    /// Optimistic concurrency token
    pub revision: u64,

    /// Retained versions keyed by `version_no`
    pub versions: BTreeMap<u64, VersionRecord>,
}

impl Entry {
    pub(crate) fn new(
        file_id: EntryId,
        entry_type: EntryType,
        parent_folder_id: Option<EntryId>,
        owner_id: &str,
        file_name: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            file_id,
            entry_type,
            parent_folder_id,
            owner_id: owner_id.to_string(),
            file_name: file_name.to_string(),
            version_no: 0,
            data_version_no: 0,
            size: 0,
            actual_size: 0,
            checksum: None,
            frag_count: 0,
            parity_count: 0,
            versioning_mode: VersioningMode::default(),
            password_protected: false,
            password_hash: None,
            status: EntryStatus::Active,
            mime_type: String::new(),
            created_at: now,
            modified_at: now,
            revision: 0,
            versions: BTreeMap::new(),
        }
    }

    pub fn is_file(&self) -> bool {
        self.entry_type == EntryType::File
    }

    pub fn is_live(&self) -> bool {
        self.status != EntryStatus::Deleted
    }

    pub fn current_version(&self) -> Option<&VersionRecord> {
        self.versions.values().next_back()
    }

    pub fn erasure_config(&self) -> ErasureConfig {
        ErasureConfig::new(self.frag_count, self.parity_count)
    }

    /// Refresh the denormalized current-version fields
    pub(crate) fn sync_current(&mut self) {
        let (size, actual_size, checksum, config) = match self.current_version() {
            Some(v) => (
                v.stored_size(),
                v.layout.original_size,
                Some(v.layout.checksum),
                Some(v.layout.config),
            ),
            None => (0, 0, None, None),
        };

        self.size = size;
        self.actual_size = actual_size;
        self.checksum = checksum;
        if let Some(config) = config {
            self.frag_count = config.data_shards;
            self.parity_count = config.parity_shards;
        }
    }
}

/// Metadata changes accepted by `PATCH file metadata`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilePatch {
    pub file_name: Option<String>,
    pub versioning_mode: Option<VersioningMode>,
    pub mime_type: Option<String>,
}

impl FilePatch {
    pub fn is_empty(&self) -> bool {
        self.file_name.is_none() && self.versioning_mode.is_none() && self.mime_type.is_none()
    }
}
