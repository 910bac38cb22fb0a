//! Authoritative metadata: entries, versions, fragment locations, grants
//!
//! Every mutation runs inside one write-lock critical section against a staged
//! copy and is swapped in (and snapshotted, when a snapshot path is set) only
//! when it fully succeeds.

use super::entry::{is_fragment_of, Entry, EntryId, EntryStatus, EntryType, FilePatch, FragmentRecord, VersionRecord, VersioningMode};
use super::permission::{Access, Permission, PermissionSet, Principal};
use super::MetadataError;
use crate::crypto::{ContentHash, KeyId};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

type Result<T> = std::result::Result<T, MetadataError>;

/// Which versions a fragment scan covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionScope {
    Current,
    AllRetained,
}

/// A fragment metadata says should exist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedFragment {
    pub file_id: EntryId,
    pub version_no: u64,
    pub record: FragmentRecord,
}

/// Parameters for creating a file together with its first version
#[derive(Debug, Clone)]
pub struct NewFile {
    pub file_id: EntryId,
    pub parent_folder_id: Option<EntryId>,
    pub owner_id: String,
    pub file_name: String,
    pub versioning_mode: VersioningMode,
    pub mime_type: String,
}

/// Result of committing a version
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub entry: Entry,

    /// Fragments of versions dropped by the versioning policy
    pub released: Vec<FragmentRecord>,
}

/// Move of one fragment record to another server
#[derive(Debug, Clone)]
pub struct Relocation {
    pub file_id: EntryId,
    pub version_no: u64,
    pub index: usize,
    pub from_server: String,
    pub to_server: String,
    pub sealed_checksum: ContentHash,
    pub key_id: KeyId,
    pub size: u64,
}

/// Swap of one fragment record to a copy sealed under another key
///
/// The copy lives on the same server under `new_fragment_id`; the record
/// must still name `previous_fragment_id` sealed under `expected_key`.
#[derive(Debug, Clone)]
pub struct Reseal {
    pub file_id: EntryId,
    pub version_no: u64,
    pub index: usize,
    pub server_name: String,
    pub previous_fragment_id: String,
    pub expected_key: KeyId,
    pub new_fragment_id: String,
    pub key_id: KeyId,
    pub sealed_checksum: ContentHash,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrphanReason {
    MissingParent(EntryId),
    MissingOwner(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanedFile {
    pub file_id: EntryId,
    pub file_name: String,
    pub reason: OrphanReason,
}

/// Totals over live files, used by cluster statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataUsage {
    pub files: u64,
    pub folders: u64,

    /// Bytes held in data fragments across retained versions
    pub data_bytes: u64,

    /// Bytes held in parity fragments across retained versions
    pub parity_bytes: u64,

    /// Decoded size of current versions
    pub logical_bytes: u64,
}

pub type IntentId = u64;

/// Releases an upload/repair intent when dropped
pub struct IntentGuard<'a> {
    store: &'a MetadataStore,
    id: IntentId,
}

impl IntentGuard<'_> {
    pub fn id(&self) -> IntentId {
        self.id
    }
}

impl Drop for IntentGuard<'_> {
    fn drop(&mut self) {
        self.store.release_intent(self.id);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Tables {
    entries: HashMap<EntryId, Entry>,
    permissions: Vec<Permission>,
    users: BTreeSet<String>,
    groups: BTreeSet<String>,
}

impl Tables {
    fn live(&self, id: &EntryId) -> Option<&Entry> {
        self.entries.get(id).filter(|e| e.is_live())
    }

    fn check_parent(&self, parent: Option<EntryId>) -> Result<()> {
        match parent {
            None => Ok(()),
            Some(id) => match self.live(&id) {
                Some(e) if e.entry_type == EntryType::Folder => Ok(()),
                Some(_) => Err(MetadataError::NotAFolder(id)),
                None => Err(MetadataError::NotFound(id)),
            },
        }
    }

    fn check_name_free(&self, parent: Option<EntryId>, name: &str, except: Option<EntryId>) -> Result<()> {
        let taken = self.entries.values().any(|e| {
            e.is_live() && e.parent_folder_id == parent && e.file_name == name && Some(e.file_id) != except
        });
        if taken {
            return Err(MetadataError::AlreadyExists { name: name.to_string() });
        }
        Ok(())
    }

    fn principal_exists(&self, principal: &Principal) -> bool {
        match principal {
            Principal::User(id) => self.users.contains(id),
            Principal::Group(id) => self.groups.contains(id),
        }
    }
}

pub struct MetadataStore {
    tables: RwLock<Tables>,
    intents: Mutex<HashMap<IntentId, BTreeSet<String>>>,
    next_intent: AtomicU64,

    /// JSON snapshot written after every commit
    snapshot_path: Option<PathBuf>,
}

impl Default for MetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataStore {
    /// In-memory store without a snapshot
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            intents: Mutex::new(HashMap::new()),
            next_intent: AtomicU64::new(1),
            snapshot_path: None,
        }
    }

    /// Open a store backed by a JSON snapshot at `path`, loading it if present
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let tables = if path.exists() {
            let raw = std::fs::read(&path).map_err(|e| MetadataError::Snapshot(e.to_string()))?;
            serde_json::from_slice(&raw).map_err(|e| MetadataError::Snapshot(e.to_string()))?
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| MetadataError::Snapshot(e.to_string()))?;
            }
            Tables::default()
        };

        info!(path = %path.display(), entries = tables.entries.len(), "Opened metadata store");

        Ok(Self {
            tables: RwLock::new(tables),
            intents: Mutex::new(HashMap::new()),
            next_intent: AtomicU64::new(1),
            snapshot_path: Some(path),
        })
    }

    fn persist(&self, tables: &Tables) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let data = serde_json::to_vec(tables).map_err(|e| MetadataError::Snapshot(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, data).map_err(|e| MetadataError::Snapshot(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| MetadataError::Snapshot(e.to_string()))?;
        Ok(())
    }

    /// Run `f` against the tables; any error leaves them as they were
    fn transact<R>(&self, f: impl FnOnce(&mut Tables) -> Result<R>) -> Result<R> {
        let mut tables = self.tables.write();
        let backup = self.snapshot_path.as_ref().map(|_| tables.clone());

        let result = f(&mut tables).and_then(|out| self.persist(&tables).map(|_| out));
        if result.is_err() {
            if let Some(backup) = backup {
                *tables = backup;
            }
        }
        result
    }

    /// Apply `f` to a staged copy of one entry and swap it in on success
    fn update_entry<R>(
        &self,
        id: EntryId,
        bump_version: bool,
        f: impl FnOnce(&mut Entry) -> Result<R>,
    ) -> Result<(Entry, R)> {
        self.transact(|tables| {
            let mut staged = tables.entries.get(&id).cloned().ok_or(MetadataError::NotFound(id))?;
            let out = f(&mut staged)?;

            staged.revision += 1;
            if bump_version {
                staged.version_no += 1;
            }
            staged.modified_at = Utc::now();
            tables.entries.insert(id, staged.clone());
            Ok((staged, out))
        })
    }

    // ---- entries ----

    pub fn entry(&self, id: EntryId) -> Result<Entry> {
        self.tables
            .read()
            .entries
            .get(&id)
            .cloned()
            .ok_or(MetadataError::NotFound(id))
    }

    /// True when the entry exists and is not deleted
    pub fn entry_exists(&self, id: EntryId) -> bool {
        self.tables.read().live(&id).is_some()
    }

    pub fn find_child(&self, parent: Option<EntryId>, name: &str) -> Option<Entry> {
        self.tables
            .read()
            .entries
            .values()
            .find(|e| e.is_live() && e.parent_folder_id == parent && e.file_name == name)
            .cloned()
    }

    pub fn children(&self, parent: Option<EntryId>) -> Vec<Entry> {
        let mut children: Vec<Entry> = self
            .tables
            .read()
            .entries
            .values()
            .filter(|e| e.is_live() && e.parent_folder_id == parent)
            .cloned()
            .collect();
        children.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        children
    }

    pub fn create_folder(&self, parent: Option<EntryId>, name: &str, owner: &str) -> Result<Entry> {
        self.transact(|tables| {
            tables.check_parent(parent)?;
            tables.check_name_free(parent, name, None)?;
            if !tables.users.contains(owner) {
                return Err(MetadataError::UnknownPrincipal(owner.to_string()));
            }

            let mut folder = Entry::new(uuid::Uuid::new_v4(), EntryType::Folder, parent, owner, name);
            folder.version_no = 1;
            tables.entries.insert(folder.file_id, folder.clone());
            debug!(folder_id = %folder.file_id, name, "Created folder");
            Ok(folder)
        })
    }

    /// Create a file entry and its first version in one commit
    pub fn create_file(&self, new: NewFile, version: VersionRecord) -> Result<Entry> {
        validate_version(&new.file_id, &version)?;
        if version.version_no != 1 {
            return Err(MetadataError::InvalidRecord(format!(
                "first version must be 1, got {}",
                version.version_no
            )));
        }

        self.transact(|tables| {
            if tables.entries.contains_key(&new.file_id) {
                return Err(MetadataError::AlreadyExists {
                    name: new.file_id.to_string(),
                });
            }
            tables.check_parent(new.parent_folder_id)?;
            tables.check_name_free(new.parent_folder_id, &new.file_name, None)?;
            if !tables.users.contains(&new.owner_id) {
                return Err(MetadataError::UnknownPrincipal(new.owner_id.clone()));
            }

            let mut entry = Entry::new(
                new.file_id,
                EntryType::File,
                new.parent_folder_id,
                &new.owner_id,
                &new.file_name,
            );
            entry.versioning_mode = new.versioning_mode;
            entry.mime_type = new.mime_type;
            entry.version_no = 1;
            entry.data_version_no = 1;

            let mut version = version;
            version.data_version_no = 1;
            entry.versions.insert(1, version);
            entry.sync_current();

            tables.entries.insert(entry.file_id, entry.clone());
            info!(file_id = %entry.file_id, name = %entry.file_name, size = entry.actual_size, "Created file");
            Ok(entry)
        })
    }

    /// Commit a new content version; `version.version_no` must be the next one
    pub fn commit_version(&self, file_id: EntryId, expected_revision: u64, version: VersionRecord) -> Result<CommitOutcome> {
        validate_version(&file_id, &version)?;
        let now = Utc::now();

        let (entry, released) = self.update_entry(file_id, true, |entry| {
            if !entry.is_file() {
                return Err(MetadataError::NotAFile(file_id));
            }
            if !entry.is_live() {
                return Err(MetadataError::NotFound(file_id));
            }
            if entry.revision != expected_revision {
                return Err(MetadataError::MetadataConflict {
                    file_id,
                    detail: format!("expected revision {}, found {}", expected_revision, entry.revision),
                });
            }
            if version.version_no != entry.version_no + 1 || entry.versions.contains_key(&version.version_no) {
                return Err(MetadataError::MetadataConflict {
                    file_id,
                    detail: format!("version {} is not next after {}", version.version_no, entry.version_no),
                });
            }

            entry.data_version_no += 1;
            let mut version = version;
            version.data_version_no = entry.data_version_no;
            let new_version_no = version.version_no;
            entry.versions.insert(new_version_no, version);

            let released = apply_retention(entry, now);
            entry.sync_current();
            if entry.status == EntryStatus::Corrupt {
                entry.status = EntryStatus::Active;
            }
            Ok(released)
        })?;

        debug!(%file_id, version_no = entry.version_no, released = released.len(), "Committed version");
        Ok(CommitOutcome { entry, released })
    }

    /// Apply a metadata patch; a versioning change may release old versions
    pub fn patch(&self, id: EntryId, expected_revision: Option<u64>, patch: &FilePatch) -> Result<CommitOutcome> {
        let now = Utc::now();
        self.transact(|tables| {
            let mut staged = tables.live(&id).cloned().ok_or(MetadataError::NotFound(id))?;
            if let Some(expected) = expected_revision {
                if staged.revision != expected {
                    return Err(MetadataError::MetadataConflict {
                        file_id: id,
                        detail: format!("expected revision {}, found {}", expected, staged.revision),
                    });
                }
            }
            if let Some(name) = &patch.file_name {
                tables.check_name_free(staged.parent_folder_id, name, Some(id))?;
                staged.file_name = name.clone();
            }
            if let Some(mime) = &patch.mime_type {
                staged.mime_type = mime.clone();
            }
            let mut released = Vec::new();
            if let Some(mode) = patch.versioning_mode {
                if !staged.is_file() {
                    return Err(MetadataError::NotAFile(id));
                }
                staged.versioning_mode = mode;
                released = apply_retention(&mut staged, now);
                staged.sync_current();
            }

            staged.version_no += 1;
            staged.revision += 1;
            staged.modified_at = now;
            tables.entries.insert(id, staged.clone());
            Ok(CommitOutcome {
                entry: staged,
                released,
            })
        })
    }

    pub fn move_entry(&self, id: EntryId, new_parent: Option<EntryId>) -> Result<Entry> {
        self.transact(|tables| {
            let current = tables.live(&id).cloned().ok_or(MetadataError::NotFound(id))?;
            tables.check_parent(new_parent)?;
            tables.check_name_free(new_parent, &current.file_name, Some(id))?;

            // a folder may not move below itself
            let mut cursor = new_parent;
            while let Some(ancestor) = cursor {
                if ancestor == id {
                    return Err(MetadataError::InvalidMove(format!(
                        "{} cannot be moved into its own subtree",
                        current.file_name
                    )));
                }
                cursor = tables.entries.get(&ancestor).and_then(|e| e.parent_folder_id);
            }

            let mut staged = current;
            staged.parent_folder_id = new_parent;
            staged.version_no += 1;
            staged.revision += 1;
            staged.modified_at = Utc::now();
            tables.entries.insert(id, staged.clone());
            Ok(staged)
        })
    }

    /// Mark an entry deleted, dropping its versions and grants
    ///
    /// Returns every fragment the entry referenced so the caller can remove
    /// them from their servers.
    pub fn mark_deleted(&self, id: EntryId) -> Result<Vec<FragmentRecord>> {
        self.transact(|tables| {
            let current = tables.live(&id).cloned().ok_or(MetadataError::NotFound(id))?;
            if current.entry_type == EntryType::Folder
                && tables.entries.values().any(|e| e.is_live() && e.parent_folder_id == Some(id))
            {
                return Err(MetadataError::NotEmpty(id));
            }

            let mut staged = current;
            let released: Vec<FragmentRecord> = std::mem::take(&mut staged.versions)
                .into_values()
                .flat_map(|v| v.fragments)
                .collect();
            staged.status = EntryStatus::Deleted;
            staged.version_no += 1;
            staged.revision += 1;
            staged.modified_at = Utc::now();
            staged.sync_current();
            tables.entries.insert(id, staged);
            tables.permissions.retain(|p| p.entry_id != id);

            info!(entry_id = %id, fragments = released.len(), "Deleted entry");
            Ok(released)
        })
    }

    pub fn set_status(&self, id: EntryId, status: EntryStatus) -> Result<Entry> {
        let (entry, _) = self.update_entry(id, true, |entry| {
            if !entry.is_live() {
                return Err(MetadataError::NotFound(id));
            }
            entry.status = status;
            Ok(())
        })?;
        Ok(entry)
    }

    /// Set (or clear) the password hash guarding a file
    pub fn set_password_hash(&self, id: EntryId, hash: Option<String>) -> Result<Entry> {
        let (entry, _) = self.update_entry(id, true, |entry| {
            if !entry.is_file() {
                return Err(MetadataError::NotAFile(id));
            }
            entry.password_protected = hash.is_some();
            entry.password_hash = hash;
            Ok(())
        })?;
        Ok(entry)
    }

    /// Drop versions whose time-limited retention has lapsed
    pub fn prune_expired_versions(&self, now: DateTime<Utc>) -> Result<Vec<FragmentRecord>> {
        self.transact(|tables| {
            let mut released = Vec::new();
            for entry in tables.entries.values_mut() {
                if !entry.is_live() || !matches!(entry.versioning_mode, VersioningMode::TimeLimited { .. }) {
                    continue;
                }
                let dropped = apply_retention(entry, now);
                if !dropped.is_empty() {
                    entry.revision += 1;
                    entry.sync_current();
                    released.extend(dropped);
                }
            }
            Ok(released)
        })
    }

    // ---- fragment locations ----

    /// Atomically point one fragment record at a new server
    ///
    /// Fails with `MetadataConflict` when the record no longer names
    /// `from_server`. Returns the previous record.
    pub fn relocate_fragment(&self, relocation: &Relocation) -> Result<FragmentRecord> {
        let file_id = relocation.file_id;
        let (_, previous) = self.update_entry(file_id, false, |entry| {
            let version = entry
                .versions
                .get_mut(&relocation.version_no)
                .ok_or(MetadataError::VersionNotFound {
                    file_id,
                    version_no: relocation.version_no,
                })?;
            let fragment = version.fragment_mut(relocation.index).ok_or_else(|| {
                MetadataError::FragmentNotFound(fragment_label(&file_id, relocation.version_no, relocation.index))
            })?;
            if fragment.server_name != relocation.from_server {
                return Err(MetadataError::MetadataConflict {
                    file_id,
                    detail: format!("{} moved to {} meanwhile", fragment.fragment_id, fragment.server_name),
                });
            }

            let previous = fragment.clone();
            fragment.server_name = relocation.to_server.clone();
            fragment.sealed_checksum = relocation.sealed_checksum;
            fragment.key_id = relocation.key_id;
            fragment.size = relocation.size;
            Ok(previous)
        })?;

        debug!(
            fragment_id = %previous.fragment_id,
            from = %relocation.from_server,
            to = %relocation.to_server,
            "Relocated fragment"
        );
        Ok(previous)
    }

    /// Point a fragment record at its re-sealed copy
    ///
    /// Fails with `MetadataConflict` when the record moved, changed ID or
    /// changed key since the copy was made. Returns the previous record.
    pub fn update_fragment_seal(&self, reseal: &Reseal) -> Result<FragmentRecord> {
        let file_id = reseal.file_id;
        let version_no = reseal.version_no;
        let (_, previous) = self.update_entry(file_id, false, |entry| {
            let version = entry
                .versions
                .get_mut(&version_no)
                .ok_or(MetadataError::VersionNotFound { file_id, version_no })?;
            let fragment = version
                .fragment_mut(reseal.index)
                .ok_or_else(|| MetadataError::FragmentNotFound(fragment_label(&file_id, version_no, reseal.index)))?;
            if fragment.fragment_id != reseal.previous_fragment_id
                || fragment.server_name != reseal.server_name
                || fragment.key_id != reseal.expected_key
            {
                return Err(MetadataError::MetadataConflict {
                    file_id,
                    detail: format!(
                        "{} is {} on {} under {} now",
                        reseal.previous_fragment_id, fragment.fragment_id, fragment.server_name, fragment.key_id
                    ),
                });
            }

            let previous = fragment.clone();
            fragment.fragment_id = reseal.new_fragment_id.clone();
            fragment.key_id = reseal.key_id;
            fragment.sealed_checksum = reseal.sealed_checksum;
            fragment.size = reseal.size;
            Ok(previous)
        })?;
        Ok(previous)
    }

    // ---- intents ----

    /// Mark fragments of an in-flight upload or repair as referenced
    pub fn reserve_fragments(&self, fragment_ids: impl IntoIterator<Item = String>) -> IntentGuard<'_> {
        let id = self.next_intent.fetch_add(1, Ordering::Relaxed);
        self.intents.lock().insert(id, fragment_ids.into_iter().collect());
        IntentGuard { store: self, id }
    }

    pub fn release_intent(&self, id: IntentId) {
        self.intents.lock().remove(&id);
    }

    // ---- maintenance views ----

    /// Live files ordered by ID
    pub fn files(&self) -> Vec<Entry> {
        let mut files: Vec<Entry> = self
            .tables
            .read()
            .entries
            .values()
            .filter(|e| e.is_file() && e.is_live())
            .cloned()
            .collect();
        files.sort_by_key(|e| e.file_id);
        files
    }

    /// Expected fragments grouped by the server that should hold them
    pub fn expected_fragments_by_server(&self, scope: VersionScope) -> BTreeMap<String, Vec<ExpectedFragment>> {
        let mut by_server: BTreeMap<String, Vec<ExpectedFragment>> = BTreeMap::new();
        for expected in self.expected_fragments(scope) {
            by_server
                .entry(expected.record.server_name.clone())
                .or_default()
                .push(expected);
        }
        by_server
    }

    /// Expected fragments ordered by `(file_id, version_no, index)`
    pub fn expected_fragments(&self, scope: VersionScope) -> Vec<ExpectedFragment> {
        let tables = self.tables.read();
        let mut out = Vec::new();
        for entry in tables.entries.values().filter(|e| e.is_file() && e.is_live()) {
            let versions: Vec<&VersionRecord> = match scope {
                VersionScope::Current => entry.current_version().into_iter().collect(),
                VersionScope::AllRetained => entry.versions.values().collect(),
            };
            for version in versions {
                for record in &version.fragments {
                    out.push(ExpectedFragment {
                        file_id: entry.file_id,
                        version_no: version.version_no,
                        record: record.clone(),
                    });
                }
            }
        }
        out.sort_by(|a, b| {
            (a.file_id, a.version_no, a.record.index).cmp(&(b.file_id, b.version_no, b.record.index))
        });
        out
    }

    /// Fragments of any retained version placed on `server`
    pub fn fragments_on_server(&self, server: &str) -> Vec<ExpectedFragment> {
        self.expected_fragments(VersionScope::AllRetained)
            .into_iter()
            .filter(|f| f.record.server_name == server)
            .collect()
    }

    /// Every fragment ID metadata or an in-flight intent references
    pub fn referenced_fragment_ids(&self) -> HashSet<String> {
        let mut ids: HashSet<String> = self
            .expected_fragments(VersionScope::AllRetained)
            .into_iter()
            .map(|f| f.record.fragment_id)
            .collect();
        ids.extend(self.reserved_fragment_ids());
        ids
    }

    /// Fragment IDs held by in-flight intents
    pub fn reserved_fragment_ids(&self) -> HashSet<String> {
        self.intents.lock().values().flatten().cloned().collect()
    }

    /// Files whose parent folder or owner no longer exists
    pub fn orphaned_files(&self) -> Vec<OrphanedFile> {
        let tables = self.tables.read();
        let mut orphans: Vec<OrphanedFile> = tables
            .entries
            .values()
            .filter(|e| e.is_file() && e.status == EntryStatus::Active)
            .filter_map(|e| {
                let reason = match e.parent_folder_id {
                    Some(parent) if tables.live(&parent).is_none() => OrphanReason::MissingParent(parent),
                    _ if !tables.users.contains(&e.owner_id) => OrphanReason::MissingOwner(e.owner_id.clone()),
                    _ => return None,
                };
                Some(OrphanedFile {
                    file_id: e.file_id,
                    file_name: e.file_name.clone(),
                    reason,
                })
            })
            .collect();
        orphans.sort_by_key(|o| o.file_id);
        orphans
    }

    pub fn usage(&self) -> MetadataUsage {
        let tables = self.tables.read();
        let mut usage = MetadataUsage::default();
        for entry in tables.entries.values().filter(|e| e.is_live()) {
            match entry.entry_type {
                EntryType::Folder => usage.folders += 1,
                EntryType::File => {
                    usage.files += 1;
                    usage.logical_bytes += entry.actual_size;
                    for fragment in entry.versions.values().flat_map(|v| &v.fragments) {
                        if fragment.is_parity {
                            usage.parity_bytes += fragment.size;
                        } else {
                            usage.data_bytes += fragment.size;
                        }
                    }
                }
            }
        }
        usage
    }

    // ---- principal directory ----

    pub fn register_user(&self, user_id: &str) -> Result<()> {
        self.transact(|tables| {
            tables.users.insert(user_id.to_string());
            Ok(())
        })
    }

    pub fn remove_user(&self, user_id: &str) -> Result<bool> {
        self.transact(|tables| Ok(tables.users.remove(user_id)))
    }

    pub fn register_group(&self, group_id: &str) -> Result<()> {
        self.transact(|tables| {
            tables.groups.insert(group_id.to_string());
            Ok(())
        })
    }

    pub fn remove_group(&self, group_id: &str) -> Result<bool> {
        self.transact(|tables| Ok(tables.groups.remove(group_id)))
    }

    pub fn user_exists(&self, user_id: &str) -> bool {
        self.tables.read().users.contains(user_id)
    }

    pub fn principal_exists(&self, principal: &Principal) -> bool {
        self.tables.read().principal_exists(principal)
    }

    // ---- permissions ----

    /// Grant (or replace) `principal`'s permissions on an entry
    pub fn grant(&self, entry_id: EntryId, principal: Principal, permissions: PermissionSet) -> Result<Permission> {
        self.transact(|tables| {
            if tables.live(&entry_id).is_none() {
                return Err(MetadataError::NotFound(entry_id));
            }
            if !tables.principal_exists(&principal) {
                return Err(MetadataError::UnknownPrincipal(principal.to_string()));
            }

            tables
                .permissions
                .retain(|p| !(p.entry_id == entry_id && p.principal == principal));
            let grant = Permission {
                entry_id,
                principal,
                permissions,
                granted_at: Utc::now(),
            };
            tables.permissions.push(grant.clone());
            Ok(grant)
        })
    }

    pub fn revoke(&self, entry_id: EntryId, principal: &Principal) -> Result<bool> {
        self.transact(|tables| {
            let before = tables.permissions.len();
            tables
                .permissions
                .retain(|p| !(p.entry_id == entry_id && &p.principal == principal));
            Ok(tables.permissions.len() != before)
        })
    }

    pub fn permissions_for(&self, entry_id: EntryId) -> Vec<Permission> {
        self.tables
            .read()
            .permissions
            .iter()
            .filter(|p| p.entry_id == entry_id)
            .cloned()
            .collect()
    }

    /// Whether `user` (a member of `groups`) may perform `access` on an entry
    pub fn is_permitted(&self, entry_id: EntryId, user: &str, groups: &[String], access: Access) -> bool {
        let tables = self.tables.read();
        let Some(entry) = tables.live(&entry_id) else {
            return false;
        };
        if entry.owner_id == user {
            return true;
        }
        tables.permissions.iter().any(|p| {
            p.entry_id == entry_id
                && p.permissions.allows(access)
                && tables.principal_exists(&p.principal)
                && match &p.principal {
                    Principal::User(id) => id == user,
                    Principal::Group(id) => groups.contains(id),
                }
        })
    }

    /// Grants whose principal has left the directory
    pub fn expired_grants(&self) -> Vec<Permission> {
        let tables = self.tables.read();
        tables
            .permissions
            .iter()
            .filter(|p| !tables.principal_exists(&p.principal))
            .cloned()
            .collect()
    }

    /// Remove one grant if it is still present and still expired
    pub fn purge_grant(&self, grant: &Permission) -> Result<bool> {
        self.transact(|tables| {
            if tables.principal_exists(&grant.principal) {
                return Ok(false);
            }
            let before = tables.permissions.len();
            tables
                .permissions
                .retain(|p| !(p.entry_id == grant.entry_id && p.principal == grant.principal));
            Ok(tables.permissions.len() != before)
        })
    }
}

/// Drop versions the entry's versioning mode no longer retains
fn apply_retention(entry: &mut Entry, now: DateTime<Utc>) -> Vec<FragmentRecord> {
    let Some(&current) = entry.versions.keys().next_back() else {
        return Vec::new();
    };

    let expired: Vec<u64> = match entry.versioning_mode {
        VersioningMode::KeepAll => Vec::new(),
        VersioningMode::Overwrite => entry.versions.keys().copied().filter(|v| *v != current).collect(),
        VersioningMode::TimeLimited { retain_secs } => {
            let cutoff = now - ChronoDuration::seconds(retain_secs.min(i64::MAX as u64) as i64);
            entry
                .versions
                .values()
                .filter(|v| v.version_no != current && v.created_at < cutoff)
                .map(|v| v.version_no)
                .collect()
        }
    };

    expired
        .into_iter()
        .filter_map(|v| entry.versions.remove(&v))
        .flat_map(|v| v.fragments)
        .collect()
}

fn fragment_label(file_id: &EntryId, version_no: u64, index: usize) -> String {
    format!("{} v{} #{}", file_id, version_no, index)
}

fn validate_version(file_id: &EntryId, version: &VersionRecord) -> Result<()> {
    let layout = &version.layout;
    layout
        .config
        .validate()
        .map_err(|e| MetadataError::InvalidRecord(e.to_string()))?;

    let total = layout.config.total_shards();
    if version.fragments.len() != total {
        return Err(MetadataError::InvalidRecord(format!(
            "expected {} fragment records, got {}",
            total,
            version.fragments.len()
        )));
    }

    let mut seen = vec![false; total];
    for record in &version.fragments {
        if record.index >= total || seen[record.index] {
            return Err(MetadataError::InvalidRecord(format!(
                "fragment index {} is out of range or repeated",
                record.index
            )));
        }
        seen[record.index] = true;

        if record.is_parity != layout.is_parity(record.index) {
            return Err(MetadataError::InvalidRecord(format!(
                "fragment {} has the wrong parity flag",
                record.index
            )));
        }
        if !is_fragment_of(&record.fragment_id, file_id, version.version_no, record.index) {
            return Err(MetadataError::InvalidRecord(format!(
                "unexpected fragment id {}",
                record.fragment_id
            )));
        }
    }
    Ok(())
}
