//! File Service - high-level file operations
//!
//! Handles the lifecycle of file content: erasure coding, sealing,
//! distribution to fragment servers, version commits and retrieval.

use super::io::FragmentIo;
use super::{FileError, RedundancyLevel};
use crate::codec::{Fragment, FragmentCodec};
use crate::crypto::{hash_password, verify_password};
use crate::metadata::{
    fragment_id, new_write_tag, Access, CommitOutcome, Entry, EntryId, EntryStatus, FilePatch, FragmentRecord, MetadataError,
    MetadataStore, NewFile, Relocation, VersionRecord, VersioningMode,
};
use crate::placement::{PlacementConstraints, PlacementError, PlacementPlanner, ServerAssignment};

use chrono::Utc;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identity of whoever is asking, as resolved by the outer layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub groups: Vec<String>,
}

impl Caller {
    pub fn user(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            groups: Vec::new(),
        }
    }

    pub fn with_groups(mut self, groups: impl IntoIterator<Item = String>) -> Self {
        self.groups.extend(groups);
        self
    }
}

/// `POST file upload`
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub folder_id: Option<EntryId>,
    pub file_name: String,
    pub data: Vec<u8>,

    /// Overrides the service default
    pub redundancy: Option<RedundancyLevel>,

    /// Applies to newly created files only
    pub versioning_mode: Option<VersioningMode>,
}

impl UploadRequest {
    pub fn new(folder_id: Option<EntryId>, file_name: &str, data: Vec<u8>) -> Self {
        Self {
            folder_id,
            file_name: file_name.to_string(),
            data,
            redundancy: None,
            versioning_mode: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvacuationReport {
    pub moved: usize,

    /// `(file_id, version_no, error)` for versions that could not be moved
    pub failed: Vec<(EntryId, u64, String)>,
}

/// Where new content goes
enum StoreTarget {
    New(NewFile),
    Existing { file_id: EntryId, expected_revision: u64 },
}

struct SealedFragment {
    index: usize,
    fragment_id: String,
    plaintext_checksum: crate::crypto::ContentHash,
    key_id: crate::crypto::KeyId,
    bytes: Vec<u8>,
}

pub struct FileService {
    metadata: Arc<MetadataStore>,
    io: FragmentIo,
    planner: PlacementPlanner,
    default_redundancy: RwLock<RedundancyLevel>,
}

impl FileService {
    pub fn new(
        metadata: Arc<MetadataStore>,
        io: FragmentIo,
        planner: PlacementPlanner,
        default_redundancy: RedundancyLevel,
    ) -> Self {
        Self {
            metadata,
            io,
            planner,
            default_redundancy: RwLock::new(default_redundancy),
        }
    }

    pub fn metadata_store(&self) -> &Arc<MetadataStore> {
        &self.metadata
    }

    pub fn fragment_io(&self) -> &FragmentIo {
        &self.io
    }

    pub fn default_redundancy(&self) -> RedundancyLevel {
        *self.default_redundancy.read()
    }

    /// Redundancy used by uploads that do not name one
    pub fn set_default_redundancy(&self, level: RedundancyLevel) -> Result<(), FileError> {
        level.validate()?;
        *self.default_redundancy.write() = level;
        info!(
            data_shards = level.data_shards,
            parity_shards = level.parity_shards,
            key_threshold = level.key_threshold,
            "Default redundancy changed"
        );
        Ok(())
    }

    fn authorize(&self, caller: &Caller, entry_id: EntryId, access: Access) -> Result<(), FileError> {
        if self
            .metadata
            .is_permitted(entry_id, &caller.user_id, &caller.groups, access)
        {
            Ok(())
        } else {
            Err(FileError::PermissionDenied {
                user: caller.user_id.clone(),
                entry_id,
            })
        }
    }

    fn authorize_folder(&self, caller: &Caller, folder: Option<EntryId>) -> Result<(), FileError> {
        match folder {
            Some(id) => self.authorize(caller, id, Access::Write),
            None => Ok(()),
        }
    }

    /// Store `data` as a new file, or as a new version of the file with that name
    pub async fn upload(&self, caller: &Caller, request: UploadRequest) -> Result<Entry, FileError> {
        let level = request.redundancy.unwrap_or_else(|| self.default_redundancy());
        level.validate()?;

        let target = match self.metadata.find_child(request.folder_id, &request.file_name) {
            Some(existing) if existing.is_file() => {
                self.authorize(caller, existing.file_id, Access::Write)?;
                StoreTarget::Existing {
                    file_id: existing.file_id,
                    expected_revision: existing.revision,
                }
            }
            Some(_) => {
                return Err(MetadataError::AlreadyExists {
                    name: request.file_name,
                }
                .into())
            }
            None => {
                self.authorize_folder(caller, request.folder_id)?;
                StoreTarget::New(NewFile {
                    file_id: Uuid::new_v4(),
                    parent_folder_id: request.folder_id,
                    owner_id: caller.user_id.clone(),
                    mime_type: mime_for(&request.file_name),
                    file_name: request.file_name.clone(),
                    versioning_mode: request.versioning_mode.unwrap_or_default(),
                })
            }
        };

        let outcome = self.store_content(target, &request.data, level).await?;
        Ok(outcome.entry)
    }

    /// Encode, place, seal and write `data`, then commit it as a version
    async fn store_content(
        &self,
        target: StoreTarget,
        data: &[u8],
        level: RedundancyLevel,
    ) -> Result<CommitOutcome, FileError> {
        let (file_id, version_no) = match &target {
            StoreTarget::New(new) => (new.file_id, 1),
            StoreTarget::Existing { file_id, .. } => (*file_id, self.metadata.entry(*file_id)?.version_no + 1),
        };

        let write_tag = new_write_tag();
        let config = level.erasure_config();
        let ids: Vec<String> = (0..config.total_shards())
            .map(|index| fragment_id(&file_id, version_no, &write_tag, index))
            .collect();
        let _intent = self.metadata.reserve_fragments(ids);

        let version = self.write_version(file_id, version_no, &write_tag, data, level).await?;
        let written = version.fragments.clone();

        let committed = match target {
            StoreTarget::New(new) => self.metadata.create_file(new, version).map(|entry| CommitOutcome {
                entry,
                released: Vec::new(),
            }),
            StoreTarget::Existing {
                file_id,
                expected_revision,
            } => self.metadata.commit_version(file_id, expected_revision, version),
        };

        let outcome = match committed {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(%file_id, version_no, error = %e, "Commit failed, discarding written fragments");
                self.io.discard(&written).await;
                return Err(e.into());
            }
        };

        if !outcome.released.is_empty() {
            self.io.discard(&outcome.released).await;
        }

        info!(
            %file_id,
            version_no,
            size = data.len(),
            fragments = written.len(),
            "Stored file version"
        );
        Ok(outcome)
    }

    async fn write_version(
        &self,
        file_id: EntryId,
        version_no: u64,
        write_tag: &str,
        data: &[u8],
        level: RedundancyLevel,
    ) -> Result<VersionRecord, FileError> {
        let codec = FragmentCodec::new(level.erasure_config())?;
        let encoded = codec.encode(data)?;

        let mut sealed = Vec::with_capacity(encoded.fragments.len());
        for fragment in &encoded.fragments {
            let id = fragment_id(&file_id, version_no, write_tag, fragment.index);
            let (key_id, bytes) = self.io.seal(&id, &fragment.data)?;
            sealed.push(SealedFragment {
                index: fragment.index,
                fragment_id: id,
                plaintext_checksum: fragment.checksum,
                key_id,
                bytes,
            });
        }
        let fragment_size = sealed.iter().map(|s| s.bytes.len() as u64).max().unwrap_or(0);

        let mut constraints = PlacementConstraints::new(sealed.len(), fragment_size);
        constraints.min_spread = level.key_threshold;
        let assignments = self.planner.place(&constraints, &self.io.registry().live_servers())?;

        let mut records: BTreeMap<usize, FragmentRecord> = BTreeMap::new();
        let failed = self.write_assigned(&sealed, &assignments, &encoded.layout, &mut records).await;

        if !failed.is_empty() {
            // one more round on servers that did not fail
            let failed_servers: HashSet<String> = failed.iter().map(|(_, server)| server.clone()).collect();
            let used: HashSet<String> = records.values().map(|r| r.server_name.clone()).collect();
            let retry = PlacementConstraints::new(failed.len(), fragment_size)
                .excluding(failed_servers.iter().cloned())
                .excluding(used);
            let indices: Vec<usize> = failed.iter().map(|(index, _)| *index).collect();

            let placed = self.planner.place(&retry, &self.io.registry().live_servers());
            let replanned: Vec<ServerAssignment> = match placed {
                Ok(assignments) => assignments
                    .into_iter()
                    .map(|a| ServerAssignment {
                        index: indices[a.index],
                        server_name: a.server_name,
                    })
                    .collect(),
                Err(e) => {
                    self.io.discard(&records.into_values().collect::<Vec<_>>()).await;
                    return Err(e.into());
                }
            };

            let still_failed = self.write_assigned(&sealed, &replanned, &encoded.layout, &mut records).await;
            if !still_failed.is_empty() {
                self.io.discard(&records.into_values().collect::<Vec<_>>()).await;
                return Err(PlacementError::InsufficientCapacity {
                    needed: sealed.len(),
                    available: sealed.len() - still_failed.len(),
                }
                .into());
            }
        }

        Ok(VersionRecord {
            version_no,
            data_version_no: 0,
            layout: encoded.layout,
            fragments: records.into_values().collect(),
            created_at: Utc::now(),
        })
    }

    /// Write each assigned fragment; returns `(index, server)` for failures
    async fn write_assigned(
        &self,
        sealed: &[SealedFragment],
        assignments: &[ServerAssignment],
        layout: &crate::codec::FragmentLayout,
        records: &mut BTreeMap<usize, FragmentRecord>,
    ) -> Vec<(usize, String)> {
        let writes = assignments.iter().map(|a| {
            let fragment = &sealed[a.index];
            self.io.put(&a.server_name, &fragment.fragment_id, &fragment.bytes)
        });
        let results = join_all(writes).await;

        let mut failed = Vec::new();
        for (assignment, result) in assignments.iter().zip(results) {
            let fragment = &sealed[assignment.index];
            match result {
                Ok(stored) => {
                    records.insert(
                        fragment.index,
                        FragmentRecord {
                            fragment_id: fragment.fragment_id.clone(),
                            index: fragment.index,
                            is_parity: layout.is_parity(fragment.index),
                            server_name: assignment.server_name.clone(),
                            checksum: fragment.plaintext_checksum,
                            sealed_checksum: stored.checksum,
                            key_id: fragment.key_id,
                            size: stored.size_bytes,
                        },
                    );
                }
                Err(e) => {
                    warn!(server = %assignment.server_name, fragment_id = %fragment.fragment_id, error = %e, "Fragment write failed");
                    self.io.registry().record_error(&assignment.server_name, &e.to_string());
                    failed.push((fragment.index, assignment.server_name.clone()));
                }
            }
        }
        failed
    }

    /// Current content of a file
    pub async fn read(&self, caller: &Caller, file_id: EntryId, password: Option<&str>) -> Result<Vec<u8>, FileError> {
        let entry = self.readable_entry(caller, file_id, password)?;
        let version = entry.current_version().ok_or(FileError::Empty(file_id))?;
        self.decode_version(version).await
    }

    /// Content of one retained version
    pub async fn read_version(
        &self,
        caller: &Caller,
        file_id: EntryId,
        version_no: u64,
        password: Option<&str>,
    ) -> Result<Vec<u8>, FileError> {
        let entry = self.readable_entry(caller, file_id, password)?;
        let version = entry
            .versions
            .get(&version_no)
            .ok_or(MetadataError::VersionNotFound { file_id, version_no })?;
        self.decode_version(version).await
    }

    fn readable_entry(&self, caller: &Caller, file_id: EntryId, password: Option<&str>) -> Result<Entry, FileError> {
        let entry = self.metadata.entry(file_id)?;
        if !entry.is_file() {
            return Err(MetadataError::NotAFile(file_id).into());
        }
        if !entry.is_live() {
            return Err(MetadataError::NotFound(file_id).into());
        }
        if entry.status == EntryStatus::Quarantined {
            return Err(FileError::Quarantined(file_id));
        }
        self.authorize(caller, file_id, Access::Read)?;
        check_password(&entry, password)?;
        Ok(entry)
    }

    /// Fetch and decode a version from whatever fragments are reachable
    pub async fn decode_version(&self, version: &VersionRecord) -> Result<Vec<u8>, FileError> {
        let codec = FragmentCodec::new(version.layout.config)?;
        let fragments: Vec<Fragment> = self
            .io
            .fetch_all(&version.fragments)
            .await
            .into_iter()
            .filter_map(|(_, outcome)| outcome.into_fragment())
            .collect();
        Ok(codec.decode(&version.layout, fragments)?)
    }

    /// `GET file metadata`
    pub fn metadata(&self, caller: &Caller, entry_id: EntryId) -> Result<Entry, FileError> {
        let mut entry = self.metadata.entry(entry_id)?;
        if !entry.is_live() {
            return Err(MetadataError::NotFound(entry_id).into());
        }
        self.authorize(caller, entry_id, Access::Read)?;
        entry.password_hash = None;
        Ok(entry)
    }

    /// `PATCH file metadata`
    pub async fn patch_metadata(
        &self,
        caller: &Caller,
        entry_id: EntryId,
        expected_revision: Option<u64>,
        mut patch: FilePatch,
    ) -> Result<Entry, FileError> {
        self.authorize(caller, entry_id, Access::Write)?;
        if let (Some(name), None) = (&patch.file_name, &patch.mime_type) {
            if self.metadata.entry(entry_id)?.is_file() {
                patch.mime_type = Some(mime_for(name));
            }
        }

        let outcome = self.metadata.patch(entry_id, expected_revision, &patch)?;
        if !outcome.released.is_empty() {
            self.io.discard(&outcome.released).await;
        }
        Ok(outcome.entry)
    }

    /// `POST file move`
    pub fn move_entry(&self, caller: &Caller, entry_id: EntryId, new_parent: Option<EntryId>) -> Result<Entry, FileError> {
        self.authorize(caller, entry_id, Access::Write)?;
        self.authorize_folder(caller, new_parent)?;
        Ok(self.metadata.move_entry(entry_id, new_parent)?)
    }

    /// `POST file copy`: the copy gets its own fragments and the caller as owner
    pub async fn copy_entry(
        &self,
        caller: &Caller,
        entry_id: EntryId,
        destination: Option<EntryId>,
        new_name: Option<&str>,
        password: Option<&str>,
    ) -> Result<Entry, FileError> {
        let source = self.readable_entry(caller, entry_id, password)?;
        self.authorize_folder(caller, destination)?;
        let version = source.current_version().ok_or(FileError::Empty(entry_id))?;
        let data = self.decode_version(version).await?;

        let name = new_name.unwrap_or(&source.file_name);
        if self.metadata.find_child(destination, name).is_some() {
            return Err(MetadataError::AlreadyExists { name: name.to_string() }.into());
        }

        let level = RedundancyLevel::from(version.layout.config);
        let new = NewFile {
            file_id: Uuid::new_v4(),
            parent_folder_id: destination,
            owner_id: caller.user_id.clone(),
            file_name: name.to_string(),
            versioning_mode: source.versioning_mode,
            mime_type: source.mime_type.clone(),
        };
        let mut entry = self.store_content(StoreTarget::New(new), &data, level).await?.entry;
        if let Some(hash) = source.password_hash {
            entry = self.metadata.set_password_hash(entry.file_id, Some(hash))?;
        }
        entry.password_hash = None;
        Ok(entry)
    }

    /// `DELETE file`; fragment removal is best effort
    pub async fn delete(&self, caller: &Caller, entry_id: EntryId) -> Result<(), FileError> {
        self.authorize(caller, entry_id, Access::Write)?;
        let released = self.metadata.mark_deleted(entry_id)?;
        let removed = self.io.discard(&released).await;
        if removed < released.len() {
            warn!(%entry_id, left = released.len() - removed, "Some fragments were left on their servers");
        }
        Ok(())
    }

    /// `POST folder`
    pub fn create_folder(&self, caller: &Caller, parent: Option<EntryId>, name: &str) -> Result<Entry, FileError> {
        self.authorize_folder(caller, parent)?;
        Ok(self.metadata.create_folder(parent, name, &caller.user_id)?)
    }

    /// `POST maintenance/key`: set or clear a file's password
    pub fn set_password(&self, caller: &Caller, file_id: EntryId, password: Option<&str>) -> Result<Entry, FileError> {
        self.authorize(caller, file_id, Access::Write)?;
        let hash = password.map(hash_password).transpose()?;
        let mut entry = self.metadata.set_password_hash(file_id, hash)?;
        entry.password_hash = None;
        Ok(entry)
    }

    /// `POST maintenance/stitch`: re-encode the current version at a new redundancy
    pub async fn restitch(&self, caller: &Caller, file_id: EntryId, level: RedundancyLevel) -> Result<Entry, FileError> {
        level.validate()?;
        self.authorize(caller, file_id, Access::Write)?;

        let entry = self.metadata.entry(file_id)?;
        let version = entry.current_version().ok_or(FileError::Empty(file_id))?;
        let data = self.decode_version(version).await?;

        let target = StoreTarget::Existing {
            file_id,
            expected_revision: entry.revision,
        };
        let outcome = self.store_content(target, &data, level).await?;
        info!(%file_id, data_shards = level.data_shards, parity_shards = level.parity_shards, "Restitched file");
        Ok(outcome.entry)
    }

    /// Regenerate fragments `indices` of a version onto new servers
    ///
    /// The new copy is written and committed before the old one is removed.
    pub async fn rebuild_fragments(
        &self,
        file_id: EntryId,
        version_no: u64,
        indices: &BTreeSet<usize>,
    ) -> Result<Vec<Relocation>, FileError> {
        let entry = self.metadata.entry(file_id)?;
        let version = entry
            .versions
            .get(&version_no)
            .cloned()
            .ok_or(MetadataError::VersionNotFound { file_id, version_no })?;

        let codec = FragmentCodec::new(version.layout.config)?;
        let fragments: Vec<Fragment> = self
            .io
            .fetch_all(&version.fragments)
            .await
            .into_iter()
            .filter(|(record, _)| !indices.contains(&record.index))
            .filter_map(|(_, outcome)| outcome.into_fragment())
            .collect();
        let rebuilt = codec.reconstruct(&version.layout, fragments)?;

        let targets: Vec<&FragmentRecord> = version
            .fragments
            .iter()
            .filter(|f| indices.contains(&f.index))
            .collect();
        let _intent = self
            .metadata
            .reserve_fragments(targets.iter().map(|f| f.fragment_id.clone()));

        let mut sealed = Vec::with_capacity(targets.len());
        for record in &targets {
            let (key_id, bytes) = self.io.seal(&record.fragment_id, &rebuilt[record.index].data)?;
            sealed.push((*record, key_id, bytes));
        }
        let fragment_size = sealed.iter().map(|(_, _, b)| b.len() as u64).max().unwrap_or(0);

        let assignments = self.place_rebuilt(&version, indices, fragment_size)?;

        let mut relocations = Vec::with_capacity(sealed.len());
        for ((record, key_id, bytes), assignment) in sealed.iter().zip(assignments) {
            let stored = match self.io.put(&assignment.server_name, &record.fragment_id, bytes).await {
                Ok(stored) => stored,
                Err(e) => {
                    self.io.registry().record_error(&assignment.server_name, &e.to_string());
                    return Err(e.into());
                }
            };

            let relocation = Relocation {
                file_id,
                version_no,
                index: record.index,
                from_server: record.server_name.clone(),
                to_server: assignment.server_name.clone(),
                sealed_checksum: stored.checksum,
                key_id: *key_id,
                size: stored.size_bytes,
            };
            if let Err(e) = self.metadata.relocate_fragment(&relocation) {
                let _ = self.io.remove(&assignment.server_name, &record.fragment_id).await;
                return Err(e.into());
            }

            if self.io.registry().is_reachable(&record.server_name) {
                if let Err(e) = self.io.remove(&record.server_name, &record.fragment_id).await {
                    debug!(fragment_id = %record.fragment_id, server = %record.server_name, error = %e, "Old copy left in place");
                }
            }
            relocations.push(relocation);
        }

        info!(%file_id, version_no, rebuilt = relocations.len(), "Rebuilt fragments");
        Ok(relocations)
    }

    /// Prefer servers and domains the version does not use yet
    fn place_rebuilt(
        &self,
        version: &VersionRecord,
        indices: &BTreeSet<usize>,
        fragment_size: u64,
    ) -> Result<Vec<ServerAssignment>, FileError> {
        let registry = self.io.registry();
        let servers = registry.live_servers();
        let occupied: HashSet<String> = version.fragments.iter().map(|f| f.server_name.clone()).collect();
        let domains: HashSet<String> = version
            .fragments
            .iter()
            .filter(|f| !indices.contains(&f.index))
            .filter_map(|f| registry.get(&f.server_name).ok())
            .map(|s| s.failure_domain)
            .collect();

        let spread = PlacementConstraints::new(indices.len(), fragment_size)
            .excluding(occupied)
            .avoiding_domains(domains);
        match self.planner.place(&spread, &servers) {
            Ok(assignments) => Ok(assignments),
            Err(PlacementError::InsufficientCapacity { .. }) => {
                // fall back to sharing servers with surviving fragments
                let previous = version
                    .fragments
                    .iter()
                    .filter(|f| indices.contains(&f.index))
                    .map(|f| f.server_name.clone());
                let relaxed = PlacementConstraints::new(indices.len(), fragment_size).excluding(previous);
                Ok(self.planner.place(&relaxed, &servers)?)
            }
        }
    }

    /// Move every fragment off `server` ahead of decommissioning it
    pub async fn evacuate_server(&self, server: &str) -> Result<EvacuationReport, FileError> {
        let mut by_version: BTreeMap<(EntryId, u64), BTreeSet<usize>> = BTreeMap::new();
        for expected in self.metadata.fragments_on_server(server) {
            by_version
                .entry((expected.file_id, expected.version_no))
                .or_default()
                .insert(expected.record.index);
        }

        info!(server, versions = by_version.len(), "Evacuating server");
        let mut report = EvacuationReport::default();
        for ((file_id, version_no), indices) in by_version {
            match self.rebuild_fragments(file_id, version_no, &indices).await {
                Ok(relocations) => report.moved += relocations.len(),
                Err(e) => {
                    warn!(server, %file_id, version_no, error = %e, "Could not evacuate version");
                    report.failed.push((file_id, version_no, e.to_string()));
                }
            }
        }
        Ok(report)
    }
}

fn check_password(entry: &Entry, password: Option<&str>) -> Result<(), FileError> {
    if !entry.password_protected {
        return Ok(());
    }
    let hash = entry.password_hash.as_deref().unwrap_or_default();
    match password {
        None => Err(FileError::PasswordRequired(entry.file_id)),
        Some(password) if verify_password(password, hash) => Ok(()),
        Some(_) => Err(FileError::WrongPassword(entry.file_id)),
    }
}

fn mime_for(file_name: &str) -> String {
    mime_guess::from_path(file_name).first_or_octet_stream().to_string()
}
