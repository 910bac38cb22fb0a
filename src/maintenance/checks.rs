//! The individual maintenance checks
//!
//! Work is split into units (one server, one file, one orphaned record).
//! Server units compare what a server holds against what metadata expects
//! there; file units decode and, when asked, repair.

use super::engine::{Control, EngineInner, JobHandle};
use super::job::{CheckType, Finding, FindingKind, UnitStatus};
use super::MaintenanceError;
use crate::files::{FetchOutcome, FileError};
use crate::metadata::{EntryId, EntryStatus, ExpectedFragment, MetadataError, OrphanedFile, Permission, VersionScope};
use crate::storage::StorageError;

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub(super) enum Unit {
    Server(String),
    File(EntryId),
    OrphanedFile(OrphanedFile),
    Grant(Permission),
    /// Placeholder for a scan that found nothing to visit
    Clean,
}

/// Units for `check`, fixed when the job starts
pub(super) fn plan(inner: &EngineInner, check: CheckType) -> Vec<Unit> {
    let metadata = inner.files.metadata_store();
    match check {
        CheckType::QuickShards => servers(inner, VersionScope::Current),
        CheckType::MissingShards | CheckType::OrphanedShards => servers(inner, VersionScope::AllRetained),
        CheckType::FullShards => {
            let mut units = servers(inner, VersionScope::AllRetained);
            units.extend(metadata.files().into_iter().map(|e| Unit::File(e.file_id)));
            units
        }
        CheckType::OrphanedFiles => or_clean(metadata.orphaned_files().into_iter().map(Unit::OrphanedFile).collect()),
        CheckType::Permissions => or_clean(metadata.expired_grants().into_iter().map(Unit::Grant).collect()),
        CheckType::DeleteFragments => Vec::new(),
    }
}

/// Registered servers plus any server metadata still points at
fn servers(inner: &EngineInner, scope: VersionScope) -> Vec<Unit> {
    let mut names: BTreeSet<String> = inner
        .io
        .registry()
        .list()
        .into_iter()
        .filter(|s| !s.decommissioned)
        .map(|s| s.name)
        .collect();
    names.extend(inner.files.metadata_store().expected_fragments_by_server(scope).into_keys());
    names.into_iter().map(Unit::Server).collect()
}

fn or_clean(units: Vec<Unit>) -> Vec<Unit> {
    if units.is_empty() {
        vec![Unit::Clean]
    } else {
        units
    }
}

enum UnitError {
    Server(StorageError),
    Journal(MaintenanceError),
}

impl From<StorageError> for UnitError {
    fn from(e: StorageError) -> Self {
        UnitError::Server(e)
    }
}

impl From<MaintenanceError> for UnitError {
    fn from(e: MaintenanceError) -> Self {
        UnitError::Journal(e)
    }
}

type UnitResult = Result<(UnitStatus, String), UnitError>;

/// Damaged fragment indices per `(file_id, version_no)`
type Damage = BTreeMap<(EntryId, u64), BTreeSet<usize>>;

pub(super) struct CheckRun {
    inner: Arc<EngineInner>,
    job: Arc<JobHandle>,
    check: CheckType,
    repair: bool,
    delete: bool,
    control: watch::Receiver<Control>,
    damage: Damage,
}

impl CheckRun {
    pub(super) fn new(inner: Arc<EngineInner>, job: Arc<JobHandle>, check: CheckType, repair: bool, delete: bool) -> Self {
        let control = job.control();
        Self {
            inner,
            job,
            check,
            repair,
            delete,
            control,
            damage: Damage::new(),
        }
    }

    /// Block while paused; false once the job is stopped
    async fn checkpoint(&mut self) -> bool {
        loop {
            let control = *self.control.borrow_and_update();
            match control {
                Control::Run => return true,
                Control::Stop => return false,
                Control::Pause => {
                    if self.control.changed().await.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    fn stopped(&self) -> bool {
        *self.control.borrow() == Control::Stop
    }

    pub(super) async fn execute(mut self, units: Vec<Unit>) {
        debug!(check = ?self.check, units = units.len(), "Check started");
        for unit in units {
            if !self.checkpoint().await {
                debug!(check = ?self.check, "Check stopped");
                return;
            }
            match unit {
                Unit::Server(name) => self.server_unit(&name).await,
                Unit::File(file_id) => self.file_unit(file_id).await,
                Unit::OrphanedFile(orphan) => self.orphaned_file_unit(orphan),
                Unit::Grant(grant) => self.grant_unit(grant),
                Unit::Clean => {
                    let slot = self.job.begin_unit(self.check, None, None, "Scanning");
                    self.job.finish_unit(self.check, slot, UnitStatus::Ok, "Nothing found".into());
                }
            }
        }

        if self.check == CheckType::MissingShards && self.repair && !self.damage.is_empty() {
            let damage = std::mem::take(&mut self.damage);
            self.job.schedule(damage.len() as u64);
            for ((file_id, version_no), indices) in damage {
                if !self.checkpoint().await {
                    return;
                }
                self.repair_unit(file_id, version_no, &indices).await;
            }
        }

        // hold completion while paused
        self.checkpoint().await;
    }

    fn report(&self, finding: Finding) {
        let log = self.inner.io.registry().log();
        let server = finding.server_name.as_deref();
        let message = format!("{:?}: {}", finding.kind, finding.detail);
        match finding.kind {
            FindingKind::MissingFragment | FindingKind::CorruptFragment | FindingKind::ReconstructionMismatch => {
                warn!(check = ?self.check, server, file_id = ?finding.file_id, fragment_id = ?finding.fragment_id, "{}", finding.detail);
                log.warning(server, message);
            }
            _ => {
                info!(check = ?self.check, server, file_id = ?finding.file_id, fragment_id = ?finding.fragment_id, "{}", finding.detail);
                log.info(server, message);
            }
        }
        self.job.add_finding(finding);
    }

    fn mark_damaged(&mut self, expected: &ExpectedFragment) {
        self.damage
            .entry((expected.file_id, expected.version_no))
            .or_default()
            .insert(expected.record.index);
    }

    fn report_missing(&mut self, server: &str, expected: &ExpectedFragment, detail: &str) {
        self.report(
            Finding::new(FindingKind::MissingFragment, self.check, detail)
                .on_server(server)
                .for_version(expected.file_id, expected.version_no)
                .fragment(&expected.record.fragment_id),
        );
        self.mark_damaged(expected);
    }

    fn expected_on(&self, server: &str) -> Vec<ExpectedFragment> {
        let scope = match self.check {
            CheckType::QuickShards => VersionScope::Current,
            _ => VersionScope::AllRetained,
        };
        self.inner
            .files
            .metadata_store()
            .expected_fragments(scope)
            .into_iter()
            .filter(|f| f.record.server_name == server)
            .collect()
    }

    async fn server_unit(&mut self, server: &str) {
        let expected = self.expected_on(server);
        let slot = self.job.begin_unit(self.check, Some(server), None, "Checking server");
        let registry = self.inner.io.registry().clone();

        if !registry.is_reachable(server) {
            if expected.is_empty() {
                self.job
                    .finish_unit(self.check, slot, UnitStatus::Skipped, "Server offline, nothing expected here".into());
                return;
            }
            registry.record_error(server, "Offline during maintenance");
            self.unverifiable(server, &expected);
            self.job.finish_unit(
                self.check,
                slot,
                UnitStatus::Error,
                format!("Server offline, {} fragment(s) unverifiable", expected.len()),
            );
            return;
        }

        let result = match self.check {
            CheckType::QuickShards | CheckType::MissingShards => self.compare_listing(server, &expected).await,
            CheckType::FullShards => self.verify_fragments(server, &expected).await,
            CheckType::OrphanedShards => self.scan_orphans(server, &expected).await,
            _ => Ok((UnitStatus::Skipped, "Not a server check".into())),
        };

        let (status, message) = match result {
            Ok(outcome) => outcome,
            Err(UnitError::Server(e)) => {
                registry.record_error(server, &e.to_string());
                self.unverifiable(server, &expected);
                (UnitStatus::Error, e.to_string())
            }
            Err(UnitError::Journal(e)) => (UnitStatus::Error, e.to_string()),
        };
        self.job.finish_unit(self.check, slot, status, message);
    }

    /// Fragments on a server that cannot be asked count as missing
    fn unverifiable(&mut self, server: &str, expected: &[ExpectedFragment]) {
        if self.check == CheckType::OrphanedShards {
            return;
        }
        for fragment in expected {
            self.report_missing(server, fragment, "Server unreachable");
        }
    }

    async fn compare_listing(&mut self, server: &str, expected: &[ExpectedFragment]) -> UnitResult {
        let listing = self.inner.io.list(server).await?;
        let held: HashMap<&str, _> = listing.iter().map(|s| (s.fragment_id.as_str(), s)).collect();

        let mut missing = 0;
        let mut mismatched = 0;
        for fragment in expected {
            match held.get(fragment.record.fragment_id.as_str()) {
                None => {
                    missing += 1;
                    self.report_missing(server, fragment, "Fragment absent from server");
                }
                Some(stored) if self.check == CheckType::QuickShards && stored.checksum != fragment.record.sealed_checksum => {
                    mismatched += 1;
                    self.report(
                        Finding::new(FindingKind::CorruptFragment, self.check, "Stored checksum differs from metadata")
                            .on_server(server)
                            .for_version(fragment.file_id, fragment.version_no)
                            .fragment(&fragment.record.fragment_id),
                    );
                    self.mark_damaged(fragment);
                }
                Some(_) => {}
            }
        }

        Ok((
            UnitStatus::Ok,
            format!(
                "{} fragment(s) checked, {} missing, {} mismatched",
                expected.len(),
                missing,
                mismatched
            ),
        ))
    }

    async fn verify_fragments(&mut self, server: &str, expected: &[ExpectedFragment]) -> UnitResult {
        let mut checked = 0;
        let mut damaged = 0;
        for fragment in expected {
            if self.stopped() {
                break;
            }
            let outcome = self.inner.io.fetch(&fragment.record).await;
            match outcome {
                FetchOutcome::Intact(_) => {}
                FetchOutcome::Corrupt { reason, .. } => {
                    damaged += 1;
                    self.report(
                        Finding::new(FindingKind::CorruptFragment, self.check, reason)
                            .on_server(server)
                            .for_version(fragment.file_id, fragment.version_no)
                            .fragment(&fragment.record.fragment_id),
                    );
                    self.mark_damaged(fragment);
                }
                FetchOutcome::Missing => {
                    damaged += 1;
                    self.report_missing(server, fragment, "Fragment absent from server");
                }
                FetchOutcome::Unavailable(e) => return Err(e.into()),
            }
            checked += 1;
        }
        Ok((
            UnitStatus::Ok,
            format!("{} fragment(s) verified, {} damaged", checked, damaged),
        ))
    }

    async fn scan_orphans(&mut self, server: &str, expected: &[ExpectedFragment]) -> UnitResult {
        let listing = self.inner.io.list(server).await?;
        let metadata = self.inner.files.metadata_store();
        let referenced: HashSet<&str> = expected.iter().map(|f| f.record.fragment_id.as_str()).collect();
        let reserved = metadata.reserved_fragment_ids();

        let orphans: BTreeSet<String> = listing
            .iter()
            .map(|s| s.fragment_id.clone())
            .filter(|id| !referenced.contains(id.as_str()) && !reserved.contains(id))
            .collect();

        let job_id = self.job.id();
        let seen_at = Utc::now();
        let min_gap = self.inner.config.orphan_confirmation_gap();
        let mut deleted = 0;
        for fragment_id in &orphans {
            let confirmations = self.inner.ledger.confirm(server, fragment_id, job_id, seen_at, min_gap)?;
            self.report(
                Finding::new(
                    FindingKind::OrphanedFragment,
                    self.check,
                    format!("Unreferenced fragment, independently seen {} time(s)", confirmations),
                )
                .on_server(server)
                .fragment(fragment_id),
            );

            if self.delete && confirmations >= 2 && self.still_orphaned(server, fragment_id) {
                self.inner.io.remove(server, fragment_id).await?;
                self.inner.ledger.forget(server, fragment_id)?;
                deleted += 1;
                self.report(
                    Finding::new(FindingKind::DeletedOrphan, self.check, "Orphaned fragment deleted")
                        .on_server(server)
                        .fragment(fragment_id),
                );
            }
        }

        let remaining: BTreeSet<String> = orphans
            .into_iter()
            .filter(|id| self.inner.ledger.confirmations(server, id).unwrap_or(0) > 0)
            .collect();
        self.inner.ledger.retain(server, &remaining)?;

        Ok((
            UnitStatus::Ok,
            format!(
                "{} fragment(s) held, {} orphaned, {} deleted",
                listing.len(),
                remaining.len() + deleted,
                deleted
            ),
        ))
    }

    /// Re-read metadata right before deleting
    fn still_orphaned(&self, server: &str, fragment_id: &str) -> bool {
        let metadata = self.inner.files.metadata_store();
        if metadata.reserved_fragment_ids().contains(fragment_id) {
            return false;
        }
        !metadata
            .fragments_on_server(server)
            .iter()
            .any(|f| f.record.fragment_id == fragment_id)
    }

    async fn file_unit(&mut self, file_id: EntryId) {
        let slot = self.job.begin_unit(self.check, None, Some(file_id), "Reconstructing file");
        let metadata = self.inner.files.metadata_store().clone();
        let entry = match metadata.entry(file_id) {
            Ok(entry) if entry.is_live() => entry,
            _ => {
                self.job
                    .finish_unit(self.check, slot, UnitStatus::Skipped, "File no longer exists".into());
                return;
            }
        };

        let mut unrecoverable = Vec::new();
        let mut failed_rebuilds = Vec::new();
        let mut repaired = 0;
        for version in entry.versions.values() {
            if self.stopped() {
                break;
            }
            if let Err(e) = self.inner.files.decode_version(version).await {
                self.report(
                    Finding::new(FindingKind::ReconstructionMismatch, self.check, e.to_string())
                        .for_version(file_id, version.version_no),
                );
                unrecoverable.push(version.version_no);
                continue;
            }

            if self.repair {
                if let Some(indices) = self.damage.remove(&(file_id, version.version_no)) {
                    match self.rebuild(file_id, version.version_no, &indices).await {
                        Ok(rebuilt) => repaired += rebuilt,
                        Err(e) => failed_rebuilds.push(format!("version {}: {}", version.version_no, e)),
                    }
                }
            }
        }

        if unrecoverable.is_empty() {
            let verified = format!("{} version(s) verified, {} fragment(s) rebuilt", entry.versions.len(), repaired);
            let (status, message) = if failed_rebuilds.is_empty() {
                (UnitStatus::Ok, verified)
            } else {
                (
                    UnitStatus::Error,
                    format!("{}; rebuild failed for {}", verified, failed_rebuilds.join(", ")),
                )
            };
            self.job.finish_unit(self.check, slot, status, message);
            return;
        }

        if self.repair {
            self.mark_corrupt(file_id);
        }
        self.job.finish_unit(
            self.check,
            slot,
            UnitStatus::Error,
            format!("Version(s) {:?} cannot be reconstructed", unrecoverable),
        );
    }

    async fn repair_unit(&mut self, file_id: EntryId, version_no: u64, indices: &BTreeSet<usize>) {
        let slot = self.job.begin_unit(
            self.check,
            None,
            Some(file_id),
            format!("Rebuilding {} fragment(s) of version {}", indices.len(), version_no),
        );
        let (status, message) = match self.rebuild(file_id, version_no, indices).await {
            Ok(rebuilt) => (UnitStatus::Ok, format!("Rebuilt {} fragment(s)", rebuilt)),
            Err(FileError::Metadata(MetadataError::NotFound(_) | MetadataError::VersionNotFound { .. })) => {
                (UnitStatus::Skipped, "Version no longer exists".into())
            }
            Err(e) => (UnitStatus::Error, e.to_string()),
        };
        self.job.finish_unit(self.check, slot, status, message);
    }

    /// Regenerate fragments and report each relocation
    async fn rebuild(&self, file_id: EntryId, version_no: u64, indices: &BTreeSet<usize>) -> Result<usize, FileError> {
        match self.inner.files.rebuild_fragments(file_id, version_no, indices).await {
            Ok(relocations) => {
                for relocation in &relocations {
                    self.report(
                        Finding::new(
                            FindingKind::RepairedFragment,
                            self.check,
                            format!("Fragment {} moved from {} to {}", relocation.index, relocation.from_server, relocation.to_server),
                        )
                        .on_server(&relocation.to_server)
                        .for_version(file_id, version_no),
                    );
                }
                Ok(relocations.len())
            }
            Err(FileError::Codec(e)) => {
                self.report(
                    Finding::new(FindingKind::ReconstructionMismatch, self.check, e.to_string())
                        .for_version(file_id, version_no),
                );
                self.mark_corrupt(file_id);
                Err(FileError::Codec(e))
            }
            Err(e) => {
                warn!(%file_id, version_no, error = %e, "Fragment rebuild failed");
                Err(e)
            }
        }
    }

    fn mark_corrupt(&self, file_id: EntryId) {
        if let Err(e) = self.inner.files.metadata_store().set_status(file_id, EntryStatus::Corrupt) {
            warn!(%file_id, error = %e, "Could not mark file corrupt");
        }
    }

    fn orphaned_file_unit(&mut self, orphan: OrphanedFile) {
        let slot = self.job.begin_unit(self.check, None, Some(orphan.file_id), "Checking file");
        self.report(
            Finding::new(
                FindingKind::OrphanedFile,
                self.check,
                format!("{} is orphaned: {:?}", orphan.file_name, orphan.reason),
            )
            .for_file(orphan.file_id),
        );

        let (status, message) = if !self.repair {
            (UnitStatus::Ok, "Reported".to_string())
        } else {
            match self
                .inner
                .files
                .metadata_store()
                .set_status(orphan.file_id, EntryStatus::Quarantined)
            {
                Ok(_) => (UnitStatus::Ok, "Quarantined".to_string()),
                Err(e) => (UnitStatus::Error, e.to_string()),
            }
        };
        self.job.finish_unit(self.check, slot, status, message);
    }

    fn grant_unit(&mut self, grant: Permission) {
        let slot = self.job.begin_unit(self.check, None, Some(grant.entry_id), "Checking grant");
        self.report(
            Finding::new(
                FindingKind::ExpiredPermission,
                self.check,
                format!("Grant to unknown principal {}", grant.principal),
            )
            .for_file(grant.entry_id),
        );

        let (status, message) = if !self.repair {
            (UnitStatus::Ok, "Reported".to_string())
        } else {
            match self.inner.files.metadata_store().purge_grant(&grant) {
                Ok(_) => {
                    info!(entry_id = %grant.entry_id, principal = %grant.principal, "Purged grant to expired principal");
                    (UnitStatus::Ok, format!("Purged grant to {}", grant.principal))
                }
                Err(e) => (UnitStatus::Error, e.to_string()),
            }
        };
        self.job.finish_unit(self.check, slot, status, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ServerStatus;
    use crate::files::{Caller, UploadRequest};
    use crate::maintenance::{JobRecord, JobStatus, MaintenanceConfig, MaintenanceEngine, MaintenanceRequest};
    use crate::metadata::{PermissionSet, Principal};
    use crate::storage::FragmentBackend;
    use crate::testing::SimCluster;

    fn engine(cluster: &SimCluster) -> MaintenanceEngine {
        let config = MaintenanceConfig {
            server_attempts: 1,
            orphan_confirmation_gap_secs: 0,
            ..MaintenanceConfig::default()
        };
        MaintenanceEngine::open(Arc::new(cluster.files()), config).unwrap()
    }

    async fn run(engine: &MaintenanceEngine, request: MaintenanceRequest) -> JobRecord {
        let job = engine.start(request).unwrap();
        let record = engine.wait(job.id).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        record
    }

    async fn upload(cluster: &SimCluster, name: &str, data: Vec<u8>) -> crate::metadata::Entry {
        cluster
            .files()
            .upload(&Caller::user("alice"), UploadRequest::new(None, name, data))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_quick_check_reports_lost_fragment() {
        let cluster = SimCluster::new(6);
        let entry = upload(&cluster, "a.bin", vec![1u8; 4_000]).await;
        let lost = entry.current_version().unwrap().fragments[3].clone();
        cluster.store(&lost.server_name).lose(&lost.fragment_id);

        let record = run(&engine(&cluster), MaintenanceRequest::new([CheckType::QuickShards])).await;
        let missing: Vec<_> = record.findings_of(FindingKind::MissingFragment).collect();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].fragment_id.as_deref(), Some(lost.fragment_id.as_str()));
        assert_eq!(record.errors, 0);
    }

    #[tokio::test]
    async fn test_full_check_finds_corruption_and_repairs_it() {
        let cluster = SimCluster::new(8);
        let entry = upload(&cluster, "a.bin", vec![5u8; 4_000]).await;
        let bad = entry.current_version().unwrap().fragments[1].clone();
        cluster.store(&bad.server_name).corrupt(&bad.fragment_id);

        let engine = engine(&cluster);
        let record = run(&engine, MaintenanceRequest::new([CheckType::FullShards]).with_repair()).await;
        assert_eq!(record.count(FindingKind::CorruptFragment), 1);
        assert_eq!(record.count(FindingKind::RepairedFragment), 1);

        let moved = cluster.metadata.entry(entry.file_id).unwrap();
        let record_now = moved.current_version().unwrap().fragment(1).unwrap().clone();
        assert_ne!(record_now.server_name, bad.server_name);

        let again = run(&engine, MaintenanceRequest::new([CheckType::FullShards])).await;
        assert_eq!(again.count(FindingKind::CorruptFragment), 0);
    }

    #[tokio::test]
    async fn test_failed_rebuild_is_recorded_on_the_file_unit() {
        let cluster = SimCluster::new(6);
        let entry = upload(&cluster, "a.bin", vec![9u8; 4_000]).await;
        let bad = entry.current_version().unwrap().fragments[1].clone();
        cluster.store(&bad.server_name).corrupt(&bad.fragment_id);

        // reachable, but none accepts new fragments
        for i in 0..6 {
            cluster
                .registry
                .set_status(&format!("srv-{}", i), ServerStatus::NeedsAttention)
                .unwrap();
        }

        let record = run(&engine(&cluster), MaintenanceRequest::new([CheckType::FullShards]).with_repair()).await;
        assert_eq!(record.count(FindingKind::CorruptFragment), 1);
        assert_eq!(record.count(FindingKind::RepairedFragment), 0);
        assert_eq!(record.errors, 1);

        let unit = record.progress[&CheckType::FullShards]
            .iter()
            .find(|p| p.file_id == Some(entry.file_id))
            .unwrap();
        assert_eq!(unit.status, UnitStatus::Error);
        assert!(unit.message.contains("rebuild failed"), "{}", unit.message);

        let current = cluster.metadata.entry(entry.file_id).unwrap();
        assert_eq!(current.current_version().unwrap().fragment(1).unwrap().server_name, bad.server_name);
        assert_eq!(current.status, EntryStatus::Active);
    }

    #[tokio::test]
    async fn test_full_check_marks_unrecoverable_file_corrupt() {
        let cluster = SimCluster::new(6);
        let entry = upload(&cluster, "a.bin", vec![5u8; 4_000]).await;
        for fragment in &entry.current_version().unwrap().fragments[..3] {
            cluster.store(&fragment.server_name).lose(&fragment.fragment_id);
        }

        let record = run(&engine(&cluster), MaintenanceRequest::new([CheckType::FullShards]).with_repair()).await;
        assert_eq!(record.count(FindingKind::ReconstructionMismatch), 1);
        assert_eq!(cluster.metadata.entry(entry.file_id).unwrap().status, EntryStatus::Corrupt);
    }

    #[tokio::test]
    async fn test_back_to_back_sightings_do_not_confirm_each_other() {
        let cluster = SimCluster::new(6);
        upload(&cluster, "a.bin", vec![1u8; 1_000]).await;
        cluster.store("srv-2").put("stray-fragment", b"leftover").await.unwrap();
        let config = MaintenanceConfig {
            server_attempts: 1,
            orphan_confirmation_gap_secs: 3_600,
            ..MaintenanceConfig::default()
        };
        let engine = MaintenanceEngine::open(Arc::new(cluster.files()), config).unwrap();

        run(&engine, MaintenanceRequest::new([CheckType::OrphanedShards])).await;
        let second = run(&engine, MaintenanceRequest::new([CheckType::DeleteFragments])).await;
        assert_eq!(second.count(FindingKind::OrphanedFragment), 1);
        assert_eq!(second.count(FindingKind::DeletedOrphan), 0);
        assert!(cluster.store("srv-2").stat("stray-fragment").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_orphan_deleted_only_after_second_confirmation() {
        let cluster = SimCluster::new(6);
        upload(&cluster, "a.bin", vec![1u8; 1_000]).await;
        cluster.store("srv-2").put("stray-fragment", b"leftover").await.unwrap();
        let engine = engine(&cluster);

        let first = run(&engine, MaintenanceRequest::new([CheckType::DeleteFragments])).await;
        assert_eq!(first.count(FindingKind::OrphanedFragment), 1);
        assert_eq!(first.count(FindingKind::DeletedOrphan), 0);
        assert!(cluster.store("srv-2").stat("stray-fragment").await.unwrap().is_some());

        let second = run(&engine, MaintenanceRequest::new([CheckType::DeleteFragments])).await;
        assert_eq!(second.count(FindingKind::DeletedOrphan), 1);
        assert!(cluster.store("srv-2").stat("stray-fragment").await.unwrap().is_none());

        // referenced fragments are never touched
        let listed = cluster.store("srv-0").list().await.unwrap();
        assert!(!listed.is_empty());
    }

    #[tokio::test]
    async fn test_scan_without_delete_flag_keeps_orphans() {
        let cluster = SimCluster::new(6);
        cluster.store("srv-1").put("stray", b"x").await.unwrap();
        let engine = engine(&cluster);

        for _ in 0..3 {
            let record = run(&engine, MaintenanceRequest::new([CheckType::OrphanedShards])).await;
            assert_eq!(record.count(FindingKind::DeletedOrphan), 0);
        }
        assert!(cluster.store("srv-1").stat("stray").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reserved_fragments_are_not_orphans() {
        let cluster = SimCluster::new(6);
        cluster.store("srv-1").put("in-flight", b"x").await.unwrap();
        let _intent = cluster.metadata.reserve_fragments(vec!["in-flight".to_string()]);

        let record = run(&engine(&cluster), MaintenanceRequest::new([CheckType::OrphanedShards])).await;
        assert_eq!(record.count(FindingKind::OrphanedFragment), 0);
    }

    #[tokio::test]
    async fn test_orphaned_files_are_quarantined() {
        let cluster = SimCluster::new(6);
        cluster.metadata.register_user("bob").unwrap();
        let entry = cluster
            .files()
            .upload(&Caller::user("bob"), UploadRequest::new(None, "b.txt", b"bob's".to_vec()))
            .await
            .unwrap();
        cluster.metadata.remove_user("bob").unwrap();

        let engine = engine(&cluster);
        let report_only = run(&engine, MaintenanceRequest::new([CheckType::OrphanedFiles])).await;
        assert_eq!(report_only.count(FindingKind::OrphanedFile), 1);
        assert_eq!(cluster.metadata.entry(entry.file_id).unwrap().status, EntryStatus::Active);

        run(&engine, MaintenanceRequest::new([CheckType::OrphanedFiles]).with_repair()).await;
        assert_eq!(
            cluster.metadata.entry(entry.file_id).unwrap().status,
            EntryStatus::Quarantined
        );
    }

    #[tokio::test]
    async fn test_expired_grants_are_purged() {
        let cluster = SimCluster::new(6);
        cluster.metadata.register_group("interns").unwrap();
        let entry = upload(&cluster, "a.txt", b"data".to_vec()).await;
        cluster
            .metadata
            .grant(entry.file_id, Principal::Group("interns".into()), PermissionSet::read_only())
            .unwrap();
        cluster.metadata.remove_group("interns").unwrap();

        let record = run(&engine(&cluster), MaintenanceRequest::new([CheckType::Permissions]).with_repair()).await;
        assert_eq!(record.count(FindingKind::ExpiredPermission), 1);
        assert!(cluster.metadata.permissions_for(entry.file_id).is_empty());
        assert!(cluster.registry.log().recent(50).iter().any(|e| e.message.contains("ExpiredPermission")));
    }

    #[tokio::test]
    async fn test_offline_server_without_fragments_is_skipped() {
        let cluster = SimCluster::new(7);
        let entry = upload(&cluster, "a.bin", vec![1u8; 100]).await;
        let used: HashSet<String> = entry
            .current_version()
            .unwrap()
            .fragments
            .iter()
            .map(|f| f.server_name.clone())
            .collect();
        let idle = (0..7)
            .map(|i| format!("srv-{}", i))
            .find(|name| !used.contains(name))
            .unwrap();
        cluster.registry.set_status(&idle, crate::cluster::ServerStatus::Offline).unwrap();

        let record = run(&engine(&cluster), MaintenanceRequest::new([CheckType::QuickShards])).await;
        let entry = record.progress[&CheckType::QuickShards]
            .iter()
            .find(|p| p.server_name.as_deref() == Some(idle.as_str()))
            .unwrap();
        assert_eq!(entry.status, UnitStatus::Skipped);
        assert_eq!(record.errors, 0);
    }
}
