//! Maintenance job records

use crate::metadata::EntryId;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

pub type JobId = Uuid;

/// A check a maintenance job can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    /// Current versions: listings compared against metadata
    QuickShards,
    /// Every retained fragment read, verified and decoded
    FullShards,
    MissingShards,
    OrphanedShards,
    OrphanedFiles,
    Permissions,
    /// Allow orphan deletion; implies an orphan scan
    DeleteFragments,
}

impl CheckType {
    pub fn is_destructive(&self) -> bool {
        matches!(self, CheckType::DeleteFragments)
    }
}

/// What a job should do
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceRequest {
    pub checks: BTreeSet<CheckType>,

    /// Fix what the checks find instead of only reporting it
    #[serde(default)]
    pub repair: bool,
}

impl MaintenanceRequest {
    pub fn new(checks: impl IntoIterator<Item = CheckType>) -> Self {
        Self {
            checks: checks.into_iter().collect(),
            repair: false,
        }
    }

    pub fn with_repair(mut self) -> Self {
        self.repair = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    pub fn is_destructive(&self) -> bool {
        self.checks.iter().any(CheckType::is_destructive)
    }

    /// Checks that actually run; `DeleteFragments` folds into the orphan scan
    pub fn runnable_checks(&self) -> BTreeSet<CheckType> {
        let mut checks: BTreeSet<CheckType> = self.checks.iter().copied().filter(|c| !c.is_destructive()).collect();
        if self.is_destructive() {
            checks.insert(CheckType::OrphanedShards);
        }
        checks
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Ok,
    Error,
    Skipped,
}

/// One unit of work (a server or a file) within a check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceProgress {
    pub timestamp: DateTime<Utc>,
    pub server_name: Option<String>,
    pub file_id: Option<EntryId>,
    pub in_progress: bool,
    pub status: UnitStatus,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    MissingFragment,
    CorruptFragment,
    OrphanedFragment,
    OrphanedFile,
    ExpiredPermission,
    RepairedFragment,
    DeletedOrphan,
    /// A version could not be rebuilt into content matching its checksum
    ReconstructionMismatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub check: CheckType,
    pub server_name: Option<String>,
    pub file_id: Option<EntryId>,
    pub version_no: Option<u64>,
    pub fragment_id: Option<String>,
    pub detail: String,
}

impl Finding {
    pub fn new(kind: FindingKind, check: CheckType, detail: impl Into<String>) -> Self {
        Self {
            kind,
            check,
            server_name: None,
            file_id: None,
            version_no: None,
            fragment_id: None,
            detail: detail.into(),
        }
    }

    pub fn on_server(mut self, server: &str) -> Self {
        self.server_name = Some(server.to_string());
        self
    }

    pub fn for_version(mut self, file_id: EntryId, version_no: u64) -> Self {
        self.file_id = Some(file_id);
        self.version_no = Some(version_no);
        self
    }

    pub fn for_file(mut self, file_id: EntryId) -> Self {
        self.file_id = Some(file_id);
        self
    }

    pub fn fragment(mut self, fragment_id: &str) -> Self {
        self.fragment_id = Some(fragment_id.to_string());
        self
    }
}

/// State of one maintenance job as served by `maintenance/job/:id`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub request: MaintenanceRequest,
    pub status: JobStatus,
    pub status_msg: String,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub progress: BTreeMap<CheckType, Vec<MaintenanceProgress>>,
    pub units_total: u64,
    pub units_done: u64,

    /// `units_done / units_total` as a percentage
    pub percent_complete: f64,
    pub errors: u64,
    pub findings: Vec<Finding>,
}

impl JobRecord {
    pub fn new(request: MaintenanceRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            status: JobStatus::Queued,
            status_msg: "Queued".into(),
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            progress: BTreeMap::new(),
            units_total: 0,
            units_done: 0,
            percent_complete: 0.0,
            errors: 0,
            findings: Vec::new(),
        }
    }

    pub fn count(&self, kind: FindingKind) -> usize {
        self.findings.iter().filter(|f| f.kind == kind).count()
    }

    pub fn findings_of(&self, kind: FindingKind) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(move |f| f.kind == kind)
    }

    pub(crate) fn update_percent(&mut self) {
        self.percent_complete = if self.units_total == 0 {
            0.0
        } else {
            self.units_done as f64 / self.units_total as f64 * 100.0
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_fragments_folds_into_orphan_scan() {
        let request = MaintenanceRequest::new([CheckType::DeleteFragments]);
        assert!(request.is_destructive());
        assert_eq!(
            request.runnable_checks().into_iter().collect::<Vec<_>>(),
            vec![CheckType::OrphanedShards]
        );

        let request = MaintenanceRequest::new([CheckType::QuickShards, CheckType::Permissions]);
        assert!(!request.is_destructive());
        assert_eq!(request.runnable_checks().len(), 2);
    }

    #[test]
    fn test_percent_tracks_units() {
        let mut record = JobRecord::new(MaintenanceRequest::new([CheckType::QuickShards]));
        record.units_total = 4;
        record.units_done = 1;
        record.update_percent();
        assert_eq!(record.percent_complete, 25.0);
    }

    #[test]
    fn test_request_serializes_check_names() {
        let request = MaintenanceRequest::new([CheckType::OrphanedShards]).with_repair();
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"checks":["orphaned_shards"],"repair":true}"#);
    }
}
