//! Maintenance job lifecycle
//!
//! A job moves `Queued -> Running -> {Completed | Failed | Stopped}`, may be
//! paused and resumed while running, and can be stopped from any
//! non-terminal state. Each requested check runs as its own task; the tasks
//! observe a shared control channel between units of work.

use super::checks::{self, CheckRun};
use super::job::{JobId, JobRecord, JobStatus, MaintenanceRequest, UnitStatus};
use super::journal::{open_db, JobJournal, OrphanLedger};
use super::MaintenanceError;
use crate::files::{FileService, FragmentIo};
use crate::metadata::EntryId;
use crate::storage::RetryPolicy;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Timeout for a single server operation
    pub server_timeout_ms: u64,

    /// Attempts per server operation before the unit is marked as failed
    pub server_attempts: u32,

    /// Cadence of scheduled jobs; 0 disables the scheduler
    pub schedule_interval_secs: u64,

    /// What scheduled jobs run
    pub scheduled_request: MaintenanceRequest,

    /// Journal location, temporary when unset
    pub journal_path: Option<PathBuf>,

    /// Minimum time between two sightings of an orphan for both to count
    #[serde(default = "default_orphan_gap")]
    pub orphan_confirmation_gap_secs: u64,
}

fn default_orphan_gap() -> u64 {
    10 * 60
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            server_timeout_ms: 5_000,
            server_attempts: 3,
            schedule_interval_secs: 24 * 60 * 60,
            scheduled_request: MaintenanceRequest::new([
                super::CheckType::QuickShards,
                super::CheckType::OrphanedShards,
            ]),
            journal_path: None,
            orphan_confirmation_gap_secs: default_orphan_gap(),
        }
    }
}

impl MaintenanceConfig {
    pub fn orphan_confirmation_gap(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.orphan_confirmation_gap_secs.min(i64::MAX as u64) as i64)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.server_attempts,
            attempt_timeout_ms: self.server_timeout_ms,
            ..RetryPolicy::default()
        }
    }
}

/// What running checks are told to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Control {
    Run,
    Pause,
    Stop,
}

/// Live state of one job
pub(super) struct JobHandle {
    record: Mutex<JobRecord>,
    control: watch::Sender<Control>,
    status: watch::Sender<JobStatus>,
    journal: JobJournal,
}

impl JobHandle {
    fn new(record: JobRecord, journal: JobJournal) -> Self {
        let (control, _) = watch::channel(Control::Run);
        let (status, _) = watch::channel(record.status);
        Self {
            record: Mutex::new(record),
            control,
            status,
            journal,
        }
    }

    pub(super) fn id(&self) -> JobId {
        self.record.lock().id
    }

    pub(super) fn snapshot(&self) -> JobRecord {
        self.record.lock().clone()
    }

    pub(super) fn control(&self) -> watch::Receiver<Control> {
        self.control.subscribe()
    }

    fn persist(&self, record: &JobRecord) {
        if let Err(e) = self.journal.save(record) {
            warn!(job = %record.id, error = %e, "Failed to persist job record");
        }
    }

    /// Add units to the job's total
    pub(super) fn schedule(&self, units: u64) {
        let mut record = self.record.lock();
        if record.status.is_terminal() {
            return;
        }
        record.units_total += units;
        record.update_percent();
    }

    /// Append an in-progress entry; `None` once the job has ended
    pub(super) fn begin_unit(
        &self,
        check: super::CheckType,
        server_name: Option<&str>,
        file_id: Option<EntryId>,
        message: impl Into<String>,
    ) -> Option<usize> {
        let mut record = self.record.lock();
        if record.status.is_terminal() {
            return None;
        }
        let entries = record.progress.entry(check).or_default();
        entries.push(super::MaintenanceProgress {
            timestamp: Utc::now(),
            server_name: server_name.map(str::to_string),
            file_id,
            in_progress: true,
            status: UnitStatus::Ok,
            message: message.into(),
        });
        Some(entries.len() - 1)
    }

    /// Close the entry opened by `begin_unit` and count the unit as done
    pub(super) fn finish_unit(&self, check: super::CheckType, slot: Option<usize>, status: UnitStatus, message: String) {
        let mut record = self.record.lock();
        if record.status.is_terminal() {
            return;
        }
        let Some(entry) = slot.and_then(|i| record.progress.get_mut(&check).and_then(|e| e.get_mut(i))) else {
            return;
        };
        entry.timestamp = Utc::now();
        entry.in_progress = false;
        entry.status = status;
        entry.message = message;

        record.units_done += 1;
        if status == UnitStatus::Error {
            record.errors += 1;
        }
        record.update_percent();
        self.persist(&record);
    }

    pub(super) fn add_finding(&self, finding: super::Finding) {
        let mut record = self.record.lock();
        if record.status.is_terminal() {
            return;
        }
        record.findings.push(finding);
    }

    /// Move from `from` to `to`, or fail with `InvalidTransition`
    fn transition(&self, from: JobStatus, to: JobStatus, action: &'static str) -> Result<JobRecord, MaintenanceError> {
        let mut record = self.record.lock();
        if record.status != from {
            return Err(MaintenanceError::InvalidTransition {
                job: record.id,
                status: record.status,
                action,
            });
        }
        record.status = to;
        record.status_msg = format!("{:?}", to);
        self.persist(&record);
        self.status.send_replace(to);
        Ok(record.clone())
    }

    /// Mark a job Running if it is still queued
    fn mark_running(&self) -> bool {
        let mut record = self.record.lock();
        if record.status != JobStatus::Queued {
            return false;
        }
        record.status = JobStatus::Running;
        record.status_msg = "Running".into();
        record.start_time = Some(Utc::now());
        self.persist(&record);
        self.status.send_replace(JobStatus::Running);
        true
    }

    fn stop(&self) -> Result<JobRecord, MaintenanceError> {
        let mut record = self.record.lock();
        if record.status.is_terminal() {
            return Err(MaintenanceError::InvalidTransition {
                job: record.id,
                status: record.status,
                action: "stop",
            });
        }
        record.status = JobStatus::Stopped;
        record.status_msg = "Stopped by request".into();
        record.end_time = Some(Utc::now());
        for entry in record.progress.values_mut().flatten().filter(|e| e.in_progress) {
            entry.in_progress = false;
            entry.status = UnitStatus::Skipped;
            entry.message = "Stopped before completion".into();
        }
        self.persist(&record);
        self.control.send_replace(Control::Stop);
        self.status.send_replace(JobStatus::Stopped);
        Ok(record.clone())
    }

    fn finish(&self, failure: Option<String>) {
        let mut record = self.record.lock();
        if record.status.is_terminal() {
            return;
        }
        record.end_time = Some(Utc::now());
        match failure {
            Some(reason) => {
                record.status = JobStatus::Failed;
                record.status_msg = reason;
            }
            None => {
                record.status = JobStatus::Completed;
                record.status_msg = format!(
                    "Completed with {} finding(s) and {} error(s)",
                    record.findings.len(),
                    record.errors
                );
            }
        }
        self.persist(&record);
        self.status.send_replace(record.status);
        info!(job = %record.id, status = ?record.status, findings = record.findings.len(), errors = record.errors, "Maintenance job finished");
    }
}

pub(super) struct EngineInner {
    pub(super) files: Arc<FileService>,

    /// Fragment I/O under the maintenance retry budget
    pub(super) io: FragmentIo,
    pub(super) ledger: OrphanLedger,
    journal: JobJournal,
    pub(super) config: MaintenanceConfig,
    jobs: DashMap<JobId, Arc<JobHandle>>,
    destructive: Mutex<Option<JobId>>,
}

impl EngineInner {
    fn release_destructive(&self, id: JobId) {
        let mut holder = self.destructive.lock();
        if *holder == Some(id) {
            *holder = None;
        }
    }
}

#[derive(Clone)]
pub struct MaintenanceEngine {
    inner: Arc<EngineInner>,
}

impl MaintenanceEngine {
    pub fn open(files: Arc<FileService>, config: MaintenanceConfig) -> Result<Self, MaintenanceError> {
        let db = open_db(config.journal_path.as_deref())?;
        Self::with_db(files, config, &db)
    }

    pub fn with_db(files: Arc<FileService>, config: MaintenanceConfig, db: &sled::Db) -> Result<Self, MaintenanceError> {
        let journal = JobJournal::new(db)?;
        let ledger = OrphanLedger::new(db)?;

        // jobs cut off by a restart cannot be resumed
        for mut record in journal.list()? {
            if !record.status.is_terminal() {
                warn!(job = %record.id, status = ?record.status, "Marking interrupted job as failed");
                record.status = JobStatus::Failed;
                record.status_msg = "Interrupted by restart".into();
                record.end_time = Some(Utc::now());
                journal.save(&record)?;
            }
        }

        let io = files.fragment_io().with_retry_policy(config.retry_policy());
        Ok(Self {
            inner: Arc::new(EngineInner {
                files,
                io,
                ledger,
                journal,
                config,
                jobs: DashMap::new(),
                destructive: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &MaintenanceConfig {
        &self.inner.config
    }

    /// `POST maintenance/start`
    pub fn start(&self, request: MaintenanceRequest) -> Result<JobRecord, MaintenanceError> {
        if request.is_empty() {
            return Err(MaintenanceError::NothingRequested);
        }

        let record = JobRecord::new(request);
        let id = record.id;
        if record.request.is_destructive() {
            let mut holder = self.inner.destructive.lock();
            if let Some(active) = *holder {
                return Err(MaintenanceError::JobConflict(active));
            }
            *holder = Some(id);
        }

        if let Err(e) = self.inner.journal.save(&record) {
            self.inner.release_destructive(id);
            return Err(e);
        }

        let handle = Arc::new(JobHandle::new(record.clone(), self.inner.journal.clone()));
        self.inner.jobs.insert(id, handle.clone());
        info!(job = %id, checks = ?record.request.checks, repair = record.request.repair, "Maintenance job queued");

        tokio::spawn(run_job(self.inner.clone(), handle));
        Ok(record)
    }

    fn handle(&self, id: JobId) -> Result<Arc<JobHandle>, MaintenanceError> {
        self.inner
            .jobs
            .get(&id)
            .map(|h| Arc::clone(h.value()))
            .ok_or(MaintenanceError::JobNotFound(id))
    }

    /// `GET maintenance/job/:id`
    pub fn get(&self, id: JobId) -> Result<JobRecord, MaintenanceError> {
        if let Ok(handle) = self.handle(id) {
            return Ok(handle.snapshot());
        }
        self.inner.journal.load(id)?.ok_or(MaintenanceError::JobNotFound(id))
    }

    /// Every known job, oldest first
    pub fn list(&self) -> Result<Vec<JobRecord>, MaintenanceError> {
        let mut records = self.inner.journal.list()?;
        for record in records.iter_mut() {
            if let Some(handle) = self.inner.jobs.get(&record.id) {
                *record = handle.snapshot();
            }
        }
        Ok(records)
    }

    pub fn pause(&self, id: JobId) -> Result<JobRecord, MaintenanceError> {
        let handle = self.handle(id)?;
        let record = handle.transition(JobStatus::Running, JobStatus::Paused, "pause")?;
        handle.control.send_replace(Control::Pause);
        info!(job = %id, "Maintenance job paused");
        Ok(record)
    }

    pub fn resume(&self, id: JobId) -> Result<JobRecord, MaintenanceError> {
        let handle = self.handle(id)?;
        let record = handle.transition(JobStatus::Paused, JobStatus::Running, "resume")?;
        handle.control.send_replace(Control::Run);
        info!(job = %id, "Maintenance job resumed");
        Ok(record)
    }

    /// Stop a job; in-flight units finish but nothing more is recorded
    pub fn stop(&self, id: JobId) -> Result<JobRecord, MaintenanceError> {
        let record = self.handle(id)?.stop()?;
        info!(job = %id, "Maintenance job stopped");
        Ok(record)
    }

    /// `DELETE maintenance/job/:id`
    pub fn delete(&self, id: JobId) -> Result<(), MaintenanceError> {
        if let Ok(handle) = self.handle(id) {
            let status = handle.snapshot().status;
            if !status.is_terminal() {
                return Err(MaintenanceError::JobActive(id));
            }
        }

        let in_memory = self.inner.jobs.remove(&id).is_some();
        let journaled = self.inner.journal.remove(id)?;
        if !in_memory && !journaled {
            return Err(MaintenanceError::JobNotFound(id));
        }
        debug!(job = %id, "Maintenance job deleted");
        Ok(())
    }

    /// Wait until the job reaches a terminal state
    pub async fn wait(&self, id: JobId) -> Result<JobRecord, MaintenanceError> {
        let handle = match self.handle(id) {
            Ok(handle) => handle,
            Err(_) => {
                let record = self.get(id)?;
                return if record.status.is_terminal() {
                    Ok(record)
                } else {
                    Err(MaintenanceError::JobNotFound(id))
                };
            }
        };

        let mut status = handle.status.subscribe();
        status
            .wait_for(JobStatus::is_terminal)
            .await
            .map_err(|_| MaintenanceError::JobNotFound(id))?;
        Ok(handle.snapshot())
    }

    /// Start the configured request on a fixed cadence until `shutdown` flips
    pub fn spawn_scheduler(&self, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        if self.inner.config.schedule_interval_secs == 0 {
            return None;
        }
        let period = Duration::from_secs(self.inner.config.schedule_interval_secs);
        let engine = self.clone();

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match engine.start(engine.inner.config.scheduled_request.clone()) {
                            Ok(record) => debug!(job = %record.id, "Scheduled maintenance job started"),
                            Err(e) => warn!(error = %e, "Scheduled maintenance job not started"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Maintenance scheduler shutting down");
                            break;
                        }
                    }
                }
            }
        }))
    }
}

async fn run_job(inner: Arc<EngineInner>, handle: Arc<JobHandle>) {
    let id = handle.id();
    if !handle.mark_running() {
        inner.release_destructive(id);
        return;
    }

    let request = handle.snapshot().request;
    let delete = request.is_destructive();
    let plans: Vec<_> = request
        .runnable_checks()
        .into_iter()
        .map(|check| (check, checks::plan(&inner, check)))
        .collect();
    handle.schedule(plans.iter().map(|(_, units)| units.len() as u64).sum());

    let tasks = plans.into_iter().map(|(check, units)| {
        let run = CheckRun::new(inner.clone(), handle.clone(), check, request.repair, delete);
        tokio::spawn(run.execute(units))
    });

    let mut failure = None;
    for result in join_all(tasks).await {
        if let Err(e) = result {
            error!(job = %id, error = %e, "Maintenance check task failed");
            failure = Some(format!("Check task failed: {}", e));
        }
    }

    handle.finish(failure);
    inner.release_destructive(id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::{Caller, UploadRequest};
    use crate::maintenance::CheckType;
    use crate::testing::SimCluster;

    fn engine(cluster: &SimCluster) -> MaintenanceEngine {
        let config = MaintenanceConfig {
            server_timeout_ms: 1_000,
            server_attempts: 1,
            ..MaintenanceConfig::default()
        };
        MaintenanceEngine::open(Arc::new(cluster.files()), config).unwrap()
    }

    async fn seed(cluster: &SimCluster, files: usize) {
        let service = cluster.files();
        for i in 0..files {
            service
                .upload(
                    &Caller::user("alice"),
                    UploadRequest::new(None, &format!("file-{}.bin", i), vec![i as u8; 2_048]),
                )
                .await
                .unwrap();
        }
    }

    fn slow_down(cluster: &SimCluster, millis: u64) {
        for i in 0..6 {
            cluster
                .store(&format!("srv-{}", i))
                .set_latency(Duration::from_millis(millis));
        }
    }

    #[tokio::test]
    async fn test_nothing_requested_creates_no_record() {
        let cluster = SimCluster::new(6);
        let engine = engine(&cluster);

        let err = engine.start(MaintenanceRequest::default()).unwrap_err();
        assert!(matches!(err, MaintenanceError::NothingRequested));
        assert!(engine.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clean_cluster_completes_at_full_progress() {
        let cluster = SimCluster::new(6);
        seed(&cluster, 2).await;
        let engine = engine(&cluster);

        let job = engine
            .start(MaintenanceRequest::new([CheckType::QuickShards, CheckType::Permissions]))
            .unwrap();
        let record = engine.wait(job.id).await.unwrap();

        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.units_done, record.units_total);
        assert_eq!(record.percent_complete, 100.0);
        assert_eq!(record.progress[&CheckType::QuickShards].len(), 6);
        assert!(record.findings.is_empty());
        assert!(record.end_time.is_some());
    }

    #[tokio::test]
    async fn test_stop_freezes_progress() {
        let cluster = SimCluster::new(6);
        seed(&cluster, 3).await;
        slow_down(&cluster, 100);
        let engine = engine(&cluster);

        let job = engine.start(MaintenanceRequest::new([CheckType::FullShards])).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let stopped = engine.stop(job.id).unwrap();
        assert_eq!(stopped.status, JobStatus::Stopped);
        let entries = stopped.progress.values().map(Vec::len).sum::<usize>();

        let finished = engine.wait(job.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let later = engine.get(job.id).unwrap();

        assert_eq!(finished.status, JobStatus::Stopped);
        assert_eq!(later.status, JobStatus::Stopped);
        assert_eq!(later.progress.values().map(Vec::len).sum::<usize>(), entries);
        assert!(later.progress.values().flatten().all(|e| !e.in_progress));

        assert!(matches!(
            engine.stop(job.id),
            Err(MaintenanceError::InvalidTransition { action: "stop", .. })
        ));
        assert!(matches!(
            engine.resume(job.id),
            Err(MaintenanceError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_second_destructive_job_conflicts() {
        let cluster = SimCluster::new(6);
        seed(&cluster, 1).await;
        slow_down(&cluster, 100);
        let engine = engine(&cluster);

        let first = engine.start(MaintenanceRequest::new([CheckType::DeleteFragments])).unwrap();
        let err = engine
            .start(MaintenanceRequest::new([CheckType::DeleteFragments, CheckType::QuickShards]))
            .unwrap_err();
        assert!(matches!(err, MaintenanceError::JobConflict(id) if id == first.id));

        // non-destructive jobs still run alongside
        let quick = engine.start(MaintenanceRequest::new([CheckType::QuickShards])).unwrap();

        engine.wait(first.id).await.unwrap();
        engine.wait(quick.id).await.unwrap();
        let again = engine.start(MaintenanceRequest::new([CheckType::DeleteFragments])).unwrap();
        engine.wait(again.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let cluster = SimCluster::new(6);
        seed(&cluster, 1).await;
        slow_down(&cluster, 50);
        let engine = engine(&cluster);

        let job = engine.start(MaintenanceRequest::new([CheckType::QuickShards])).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let paused = engine.pause(job.id).unwrap();
        assert_eq!(paused.status, JobStatus::Paused);
        assert!(matches!(
            engine.pause(job.id),
            Err(MaintenanceError::InvalidTransition { action: "pause", .. })
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let held = engine.get(job.id).unwrap();
        assert_eq!(held.status, JobStatus::Paused);
        assert!(held.units_done < held.units_total);

        engine.resume(job.id).unwrap();
        let record = engine.wait(job.id).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.units_done, record.units_total);
    }

    #[tokio::test]
    async fn test_delete_only_after_terminal() {
        let cluster = SimCluster::new(6);
        seed(&cluster, 1).await;
        slow_down(&cluster, 50);
        let engine = engine(&cluster);

        let job = engine.start(MaintenanceRequest::new([CheckType::QuickShards])).unwrap();
        assert!(matches!(engine.delete(job.id), Err(MaintenanceError::JobActive(_))));

        engine.wait(job.id).await.unwrap();
        engine.delete(job.id).unwrap();
        assert!(matches!(engine.get(job.id), Err(MaintenanceError::JobNotFound(_))));
        assert!(matches!(engine.delete(job.id), Err(MaintenanceError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn test_interrupted_jobs_fail_on_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let cluster = SimCluster::new(6);
        let record = JobRecord::new(MaintenanceRequest::new([CheckType::QuickShards]));
        {
            let db = open_db(Some(dir.path())).unwrap();
            JobJournal::new(&db).unwrap().save(&record).unwrap();
            db.flush().unwrap();
        }

        let config = MaintenanceConfig {
            journal_path: Some(dir.path().to_path_buf()),
            ..MaintenanceConfig::default()
        };
        let engine = MaintenanceEngine::open(Arc::new(cluster.files()), config).unwrap();
        let loaded = engine.get(record.id).unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(engine.wait(record.id).await.unwrap().status, JobStatus::Failed);
    }
}
