//! Maintenance Engine - integrity checks, repair and orphan cleanup
//!
//! Jobs run a set of checks concurrently against the fragment servers and
//! the metadata store, record per-unit progress and findings, and persist
//! their records in a sled journal.

mod checks;
mod engine;
mod job;
mod journal;

pub use engine::{MaintenanceConfig, MaintenanceEngine};
pub use job::{
    CheckType, Finding, FindingKind, JobId, JobRecord, JobStatus, MaintenanceProgress, MaintenanceRequest, UnitStatus,
};
pub use journal::{open_db, JobJournal, OrphanLedger};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MaintenanceError {
    #[error("No checks were requested")]
    NothingRequested,

    #[error("Job {0} already holds the destructive lock")]
    JobConflict(JobId),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job {0} has not finished")]
    JobActive(JobId),

    #[error("Cannot {action} job {job} while it is {status:?}")]
    InvalidTransition {
        job: JobId,
        status: JobStatus,
        action: &'static str,
    },

    #[error("Journal error: {0}")]
    Journal(String),
}

impl From<sled::Error> for MaintenanceError {
    fn from(e: sled::Error) -> Self {
        MaintenanceError::Journal(e.to_string())
    }
}

impl From<serde_json::Error> for MaintenanceError {
    fn from(e: serde_json::Error) -> Self {
        MaintenanceError::Journal(e.to_string())
    }
}

impl From<bincode::Error> for MaintenanceError {
    fn from(e: bincode::Error) -> Self {
        MaintenanceError::Journal(e.to_string())
    }
}
