//! Durable job journal and orphan sightings, both in sled

use super::job::{JobId, JobRecord};
use super::MaintenanceError;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::debug;

const JOBS_TREE: &str = "jobs";
const ORPHANS_TREE: &str = "orphans";

/// Job records keyed by job ID
#[derive(Clone)]
pub struct JobJournal {
    jobs: sled::Tree,
}

impl JobJournal {
    pub fn new(db: &sled::Db) -> Result<Self, MaintenanceError> {
        Ok(Self {
            jobs: db.open_tree(JOBS_TREE)?,
        })
    }

    pub fn save(&self, record: &JobRecord) -> Result<(), MaintenanceError> {
        let value = serde_json::to_vec(record)?;
        self.jobs.insert(record.id.as_bytes(), value)?;
        Ok(())
    }

    pub fn load(&self, id: JobId) -> Result<Option<JobRecord>, MaintenanceError> {
        match self.jobs.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove(&self, id: JobId) -> Result<bool, MaintenanceError> {
        Ok(self.jobs.remove(id.as_bytes())?.is_some())
    }

    /// Every record, oldest first
    pub fn list(&self) -> Result<Vec<JobRecord>, MaintenanceError> {
        let mut records = Vec::new();
        for item in self.jobs.iter() {
            let (_, bytes) = item?;
            records.push(serde_json::from_slice::<JobRecord>(&bytes)?);
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Sightings {
    jobs: BTreeMap<JobId, DateTime<Utc>>,
}

/// Which jobs saw an unreferenced fragment on a server
#[derive(Clone)]
pub struct OrphanLedger {
    sightings: sled::Tree,
}

impl OrphanLedger {
    pub fn new(db: &sled::Db) -> Result<Self, MaintenanceError> {
        Ok(Self {
            sightings: db.open_tree(ORPHANS_TREE)?,
        })
    }

    fn key(server: &str, fragment_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(server.len() + fragment_id.len() + 1);
        key.extend_from_slice(server.as_bytes());
        key.push(0);
        key.extend_from_slice(fragment_id.as_bytes());
        key
    }

    fn read(&self, key: &[u8]) -> Result<Sightings, MaintenanceError> {
        match self.sightings.get(key)? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(Sightings::default()),
        }
    }

    /// Record that `job` saw the orphan at `seen_at`
    ///
    /// Returns the number of independent sightings: the earliest one plus
    /// every other job that saw the fragment at least `min_gap` after it.
    pub fn confirm(
        &self,
        server: &str,
        fragment_id: &str,
        job: JobId,
        seen_at: DateTime<Utc>,
        min_gap: ChronoDuration,
    ) -> Result<usize, MaintenanceError> {
        let key = Self::key(server, fragment_id);
        let mut sightings = self.read(&key)?;
        sightings.jobs.entry(job).or_insert(seen_at);
        self.sightings.insert(key, bincode::serialize(&sightings)?)?;

        let Some(first) = sightings.jobs.values().min().copied() else {
            return Ok(0);
        };
        let later = sightings
            .jobs
            .values()
            .filter(|seen| **seen > first && **seen - first >= min_gap)
            .count();
        Ok(1 + later)
    }

    /// Jobs that have sighted the fragment, independent or not
    pub fn confirmations(&self, server: &str, fragment_id: &str) -> Result<usize, MaintenanceError> {
        Ok(self.read(&Self::key(server, fragment_id))?.jobs.len())
    }

    pub fn forget(&self, server: &str, fragment_id: &str) -> Result<(), MaintenanceError> {
        self.sightings.remove(Self::key(server, fragment_id))?;
        Ok(())
    }

    /// Drop sightings on `server` for fragments no longer seen as orphans
    pub fn retain(&self, server: &str, orphans: &BTreeSet<String>) -> Result<usize, MaintenanceError> {
        let mut prefix = server.as_bytes().to_vec();
        prefix.push(0);

        let mut dropped = 0;
        for item in self.sightings.scan_prefix(&prefix) {
            let (key, _) = item?;
            let fragment_id = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            if !orphans.contains(&fragment_id) {
                self.sightings.remove(&key)?;
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!(server, dropped, "Cleared stale orphan sightings");
        }
        Ok(dropped)
    }
}

/// Open (or create) the sled database backing the journal
pub fn open_db(path: Option<&Path>) -> Result<sled::Db, MaintenanceError> {
    let db = match path {
        Some(path) => sled::open(path)?,
        None => sled::Config::new().temporary(true).open()?,
    };
    Ok(db)
}
