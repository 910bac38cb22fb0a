//! File operations - upload, download, metadata and folder management
//!
//! Ties the codec, placement planner, fragment servers and metadata store
//! together for whole-file operations.

mod io;
mod service;

pub use io::{FetchOutcome, FragmentIo};
pub use service::{Caller, EvacuationReport, FileService, UploadRequest};

use crate::codec::{CodecError, ErasureConfig};
use crate::crypto::CryptoError;
use crate::metadata::{EntryId, MetadataError};
use crate::placement::PlacementError;
use crate::storage::StorageError;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FileError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Placement error: {0}")]
    Placement(#[from] PlacementError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("{user} may not access {entry_id}")]
    PermissionDenied { user: String, entry_id: EntryId },

    #[error("File {0} is password protected")]
    PasswordRequired(EntryId),

    #[error("Wrong password for {0}")]
    WrongPassword(EntryId),

    #[error("File {0} is quarantined")]
    Quarantined(EntryId),

    #[error("{0} has no content")]
    Empty(EntryId),

    #[error("Invalid redundancy: {0}")]
    InvalidRedundancy(String),
}

/// Redundancy applied to new versions (`maintenance/stitch`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundancyLevel {
    pub data_shards: usize,
    pub parity_shards: usize,

    /// Distinct servers a version must span even on a degraded cluster
    pub key_threshold: usize,
}

impl RedundancyLevel {
    pub fn new(data_shards: usize, parity_shards: usize, key_threshold: usize) -> Self {
        Self {
            data_shards,
            parity_shards,
            key_threshold,
        }
    }

    pub fn erasure_config(&self) -> ErasureConfig {
        ErasureConfig::new(self.data_shards, self.parity_shards)
    }

    pub fn validate(&self) -> Result<(), FileError> {
        self.erasure_config()
            .validate()
            .map_err(|e| FileError::InvalidRedundancy(e.to_string()))?;
        if self.key_threshold == 0 || self.key_threshold > self.data_shards {
            return Err(FileError::InvalidRedundancy(format!(
                "key_threshold must be between 1 and {}, got {}",
                self.data_shards, self.key_threshold
            )));
        }
        Ok(())
    }
}

impl Default for RedundancyLevel {
    fn default() -> Self {
        let config = ErasureConfig::default();
        Self::new(config.data_shards, config.parity_shards, config.data_shards)
    }
}

impl From<ErasureConfig> for RedundancyLevel {
    fn from(config: ErasureConfig) -> Self {
        Self::new(config.data_shards, config.parity_shards, config.data_shards.max(1))
    }
}
