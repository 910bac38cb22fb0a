//! Storage Module - fragment servers
//!
//! A fragment server holds sealed fragment blobs keyed by fragment ID and is
//! authoritative for "this fragment exists here with this checksum". All
//! writes are idempotent so repair retries are safe.

mod backend;
mod local;
mod memory;
mod retry;

pub use backend::{FragmentBackend, FragmentBackends, StorageUsage, StoredFragment};
pub use local::LocalFragmentStore;
pub use memory::MemoryFragmentStore;
pub use retry::{with_retry, RetryPolicy};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Server unreachable: {0}")]
    Unreachable(String),

    #[error("Operation on server {server} timed out after {millis} ms")]
    Timeout { server: String, millis: u64 },

    #[error("Fragment not found: {0}")]
    FragmentNotFound(String),

    #[error("Insufficient space on {server}: need {needed} bytes, {available} available")]
    InsufficientSpace {
        server: String,
        needed: u64,
        available: u64,
    },

    #[error("No backend registered for server {0}")]
    UnknownServer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Errors worth retrying at the per-operation level
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unreachable(_) | StorageError::Timeout { .. })
    }
}
