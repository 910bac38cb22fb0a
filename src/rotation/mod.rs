//! Key Rotation - re-seal every stored fragment under a new key
//!
//! Rotation walks fragments in `(file_id, version_no, index)` order and
//! persists a cursor after each one, so a crashed rotation resumes where it
//! stopped. The previous key stays in the ring until every fragment has moved.

mod service;

pub use service::{KeyRotationService, RotationCursor, RotationReport};

use crate::crypto::{CryptoError, KeyId};
use crate::metadata::MetadataError;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RotationError {
    #[error("Rotation stalled at {fragment_id} on {server}: {reason}")]
    Stalled {
        fragment_id: String,
        server: String,
        reason: String,
    },

    #[error("A rotation to key {0} is already in progress")]
    AlreadyInProgress(KeyId),

    #[error("No rotation in progress")]
    NothingToResume,

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Rotation state error: {0}")]
    State(String),
}

impl From<sled::Error> for RotationError {
    fn from(e: sled::Error) -> Self {
        RotationError::State(e.to_string())
    }
}

impl From<bincode::Error> for RotationError {
    fn from(e: bincode::Error) -> Self {
        RotationError::State(e.to_string())
    }
}
