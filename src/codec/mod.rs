//! Fragment Codec - Reed-Solomon erasure coding of file versions
//!
//! Splits a version's bytes into data fragments plus parity fragments and
//! rebuilds the original bytes from any `data_shards` verified fragments.

mod erasure;

pub use erasure::{EncodedVersion, ErasureConfig, Fragment, FragmentCodec, FragmentLayout};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Not enough fragments available: have {have}, need {need}")]
    InsufficientFragments { have: usize, need: usize },

    #[error("Checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("Invalid erasure configuration: {0}")]
    InvalidConfig(String),

    #[error("Erasure coding error: {0}")]
    ErasureCoding(String),
}
