//! Metadata Store - files, folders, versions, fragment locations, permissions
//!
//! Metadata is authoritative for where a fragment should be; fragment servers
//! are authoritative for whether it is there.

mod entry;
mod permission;
mod store;

pub use entry::{
    fragment_id, is_fragment_of, new_write_tag, Entry, EntryId, EntryStatus, EntryType, FilePatch, FragmentRecord,
    VersionRecord, VersioningMode,
};
pub use permission::{Access, Permission, PermissionSet, Principal};
pub use store::{
    CommitOutcome, ExpectedFragment, IntentGuard, IntentId, MetadataStore, MetadataUsage, NewFile, OrphanReason,
    OrphanedFile, Relocation, Reseal, VersionScope,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Entry not found: {0}")]
    NotFound(EntryId),

    #[error("Version {version_no} of {file_id} not found")]
    VersionNotFound { file_id: EntryId, version_no: u64 },

    #[error("Fragment record not found: {0}")]
    FragmentNotFound(String),

    #[error("An entry named '{name}' already exists here")]
    AlreadyExists { name: String },

    #[error("Metadata conflict on {file_id}: {detail}")]
    MetadataConflict { file_id: EntryId, detail: String },

    #[error("Not a folder: {0}")]
    NotAFolder(EntryId),

    #[error("Not a file: {0}")]
    NotAFile(EntryId),

    #[error("Folder is not empty: {0}")]
    NotEmpty(EntryId),

    #[error("Invalid move: {0}")]
    InvalidMove(String),

    #[error("Invalid version record: {0}")]
    InvalidRecord(String),

    #[error("Unknown principal: {0}")]
    UnknownPrincipal(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),
}
