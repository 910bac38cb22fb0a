//! Permission grants on files and folders

use super::EntryId;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Subject of a grant
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Principal {
    User(String),
    Group(String),
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::User(id) => write!(f, "user:{}", id),
            Principal::Group(id) => write!(f, "group:{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
    Share,
    Audit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    pub can_read: bool,
    pub can_write: bool,
    pub can_execute: bool,
    pub can_share: bool,
    pub can_audit: bool,
}

impl PermissionSet {
    pub fn read_only() -> Self {
        Self {
            can_read: true,
            ..Self::default()
        }
    }

    pub fn full() -> Self {
        Self {
            can_read: true,
            can_write: true,
            can_execute: true,
            can_share: true,
            can_audit: true,
        }
    }

    pub fn allows(&self, access: Access) -> bool {
        match access {
            Access::Read => self.can_read,
            Access::Write => self.can_write,
            Access::Execute => self.can_execute,
            Access::Share => self.can_share,
            Access::Audit => self.can_audit,
        }
    }
}

/// One `(entry, principal) → permissions` grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub entry_id: EntryId,
    pub principal: Principal,
    pub permissions: PermissionSet,
    pub granted_at: DateTime<Utc>,
}
