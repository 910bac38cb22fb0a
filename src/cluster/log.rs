//! Bounded in-memory cluster event log

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub server_name: Option<String>,
    pub message: String,
}

pub struct ClusterLog {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
}

impl ClusterLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, level: LogLevel, server_name: Option<&str>, message: impl Into<String>) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            timestamp: Utc::now(),
            level,
            server_name: server_name.map(str::to_string),
            message: message.into(),
        });
    }

    pub fn info(&self, server_name: Option<&str>, message: impl Into<String>) {
        self.push(LogLevel::Info, server_name, message);
    }

    pub fn warning(&self, server_name: Option<&str>, message: impl Into<String>) {
        self.push(LogLevel::Warning, server_name, message);
    }

    pub fn error(&self, server_name: Option<&str>, message: impl Into<String>) {
        self.push(LogLevel::Error, server_name, message);
    }

    /// Newest entries first
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.entries.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Entries at or after `since`, oldest first
    pub fn since(&self, since: DateTime<Utc>) -> Vec<LogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.timestamp >= since)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for ClusterLog {
    fn default() -> Self {
        Self::new(10_000)
    }
}
