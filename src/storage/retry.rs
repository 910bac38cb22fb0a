//! Bounded retry with exponential back-off for per-server operations.
//!
//! Every attempt runs under a timeout; transient failures (unreachable,
//! timed out) are retried until the attempt budget is spent, then the last
//! error is returned for the caller to record.

use super::StorageError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,

    pub initial_backoff_ms: u64,

    pub max_backoff_ms: u64,

    /// Timeout applied to each attempt
    pub attempt_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 1_000,
            attempt_timeout_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no back-off
    pub fn once(attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            attempt_timeout_ms: attempt_timeout.as_millis() as u64,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(16);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

/// Run `op` against `server` under `policy`
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, server: &str, mut op: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let timeout = Duration::from_millis(policy.attempt_timeout_ms);
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let result = match tokio::time::timeout(timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout {
                server: server.to_string(),
                millis: policy.attempt_timeout_ms,
            }),
        };

        match result {
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                let wait = policy.backoff(attempt);
                debug!(server, attempt, ?wait, error = %e, "Retrying server operation");
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
