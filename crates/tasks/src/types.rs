//! Core data types for the task queue.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A row drained from the tasks table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub task_id: String,
    /// Name of the registered job handler in charge of this task.
    pub job_handler: String,
    /// Opaque msgpack job body, decoded by the handler's registration.
    pub job_body: Vec<u8>,
    /// Opaque msgpack [`JobMetadata`], carried through retries.
    pub scheduler_metadata: Vec<u8>,
}

/// Input for inserting a task. The store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub job_handler: String,
    pub job_body: Vec<u8>,
    pub scheduler_metadata: Vec<u8>,
}

/// Retry policy carried with every task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    /// Attempts remaining; decremented on each refire. Zero means unlimited.
    pub retries: u32,
    /// Per-attempt deadline in milliseconds.
    pub timeout_ms: u64,
    /// Delay before a failed task is refired, in milliseconds.
    pub refire_ms: u64,
}

impl Default for JobMetadata {
    fn default() -> Self {
        Self {
            retries: 1,
            timeout_ms: 30_000,
            refire_ms: 1_000,
        }
    }
}

impl JobMetadata {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn refire(&self) -> Duration {
        Duration::from_millis(self.refire_ms)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_roundtrip() {
        let meta = JobMetadata {
            retries: 3,
            timeout_ms: 5_000,
            refire_ms: 1_000,
        };
        let bytes = rmp_serde::to_vec_named(&meta).unwrap();
        let back: JobMetadata = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn test_metadata_defaults_single_attempt() {
        let meta = JobMetadata::default();
        assert_eq!(meta.retries, 1);
        assert_eq!(meta.timeout(), Duration::from_secs(30));
    }
}
