//! Persistence trait for the task table.

use std::time::Duration;

use async_trait::async_trait;

use spherical_common::Result;

use crate::types::{NewTask, TaskRecord};

/// Backend for the durable task queue. A task is visible to drainers iff
/// `now >= scheduled_for`; draining deletes and returns rows in one atomic
/// operation so a task is never dispatched twice.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a row scheduled at `now + delay`. Returns the assigned id.
    async fn add_task(&self, task: &NewTask, delay: Duration) -> Result<String>;

    /// Atomically delete and return up to `n` due rows whose handler is in
    /// `handlers`. No ordering is promised within a batch.
    async fn drain_ready(&self, handlers: &[String], n: u64) -> Result<Vec<TaskRecord>>;

    /// Delete the given rows. True iff every id existed.
    async fn delete_tasks(&self, ids: &[String]) -> Result<bool>;

    /// Push a row's `scheduled_for` out to `now + delay`. True iff it exists.
    async fn extend_task(&self, id: &str, delay: Duration) -> Result<bool>;
}
