//! In-memory task store for tests.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;

use spherical_common::Result;

use crate::{
    store::TaskStore,
    types::{NewTask, TaskRecord},
};

struct StoredTask {
    record: TaskRecord,
    scheduled_for: Instant,
}

/// `HashMap`-backed store. No persistence and no ordering, which also keeps
/// callers honest about the queue's set semantics.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<String, StoredTask>>,
}

impl MemoryTaskStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently in the table.
    pub fn task_count(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn add_task(&self, task: &NewTask, delay: Duration) -> Result<String> {
        let task_id = uuid::Uuid::new_v4().to_string();
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.insert(task_id.clone(), StoredTask {
            record: TaskRecord {
                task_id: task_id.clone(),
                job_handler: task.job_handler.clone(),
                job_body: task.job_body.clone(),
                scheduler_metadata: task.scheduler_metadata.clone(),
            },
            scheduled_for: Instant::now() + delay,
        });
        Ok(task_id)
    }

    async fn drain_ready(&self, handlers: &[String], n: u64) -> Result<Vec<TaskRecord>> {
        let now = Instant::now();
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let due: Vec<String> = tasks
            .iter()
            .filter(|(_, t)| {
                t.scheduled_for <= now && handlers.contains(&t.record.job_handler)
            })
            .map(|(id, _)| id.clone())
            .take(usize::try_from(n).unwrap_or(usize::MAX))
            .collect();
        Ok(due
            .into_iter()
            .filter_map(|id| tasks.remove(&id).map(|t| t.record))
            .collect())
    }

    async fn delete_tasks(&self, ids: &[String]) -> Result<bool> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        for id in ids {
            if tasks.remove(id).is_some() {
                removed += 1;
            }
        }
        Ok(removed == ids.len())
    }

    async fn extend_task(&self, id: &str, delay: Duration) -> Result<bool> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        match tasks.get_mut(id) {
            Some(task) => {
                task.scheduled_for = Instant::now() + delay;
                Ok(true)
            },
            None => Ok(false),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn new_task(handler: &str) -> NewTask {
        NewTask {
            job_handler: handler.into(),
            job_body: b"body".to_vec(),
            scheduler_metadata: b"meta".to_vec(),
        }
    }

    fn handlers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_owned()).collect()
    }

    #[tokio::test]
    async fn test_immediate_task_is_drainable() {
        let store = MemoryTaskStore::new();
        let id = store
            .add_task(&new_task("hello"), Duration::ZERO)
            .await
            .unwrap();

        let drained = store.drain_ready(&handlers(&["hello"]), 10).await.unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].task_id, id);
        // Drain deletes: a second drain finds nothing.
        assert!(store.drain_ready(&handlers(&["hello"]), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_future_task_not_visible() {
        let store = MemoryTaskStore::new();
        store
            .add_task(&new_task("hello"), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.drain_ready(&handlers(&["hello"]), 10).await.unwrap().is_empty());
        assert_eq!(store.task_count(), 1);
    }

    #[tokio::test]
    async fn test_drain_filters_by_handler() {
        let store = MemoryTaskStore::new();
        store.add_task(&new_task("a"), Duration::ZERO).await.unwrap();
        store.add_task(&new_task("b"), Duration::ZERO).await.unwrap();

        let drained = store.drain_ready(&handlers(&["a"]), 10).await.unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].job_handler, "a");
        assert_eq!(store.task_count(), 1);
    }

    #[tokio::test]
    async fn test_drain_respects_limit() {
        let store = MemoryTaskStore::new();
        for _ in 0..5 {
            store.add_task(&new_task("a"), Duration::ZERO).await.unwrap();
        }
        let drained = store.drain_ready(&handlers(&["a"]), 3).await.unwrap();
        assert_eq!(drained.len(), 3);
        assert_eq!(store.task_count(), 2);
    }

    #[tokio::test]
    async fn test_delete_reports_partial_misses() {
        let store = MemoryTaskStore::new();
        let id = store.add_task(&new_task("a"), Duration::ZERO).await.unwrap();
        assert!(store.delete_tasks(&[id.clone()]).await.unwrap());
        assert!(!store.delete_tasks(&[id]).await.unwrap());
    }

    #[tokio::test]
    async fn test_extend_pushes_task_out() {
        let store = MemoryTaskStore::new();
        let id = store.add_task(&new_task("a"), Duration::ZERO).await.unwrap();
        assert!(store.extend_task(&id, Duration::from_secs(60)).await.unwrap());
        assert!(store.drain_ready(&handlers(&["a"]), 10).await.unwrap().is_empty());
        assert!(!store.extend_task("missing", Duration::ZERO).await.unwrap());
    }
}
