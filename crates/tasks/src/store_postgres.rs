//! Postgres-backed task store using sqlx.

use std::time::Duration;

use {
    async_trait::async_trait,
    sqlx::{PgPool, Row, postgres::PgPoolOptions},
};

use spherical_common::{Error, Result};

use crate::{
    store::TaskStore,
    types::{NewTask, TaskRecord},
};

/// Persistence for the `tasks` table. Visibility and atomicity both live in
/// SQL: the drain is a single delete-returning statement.
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    /// Create a store with its own connection pool.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(Error::transient)?;
        Ok(Self { pool })
    }

    /// Create a store using an existing pool.
    #[must_use]
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn add_task(&self, task: &NewTask, delay: Duration) -> Result<String> {
        let task_id: String = sqlx::query_scalar(
            "INSERT INTO tasks (job_handler, job_body, scheduler_metadata, scheduled_for)
             VALUES ($1, $2, $3, now() + make_interval(secs => $4))
             RETURNING task_id",
        )
        .bind(&task.job_handler)
        .bind(&task.job_body)
        .bind(&task.scheduler_metadata)
        .bind(delay.as_secs_f64())
        .fetch_one(&self.pool)
        .await
        .map_err(Error::transient)?;
        Ok(task_id)
    }

    async fn drain_ready(&self, handlers: &[String], n: u64) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query(
            "DELETE FROM tasks
             WHERE task_id = ANY(ARRAY(
                 SELECT task_id FROM tasks
                 WHERE now() >= scheduled_for AND job_handler = ANY($1)
                 LIMIT $2))
             RETURNING task_id, job_handler, job_body, scheduler_metadata",
        )
        .bind(handlers)
        .bind(i64::try_from(n).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::transient)?;

        Ok(rows
            .into_iter()
            .map(|row| TaskRecord {
                task_id: row.get("task_id"),
                job_handler: row.get("job_handler"),
                job_body: row.get("job_body"),
                scheduler_metadata: row.get("scheduler_metadata"),
            })
            .collect())
    }

    async fn delete_tasks(&self, ids: &[String]) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE task_id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(Error::transient)?;
        Ok(result.rows_affected() == ids.len() as u64)
    }

    async fn extend_task(&self, id: &str, delay: Duration) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET scheduled_for = now() + make_interval(secs => $2)
             WHERE task_id = $1",
        )
        .bind(id)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(Error::transient)?;
        Ok(result.rows_affected() == 1)
    }
}
