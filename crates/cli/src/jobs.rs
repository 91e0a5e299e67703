//! Built-in scheduler jobs.

use std::sync::Arc;

use {
    serde::{Deserialize, Serialize},
    sqlx::PgPool,
    tracing::info,
};

use {
    spherical_auth::{TokenStore, sessions},
    spherical_common::Result,
    spherical_tasks::{Job, Scheduler, TaskStore},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionExtendBody {
    pub token: String,
    pub extend_ms: u64,
}

/// Handles to every built-in job.
pub struct Jobs {
    pub hello: Job<String>,
    pub session_delete: Job<String>,
    pub session_extend: Job<SessionExtendBody>,
    pub session_purge: Job<u64>,
}

/// Register the built-in jobs. Called once at startup, before the runner
/// starts draining.
pub fn register(
    scheduler: &Arc<Scheduler>,
    pool: &PgPool,
    store: &Arc<dyn TaskStore>,
    tokens: &Arc<TokenStore>,
) -> Result<Jobs> {
    // Diagnostic job; also exercised by `run_and_block` self-tests.
    let hello = scheduler.register("hello", |name: String| async move {
        info!(name = %name, "hello job fired");
        Ok(())
    })?;

    // Expire one session: drop the row, then cancel its own deletion task.
    let session_delete = {
        let pool = pool.clone();
        let store = Arc::clone(store);
        scheduler.register("session_delete", move |token: String| {
            let pool = pool.clone();
            let store = Arc::clone(&store);
            async move {
                let job_id = sessions::delete_session(&pool, &token).await?;
                store.delete_tasks(&[job_id]).await?;
                Ok(())
            }
        })?
    };

    // Keep a session alive by pushing its deletion task out.
    let session_extend = {
        let pool = pool.clone();
        let store = Arc::clone(store);
        scheduler.register("session_extend", move |body: SessionExtendBody| {
            let pool = pool.clone();
            let store = Arc::clone(&store);
            async move {
                let job_id = sessions::session_job_id(&pool, &body.token).await?;
                store
                    .extend_task(&job_id, std::time::Duration::from_millis(body.extend_ms))
                    .await?;
                Ok(())
            }
        })?
    };

    // Log a user out everywhere: drop every session (cancelling their
    // deletion tasks) and cascade into the half-token revocation set.
    let session_purge = {
        let pool = pool.clone();
        let store = Arc::clone(store);
        let tokens = Arc::clone(tokens);
        scheduler.register("session_purge", move |user_id: u64| {
            let pool = pool.clone();
            let store = Arc::clone(&store);
            let tokens = Arc::clone(&tokens);
            async move {
                let job_ids = sessions::delete_all_user_sessions(&pool, user_id).await?;
                if !job_ids.is_empty() {
                    store.delete_tasks(&job_ids).await?;
                }
                tokens.revoke_user_half_tokens(user_id).await?;
                Ok(())
            }
        })?
    };

    Ok(Jobs {
        hello,
        session_delete,
        session_extend,
        session_purge,
    })
}
