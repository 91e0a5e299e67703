//! Typed job registry, runner loop, dispatch workers and the retry policy.

use std::{
    collections::HashMap,
    future::Future,
    marker::PhantomData,
    pin::Pin,
    sync::{Arc, RwLock},
    time::Duration,
};

use {
    serde::{Serialize, de::DeserializeOwned},
    tokio::{sync::Mutex, task::JoinHandle},
    tokio_util::sync::CancellationToken,
    tracing::{error, info, warn},
};

use {
    spherical_common::{Error, Result},
    spherical_config::ConfigHandle,
};

use crate::{
    store::TaskStore,
    types::{JobMetadata, NewTask, TaskRecord},
};

type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type HandlerFn = Arc<dyn Fn(Vec<u8>) -> HandlerFuture + Send + Sync>;

/// Typed handle to a registered job. Obtained from [`Scheduler::register`].
pub struct Job<T> {
    name: String,
    _body: PhantomData<fn(T)>,
}

impl<T> Clone for Job<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            _body: PhantomData,
        }
    }
}

impl<T> Job<T> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The scheduler: drains due tasks from the store and runs their handlers
/// under a timeout and a panic shield.
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    config: ConfigHandle,
    jobs: RwLock<HashMap<String, HandlerFn>>,
    runner: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Scheduler {
    #[must_use]
    pub fn new(store: Arc<dyn TaskStore>, config: ConfigHandle) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            jobs: RwLock::new(HashMap::new()),
            runner: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Register a job handler under a process-unique name. Registration
    /// happens at startup and is never removed.
    pub fn register<T, F, Fut>(&self, name: &str, handler: F) -> Result<Job<T>>
    where
        T: DeserializeOwned + Serialize + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let wrapped: HandlerFn = Arc::new(move |bytes: Vec<u8>| -> HandlerFuture {
            match rmp_serde::from_slice::<T>(&bytes) {
                Ok(body) => Box::pin(handler(body)),
                Err(e) => Box::pin(std::future::ready(Err(Error::invalid(format!(
                    "job body failed to decode: {e}"
                ))))),
            }
        });

        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        if jobs.contains_key(name) {
            return Err(Error::invalid(format!("job '{name}' is already registered")));
        }
        jobs.insert(name.to_owned(), wrapped);
        Ok(Job {
            name: name.to_owned(),
            _body: PhantomData,
        })
    }

    /// Queue a task. A zero delay means "first fire after the refire
    /// duration".
    pub async fn schedule<T: Serialize>(
        &self,
        job: &Job<T>,
        body: &T,
        metadata: JobMetadata,
        delay: Duration,
    ) -> Result<String> {
        let delay = if delay.is_zero() { metadata.refire() } else { delay };
        self.insert(job, body, metadata, delay).await
    }

    /// Queue a task to fire as soon as the runner picks it up.
    pub async fn schedule_immediately<T: Serialize>(
        &self,
        job: &Job<T>,
        body: &T,
        metadata: JobMetadata,
    ) -> Result<String> {
        self.insert(job, body, metadata, Duration::ZERO).await
    }

    async fn insert<T: Serialize>(
        &self,
        job: &Job<T>,
        body: &T,
        metadata: JobMetadata,
        delay: Duration,
    ) -> Result<String> {
        let task = NewTask {
            job_handler: job.name.clone(),
            job_body: rmp_serde::to_vec_named(body).map_err(Error::internal)?,
            scheduler_metadata: rmp_serde::to_vec_named(&metadata).map_err(Error::internal)?,
        };
        self.store.add_task(&task, delay).await
    }

    /// Run the handler in-process and wait for it, bypassing persistence.
    /// Used for configuration self-tests.
    pub async fn run_and_block<T: Serialize>(&self, job: &Job<T>, body: &T) -> Result<()> {
        let handler = self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job.name)
            .cloned()
            .ok_or_else(|| Error::invalid(format!("job '{}' is not registered", job.name)))?;
        let bytes = rmp_serde::to_vec_named(body).map_err(Error::internal)?;
        handler(bytes).await.map_err(|e| e.unwrap_do_not_rerun().1)
    }

    /// Start the runner loop.
    pub async fn start(self: &Arc<Self>) {
        let svc = Arc::clone(self);
        let handle = tokio::spawn(async move {
            svc.runner_loop().await;
        });
        *self.runner.lock().await = Some(handle);
        info!("scheduler runner started");
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.runner.lock().await.take() {
            handle.abort();
        }
        info!("scheduler stopped");
    }

    // ── Internal ────────────────────────────────────────────────────────

    async fn runner_loop(self: Arc<Self>) {
        loop {
            let cfg = self.config.snapshot();
            let sleep_ms = if cfg.scheduler_sleep_ms == 0 {
                1000
            } else {
                cfg.scheduler_sleep_ms
            };
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {},
            }

            let handlers: Vec<String> = {
                let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
                jobs.keys().cloned().collect()
            };
            if handlers.is_empty() {
                continue;
            }

            let n = if cfg.scheduler_job_count == 0 {
                120
            } else {
                cfg.scheduler_job_count
            };
            let batch = match self.store.drain_ready(&handlers, n).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(error = %e, "failed to drain task queue");
                    continue;
                },
            };
            if !batch.is_empty() {
                info!(count = batch.len(), "dispatching drained tasks");
            }

            for task in batch {
                let svc = Arc::clone(&self);
                tokio::spawn(async move {
                    svc.dispatch(task).await;
                });
            }
        }
    }

    async fn dispatch(self: Arc<Self>, task: TaskRecord) {
        let handler = self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&task.job_handler)
            .cloned();
        let Some(handler) = handler else {
            error!(task_id = %task.task_id, job = %task.job_handler,
                "drained task has no registered handler");
            return;
        };

        let metadata: JobMetadata = match rmp_serde::from_slice(&task.scheduler_metadata) {
            Ok(m) => m,
            Err(e) => {
                error!(task_id = %task.task_id, job = %task.job_handler, error = %e,
                    "task metadata failed to decode, abandoning");
                return;
            },
        };

        let Err(err) = run_shielded(handler, task.job_body.clone(), metadata.timeout()).await
        else {
            return;
        };

        let (wrapped, err) = err.unwrap_do_not_rerun();
        let no_rerun = wrapped || metadata.retries == 1;
        error!(task_id = %task.task_id, job = %task.job_handler, no_rerun, error = %err,
            "job failed");
        if no_rerun {
            return;
        }

        let mut metadata = metadata;
        if metadata.retries != 0 {
            metadata.retries -= 1;
        }
        let scheduler_metadata = match rmp_serde::to_vec_named(&metadata) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(task_id = %task.task_id, error = %e, "metadata failed to re-encode");
                return;
            },
        };

        // Tasks are never silently dropped: keep retrying the re-insert
        // itself until it lands.
        let new_task = NewTask {
            job_handler: task.job_handler,
            job_body: task.job_body,
            scheduler_metadata,
        };
        let store = Arc::clone(&self.store);
        let refire = metadata.refire();
        let task_id = task.task_id;
        tokio::spawn(async move {
            loop {
                match store.add_task(&new_task, refire).await {
                    Ok(_) => return,
                    Err(e) => {
                        error!(task_id = %task_id, job = %new_task.job_handler, error = %e,
                            "failed to refire task, retrying in 1s");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    },
                }
            }
        });
    }
}

/// Run a handler under its deadline, converting panics into ordinary errors
/// so they never cross task boundaries.
async fn run_shielded(handler: HandlerFn, body: Vec<u8>, timeout: Duration) -> Result<()> {
    let handle = tokio::spawn(async move {
        match tokio::time::timeout(timeout, handler(body)).await {
            Ok(result) => result,
            Err(_) => Err(Error::transient_msg("job timed out")),
        }
    });
    match handle.await {
        Ok(result) => result,
        Err(join) if join.is_panic() => Err(Error::internal_msg("job panicked")),
        Err(join) => Err(Error::internal(join)),
    }
}
