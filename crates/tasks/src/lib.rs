//! Durable, time-ordered task queue and the typed job scheduler on top of it.
//!
//! Tasks live in the `tasks` table until a drainer claims them with an atomic
//! delete-returning batch; failed handlers are refired by re-inserting a new
//! row, so a task is never silently dropped.

pub mod scheduler;
pub mod store;
pub mod store_memory;
pub mod store_postgres;
pub mod types;

pub use {
    scheduler::{Job, Scheduler},
    store::TaskStore,
    store_memory::MemoryTaskStore,
    store_postgres::PostgresTaskStore,
    types::{JobMetadata, NewTask, TaskRecord},
};
