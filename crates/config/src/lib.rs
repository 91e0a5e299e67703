//! Node configuration: the schema, an explicit sum type of config changes,
//! and a process-wide handle.
//!
//! Configuration rows live in the `config` table and are fanned out over the
//! event bus; each incoming `(key, value)` pair is parsed into a
//! [`ConfigChange`] and applied to the shared [`ConfigHandle`].

pub mod change;
pub mod schema;

pub use {
    change::{ConfigChange, ConfigHandle},
    schema::NodeConfig,
};
