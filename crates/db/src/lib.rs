//! Postgres access: pool construction, the advisory-lock helper, guild
//! membership queries and signing-key persistence.
//!
//! Schema migrations are owned by the deployment; this crate assumes the
//! tables exist (`tasks`, `sessions`, `users`, `guilds`, `guild_members`,
//! `channels`).

pub mod guilds;
pub mod keys;
pub mod locks;

use sqlx::{PgPool, postgres::PgPoolOptions};

use spherical_common::{Error, Result};

pub use locks::with_global_lock;

/// Connect a shared pool.
pub async fn connect(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(Error::transient)
}
