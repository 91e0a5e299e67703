//! Fetch-or-create persistence for the node's signing key pair.

use {
    sqlx::{PgPool, Row},
    tracing::info,
};

use spherical_common::{Error, Result};

use crate::locks::with_global_lock;

/// Load the node key pair, creating it with `maker` on first startup. The
/// whole dance runs under a global advisory lock so concurrent replicas
/// cannot both generate a key.
pub async fn signing_key<F>(pool: &PgPool, maker: F) -> Result<(String, String)>
where
    F: FnOnce() -> Result<(String, String)>,
{
    sqlx::query("CREATE TABLE IF NOT EXISTS node_key (pub_key TEXT NOT NULL, priv_key TEXT NOT NULL)")
        .execute(pool)
        .await
        .map_err(Error::transient)?;

    with_global_lock(pool, "node_key", || async {
        let row = sqlx::query("SELECT pub_key, priv_key FROM node_key")
            .fetch_optional(pool)
            .await
            .map_err(Error::transient)?;
        if let Some(row) = row {
            return Ok((row.get("pub_key"), row.get("priv_key")));
        }

        info!("no signing key found, generating one");
        let (pub_key, priv_key) = maker()?;
        sqlx::query("INSERT INTO node_key (pub_key, priv_key) VALUES ($1, $2)")
            .bind(&pub_key)
            .bind(&priv_key)
            .execute(pool)
            .await
            .map_err(Error::transient)?;
        Ok((pub_key, priv_key))
    })
    .await
}
