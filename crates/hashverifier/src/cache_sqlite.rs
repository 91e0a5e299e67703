//! Embedded file-DB cache driver using sqlx.
//!
//! For standalone verifier nodes without a redis to lean on.

use {
    async_trait::async_trait,
    sqlx::{Row, SqlitePool, sqlite::SqlitePoolOptions},
    tracing::debug,
};

use spherical_common::{Error, Result};

use crate::cache::HashCache;

pub struct SqliteCache {
    pool: SqlitePool,
}

impl SqliteCache {
    /// Open (or create) the cache database at `database_url`.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .map_err(Error::transient)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS pgp_keys (
                 hostname TEXT PRIMARY KEY,
                 key_pem  BLOB NOT NULL
             )",
        )
        .execute(&pool)
        .await
        .map_err(Error::transient)?;
        sqlx::query("CREATE TABLE IF NOT EXISTS seen_hashes (digest BLOB PRIMARY KEY)")
            .execute(&pool)
            .await
            .map_err(Error::transient)?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl HashCache for SqliteCache {
    async fn lookup_key(&self, hostname: &str) -> Option<Vec<u8>> {
        let row = sqlx::query("SELECT key_pem FROM pgp_keys WHERE hostname = ?")
            .bind(hostname.to_lowercase())
            .fetch_optional(&self.pool)
            .await;
        match row {
            Ok(row) => row.map(|r| r.get("key_pem")),
            Err(e) => {
                debug!(hostname, error = %e, "key lookup failed");
                None
            },
        }
    }

    async fn write_key(&self, hostname: &str, key: &[u8]) {
        let result = sqlx::query(
            "INSERT INTO pgp_keys (hostname, key_pem) VALUES (?, ?)
             ON CONFLICT(hostname) DO UPDATE SET key_pem = excluded.key_pem",
        )
        .bind(hostname.to_lowercase())
        .bind(key)
        .execute(&self.pool)
        .await;
        if let Err(e) = result {
            debug!(hostname, error = %e, "key write failed");
        }
    }

    async fn invalidate_key(&self, hostname: &str) {
        let result = sqlx::query("DELETE FROM pgp_keys WHERE hostname = ?")
            .bind(hostname.to_lowercase())
            .execute(&self.pool)
            .await;
        if let Err(e) = result {
            debug!(hostname, error = %e, "key invalidation failed");
        }
    }

    async fn exists(&self, digest: &[u8]) -> bool {
        let row = sqlx::query("SELECT 1 AS present FROM seen_hashes WHERE digest = ?")
            .bind(digest)
            .fetch_optional(&self.pool)
            .await;
        match row {
            Ok(row) => row.is_some(),
            Err(e) => {
                debug!(error = %e, "digest read failed");
                false
            },
        }
    }

    async fn ensure(&self, digest: &[u8]) {
        let result = sqlx::query("INSERT OR IGNORE INTO seen_hashes (digest) VALUES (?)")
            .bind(digest)
            .execute(&self.pool)
            .await;
        if let Err(e) = result {
            debug!(error = %e, "digest write failed");
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    async fn make_cache() -> SqliteCache {
        SqliteCache::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_digest_monotonicity() {
        let cache = make_cache().await;
        let digest = b"some-digest".to_vec();
        assert!(!cache.exists(&digest).await);
        cache.ensure(&digest).await;
        assert!(cache.exists(&digest).await);
        // Idempotent re-ensure.
        cache.ensure(&digest).await;
        assert!(cache.exists(&digest).await);
    }

    #[tokio::test]
    async fn test_key_roundtrip_and_overwrite() {
        let cache = make_cache().await;
        cache.write_key("Node.Example.Com", b"old").await;
        cache.write_key("node.example.com", b"new").await;
        assert_eq!(
            cache.lookup_key("NODE.example.com").await,
            Some(b"new".to_vec())
        );
    }

    #[tokio::test]
    async fn test_invalidate_key() {
        let cache = make_cache().await;
        cache.write_key("node.example.com", b"pem").await;
        cache.invalidate_key("node.example.com").await;
        assert_eq!(cache.lookup_key("node.example.com").await, None);
    }
}
