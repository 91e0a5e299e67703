//! KV cache driver on the shared redis broker.
//!
//! Keys: `pgp:<hostname>` with a 30-day TTL, `hash:<base64 digest>` with no
//! TTL. Every failure is swallowed: a read error reads as absent, a write
//! error is logged at debug and forgotten.

use {
    async_trait::async_trait,
    base64::{Engine, engine::general_purpose::STANDARD as BASE64},
    redis::{AsyncCommands, aio::ConnectionManager},
    tracing::debug,
};

use crate::cache::HashCache;

const KEY_TTL_SECS: u64 = 30 * 24 * 60 * 60;

pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn key_key(hostname: &str) -> String {
        format!("pgp:{}", hostname.to_lowercase())
    }

    fn hash_key(digest: &[u8]) -> String {
        format!("hash:{}", BASE64.encode(digest))
    }
}

#[async_trait]
impl HashCache for RedisCache {
    async fn lookup_key(&self, hostname: &str) -> Option<Vec<u8>> {
        let mut conn = self.conn.clone();
        match conn.get::<_, Option<Vec<u8>>>(Self::key_key(hostname)).await {
            Ok(key) => key,
            Err(e) => {
                debug!(hostname, error = %e, "key lookup failed");
                None
            },
        }
    }

    async fn write_key(&self, hostname: &str, key: &[u8]) {
        let mut conn = self.conn.clone();
        if let Err(e) = conn
            .set_ex::<_, _, ()>(Self::key_key(hostname), key, KEY_TTL_SECS)
            .await
        {
            debug!(hostname, error = %e, "key write failed");
        }
    }

    async fn invalidate_key(&self, hostname: &str) {
        let mut conn = self.conn.clone();
        if let Err(e) = conn.del::<_, ()>(Self::key_key(hostname)).await {
            debug!(hostname, error = %e, "key invalidation failed");
        }
    }

    async fn exists(&self, digest: &[u8]) -> bool {
        let mut conn = self.conn.clone();
        match conn.get::<_, Option<String>>(Self::hash_key(digest)).await {
            Ok(value) => value.as_deref() == Some("1"),
            Err(e) => {
                debug!(error = %e, "digest read failed");
                false
            },
        }
    }

    async fn ensure(&self, digest: &[u8]) {
        let mut conn = self.conn.clone();
        if let Err(e) = conn.set::<_, _, ()>(Self::hash_key(digest), "1").await {
            debug!(error = %e, "digest write failed");
        }
    }
}
