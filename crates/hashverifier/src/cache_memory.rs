//! In-memory cache driver.

use std::{collections::HashSet, sync::Mutex, time::Duration};

use async_trait::async_trait;

use spherical_common::Tlru;

use crate::cache::HashCache;

/// Default key lifetime: 30 days, matching the KV driver.
const KEY_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Keys live in a time-bounded LRU; cleared digests are a plain set, since
/// they are monotonic for the lifetime of the backend.
pub struct MemoryCache {
    keys: Tlru<Vec<u8>>,
    key_ttl: Duration,
    digests: Mutex<HashSet<Vec<u8>>>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::with_key_ttl(KEY_TTL)
    }

    #[must_use]
    pub fn with_key_ttl(key_ttl: Duration) -> Self {
        Self {
            keys: Tlru::new(),
            key_ttl,
            digests: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl HashCache for MemoryCache {
    async fn lookup_key(&self, hostname: &str) -> Option<Vec<u8>> {
        self.keys.get(&hostname.to_lowercase(), self.key_ttl).await
    }

    async fn write_key(&self, hostname: &str, key: &[u8]) {
        self.keys
            .set(hostname.to_lowercase(), key.to_vec(), self.key_ttl)
            .await;
    }

    async fn invalidate_key(&self, hostname: &str) {
        self.keys.remove(&hostname.to_lowercase()).await;
    }

    async fn exists(&self, digest: &[u8]) -> bool {
        self.digests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(digest)
    }

    async fn ensure(&self, digest: &[u8]) {
        self.digests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(digest.to_vec());
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_digest_monotonicity() {
        let cache = MemoryCache::new();
        let digest = b"digest".to_vec();
        assert!(!cache.exists(&digest).await);
        cache.ensure(&digest).await;
        assert!(cache.exists(&digest).await);
        cache.ensure(&digest).await;
        assert!(cache.exists(&digest).await);
    }

    #[tokio::test]
    async fn test_key_roundtrip_case_insensitive() {
        let cache = MemoryCache::new();
        cache.write_key("Node.Example.Com", b"pem").await;
        assert_eq!(
            cache.lookup_key("node.example.com").await,
            Some(b"pem".to_vec())
        );
    }

    #[tokio::test]
    async fn test_invalidate_key() {
        let cache = MemoryCache::new();
        cache.write_key("node.example.com", b"stale").await;
        cache.invalidate_key("node.example.com").await;
        assert_eq!(cache.lookup_key("node.example.com").await, None);
    }
}
