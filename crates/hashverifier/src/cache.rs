//! Polymorphic backend for recording verified hashes and caching remote
//! signing keys.

use async_trait::async_trait;

/// Storage backend for the verifier. Backends MAY fail silently on writes;
/// reads that fail report "absent".
#[async_trait]
pub trait HashCache: Send + Sync {
    /// Look up a node's cached public key.
    async fn lookup_key(&self, hostname: &str) -> Option<Vec<u8>>;

    /// Cache a node's public key.
    async fn write_key(&self, hostname: &str, key: &[u8]);

    /// Drop a cached key that failed to verify (it may be stale).
    async fn invalidate_key(&self, hostname: &str);

    /// Whether this blob digest has already been cleared.
    async fn exists(&self, digest: &[u8]) -> bool;

    /// Record a cleared blob digest. Only called after verification; once
    /// set, the digest is never deleted.
    async fn ensure(&self, digest: &[u8]);
}

/// Cache that remembers nothing. Used where caching is undesirable, e.g.
/// validating one-off envelopes.
pub struct NopCache;

#[async_trait]
impl HashCache for NopCache {
    async fn lookup_key(&self, _hostname: &str) -> Option<Vec<u8>> {
        None
    }

    async fn write_key(&self, _hostname: &str, _key: &[u8]) {}

    async fn invalidate_key(&self, _hostname: &str) {}

    async fn exists(&self, _digest: &[u8]) -> bool {
        false
    }

    async fn ensure(&self, _digest: &[u8]) {}
}
