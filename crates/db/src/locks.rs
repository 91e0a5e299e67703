//! Distributed advisory locks.

use std::future::Future;

use {
    sha2::{Digest, Sha256},
    sqlx::PgPool,
};

use spherical_common::{Error, Result};

/// Run `f` while holding the advisory lock derived from `name`. The lock is
/// session-scoped, so both lock and unlock run on one pinned connection.
pub async fn with_global_lock<T, F, Fut>(pool: &PgPool, name: &str, f: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let lock_id = lock_number(name);
    let mut conn = pool.acquire().await.map_err(Error::transient)?;

    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(lock_id)
        .execute(&mut *conn)
        .await
        .map_err(Error::transient)?;

    let result = f().await;

    let unlock = sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(lock_id)
        .execute(&mut *conn)
        .await;

    match (result, unlock) {
        (Ok(value), Ok(_)) => Ok(value),
        (Ok(_), Err(e)) => Err(Error::transient(e)),
        (Err(e), _) => Err(e),
    }
}

/// Stable 64-bit lock id for a name. The value never leaves the process
/// group, it only has to agree across replicas of this service.
fn lock_number(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_le_bytes(bytes)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_number_is_stable() {
        assert_eq!(lock_number("cross_node_token:abc"), lock_number("cross_node_token:abc"));
        assert_ne!(lock_number("a"), lock_number("b"));
    }
}
