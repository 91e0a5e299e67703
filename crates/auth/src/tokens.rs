//! Opaque short-lived tokens in the KV broker.
//!
//! Node-auth tokens (2 minutes) let a user's home node open a gateway socket
//! on another node; half-tokens (30 minutes) carry "password passed, second
//! factor pending". Both are single-use.

use {
    redis::{AsyncCommands, aio::ConnectionManager},
    sqlx::PgPool,
    tracing::debug,
};

use {
    spherical_common::{Error, Result},
    spherical_db::with_global_lock,
};

/// Node-auth token lifetime.
const CROSS_NODE_TTL_SECS: u64 = 2 * 60;
/// Half-token lifetime.
const HALF_TOKEN_TTL_SECS: u64 = 30 * 60;

fn half_token_key(id: &str) -> String {
    format!("half_token:{id}")
}

fn half_tokens_key(user_id: u64) -> String {
    format!("half_tokens:{user_id}")
}

pub struct TokenStore {
    redis: ConnectionManager,
    pg: PgPool,
}

impl TokenStore {
    #[must_use]
    pub fn new(redis: ConnectionManager, pg: PgPool) -> Self {
        Self { redis, pg }
    }

    /// Store `data` under a fresh opaque token with a 2-minute TTL. The
    /// token is suitable for an immediate cross-node gateway Hello.
    pub async fn build_cross_node_token(&self, data: &[u8]) -> Result<String> {
        let token = uuid::Uuid::new_v4().to_string();
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(&token, data, CROSS_NODE_TTL_SECS)
            .await
            .map_err(Error::transient)?;
        Ok(token)
    }

    /// Fetch and destroy a node-auth token. The read-then-delete runs under
    /// a per-token advisory lock so two replicas cannot both spend it.
    pub async fn get_cross_node_token(&self, token: &str) -> Result<Vec<u8>> {
        let lock_name = format!("cross_node_token:{token}");
        with_global_lock(&self.pg, &lock_name, || async {
            let mut conn = self.redis.clone();
            let data: Option<Vec<u8>> = conn.get(token).await.map_err(Error::transient)?;
            let data = data.ok_or_else(|| Error::not_found("cross-node token"))?;
            conn.del::<_, ()>(token).await.map_err(Error::transient)?;
            Ok(data)
        })
        .await
    }

    /// Mint a half-token for a user who has passed the first factor, and
    /// index it in the user's revocation set.
    pub async fn build_half_token(&self, user_id: u64) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(half_token_key(&id), user_id, HALF_TOKEN_TTL_SECS)
            .await
            .map_err(Error::transient)?;
        conn.sadd::<_, _, ()>(half_tokens_key(user_id), &id)
            .await
            .map_err(Error::transient)?;
        Ok(id)
    }

    /// Redeem a half-token. The per-user set decides validity: a token whose
    /// set entry is already gone was revoked, and reads as "no such user"
    /// even though the key itself may briefly still exist.
    pub async fn redeem_half_token(&self, token: &str) -> Result<u64> {
        let mut conn = self.redis.clone();
        let user_id: Option<u64> = conn
            .get(half_token_key(token))
            .await
            .map_err(Error::transient)?;
        let user_id = user_id.ok_or_else(|| Error::not_found("half token"))?;

        let removed: u64 = conn
            .srem(half_tokens_key(user_id), token)
            .await
            .map_err(Error::transient)?;
        if removed == 0 {
            debug!(user_id, "half token revoked before redemption");
            return Err(Error::not_found("no such user"));
        }

        conn.del::<_, ()>(half_token_key(token))
            .await
            .map_err(Error::transient)?;
        Ok(user_id)
    }

    /// Revoke every outstanding half-token for a user. Removing the set is
    /// what makes the cascade stick; the keys are deleted as cleanup.
    pub async fn revoke_user_half_tokens(&self, user_id: u64) -> Result<Vec<String>> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .smembers(half_tokens_key(user_id))
            .await
            .map_err(Error::transient)?;
        conn.del::<_, ()>(half_tokens_key(user_id))
            .await
            .map_err(Error::transient)?;
        for id in &ids {
            conn.del::<_, ()>(half_token_key(id))
                .await
                .map_err(Error::transient)?;
        }
        Ok(ids)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_key_layout() {
        assert_eq!(half_token_key("abc"), "half_token:abc");
        assert_eq!(half_tokens_key(42), "half_tokens:42");
    }
}
