//! Session token queries. Session creation belongs to the password-auth
//! surface, which lives outside this workspace; these are the queries the
//! gateway and the token jobs need.

use sqlx::{PgPool, Row};

use spherical_common::{Error, Result};

use crate::user::UserContext;

/// Resolve a session token to the local user row. `NotFound` when the token
/// does not exist.
pub async fn user_from_token(pool: &PgPool, token: &str) -> Result<UserContext> {
    let row = sqlx::query(
        "SELECT username, user_id, flags, avatar_url, email, confirmed FROM users
         WHERE user_id = (SELECT user_id FROM sessions WHERE token = $1)",
    )
    .bind(token)
    .fetch_optional(pool)
    .await
    .map_err(Error::transient)?
    .ok_or_else(|| Error::not_found("session token"))?;

    Ok(UserContext {
        username: row.get("username"),
        user_id: row.get::<i64, _>("user_id") as u64,
        flags: row.get::<i64, _>("flags") as u64,
        avatar_url: row.get("avatar_url"),
        hostname: String::new(),
        email: row.get("email"),
        confirmed: row.get("confirmed"),
    })
}

/// Delete a session row, returning the id of its deletion task so the caller
/// can cancel it. Used by the session-delete job.
pub async fn delete_session(pool: &PgPool, token: &str) -> Result<String> {
    sqlx::query_scalar("DELETE FROM sessions WHERE token = $1 RETURNING deletion_job_id")
        .bind(token)
        .fetch_optional(pool)
        .await
        .map_err(Error::transient)?
        .ok_or_else(|| Error::not_found("session token"))
}

/// Delete every session a user holds, returning the deletion-task ids so
/// the caller can cancel them. Used by the session-purge job; half-token
/// revocation cascades from the same place.
pub async fn delete_all_user_sessions(pool: &PgPool, user_id: u64) -> Result<Vec<String>> {
    sqlx::query_scalar("DELETE FROM sessions WHERE user_id = $1 RETURNING deletion_job_id")
        .bind(user_id as i64)
        .fetch_all(pool)
        .await
        .map_err(Error::transient)
}

/// Look up the deletion task of a session. Used by the session-extend job.
pub async fn session_job_id(pool: &PgPool, token: &str) -> Result<String> {
    sqlx::query_scalar("SELECT deletion_job_id FROM sessions WHERE token = $1")
        .bind(token)
        .fetch_optional(pool)
        .await
        .map_err(Error::transient)?
        .ok_or_else(|| Error::not_found("session token"))
}
