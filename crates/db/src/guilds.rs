//! Guild membership and guild row loading.

use {
    sqlx::{PgPool, Row},
    tracing::warn,
};

use {
    spherical_common::{Error, Result},
    spherical_protocol::{Channel, ChannelKind, Guild},
};

/// The `(hostname, guild_id)` pairs a user belongs to, across all nodes.
pub async fn member_guilds(
    pool: &PgPool,
    user_hostname: &str,
    user_id: u64,
) -> Result<Vec<(String, u64)>> {
    let rows = sqlx::query(
        "SELECT hostname, guild_id FROM guild_members
         WHERE user_hostname = $1 AND user_id = $2",
    )
    .bind(user_hostname)
    .bind(user_id as i64)
    .fetch_all(pool)
    .await
    .map_err(Error::transient)?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let hostname: String = row.get("hostname");
            let guild_id: i64 = row.get("guild_id");
            (hostname, guild_id as u64)
        })
        .collect())
}

/// Load full guild rows (with channels) for the given local guild ids. Ids
/// with no row are simply absent from the result; the caller decides what
/// "missing" means.
pub async fn load_guilds(pool: &PgPool, guild_ids: &[u64]) -> Result<Vec<Guild>> {
    if guild_ids.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<i64> = guild_ids.iter().map(|id| *id as i64).collect();

    let guild_rows = sqlx::query(
        "SELECT guild_id, name, icon, splash, owner_id FROM guilds WHERE guild_id = ANY($1)",
    )
    .bind(&ids)
    .fetch_all(pool)
    .await
    .map_err(Error::transient)?;

    let channel_rows = sqlx::query(
        "SELECT guild_id, channel_id, name, kind, permissions FROM channels
         WHERE guild_id = ANY($1)",
    )
    .bind(&ids)
    .fetch_all(pool)
    .await
    .map_err(Error::transient)?;

    let mut guilds: Vec<Guild> = guild_rows
        .into_iter()
        .map(|row| Guild {
            id: row.get::<i64, _>("guild_id") as u64,
            hostname: String::new(),
            available: true,
            name: row.get("name"),
            icon: row.get("icon"),
            splash: row.get("splash"),
            channels: Vec::new(),
            owner_id: row.get::<Option<i64>, _>("owner_id").map(|id| id as u64),
            members: Vec::new(),
        })
        .collect();

    for row in channel_rows {
        let guild_id = row.get::<i64, _>("guild_id") as u64;
        let kind = match row.get::<&str, _>("kind") {
            "voice" => ChannelKind::Voice,
            "text" => ChannelKind::Text,
            other => {
                warn!(guild_id, kind = other, "unknown channel kind, treating as text");
                ChannelKind::Text
            },
        };
        if let Some(guild) = guilds.iter_mut().find(|g| g.id == guild_id) {
            guild.channels.push(Channel {
                id: row.get::<i64, _>("channel_id") as u64,
                name: row.get("name"),
                kind,
                permissions: row.get::<i64, _>("permissions") as u64,
            });
        }
    }

    Ok(guilds)
}
