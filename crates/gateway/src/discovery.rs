//! Guild discovery: membership partitioning, remote dials, and the
//! intersection of what a remote returned with what we expected of it.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use {
    tokio::sync::mpsc,
    tracing::{debug, warn},
};

use {
    spherical_auth::UserContext,
    spherical_protocol::{DISCOVERY_BUDGET_MS, Guild, Payload, ReadyPayload},
};

use crate::{cross_node_client::CrossNodeClient, outbound, state::GatewayState};

/// Group membership rows by owning node.
#[must_use]
pub fn partition_by_host(memberships: Vec<(String, u64)>) -> HashMap<String, Vec<u64>> {
    let mut partitions: HashMap<String, Vec<u64>> = HashMap::new();
    for (hostname, guild_id) in memberships {
        partitions.entry(hostname.to_lowercase()).or_default().push(guild_id);
    }
    partitions
}

/// Placeholders for every guild we know lives on `host` but could not load.
#[must_use]
pub fn all_unavailable(host: &str, expected: &[u64]) -> Vec<Guild> {
    expected
        .iter()
        .map(|id| Guild::unavailable(*id, host))
        .collect()
}

/// Intersect a remote's Ready with the guild ids we expected of that host:
/// returned-and-expected guilds are stamped with the hostname, expected-but-
/// missing guilds are marked unavailable, unexpected guilds are dropped.
#[must_use]
pub fn merge_remote_ready(
    host: &str,
    expected: &[u64],
    ready: &ReadyPayload,
) -> (Vec<Guild>, Vec<Guild>) {
    let mut available = Vec::new();
    let mut unavailable = Vec::new();
    let mut seen: HashSet<u64> = HashSet::new();

    for guild in &ready.available_guilds {
        if expected.contains(&guild.id) && seen.insert(guild.id) {
            let mut guild = guild.clone();
            guild.hostname = host.to_owned();
            available.push(guild);
        }
    }
    for guild in &ready.unavailable_guilds {
        if expected.contains(&guild.id) && seen.insert(guild.id) {
            unavailable.push(Guild::unavailable(guild.id, host));
        }
    }
    for id in expected {
        if !seen.contains(id) {
            unavailable.push(Guild::unavailable(*id, host));
        }
    }

    (available, unavailable)
}

/// Result of dialling one remote host.
pub struct RemoteOutcome {
    pub host: String,
    pub expected: Vec<u64>,
    pub available: Vec<Guild>,
    pub unavailable: Vec<Guild>,
    pub client: Option<Arc<CrossNodeClient>>,
    /// Set when Ready did not arrive inside the budget but the socket is
    /// still up; the late Ready must be honored as GuildUpdate frames.
    pub ready_pending: bool,
}

/// Dial one remote node and collect its share of the user's guilds, all
/// under the discovery budget. Failure or timeout yields every expected
/// guild marked unavailable.
pub async fn discover_remote(
    state: &GatewayState,
    user: &UserContext,
    host: String,
    expected: Vec<u64>,
    updates: mpsc::Sender<Payload>,
) -> RemoteOutcome {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(DISCOVERY_BUDGET_MS);

    let dial = async {
        let token = outbound::fetch_cross_node_token(state, &host, user).await?;
        CrossNodeClient::connect(state, &host, &token, updates).await
    };
    let client = match tokio::time::timeout_at(deadline, dial).await {
        Ok(Ok(client)) => client,
        Ok(Err(e)) => {
            warn!(host = %host, error = %e, "remote discovery failed");
            return RemoteOutcome {
                unavailable: all_unavailable(&host, &expected),
                available: Vec::new(),
                client: None,
                ready_pending: false,
                host,
                expected,
            };
        },
        Err(_) => {
            warn!(host = %host, "remote discovery timed out during dial");
            return RemoteOutcome {
                unavailable: all_unavailable(&host, &expected),
                available: Vec::new(),
                client: None,
                ready_pending: false,
                host,
                expected,
            };
        },
    };

    match tokio::time::timeout_at(deadline, client.wait_ready()).await {
        Ok(Ok(ready)) => {
            let (available, unavailable) = merge_remote_ready(&host, &expected, &ready);
            debug!(host = %host, available = available.len(), unavailable = unavailable.len(),
                "remote discovery complete");
            RemoteOutcome {
                available,
                unavailable,
                client: Some(client),
                ready_pending: false,
                host,
                expected,
            }
        },
        Ok(Err(e)) => {
            warn!(host = %host, error = %e, "remote closed before ready");
            RemoteOutcome {
                unavailable: all_unavailable(&host, &expected),
                available: Vec::new(),
                client: None,
                ready_pending: false,
                host,
                expected,
            }
        },
        Err(_) => {
            // Socket is healthy, the remote is just slow. Report everything
            // unavailable now; its Ready is still honored when it lands.
            warn!(host = %host, "remote ready missed the discovery budget");
            RemoteOutcome {
                unavailable: all_unavailable(&host, &expected),
                available: Vec::new(),
                client: Some(client),
                ready_pending: true,
                host,
                expected,
            }
        },
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn available_guild(id: u64) -> Guild {
        Guild {
            id,
            available: true,
            name: Some(format!("guild-{id}")),
            ..Guild::default()
        }
    }

    #[test]
    fn test_partition_by_host() {
        let partitions = partition_by_host(vec![
            ("self.example.com".into(), 1),
            ("Peer-A.example.com".into(), 42),
            ("peer-a.example.com".into(), 43),
        ]);
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions["self.example.com"], vec![1]);
        assert_eq!(partitions["peer-a.example.com"], vec![42, 43]);
    }

    #[test]
    fn test_merge_keeps_expected_and_stamps_hostname() {
        let ready = ReadyPayload {
            available_guilds: vec![available_guild(42), available_guild(99)],
            unavailable_guilds: vec![],
        };
        let (available, unavailable) =
            merge_remote_ready("peer-a.example.com", &[42, 43], &ready);

        assert_eq!(available.len(), 1);
        assert_eq!(available[0].id, 42);
        assert_eq!(available[0].hostname, "peer-a.example.com");
        // 43 was expected but never returned; 99 was never ours to report.
        assert_eq!(unavailable.len(), 1);
        assert_eq!(unavailable[0].id, 43);
        assert!(!unavailable[0].available);
    }

    #[test]
    fn test_merge_respects_remote_unavailable() {
        let ready = ReadyPayload {
            available_guilds: vec![],
            unavailable_guilds: vec![Guild::unavailable(42, "")],
        };
        let (available, unavailable) = merge_remote_ready("peer-a.example.com", &[42], &ready);
        assert!(available.is_empty());
        assert_eq!(unavailable.len(), 1);
        assert_eq!(unavailable[0].hostname, "peer-a.example.com");
    }

    #[test]
    fn test_every_expected_guild_appears_exactly_once() {
        // Aggregation completeness: available ∪ unavailable covers each
        // expected id exactly once, whatever the remote sent.
        let ready = ReadyPayload {
            available_guilds: vec![available_guild(1), available_guild(1), available_guild(3)],
            unavailable_guilds: vec![Guild::unavailable(1, ""), Guild::unavailable(2, "")],
        };
        let expected = [1u64, 2, 3, 4];
        let (available, unavailable) = merge_remote_ready("h.example.com", &expected, &ready);

        let mut ids: Vec<u64> = available
            .iter()
            .chain(unavailable.iter())
            .map(|g| g.id)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_all_unavailable() {
        let guilds = all_unavailable("down.example.com", &[7, 8]);
        assert_eq!(guilds.len(), 2);
        assert!(guilds.iter().all(|g| !g.available));
        assert!(guilds.iter().all(|g| g.hostname == "down.example.com"));
    }
}
