//! Configuration schema with serde defaults.

use serde::{Deserialize, Serialize};

/// Runtime configuration of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct NodeConfig {
    /// Public hostname of this node. Empty until setup completes.
    pub hostname: String,

    /// Milliseconds the scheduler coordinator sleeps between drains.
    pub scheduler_sleep_ms: u64,

    /// Maximum tasks drained per scheduler tick.
    pub scheduler_job_count: u64,

    /// Trusted-node confirmations required to accept an unverifiable blob.
    /// Zero disables the consensus fallback.
    pub consensus: u32,

    /// Nodes trusted enough that `consensus` of them can vouch for a blob.
    pub trusted_nodes: Vec<String>,

    /// Verifiers to notify of newly accepted blobs.
    pub informants: Vec<String>,

    /// How long fetched signing keys stay cached, in seconds.
    pub key_cache_ttl_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            scheduler_sleep_ms: 1000,
            scheduler_job_count: 120,
            consensus: 3,
            trusted_nodes: Vec::new(),
            informants: Vec::new(),
            key_cache_ttl_secs: 30 * 24 * 60 * 60,
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.scheduler_sleep_ms, 1000);
        assert_eq!(cfg.scheduler_job_count, 120);
        assert_eq!(cfg.consensus, 3);
        assert!(cfg.hostname.is_empty());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let cfg: NodeConfig =
            serde_json::from_str(r#"{"hostname":"node.example.com","consensus":5}"#).unwrap();
        assert_eq!(cfg.hostname, "node.example.com");
        assert_eq!(cfg.consensus, 5);
        assert_eq!(cfg.scheduler_sleep_ms, 1000);
    }

    #[test]
    fn test_roundtrip() {
        let cfg = NodeConfig {
            hostname: "a.example.com".into(),
            trusted_nodes: vec!["b.example.com".into()],
            ..NodeConfig::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: NodeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
