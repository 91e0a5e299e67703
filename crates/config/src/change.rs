//! Explicit config fan-out: one enum variant per settable key, plus the
//! shared handle the rest of the process reads snapshots from.

use std::sync::{Arc, RwLock};

use {serde_json::Value, tracing::debug};

use crate::schema::NodeConfig;

/// A single configuration edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChange {
    Hostname(String),
    SchedulerSleepMs(u64),
    SchedulerJobCount(u64),
    Consensus(u32),
    TrustedNodes(Vec<String>),
    Informants(Vec<String>),
    KeyCacheTtlSecs(u64),
}

impl ConfigChange {
    /// Parse a `(key, value)` pair from the config table. Unknown keys and
    /// mistyped values are dropped with a debug log; newer server versions
    /// may write keys old ones do not know.
    #[must_use]
    pub fn parse(key: &str, value: &Value) -> Option<Self> {
        let change = match key {
            "hostname" => Self::Hostname(value.as_str()?.to_owned()),
            "scheduler_sleep_ms" => Self::SchedulerSleepMs(value.as_u64()?),
            "scheduler_job_count" => Self::SchedulerJobCount(value.as_u64()?),
            "consensus" => Self::Consensus(u32::try_from(value.as_u64()?).ok()?),
            "trusted_nodes" => Self::TrustedNodes(string_vec(value)?),
            "informants" => Self::Informants(string_vec(value)?),
            "key_cache_ttl_secs" => Self::KeyCacheTtlSecs(value.as_u64()?),
            other => {
                debug!(key = other, "ignoring unknown config key");
                return None;
            },
        };
        Some(change)
    }

    /// The table key this change writes.
    #[must_use]
    pub fn key(&self) -> &'static str {
        match self {
            Self::Hostname(_) => "hostname",
            Self::SchedulerSleepMs(_) => "scheduler_sleep_ms",
            Self::SchedulerJobCount(_) => "scheduler_job_count",
            Self::Consensus(_) => "consensus",
            Self::TrustedNodes(_) => "trusted_nodes",
            Self::Informants(_) => "informants",
            Self::KeyCacheTtlSecs(_) => "key_cache_ttl_secs",
        }
    }

    pub fn apply(&self, cfg: &mut NodeConfig) {
        match self {
            Self::Hostname(v) => cfg.hostname = v.clone(),
            Self::SchedulerSleepMs(v) => cfg.scheduler_sleep_ms = *v,
            Self::SchedulerJobCount(v) => cfg.scheduler_job_count = *v,
            Self::Consensus(v) => cfg.consensus = *v,
            Self::TrustedNodes(v) => cfg.trusted_nodes = v.clone(),
            Self::Informants(v) => cfg.informants = v.clone(),
            Self::KeyCacheTtlSecs(v) => cfg.key_cache_ttl_secs = *v,
        }
    }
}

fn string_vec(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(str::to_owned))
        .collect()
}

/// Cheaply clonable handle to the live configuration. Readers take
/// snapshots; the only runtime mutation paths are `apply` and `replace`.
#[derive(Clone, Default)]
pub struct ConfigHandle {
    inner: Arc<RwLock<NodeConfig>>,
}

impl ConfigHandle {
    #[must_use]
    pub fn new(config: NodeConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> NodeConfig {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn apply(&self, change: &ConfigChange) {
        let mut cfg = self.inner.write().unwrap_or_else(|e| e.into_inner());
        change.apply(&mut cfg);
    }

    pub fn replace(&self, config: NodeConfig) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = config;
    }
}
