//! Indexer configuration and state types.

use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;

/// Configuration for an indexer instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Name of this indexer (used in logs).
    pub id: String,
    /// Explicit start height; overrides the stored cursor.
    pub start_height: Option<u64>,
    /// Height to start from when there is no override and no cursor.
    pub default_start_height: u64,
    /// Stop after indexing this height. `None` = follow the tip forever.
    pub stop_height: Option<u64>,
    /// Maximum number of blocks processed per batch.
    pub batch_size: u64,
    /// Tip polling interval once caught up (milliseconds).
    pub poll_interval_ms: u64,
    /// Per-block retry policy.
    pub retry: RetryConfig,
    /// Chain reorganization handling.
    pub reorg: ReorgConfig,
    /// Which indexing modules run.
    pub modules: ModuleConfig,
    /// Extension-output payloads larger than this are stored empty.
    pub max_precondition_size: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            id: "default".into(),
            start_height: None,
            default_start_height: 0,
            stop_height: None,
            batch_size: 100,
            poll_interval_ms: 5000,
            retry: RetryConfig::default(),
            reorg: ReorgConfig::default(),
            modules: ModuleConfig::default(),
            max_precondition_size: 4096,
        }
    }
}

/// Reorg handling settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReorgConfig {
    pub enabled: bool,
    /// Maximum number of blocks the common-ancestor search walks back.
    pub max_depth: u64,
}

impl Default for ReorgConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_depth: 100,
        }
    }
}

/// Per-module enable flags. The block module always runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    pub accounts: bool,
    pub graph: bool,
    pub extension: bool,
    pub verifiers: bool,
    /// Emit state-transition facts for verify transactions.
    pub state_transitions: bool,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            accounts: true,
            graph: true,
            extension: true,
            verifiers: true,
            state_transitions: true,
        }
    }
}

/// Settings handed to every module while a block is being indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexContext {
    pub max_precondition_size: usize,
    pub track_state_transitions: bool,
}

impl From<&IndexerConfig> for IndexContext {
    fn from(config: &IndexerConfig) -> Self {
        Self {
            max_precondition_size: config.max_precondition_size,
            track_state_transitions: config.modules.state_transitions,
        }
    }
}

/// Runtime state of the indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerState {
    /// Not yet started.
    Idle,
    /// Behind the node tip, processing batches.
    Backfilling,
    /// Caught up; polling for new blocks.
    Live,
    /// Rolling back to a common ancestor.
    ReorgRecovery,
    /// Stop requested.
    Stopping,
    /// Terminated cleanly.
    Stopped,
    /// Terminated with a fatal error.
    Error,
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Backfilling => write!(f, "backfilling"),
            Self::Live => write!(f, "live"),
            Self::ReorgRecovery => write!(f, "reorg-recovery"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: IndexerConfig =
            serde_json::from_str(r#"{"batch_size": 10, "reorg": {"max_depth": 8}}"#).unwrap();
        assert_eq!(cfg.batch_size, 10);
        assert_eq!(cfg.reorg.max_depth, 8);
        assert!(cfg.reorg.enabled);
        assert_eq!(cfg.retry.max_retries, 3);
        assert!(cfg.modules.verifiers);
    }

    #[test]
    fn context_from_config() {
        let mut cfg = IndexerConfig::default();
        cfg.modules.state_transitions = false;
        cfg.max_precondition_size = 12;
        let ctx = IndexContext::from(&cfg);
        assert!(!ctx.track_state_transitions);
        assert_eq!(ctx.max_precondition_size, 12);
    }
}
