//! YAML settings file for `tzeindex run`.
//!
//! ```yaml
//! node:
//!   url: http://127.0.0.1:18232
//!   user: rpcuser
//! storage:
//!   backend: sqlite
//!   path: ./tzeindex.db
//! indexer:
//!   id: tze-testnet
//!   default_start_height: 280000
//!   reorg:
//!     max_depth: 8
//! log:
//!   level: info
//!   components:
//!     tzeindex-zcash: debug
//! ```
//!
//! Every section and field is optional.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use tzeindex_core::IndexerConfig;
use tzeindex_zcash::NodeConfig;

use crate::logging::LogConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub node: NodeConfig,
    pub storage: StorageSettings,
    pub indexer: IndexerConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    /// Database file (sqlite backend only).
    pub path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            path: "tzeindex.db".into(),
        }
    }
}

impl Settings {
    /// Load `path`, or the defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings file {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing settings file {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        assert_eq!(Settings::from_yaml("").unwrap(), Settings::default());
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let settings = Settings::from_yaml(
            r#"
node:
  url: http://127.0.0.1:18232
storage:
  backend: memory
indexer:
  id: tze-testnet
  stop_height: 300000
  reorg:
    max_depth: 8
log:
  json: true
"#,
        )
        .unwrap();

        assert_eq!(settings.node.url, "http://127.0.0.1:18232");
        assert_eq!(settings.node.timeout_ms, 30_000);
        assert_eq!(settings.storage.backend, StorageBackend::Memory);
        assert_eq!(settings.storage.path, "tzeindex.db");
        assert_eq!(settings.indexer.id, "tze-testnet");
        assert_eq!(settings.indexer.stop_height, Some(300_000));
        assert_eq!(settings.indexer.reorg.max_depth, 8);
        assert!(settings.indexer.reorg.enabled);
        assert_eq!(settings.indexer.batch_size, 100);
        assert!(settings.log.json);
        assert_eq!(settings.log.level, "info");
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(Settings::from_yaml("storage:\n  backend: postgres\n").is_err());
    }
}
