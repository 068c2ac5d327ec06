//! Fluent builder API for creating indexers.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tzeindex_storage::MemoryStorage;
//! use tzeindex_zcash::{HttpNodeClient, IndexerBuilder, NodeConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Arc::new(HttpNodeClient::new(NodeConfig::default())?);
//! let store = Arc::new(MemoryStorage::new());
//!
//! let handle = IndexerBuilder::new()
//!     .id("tze-mainnet")
//!     .default_start_height(1_000_000)
//!     .batch_size(50)
//!     .reorg_max_depth(8)
//!     .build(client, store)
//!     .spawn();
//! handle.wait().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tzeindex_core::indexer::{IndexerConfig, ModuleConfig};
use tzeindex_core::modules::IndexModule;
use tzeindex_core::store::IndexStore;

use crate::fetcher::NodeClient;
use crate::index_loop::IndexLoop;

/// Fluent builder for `IndexerConfig`.
#[derive(Default)]
pub struct IndexerBuilder {
    config: IndexerConfig,
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self {
            config: IndexerConfig::default(),
        }
    }

    /// Start from an existing configuration.
    pub fn from_config(config: IndexerConfig) -> Self {
        Self { config }
    }

    /// Set the indexer ID (used in logs).
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = id.into();
        self
    }

    /// Start at `height` regardless of the stored cursor.
    pub fn start_height(mut self, height: u64) -> Self {
        self.config.start_height = Some(height);
        self
    }

    /// Start height used when there is no cursor and no override.
    pub fn default_start_height(mut self, height: u64) -> Self {
        self.config.default_start_height = height;
        self
    }

    /// Exit cleanly once `height` is indexed.
    pub fn stop_height(mut self, height: u64) -> Self {
        self.config.stop_height = Some(height);
        self
    }

    pub fn batch_size(mut self, size: u64) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set tip polling interval in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.retry.max_retries = retries;
        self
    }

    /// Initial and maximum retry backoff in milliseconds.
    pub fn retry_backoff_ms(mut self, initial: u64, max: u64) -> Self {
        self.config.retry.initial_backoff_ms = initial;
        self.config.retry.max_backoff_ms = max;
        self
    }

    pub fn reorg_max_depth(mut self, depth: u64) -> Self {
        self.config.reorg.max_depth = depth;
        self
    }

    /// Skip reorg detection entirely.
    pub fn disable_reorg(mut self) -> Self {
        self.config.reorg.enabled = false;
        self
    }

    pub fn modules(mut self, modules: ModuleConfig) -> Self {
        self.config.modules = modules;
        self
    }

    /// Turn one module off. The block module cannot be disabled.
    pub fn disable_module(mut self, module: IndexModule) -> Self {
        let m = &mut self.config.modules;
        match module {
            IndexModule::Blocks => {}
            IndexModule::Accounts => m.accounts = false,
            IndexModule::Graph => m.graph = false,
            IndexModule::Extension => m.extension = false,
            IndexModule::Verifiers => m.verifiers = false,
        }
        self
    }

    pub fn track_state_transitions(mut self, enabled: bool) -> Self {
        self.config.modules.state_transitions = enabled;
        self
    }

    /// Preconditions larger than this are stored empty.
    pub fn max_precondition_size(mut self, bytes: usize) -> Self {
        self.config.max_precondition_size = bytes;
        self
    }

    /// Build the `IndexerConfig`.
    pub fn build_config(self) -> IndexerConfig {
        self.config
    }

    /// Build an [`IndexLoop`] over `client` and `store`.
    pub fn build<C, S>(self, client: Arc<C>, store: Arc<S>) -> IndexLoop<C, S>
    where
        C: NodeClient + ?Sized,
        S: IndexStore + ?Sized,
    {
        IndexLoop::new(self.config, client, store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let cfg = IndexerBuilder::new().build_config();
        assert_eq!(cfg.batch_size, 100);
        assert_eq!(cfg.poll_interval_ms, 5000);
        assert_eq!(cfg.retry.max_retries, 3);
        assert!(cfg.reorg.enabled);
        assert_eq!(cfg.reorg.max_depth, 100);
        assert_eq!(cfg.max_precondition_size, 4096);
    }

    #[test]
    fn builder_custom() {
        let cfg = IndexerBuilder::new()
            .id("tze-testnet")
            .start_height(280_000)
            .stop_height(281_000)
            .batch_size(25)
            .reorg_max_depth(8)
            .max_precondition_size(256)
            .build_config();

        assert_eq!(cfg.id, "tze-testnet");
        assert_eq!(cfg.start_height, Some(280_000));
        assert_eq!(cfg.stop_height, Some(281_000));
        assert_eq!(cfg.batch_size, 25);
        assert_eq!(cfg.reorg.max_depth, 8);
        assert_eq!(cfg.max_precondition_size, 256);
    }

    #[test]
    fn disabling_modules() {
        let cfg = IndexerBuilder::new()
            .disable_module(IndexModule::Accounts)
            .disable_module(IndexModule::Blocks)
            .disable_reorg()
            .build_config();
        assert!(!cfg.modules.accounts);
        assert!(cfg.modules.graph);
        assert!(!cfg.reorg.enabled);
        assert_eq!(
            IndexModule::enabled(&cfg.modules).first(),
            Some(&IndexModule::Blocks)
        );
    }
}
