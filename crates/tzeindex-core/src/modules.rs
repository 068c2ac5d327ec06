//! Indexing modules, run in a fixed order inside one block transaction.
//!
//! Order matters: the block record comes first so later rows reference an
//! existing block, balance aggregation runs next, and detail records that
//! reference those rows come last.

use tracing::trace;

use crate::error::IndexerError;
use crate::graph;
use crate::indexer::{IndexContext, ModuleConfig};
use crate::store::{BlockRecord, StoreTx, TransactionRecord};
use crate::types::Block;
use crate::{accounts, extension, verifier};

/// One indexing stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexModule {
    /// Block and transaction rows. Always enabled.
    Blocks,
    /// Transparent address balances.
    Accounts,
    /// UTXO spend graph.
    Graph,
    /// Decoded extension outputs and inputs.
    Extension,
    /// Verifiers, proof records, and state-transition facts.
    Verifiers,
}

impl IndexModule {
    /// Every module in execution order.
    pub const ALL: [IndexModule; 5] = [
        Self::Blocks,
        Self::Accounts,
        Self::Graph,
        Self::Extension,
        Self::Verifiers,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Blocks => "blocks",
            Self::Accounts => "accounts",
            Self::Graph => "graph",
            Self::Extension => "extension",
            Self::Verifiers => "verifiers",
        }
    }

    pub fn is_enabled(&self, config: &ModuleConfig) -> bool {
        match self {
            Self::Blocks => true,
            Self::Accounts => config.accounts,
            Self::Graph => config.graph,
            Self::Extension => config.extension,
            Self::Verifiers => config.verifiers,
        }
    }

    /// The enabled modules, in execution order.
    pub fn enabled(config: &ModuleConfig) -> Vec<IndexModule> {
        Self::ALL
            .into_iter()
            .filter(|m| m.is_enabled(config))
            .collect()
    }

    /// Index `block` through `store`.
    pub async fn index(
        &self,
        block: &Block,
        ctx: &IndexContext,
        store: &mut dyn StoreTx,
    ) -> Result<(), IndexerError> {
        trace!(module = self.name(), height = block.height, "indexing");
        match self {
            Self::Blocks => index_base(block, store).await,
            Self::Accounts => accounts::index_block(block, store).await,
            Self::Graph => graph::index_block(block, store).await,
            Self::Extension => extension::index_block(block, ctx.max_precondition_size, store).await,
            Self::Verifiers => verifier::index_block(block, ctx, store).await,
        }
    }
}

impl std::fmt::Display for IndexModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

async fn index_base(block: &Block, store: &mut dyn StoreTx) -> Result<(), IndexerError> {
    store.insert_block(&BlockRecord::from(block)).await?;
    for tx in &block.transactions {
        store
            .insert_transaction(&TransactionRecord {
                txid: tx.txid.clone(),
                block_height: block.height,
                kind: graph::classify(tx),
                version: tx.version,
                lock_time: tx.lock_time,
                size: tx.size,
            })
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_module_cannot_be_disabled() {
        let config = ModuleConfig {
            accounts: false,
            graph: false,
            extension: false,
            verifiers: false,
            state_transitions: false,
        };
        assert_eq!(IndexModule::enabled(&config), vec![IndexModule::Blocks]);
    }

    #[test]
    fn enabled_modules_keep_declared_order() {
        let config = ModuleConfig {
            accounts: false,
            ..ModuleConfig::default()
        };
        assert_eq!(
            IndexModule::enabled(&config),
            vec![
                IndexModule::Blocks,
                IndexModule::Graph,
                IndexModule::Extension,
                IndexModule::Verifiers
            ]
        );
    }
}
