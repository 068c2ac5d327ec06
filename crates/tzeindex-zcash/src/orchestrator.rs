//! Per-block pipeline: fetch, parse, reorg check, index, advance cursor.

use std::sync::Arc;

use tracing::{debug, warn};

use tzeindex_core::cursor::Cursor;
use tzeindex_core::error::IndexerError;
use tzeindex_core::indexer::{IndexContext, IndexerConfig};
use tzeindex_core::modules::IndexModule;
use tzeindex_core::reorg::{ReorgDetector, ReorgEvent};
use tzeindex_core::store::{IndexStore, StoreTx};
use tzeindex_core::types::Block;

use crate::fetcher::{NodeChainView, NodeClient};
use crate::parser::parse_block;

/// Result of processing one height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// The block was indexed and the cursor now points at it.
    Indexed { height: u64, hash: String, tx_count: u32 },
    /// The block did not extend the stored chain; the store was rolled back.
    Reorg(ReorgEvent),
}

/// Runs one block through every enabled module inside a single store transaction.
pub struct BlockOrchestrator<C: ?Sized, S: ?Sized> {
    client: Arc<C>,
    store: Arc<S>,
    modules: Vec<IndexModule>,
    ctx: IndexContext,
    reorg: Option<ReorgDetector>,
}

impl<C, S> BlockOrchestrator<C, S>
where
    C: NodeClient + ?Sized,
    S: IndexStore + ?Sized,
{
    pub fn new(config: &IndexerConfig, client: Arc<C>, store: Arc<S>) -> Self {
        Self {
            client,
            store,
            modules: IndexModule::enabled(&config.modules),
            ctx: IndexContext::from(config),
            reorg: config
                .reorg
                .enabled
                .then(|| ReorgDetector::new(config.reorg.max_depth)),
        }
    }

    pub fn modules(&self) -> &[IndexModule] {
        &self.modules
    }

    /// Fetch and parse the block at `height`, checking the node returned that height.
    pub async fn fetch_block(&self, height: u64) -> Result<Block, IndexerError> {
        let hash = self.client.get_block_hash(height).await?;
        let raw = self.client.get_block(&hash).await?;
        let block = parse_block(&raw)?;
        if block.height != height {
            return Err(IndexerError::HeightMismatch {
                requested: height,
                got: block.height,
            });
        }
        Ok(block)
    }

    /// Process the block at `height`.
    ///
    /// A reorg is reported as [`BlockOutcome::Reorg`] after the store has been
    /// rolled back to the common ancestor; the block itself is not indexed.
    pub async fn process_block(&self, height: u64) -> Result<BlockOutcome, IndexerError> {
        let block = self.fetch_block(height).await?;

        if let Some(detector) = &self.reorg {
            let summary = block.summary();
            if detector.detect(self.store.as_ref(), &summary).await? {
                let chain = NodeChainView(self.client.as_ref());
                let event = detector
                    .resolve(self.store.as_ref(), &chain, &summary)
                    .await?;
                return Ok(BlockOutcome::Reorg(event));
            }
        }

        self.index(&block).await?;
        debug!(
            height,
            hash = %block.hash,
            txs = block.tx_count(),
            "block indexed"
        );
        Ok(BlockOutcome::Indexed {
            height,
            hash: block.hash,
            tx_count: block.transactions.len() as u32,
        })
    }

    /// Index `block` atomically: every module's writes and the cursor commit
    /// together or not at all.
    pub async fn index(&self, block: &Block) -> Result<(), IndexerError> {
        let mut tx = self.store.begin().await?;
        match self.write(block, tx.as_mut()).await {
            Ok(()) => tx.commit().await,
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(height = block.height, error = %rollback_err, "rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn write(&self, block: &Block, tx: &mut dyn StoreTx) -> Result<(), IndexerError> {
        for module in &self.modules {
            module.index(block, &self.ctx, tx).await?;
        }
        tx.save_cursor(&Cursor::new(block.height, block.hash.clone()))
            .await
    }
}
