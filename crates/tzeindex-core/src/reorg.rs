//! Reorg detection and recovery.
//!
//! Detection compares an incoming block's previous-hash with the stored hash
//! one height below. Resolution walks back from that height, comparing stored
//! hashes with the node's canonical hashes, until they agree; everything
//! above the agreeing height (the common ancestor) is rolled back.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::IndexerError;
use crate::store::IndexStore;
use crate::types::BlockSummary;

/// Source of the node's canonical block hashes.
#[async_trait]
pub trait ChainView: Send + Sync {
    async fn canonical_hash(&self, height: u64) -> Result<String, IndexerError>;
}

/// Describes a resolved chain reorganization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgEvent {
    /// Height of the incoming block whose parent did not match.
    pub detected_at: u64,
    /// Highest height where the stored chain and the node agree.
    pub common_ancestor: u64,
    /// Number of stored blocks that were rolled back.
    pub depth: u64,
    /// Where indexing continues (`common_ancestor + 1`).
    pub resume_height: u64,
    /// Number of block rows the store removed.
    pub removed_blocks: u64,
}

/// Detects and resolves chain reorganizations against the stored chain.
#[derive(Debug, Clone, Copy)]
pub struct ReorgDetector {
    max_depth: u64,
}

impl ReorgDetector {
    pub fn new(max_depth: u64) -> Self {
        Self { max_depth }
    }

    pub fn max_depth(&self) -> u64 {
        self.max_depth
    }

    /// Pure detection rule: a missing stored parent is never a reorg.
    pub fn is_reorg(stored_parent_hash: Option<&str>, block: &BlockSummary) -> bool {
        match stored_parent_hash {
            Some(stored) => stored != block.previous_hash,
            None => false,
        }
    }

    /// Returns `true` if `block` does not extend the stored chain.
    pub async fn detect<S>(&self, store: &S, block: &BlockSummary) -> Result<bool, IndexerError>
    where
        S: IndexStore + ?Sized,
    {
        if block.height == 0 {
            return Ok(false);
        }
        let stored = store.block_hash_at(block.height - 1).await?;
        Ok(Self::is_reorg(stored.as_deref(), block))
    }

    /// Walk back from `tip` until the stored hash agrees with the node.
    ///
    /// Heights with no stored block are skipped. Fails once the walk would
    /// go deeper than `max_depth` below `tip`, or passes genesis.
    pub async fn find_common_ancestor<S>(
        &self,
        store: &S,
        chain: &dyn ChainView,
        tip: u64,
    ) -> Result<u64, IndexerError>
    where
        S: IndexStore + ?Sized,
    {
        let mut height = tip;
        loop {
            if let Some(stored) = store.block_hash_at(height).await? {
                let canonical = chain.canonical_hash(height).await?;
                if stored == canonical {
                    return Ok(height);
                }
            }
            if height == 0 {
                return Err(IndexerError::GenesisReached { from: tip });
            }
            height -= 1;
            if tip - height > self.max_depth {
                return Err(IndexerError::ReorgTooDeep {
                    from: tip,
                    max_depth: self.max_depth,
                });
            }
        }
    }

    /// Find the common ancestor for `block` and roll the store back to it.
    pub async fn resolve<S>(
        &self,
        store: &S,
        chain: &dyn ChainView,
        block: &BlockSummary,
    ) -> Result<ReorgEvent, IndexerError>
    where
        S: IndexStore + ?Sized,
    {
        let tip = block.height.saturating_sub(1);
        warn!(
            height = block.height,
            previous_hash = %block.previous_hash,
            "Reorg detected, searching for common ancestor"
        );
        let ancestor = self.find_common_ancestor(store, chain, tip).await?;
        let removed_blocks = store.rollback_after(ancestor).await?;
        let event = ReorgEvent {
            detected_at: block.height,
            common_ancestor: ancestor,
            depth: tip - ancestor,
            resume_height: ancestor + 1,
            removed_blocks,
        };
        info!(
            ancestor,
            depth = event.depth,
            removed_blocks,
            "Rolled back to common ancestor"
        );
        Ok(event)
    }
}
