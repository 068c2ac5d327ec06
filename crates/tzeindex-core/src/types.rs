//! Shared block and transaction types for the indexing pipeline.
//!
//! Every component (graph builder, verifier resolver, reorg detector,
//! orchestrator) works on these values; node-specific parsing lives in
//! `tzeindex-zcash`.

use serde::{Deserialize, Serialize};

/// Transaction version used by extension (TZE) transactions.
pub const EXTENSION_TX_VERSION: i32 = 0xFFFF;

/// Version-group id carried by extension (TZE) transactions.
pub const EXTENSION_VERSION_GROUP_ID: u32 = 0xFFFF_FFFF;

// ─── Block ────────────────────────────────────────────────────────────────────

/// A fully parsed block, as handed to the indexing modules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub hash: String,
    /// Empty for the genesis block.
    pub previous_hash: String,
    pub merkle_root: String,
    /// Unix timestamp (seconds).
    pub timestamp: i64,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn tx_count(&self) -> u32 {
        self.transactions.len() as u32
    }

    /// The height/hash summary used by cursor and reorg bookkeeping.
    pub fn summary(&self) -> BlockSummary {
        BlockSummary {
            height: self.height,
            hash: self.hash.clone(),
            previous_hash: self.previous_hash.clone(),
            timestamp: self.timestamp,
            tx_count: self.tx_count(),
        }
    }
}

/// A minimal summary of a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    pub height: u64,
    pub hash: String,
    pub previous_hash: String,
    pub timestamp: i64,
    pub tx_count: u32,
}

impl BlockSummary {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &BlockSummary) -> bool {
        self.height == parent.height + 1 && self.previous_hash == parent.hash
    }
}

// ─── Transaction ──────────────────────────────────────────────────────────────

/// A transaction inside a [`Block`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub txid: String,
    pub version: i32,
    pub version_group_id: u32,
    pub lock_time: u32,
    /// Serialized size in bytes.
    pub size: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    /// Shielded spends (Sprout joinsplits, Sapling spends, Orchard actions).
    pub shielded_spends: u32,
    /// Shielded outputs (Sprout joinsplits, Sapling outputs, Orchard actions).
    pub shielded_outputs: u32,
}

impl Transaction {
    /// A coinbase transaction has exactly one input with no previous-output reference.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous.is_none()
    }

    /// Extension transactions are identified by their version and version group.
    pub fn is_extension(&self) -> bool {
        self.version == EXTENSION_TX_VERSION
            && self.version_group_id == EXTENSION_VERSION_GROUP_ID
    }

    /// Returns `true` if any input carries an extension-bearing script.
    pub fn has_extension_input(&self) -> bool {
        self.inputs.iter().any(TxInput::is_extension)
    }
}

/// A reference to an output of an earlier transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: String,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: impl Into<String>, vout: u32) -> Self {
        Self {
            txid: txid.into(),
            vout,
        }
    }
}

impl std::fmt::Display for OutPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// A transparent input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// `None` for the coinbase input.
    pub previous: Option<OutPoint>,
    /// Hex-encoded script (scriptSig, or the extension witness script).
    pub script_hex: String,
    pub sequence: u32,
    /// Value reported by the node, if it includes one (zatoshis).
    pub value: Option<i64>,
}

impl TxInput {
    pub fn is_extension(&self) -> bool {
        crate::codec::is_extension_script(&self.script_hex)
    }
}

/// A transparent output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub index: u32,
    /// Value in zatoshis.
    pub value: i64,
    /// Hex-encoded scriptPubKey (or the extension precondition script).
    pub script_hex: String,
    /// First transparent address the node decoded for this script, if any.
    pub address: Option<String>,
}

impl TxOutput {
    pub fn is_extension(&self) -> bool {
        crate::codec::is_extension_script(&self.script_hex)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(height: u64, hash: &str, prev: &str) -> BlockSummary {
        BlockSummary {
            height,
            hash: hash.into(),
            previous_hash: prev.into(),
            timestamp: height as i64 * 75,
            tx_count: 1,
        }
    }

    #[test]
    fn block_extends_parent() {
        let parent = summary(100, "aa", "99");
        let child = summary(101, "bb", "aa");
        assert!(child.extends(&parent));
        assert!(!parent.extends(&child));
    }

    #[test]
    fn block_extends_false_on_gap() {
        let a = summary(100, "aa", "99");
        let b = summary(102, "cc", "aa");
        assert!(!b.extends(&a));
    }

    #[test]
    fn coinbase_and_extension_detection() {
        let mut tx = Transaction {
            txid: "t".into(),
            version: 4,
            version_group_id: 0x892F_2085,
            lock_time: 0,
            size: 100,
            inputs: vec![TxInput {
                previous: None,
                script_hex: "03a08601".into(),
                sequence: u32::MAX,
                value: None,
            }],
            outputs: vec![],
            shielded_spends: 0,
            shielded_outputs: 0,
        };
        assert!(tx.is_coinbase());
        assert!(!tx.is_extension());

        tx.version = EXTENSION_TX_VERSION;
        assert!(!tx.is_extension(), "version alone is not enough");
        tx.version_group_id = EXTENSION_VERSION_GROUP_ID;
        assert!(tx.is_extension());
    }

    #[test]
    fn outpoint_display() {
        assert_eq!(OutPoint::new("abc", 2).to_string(), "abc:2");
    }
}
