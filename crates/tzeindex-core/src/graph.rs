//! UTXO spend-graph builder.
//!
//! Persists every output and input of a block and flips each referenced
//! output to spent. All outputs of a block are written before any input so
//! that spends of same-block outputs find their target.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::IndexerError;
use crate::store::{InputRecord, OutputRecord, SpendRef, StoreTx};
use crate::types::{Block, Transaction};

/// Classification of a transaction by where its value comes from and goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    Coinbase,
    Extension,
    TransparentToTransparent,
    TransparentToShielded,
    ShieldedToTransparent,
    ShieldedToShielded,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coinbase => "coinbase",
            Self::Extension => "extension",
            Self::TransparentToTransparent => "t2t",
            Self::TransparentToShielded => "t2z",
            Self::ShieldedToTransparent => "z2t",
            Self::ShieldedToShielded => "z2z",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "coinbase" => Self::Coinbase,
            "extension" => Self::Extension,
            "t2t" => Self::TransparentToTransparent,
            "t2z" => Self::TransparentToShielded,
            "z2t" => Self::ShieldedToTransparent,
            "z2z" => Self::ShieldedToShielded,
            _ => return None,
        })
    }
}

impl std::fmt::Display for TxKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a transaction.
///
/// Coinbase first, then extension transactions regardless of their shielded
/// content. Value is "from shielded" when no transparent input funds the
/// transaction, and "to shielded" when any shielded output is created.
pub fn classify(tx: &Transaction) -> TxKind {
    if tx.is_coinbase() {
        return TxKind::Coinbase;
    }
    if tx.is_extension() {
        return TxKind::Extension;
    }
    let from_shielded = tx.inputs.is_empty() && tx.shielded_spends > 0;
    let to_shielded = tx.shielded_outputs > 0;
    match (from_shielded, to_shielded) {
        (false, false) => TxKind::TransparentToTransparent,
        (false, true) => TxKind::TransparentToShielded,
        (true, false) => TxKind::ShieldedToTransparent,
        (true, true) => TxKind::ShieldedToShielded,
    }
}

/// Write every output of every transaction in `block`.
///
/// Extension-bearing scripts are never treated as addresses.
pub async fn index_outputs(block: &Block, store: &mut dyn StoreTx) -> Result<(), IndexerError> {
    for tx in &block.transactions {
        for out in &tx.outputs {
            let address = if out.is_extension() {
                None
            } else {
                out.address.clone()
            };
            store
                .insert_output(&OutputRecord {
                    txid: tx.txid.clone(),
                    index: out.index,
                    value: out.value,
                    address,
                    block_height: block.height,
                    spent_by: None,
                })
                .await?;
        }
    }
    Ok(())
}

/// Write every non-coinbase input in `block` and mark its target spent.
pub async fn index_inputs(block: &Block, store: &mut dyn StoreTx) -> Result<(), IndexerError> {
    for tx in &block.transactions {
        if tx.is_coinbase() {
            continue;
        }
        for (vin, input) in tx.inputs.iter().enumerate() {
            let Some(previous) = &input.previous else {
                continue;
            };
            let value = match store.output(previous).await? {
                Some(prev) => prev.value,
                None => input.value.unwrap_or(0),
            };
            store
                .insert_input(&InputRecord {
                    txid: tx.txid.clone(),
                    index: vin as u32,
                    value,
                    previous: previous.clone(),
                    sequence: input.sequence,
                    block_height: block.height,
                })
                .await?;

            let spend = SpendRef {
                txid: tx.txid.clone(),
                input_index: vin as u32,
                height: block.height,
            };
            if !store.mark_output_spent(previous, &spend).await? {
                debug!(
                    outpoint = %previous,
                    spender = %tx.txid,
                    "spent output is not indexed or already spent"
                );
            }
        }
    }
    Ok(())
}

/// Build the spend graph for one block: all outputs, then all inputs.
pub async fn index_block(block: &Block, store: &mut dyn StoreTx) -> Result<(), IndexerError> {
    index_outputs(block, store).await?;
    index_inputs(block, store).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OutPoint, TxInput, TxOutput, EXTENSION_TX_VERSION, EXTENSION_VERSION_GROUP_ID};

    fn input(prev: Option<(&str, u32)>) -> TxInput {
        TxInput {
            previous: prev.map(|(t, v)| OutPoint::new(t, v)),
            script_hex: "47304402".into(),
            sequence: u32::MAX,
            value: None,
        }
    }

    fn output(index: u32) -> TxOutput {
        TxOutput {
            index,
            value: 1_000,
            script_hex: "76a914".into(),
            address: Some("t1abc".into()),
        }
    }

    fn tx(inputs: Vec<TxInput>, outputs: Vec<TxOutput>, z_in: u32, z_out: u32) -> Transaction {
        Transaction {
            txid: "tx".into(),
            version: 4,
            version_group_id: 0x892F_2085,
            lock_time: 0,
            size: 250,
            inputs,
            outputs,
            shielded_spends: z_in,
            shielded_outputs: z_out,
        }
    }

    #[test]
    fn classify_coinbase() {
        assert_eq!(classify(&tx(vec![input(None)], vec![output(0)], 0, 0)), TxKind::Coinbase);
    }

    #[test]
    fn classify_transparent_and_shielded() {
        let t = || vec![input(Some(("a", 0)))];
        assert_eq!(classify(&tx(t(), vec![output(0)], 0, 0)), TxKind::TransparentToTransparent);
        assert_eq!(classify(&tx(t(), vec![output(0)], 0, 2)), TxKind::TransparentToShielded);
        assert_eq!(classify(&tx(vec![], vec![output(0)], 1, 0)), TxKind::ShieldedToTransparent);
        assert_eq!(classify(&tx(vec![], vec![], 2, 2)), TxKind::ShieldedToShielded);
    }

    #[test]
    fn classify_extension_ignores_shielded_content() {
        let mut t = tx(vec![input(Some(("a", 0)))], vec![output(0)], 3, 3);
        t.version = EXTENSION_TX_VERSION;
        t.version_group_id = EXTENSION_VERSION_GROUP_ID;
        assert_eq!(classify(&t), TxKind::Extension);
    }

    #[test]
    fn kind_string_roundtrip() {
        for kind in [
            TxKind::Coinbase,
            TxKind::Extension,
            TxKind::TransparentToTransparent,
            TxKind::TransparentToShielded,
            TxKind::ShieldedToTransparent,
            TxKind::ShieldedToShielded,
        ] {
            assert_eq!(TxKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TxKind::parse("bogus"), None);
    }
}
