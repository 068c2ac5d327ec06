//! Extension (TZE) record indexing.
//!
//! Routes every extension-bearing script in a block through the codec and
//! stores the decoded `{extension_id, mode, payload}` rows. A malformed script
//! that carries the extension marker aborts the block.

use crate::codec::{self, ExtensionScript};
use crate::error::IndexerError;
use crate::store::{ExtensionInputRecord, ExtensionOutputRecord, StoreTx};
use crate::types::{Block, OutPoint, Transaction, TxInput, TxOutput};

/// A decoded extension output of a transaction.
#[derive(Debug, Clone)]
pub struct ExtensionOutput<'a> {
    pub output: &'a TxOutput,
    pub script: ExtensionScript,
}

/// A decoded extension input of a transaction.
#[derive(Debug, Clone)]
pub struct ExtensionInput<'a> {
    pub index: u32,
    pub input: &'a TxInput,
    pub previous: &'a OutPoint,
    pub script: ExtensionScript,
}

/// Decode every extension output of `tx`.
///
/// Payloads longer than `max_payload` are replaced by an empty payload.
pub fn extension_outputs(
    tx: &Transaction,
    max_payload: usize,
) -> Result<Vec<ExtensionOutput<'_>>, IndexerError> {
    let mut out = Vec::new();
    for output in tx.outputs.iter().filter(|o| o.is_extension()) {
        let mut script = codec::decode_hex(&output.script_hex)?;
        if script.payload.len() > max_payload {
            tracing::debug!(
                txid = %tx.txid,
                vout = output.index,
                size = script.payload.len(),
                max = max_payload,
                "oversized precondition stored empty"
            );
            script.payload.clear();
        }
        out.push(ExtensionOutput { output, script });
    }
    Ok(out)
}

/// Decode every extension input of `tx` that references a previous output.
pub fn extension_inputs(tx: &Transaction) -> Result<Vec<ExtensionInput<'_>>, IndexerError> {
    let mut out = Vec::new();
    for (vin, input) in tx.inputs.iter().enumerate() {
        if !input.is_extension() {
            continue;
        }
        let Some(previous) = &input.previous else {
            continue;
        };
        out.push(ExtensionInput {
            index: vin as u32,
            input,
            previous,
            script: codec::decode_hex(&input.script_hex)?,
        });
    }
    Ok(out)
}

/// Store the extension outputs and inputs of every transaction in `block`.
pub async fn index_block(
    block: &Block,
    max_payload: usize,
    store: &mut dyn StoreTx,
) -> Result<(), IndexerError> {
    for tx in &block.transactions {
        for ext in extension_outputs(tx, max_payload)? {
            store
                .insert_extension_output(&ExtensionOutputRecord {
                    txid: tx.txid.clone(),
                    index: ext.output.index,
                    extension_id: ext.script.extension_id,
                    mode: ext.script.mode,
                    payload: ext.script.payload,
                    value: ext.output.value,
                    block_height: block.height,
                })
                .await?;
        }
        for ext in extension_inputs(tx)? {
            store
                .insert_extension_input(&ExtensionInputRecord {
                    txid: tx.txid.clone(),
                    index: ext.index,
                    extension_id: ext.script.extension_id,
                    mode: ext.script.mode,
                    payload: ext.script.payload,
                    previous: ext.previous.clone(),
                    block_height: block.height,
                })
                .await?;
        }
    }
    Ok(())
}
