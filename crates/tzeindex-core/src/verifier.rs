//! Verifier-chain resolution for the STARK-verification extension.
//!
//! An extension output in a transaction without extension inputs
//! *initializes* a verifier identified by `txid:vout`. An extension output in
//! a transaction with extension inputs *verifies*: each input is resolved to
//! the verifier it continues, a proof record is stored, and the verifier's
//! balance is replaced by the new output's value.
//!
//! Resolution is two keyed lookups rather than a graph walk:
//! 1. a verifier whose id equals the spent outpoint (spending the root), else
//! 2. the verifier of any proof recorded for the spent transaction (spending
//!    an intermediate verify output).

use tracing::debug;

use crate::codec::{Precondition, Witness};
use crate::error::IndexerError;
use crate::extension::{extension_inputs, extension_outputs, ExtensionOutput};
use crate::indexer::IndexContext;
use crate::store::{ProofRecord, StateTransitionFact, StoreTx, Verifier};
use crate::types::{Block, OutPoint, Transaction};

const ZERO_STATE: [u8; 32] = [0u8; 32];

/// Resolve the verifier id that the input spending `previous` continues.
pub async fn resolve_verifier(
    store: &mut dyn StoreTx,
    previous: &OutPoint,
) -> Result<String, IndexerError> {
    let direct = previous.to_string();
    if store.verifier(&direct).await?.is_some() {
        return Ok(direct);
    }
    if let Some(proof) = store.proof_by_txid(&previous.txid).await? {
        return Ok(proof.verifier_id);
    }
    Err(IndexerError::UnresolvedVerifier {
        prev_txid: previous.txid.clone(),
        prev_vout: previous.vout,
    })
}

/// Create or advance verifiers for every STARK-verification transaction in `block`.
pub async fn index_block(
    block: &Block,
    ctx: &IndexContext,
    store: &mut dyn StoreTx,
) -> Result<(), IndexerError> {
    for tx in &block.transactions {
        index_transaction(block.height, tx, ctx, store).await?;
    }
    Ok(())
}

async fn index_transaction(
    height: u64,
    tx: &Transaction,
    ctx: &IndexContext,
    store: &mut dyn StoreTx,
) -> Result<(), IndexerError> {
    let outputs: Vec<_> = extension_outputs(tx, ctx.max_precondition_size)?
        .into_iter()
        .filter(|o| o.script.is_stark_verify())
        .collect();
    let inputs: Vec<_> = extension_inputs(tx)?
        .into_iter()
        .filter(|i| i.script.is_stark_verify())
        .collect();

    if inputs.is_empty() {
        for out in &outputs {
            initialize(height, tx, out, store).await?;
        }
        return Ok(());
    }

    let next = outputs.first();
    let new_state = next.map(|o| Precondition::decode(&o.script.payload).root);

    for input in &inputs {
        let witness = Witness::decode(&input.script.payload)?;
        let verifier_id = resolve_verifier(store, input.previous).await?;
        let verifier = store
            .verifier(&verifier_id)
            .await?
            .ok_or_else(|| IndexerError::UnresolvedVerifier {
                prev_txid: input.previous.txid.clone(),
                prev_vout: input.previous.vout,
            })?;

        store
            .insert_proof(&ProofRecord {
                verifier_id: verifier_id.clone(),
                txid: tx.txid.clone(),
                input_index: input.index,
                block_height: height,
                proof_size: witness.proof_size(),
                balance_after: next.map(|o| o.output.value),
            })
            .await?;

        if let Some(out) = next {
            store.set_verifier_balance(&verifier_id, out.output.value).await?;
        }

        if ctx.track_state_transitions {
            let old_state = store
                .extension_output(input.previous)
                .await?
                .map(|prev| Precondition::decode(&prev.payload).root)
                .unwrap_or(ZERO_STATE);
            store
                .insert_state_transition(&StateTransitionFact {
                    verifier_id: verifier_id.clone(),
                    txid: tx.txid.clone(),
                    input_index: input.index,
                    block_height: height,
                    old_state: hex::encode(old_state),
                    new_state: hex::encode(new_state.unwrap_or(ZERO_STATE)),
                    program_hash: verifier.program_hash.clone(),
                    inner_program_hash: verifier.inner_program_hash.clone(),
                })
                .await?;
        }

        debug!(
            verifier = %verifier_id,
            txid = %tx.txid,
            vin = input.index,
            proof_size = witness.proof_size(),
            "verify step recorded"
        );
    }
    Ok(())
}

async fn initialize(
    height: u64,
    tx: &Transaction,
    out: &ExtensionOutput<'_>,
    store: &mut dyn StoreTx,
) -> Result<(), IndexerError> {
    let precondition = Precondition::decode(&out.script.payload);
    let id = OutPoint::new(tx.txid.clone(), out.output.index).to_string();
    let short = tx.txid.get(..8).unwrap_or(tx.txid.as_str());
    store
        .insert_verifier(&Verifier {
            id: id.clone(),
            name: format!("verifier-{short}-{}", out.output.index),
            balance: out.output.value,
            initial_balance: out.output.value,
            root: precondition.root_hex(),
            inner_program_hash: precondition.inner_program_hash_hex(),
            program_hash: precondition.program_hash_hex(),
            created_height: height,
        })
        .await?;
    debug!(verifier = %id, balance = out.output.value, "verifier initialized");
    Ok(())
}
