//! Transparent address balances.
//!
//! Aggregates each block into one [`AccountDelta`] per touched address.
//! Inputs debit the address of the output they spend, found among this
//! block's outputs first and then in the store.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::IndexerError;
use crate::store::{AccountDelta, StoreTx};
use crate::types::{Block, OutPoint};

/// Address and value of a spent output.
pub type SpentOutput = (String, i64);

pub async fn index_block(block: &Block, store: &mut dyn StoreTx) -> Result<(), IndexerError> {
    let created = created_outputs(block);
    let mut prior: HashMap<OutPoint, SpentOutput> = HashMap::new();
    for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
        for previous in tx.inputs.iter().filter_map(|i| i.previous.as_ref()) {
            if created.contains_key(previous) || prior.contains_key(previous) {
                continue;
            }
            if let Some(out) = store.output(previous).await? {
                if let Some(address) = out.address {
                    prior.insert(previous.clone(), (address, out.value));
                }
            }
        }
    }

    for delta in block_deltas(block, &prior) {
        store.apply_account_delta(&delta).await?;
    }
    Ok(())
}

/// Per-address deltas for `block`, ordered by address.
///
/// `prior` maps outpoints created before this block to the output they
/// spend; inputs found in neither `prior` nor this block debit nobody.
pub fn block_deltas(block: &Block, prior: &HashMap<OutPoint, SpentOutput>) -> Vec<AccountDelta> {
    let created = created_outputs(block);

    let mut deltas: BTreeMap<String, AccountDelta> = BTreeMap::new();
    for tx in &block.transactions {
        let mut touched: HashSet<String> = HashSet::new();

        for out in tx.outputs.iter().filter(|o| !o.is_extension()) {
            if let Some(addr) = &out.address {
                delta_for(&mut deltas, addr, block.height).received += out.value;
                touched.insert(addr.clone());
            }
        }

        if !tx.is_coinbase() {
            for previous in tx.inputs.iter().filter_map(|i| i.previous.as_ref()) {
                let spent = match created.get(previous) {
                    Some((addr, value)) => Some((*addr, *value)),
                    None => prior.get(previous).map(|(a, v)| (a.as_str(), *v)),
                };
                if let Some((addr, value)) = spent {
                    delta_for(&mut deltas, addr, block.height).sent += value;
                    touched.insert(addr.to_string());
                }
            }
        }

        for addr in touched {
            delta_for(&mut deltas, &addr, block.height).tx_count += 1;
        }
    }
    deltas.into_values().collect()
}

fn created_outputs(block: &Block) -> HashMap<OutPoint, (&str, i64)> {
    let mut created = HashMap::new();
    for tx in &block.transactions {
        for out in tx.outputs.iter().filter(|o| !o.is_extension()) {
            if let Some(addr) = &out.address {
                created.insert(OutPoint::new(tx.txid.clone(), out.index), (addr.as_str(), out.value));
            }
        }
    }
    created
}

fn delta_for<'a>(
    deltas: &'a mut BTreeMap<String, AccountDelta>,
    address: &str,
    height: u64,
) -> &'a mut AccountDelta {
    deltas
        .entry(address.to_string())
        .or_insert_with(|| AccountDelta {
            address: address.to_string(),
            height,
            ..Default::default()
        })
}
