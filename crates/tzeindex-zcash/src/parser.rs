//! Converts `getblock` (verbosity 2) JSON into the shared [`Block`] type.

use serde_json::Value;

use tzeindex_core::error::IndexerError;
use tzeindex_core::types::{Block, OutPoint, Transaction, TxInput, TxOutput};

const ZATOSHIS_PER_ZEC: f64 = 100_000_000.0;

fn missing(key: &str, context: &str) -> IndexerError {
    IndexerError::Parse(format!("missing or invalid `{key}` in {context}"))
}

fn req_str<'a>(v: &'a Value, key: &str, context: &str) -> Result<&'a str, IndexerError> {
    v[key].as_str().ok_or_else(|| missing(key, context))
}

fn req_u64(v: &Value, key: &str, context: &str) -> Result<u64, IndexerError> {
    v[key].as_u64().ok_or_else(|| missing(key, context))
}

fn out_of_range(key: &str, n: impl std::fmt::Display, context: &str) -> IndexerError {
    IndexerError::Parse(format!("`{key}` = {n} out of range in {context}"))
}

fn req_u32(v: &Value, key: &str, context: &str) -> Result<u32, IndexerError> {
    let n = req_u64(v, key, context)?;
    u32::try_from(n).map_err(|_| out_of_range(key, n, context))
}

fn opt_u32(v: &Value, key: &str, default: u32, context: &str) -> Result<u32, IndexerError> {
    match v[key].as_u64() {
        Some(n) => u32::try_from(n).map_err(|_| out_of_range(key, n, context)),
        None => Ok(default),
    }
}

fn array_len(v: &Value) -> u32 {
    v.as_array().map(|a| a.len() as u32).unwrap_or(0)
}

/// Parse a verbosity-2 `getblock` result.
pub fn parse_block(v: &Value) -> Result<Block, IndexerError> {
    let hash = req_str(v, "hash", "block")?.to_string();
    let height = req_u64(v, "height", &hash)?;
    let txs = v["tx"]
        .as_array()
        .ok_or_else(|| missing("tx", &hash))?;

    let transactions = txs
        .iter()
        .map(parse_transaction)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Block {
        height,
        hash,
        previous_hash: v["previousblockhash"].as_str().unwrap_or_default().to_string(),
        merkle_root: v["merkleroot"].as_str().unwrap_or_default().to_string(),
        timestamp: v["time"].as_i64().unwrap_or(0),
        transactions,
    })
}

fn parse_transaction(v: &Value) -> Result<Transaction, IndexerError> {
    if v.is_string() {
        return Err(IndexerError::Parse(
            "block transactions are not decoded (verbosity 2 required)".into(),
        ));
    }
    let txid = req_str(v, "txid", "transaction")?.to_string();

    let version_group_id = match v["versiongroupid"].as_str() {
        Some(s) => u32::from_str_radix(s.trim_start_matches("0x"), 16)
            .map_err(|_| missing("versiongroupid", &txid))?,
        None => 0,
    };

    let inputs = match v["vin"].as_array() {
        Some(vin) => vin
            .iter()
            .map(|i| parse_input(i, &txid))
            .collect::<Result<Vec<_>, _>>()?,
        None => vec![],
    };
    let outputs = match v["vout"].as_array() {
        Some(vout) => vout
            .iter()
            .enumerate()
            .map(|(n, o)| parse_output(o, n as u32, &txid))
            .collect::<Result<Vec<_>, _>>()?,
        None => vec![],
    };

    let joinsplits = array_len(&v["vjoinsplit"]);
    let actions = array_len(&v["orchard"]["actions"]);

    let version = v["version"].as_i64().unwrap_or(0);
    let version = i32::try_from(version).map_err(|_| out_of_range("version", version, &txid))?;

    Ok(Transaction {
        version,
        version_group_id,
        lock_time: opt_u32(v, "locktime", 0, &txid)?,
        size: opt_u32(v, "size", 0, &txid)?,
        inputs,
        outputs,
        shielded_spends: joinsplits + array_len(&v["vShieldedSpend"]) + actions,
        shielded_outputs: joinsplits + array_len(&v["vShieldedOutput"]) + actions,
        txid,
    })
}

fn parse_input(v: &Value, txid: &str) -> Result<TxInput, IndexerError> {
    let sequence = opt_u32(v, "sequence", u32::MAX, txid)?;
    if let Some(coinbase) = v["coinbase"].as_str() {
        return Ok(TxInput {
            previous: None,
            script_hex: coinbase.to_string(),
            sequence,
            value: None,
        });
    }
    let prev_txid = req_str(v, "txid", txid)?;
    let prev_vout = req_u32(v, "vout", txid)?;
    Ok(TxInput {
        previous: Some(OutPoint::new(prev_txid, prev_vout)),
        script_hex: v["scriptSig"]["hex"].as_str().unwrap_or_default().to_string(),
        sequence,
        value: v["valueSat"].as_i64(),
    })
}

fn parse_output(v: &Value, position: u32, txid: &str) -> Result<TxOutput, IndexerError> {
    let value = match v["valueZat"].as_i64() {
        Some(zat) => zat,
        None => {
            let zec = v["value"].as_f64().ok_or_else(|| missing("value", txid))?;
            (zec * ZATOSHIS_PER_ZEC).round() as i64
        }
    };
    let script = &v["scriptPubKey"];
    Ok(TxOutput {
        index: opt_u32(v, "n", position, txid)?,
        value,
        script_hex: script["hex"].as_str().unwrap_or_default().to_string(),
        address: script["addresses"][0].as_str().map(str::to_string),
    })
}
