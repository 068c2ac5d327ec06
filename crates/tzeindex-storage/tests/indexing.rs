//! End-to-end module tests: blocks go through every indexing module into the
//! in-memory store, and the resulting graph, accounts, verifiers and reorg
//! rollbacks are checked through the read API.

use std::collections::HashMap;

use async_trait::async_trait;
use tzeindex_core::codec::{self, ExtensionScript, STARK_VERIFY_EXTENSION_ID};
use tzeindex_core::graph::TxKind;
use tzeindex_core::types::{EXTENSION_TX_VERSION, EXTENSION_VERSION_GROUP_ID};
use tzeindex_core::{
    Block, ChainView, IndexContext, IndexModule, IndexStore, IndexerConfig, IndexerError,
    OutPoint, ReorgDetector, Transaction, TxInput, TxOutput,
};
use tzeindex_storage::MemoryStorage;

// ─── Fixtures ────────────────────────────────────────────────────────────────

fn coinbase(txid: &str, address: &str, value: i64) -> Transaction {
    Transaction {
        txid: txid.into(),
        version: 4,
        version_group_id: 0x892F_2085,
        lock_time: 0,
        size: 120,
        inputs: vec![TxInput {
            previous: None,
            script_hex: "0401".into(),
            sequence: u32::MAX,
            value: None,
        }],
        outputs: vec![TxOutput {
            index: 0,
            value,
            script_hex: "76a914".into(),
            address: Some(address.into()),
        }],
        shielded_spends: 0,
        shielded_outputs: 0,
    }
}

fn transfer(txid: &str, spends: &[(&str, u32)], outputs: &[(&str, i64)]) -> Transaction {
    Transaction {
        txid: txid.into(),
        version: 4,
        version_group_id: 0x892F_2085,
        lock_time: 0,
        size: 250,
        inputs: spends
            .iter()
            .map(|(t, v)| TxInput {
                previous: Some(OutPoint::new(*t, *v)),
                script_hex: "47304402".into(),
                sequence: u32::MAX,
                value: None,
            })
            .collect(),
        outputs: outputs
            .iter()
            .enumerate()
            .map(|(i, (addr, value))| TxOutput {
                index: i as u32,
                value: *value,
                script_hex: "76a914".into(),
                address: Some((*addr).into()),
            })
            .collect(),
        shielded_spends: 0,
        shielded_outputs: 0,
    }
}

fn ext_script(mode: i32, payload: Vec<u8>) -> String {
    hex::encode(codec::encode(&ExtensionScript::new(
        STARK_VERIFY_EXTENSION_ID,
        mode,
        payload,
    )))
}

fn precondition(root: u8) -> Vec<u8> {
    let mut payload = vec![0u8; 4];
    payload.extend([root; 32]);
    payload.extend([0xAA; 32]);
    payload.extend([0xBB; 32]);
    payload
}

fn ext_output(root: u8, value: i64) -> TxOutput {
    TxOutput {
        index: 0,
        value,
        script_hex: ext_script(0, precondition(root)),
        address: None,
    }
}

fn init_tx(txid: &str, root: u8, value: i64) -> Transaction {
    Transaction {
        txid: txid.into(),
        version: EXTENSION_TX_VERSION,
        version_group_id: EXTENSION_VERSION_GROUP_ID,
        lock_time: 0,
        size: 300,
        inputs: vec![],
        outputs: vec![ext_output(root, value)],
        shielded_spends: 0,
        shielded_outputs: 0,
    }
}

fn verify_tx(txid: &str, prev: (&str, u32), root: u8, value: i64) -> Transaction {
    let mut witness = vec![1u8, 1u8];
    witness.extend([0x5A; 48]);
    Transaction {
        inputs: vec![TxInput {
            previous: Some(OutPoint::new(prev.0, prev.1)),
            script_hex: ext_script(1, witness),
            sequence: u32::MAX,
            value: None,
        }],
        ..init_tx(txid, root, value)
    }
}

fn block(height: u64, transactions: Vec<Transaction>) -> Block {
    Block {
        height,
        hash: format!("h{height}"),
        previous_hash: if height == 0 {
            String::new()
        } else {
            format!("h{}", height - 1)
        },
        merkle_root: format!("m{height}"),
        timestamp: 1_700_000_000 + height as i64 * 75,
        transactions,
    }
}

async fn index_with(
    store: &MemoryStorage,
    block: &Block,
    config: &IndexerConfig,
) -> Result<(), IndexerError> {
    let ctx = IndexContext::from(config);
    let mut tx = store.begin().await?;
    for module in IndexModule::enabled(&config.modules) {
        if let Err(e) = module.index(block, &ctx, tx.as_mut()).await {
            tx.rollback().await?;
            return Err(e);
        }
    }
    tx.commit().await
}

async fn index(store: &MemoryStorage, block: &Block) {
    index_with(store, block, &IndexerConfig::default())
        .await
        .unwrap();
}

struct FakeChain {
    hashes: HashMap<u64, String>,
}

#[async_trait]
impl ChainView for FakeChain {
    async fn canonical_hash(&self, height: u64) -> Result<String, IndexerError> {
        self.hashes
            .get(&height)
            .cloned()
            .ok_or_else(|| IndexerError::Rpc(format!("no block at {height}")))
    }
}

// ─── UTXO graph and accounts ─────────────────────────────────────────────────

#[tokio::test]
async fn spend_marks_output_and_values_input() {
    let store = MemoryStorage::new();
    index(&store, &block(1, vec![coinbase("cb1", "t1alice", 5_000)])).await;
    index(
        &store,
        &block(
            2,
            vec![
                coinbase("cb2", "t1miner", 5_000),
                transfer("t1", &[("cb1", 0)], &[("t1bob", 3_000), ("t1alice", 1_900)]),
            ],
        ),
    )
    .await;

    let spent = store.output(&OutPoint::new("cb1", 0)).await.unwrap().unwrap();
    let spend = spent.spent_by.unwrap();
    assert_eq!(spend.txid, "t1");
    assert_eq!(spend.input_index, 0);
    assert_eq!(spend.height, 2);

    let inputs = store.inputs_of("t1").await.unwrap();
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs[0].value, 5_000);
    assert_eq!(inputs[0].previous, OutPoint::new("cb1", 0));

    assert_eq!(
        store.transaction("t1").await.unwrap().unwrap().kind,
        TxKind::TransparentToTransparent
    );
    assert_eq!(
        store.transaction("cb1").await.unwrap().unwrap().kind,
        TxKind::Coinbase
    );

    // Every stored input points at an output whose spender is that input.
    for input in store.all_inputs().unwrap() {
        let target = store.output(&input.previous).await.unwrap().unwrap();
        let by = target.spent_by.unwrap();
        assert_eq!((by.txid.as_str(), by.input_index), (input.txid.as_str(), input.index));
    }
}

#[tokio::test]
async fn accounts_track_received_and_sent() {
    let store = MemoryStorage::new();
    index(&store, &block(1, vec![coinbase("cb1", "t1alice", 5_000)])).await;
    index(
        &store,
        &block(
            2,
            vec![transfer(
                "t1",
                &[("cb1", 0)],
                &[("t1bob", 3_000), ("t1alice", 1_900)],
            )],
        ),
    )
    .await;

    let alice = store.account("t1alice").await.unwrap().unwrap();
    assert_eq!(alice.received, 6_900);
    assert_eq!(alice.sent, 5_000);
    assert_eq!(alice.balance, 1_900);
    assert_eq!(alice.tx_count, 2);
    assert_eq!((alice.first_seen_height, alice.last_seen_height), (1, 2));

    let bob = store.account("t1bob").await.unwrap().unwrap();
    assert_eq!(bob.balance, 3_000);
    assert_eq!(bob.tx_count, 1);
}

#[tokio::test]
async fn spend_within_same_block_is_linked() {
    let store = MemoryStorage::new();
    index(
        &store,
        &block(
            5,
            vec![
                coinbase("cb5", "t1alice", 1_000),
                transfer("t5", &[("cb5", 0)], &[("t1bob", 1_000)]),
            ],
        ),
    )
    .await;

    assert!(store.output(&OutPoint::new("cb5", 0)).await.unwrap().unwrap().is_spent());
    assert_eq!(store.account("t1alice").await.unwrap().unwrap().balance, 0);
}

// ─── Extension rows and verifier chains ──────────────────────────────────────

#[tokio::test]
async fn verifier_chain_converges_on_root() {
    let store = MemoryStorage::new();
    index(&store, &block(10, vec![init_tx("init", 0x10, 1_000)])).await;

    let mut prev = "init".to_string();
    for step in 1..=3u8 {
        let txid = format!("verify{step}");
        let tx = verify_tx(&txid, (prev.as_str(), 0), 0x10 + step, 1_000 - step as i64 * 100);
        index(&store, &block(10 + step as u64, vec![tx])).await;
        prev = txid;
    }

    let verifier = store.verifier("init:0").await.unwrap().unwrap();
    assert_eq!(verifier.name, "verifier-init-0");
    assert_eq!(verifier.initial_balance, 1_000);
    assert_eq!(verifier.balance, 700);
    assert_eq!(verifier.root, hex::encode([0x10; 32]));
    assert_eq!(verifier.program_hash, hex::encode([0xBB; 32]));

    let proofs = store.proofs_for("init:0").await.unwrap();
    assert_eq!(proofs.len(), 3);
    assert!(proofs.iter().all(|p| p.verifier_id == "init:0"));
    assert_eq!(proofs[0].proof_size, 48);
    assert_eq!(proofs[2].balance_after, Some(700));

    let facts = store.state_transitions_for("init:0").await.unwrap();
    assert_eq!(facts.len(), 3);
    assert_eq!(facts[0].old_state, hex::encode([0x10; 32]));
    for pair in facts.windows(2) {
        assert_eq!(pair[0].new_state, pair[1].old_state);
    }
    assert_eq!(facts[2].new_state, hex::encode([0x13; 32]));

    let ext = store.extension_outputs_of("verify2").await.unwrap();
    assert_eq!(ext.len(), 1);
    assert_eq!(ext[0].extension_id, STARK_VERIFY_EXTENSION_ID);
    assert_eq!(store.extension_inputs_of("verify2").await.unwrap().len(), 1);
    assert!(store.output(&OutPoint::new("verify2", 0)).await.unwrap().unwrap().is_spent());
}

#[tokio::test]
async fn unresolvable_verify_input_fails_block() {
    let store = MemoryStorage::new();
    let err = index_with(
        &store,
        &block(20, vec![verify_tx("orphan", ("nowhere", 0), 0x01, 10)]),
        &IndexerConfig::default(),
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        IndexerError::UnresolvedVerifier { ref prev_txid, prev_vout: 0 } if prev_txid == "nowhere"
    ));
    assert!(store.block(20).await.unwrap().is_none());
}

#[tokio::test]
async fn malformed_extension_script_fails_block() {
    let store = MemoryStorage::new();
    let mut tx = init_tx("bad", 0x01, 10);
    tx.outputs[0].script_hex = "ff0000".into();

    let err = index_with(&store, &block(3, vec![tx]), &IndexerConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, IndexerError::Format(_)));
    assert_eq!(store.block_count().unwrap(), 0);
}

#[tokio::test]
async fn oversized_precondition_is_stored_empty() {
    let store = MemoryStorage::new();
    let config = IndexerConfig {
        max_precondition_size: 16,
        ..IndexerConfig::default()
    };
    index_with(&store, &block(4, vec![init_tx("big", 0x42, 500)]), &config)
        .await
        .unwrap();

    let ext = store.extension_outputs_of("big").await.unwrap();
    assert!(ext[0].payload.is_empty());
    let verifier = store.verifier("big:0").await.unwrap().unwrap();
    assert_eq!(verifier.root, hex::encode([0u8; 32]));
}

// ─── Reorg ───────────────────────────────────────────────────────────────────

fn forked_chain(agree_through: u64, tip: u64) -> FakeChain {
    FakeChain {
        hashes: (0..=tip)
            .map(|h| {
                let hash = if h <= agree_through {
                    format!("h{h}")
                } else {
                    format!("x{h}")
                };
                (h, hash)
            })
            .collect(),
    }
}

#[tokio::test]
async fn reorg_rolls_back_to_common_ancestor() {
    let store = MemoryStorage::new();
    for h in 100..=104 {
        let mut txs = vec![coinbase(&format!("cb{h}"), "t1miner", 1_000)];
        if h == 103 {
            txs.push(transfer("s103", &[("cb100", 0)], &[("t1bob", 1_000)]));
        }
        index(&store, &block(h, txs)).await;
    }
    assert!(store.output(&OutPoint::new("cb100", 0)).await.unwrap().unwrap().is_spent());

    let chain = forked_chain(102, 105);
    let mut incoming = block(105, vec![]).summary();
    incoming.previous_hash = "x104".into();

    let detector = ReorgDetector::new(8);
    assert!(detector.detect(&store, &incoming).await.unwrap());

    let event = detector.resolve(&store, &chain, &incoming).await.unwrap();
    assert_eq!(event.detected_at, 105);
    assert_eq!(event.common_ancestor, 102);
    assert_eq!(event.depth, 2);
    assert_eq!(event.resume_height, 103);
    assert_eq!(event.removed_blocks, 2);

    assert!(store.block(103).await.unwrap().is_none());
    assert!(store.transaction("s103").await.unwrap().is_none());
    assert!(!store.output(&OutPoint::new("cb100", 0)).await.unwrap().unwrap().is_spent());
    assert!(store.account("t1bob").await.unwrap().is_none());
    assert_eq!(store.load_cursor().await.unwrap().unwrap().height, 102);
}

#[tokio::test]
async fn reorg_search_skips_heights_with_no_stored_block() {
    let store = MemoryStorage::new();
    for h in [100, 102, 103, 104] {
        index(&store, &block(h, vec![coinbase(&format!("cb{h}"), "t1miner", 1)])).await;
    }
    let mut chain = forked_chain(100, 105);
    chain.hashes.remove(&101);
    let mut incoming = block(105, vec![]).summary();
    incoming.previous_hash = "x104".into();

    let event = ReorgDetector::new(8)
        .resolve(&store, &chain, &incoming)
        .await
        .unwrap();
    assert_eq!(event.common_ancestor, 100);
    assert_eq!(event.depth, 4);
    assert_eq!(event.resume_height, 101);
    assert_eq!(event.removed_blocks, 3);
    assert_eq!(store.block_count().unwrap(), 1);
    assert_eq!(store.load_cursor().await.unwrap().unwrap().height, 100);
}

#[tokio::test]
async fn reorg_deeper_than_limit_is_fatal() {
    let store = MemoryStorage::new();
    for h in 100..=104 {
        index(&store, &block(h, vec![coinbase(&format!("cb{h}"), "t1miner", 1)])).await;
    }
    let chain = forked_chain(101, 105);
    let mut incoming = block(105, vec![]).summary();
    incoming.previous_hash = "x104".into();

    let err = ReorgDetector::new(1)
        .resolve(&store, &chain, &incoming)
        .await
        .unwrap_err();
    assert!(matches!(err, IndexerError::ReorgTooDeep { from: 104, max_depth: 1 }));
    assert!(err.is_fatal());
    assert_eq!(store.block_count().unwrap(), 5);
}

#[tokio::test]
async fn reorg_past_genesis_is_fatal() {
    let store = MemoryStorage::new();
    for h in 0..=2 {
        index(&store, &block(h, vec![coinbase(&format!("cb{h}"), "t1miner", 1)])).await;
    }
    let chain = FakeChain {
        hashes: (0..=3).map(|h| (h, format!("other{h}"))).collect(),
    };
    let mut incoming = block(3, vec![]).summary();
    incoming.previous_hash = "other2".into();

    let err = ReorgDetector::new(100)
        .resolve(&store, &chain, &incoming)
        .await
        .unwrap_err();
    assert!(matches!(err, IndexerError::GenesisReached { from: 2 }));
}

#[tokio::test]
async fn missing_parent_is_not_a_reorg() {
    let store = MemoryStorage::new();
    let incoming = block(50, vec![]).summary();
    assert!(!ReorgDetector::new(8).detect(&store, &incoming).await.unwrap());
}
