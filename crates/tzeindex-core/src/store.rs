//! Storage traits and the row types they persist.
//!
//! [`IndexStore`] is the store-level handle (cursor, reorg rollback, read
//! queries). [`StoreTx`] is one block's unit of work: every module writes
//! through it, and nothing becomes visible to [`IndexStore`] readers until
//! [`StoreTx::commit`] succeeds.
//!
//! Implementations live in `tzeindex-storage` (`MemoryStorage`, `SqliteStorage`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cursor::Cursor;
use crate::error::IndexerError;
use crate::graph::TxKind;
use crate::types::{Block, OutPoint};

// ─── Rows ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub height: u64,
    pub hash: String,
    pub previous_hash: String,
    pub merkle_root: String,
    pub timestamp: i64,
    pub tx_count: u32,
}

impl From<&Block> for BlockRecord {
    fn from(block: &Block) -> Self {
        Self {
            height: block.height,
            hash: block.hash.clone(),
            previous_hash: block.previous_hash.clone(),
            merkle_root: block.merkle_root.clone(),
            timestamp: block.timestamp,
            tx_count: block.tx_count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub txid: String,
    pub block_height: u64,
    pub kind: TxKind,
    pub version: i32,
    pub lock_time: u32,
    pub size: u32,
}

/// Who spent an output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendRef {
    pub txid: String,
    pub input_index: u32,
    pub height: u64,
}

/// A transaction output; a UTXO while `spent_by` is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub txid: String,
    pub index: u32,
    pub value: i64,
    pub address: Option<String>,
    pub block_height: u64,
    pub spent_by: Option<SpendRef>,
}

impl OutputRecord {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid.clone(), self.index)
    }

    pub fn is_spent(&self) -> bool {
        self.spent_by.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRecord {
    pub txid: String,
    pub index: u32,
    pub value: i64,
    pub previous: OutPoint,
    pub sequence: u32,
    pub block_height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionOutputRecord {
    pub txid: String,
    pub index: u32,
    pub extension_id: i32,
    pub mode: i32,
    pub payload: Vec<u8>,
    pub value: i64,
    pub block_height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionInputRecord {
    pub txid: String,
    pub index: u32,
    pub extension_id: i32,
    pub mode: i32,
    pub payload: Vec<u8>,
    pub previous: OutPoint,
    pub block_height: u64,
}

/// Root of a provenance chain, created by an "initialize" extension output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verifier {
    /// `txid:outputIndex` of the initializing output.
    pub id: String,
    pub name: String,
    pub balance: i64,
    /// Balance at creation; restored when every later proof is rolled back.
    pub initial_balance: i64,
    pub root: String,
    pub inner_program_hash: String,
    pub program_hash: String,
    pub created_height: u64,
}

/// Links a "verify" extension input to the verifier it updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofRecord {
    pub verifier_id: String,
    pub txid: String,
    pub input_index: u32,
    pub block_height: u64,
    pub proof_size: u64,
    /// Verifier balance after this proof, if the transaction produced a new output.
    pub balance_after: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransitionFact {
    pub verifier_id: String,
    pub txid: String,
    pub input_index: u32,
    pub block_height: u64,
    pub old_state: String,
    pub new_state: String,
    pub program_hash: String,
    pub inner_program_hash: String,
}

/// Aggregated transparent balance of one address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: String,
    pub balance: i64,
    pub received: i64,
    pub sent: i64,
    pub tx_count: u64,
    pub first_seen_height: u64,
    pub last_seen_height: u64,
}

/// One block's contribution to an [`Account`]; kept so rollbacks can revert it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountDelta {
    pub address: String,
    pub height: u64,
    pub received: i64,
    pub sent: i64,
    pub tx_count: u64,
}

impl AccountDelta {
    pub fn balance_change(&self) -> i64 {
        self.received - self.sent
    }
}

// ─── Traits ───────────────────────────────────────────────────────────────────

/// One block's atomic unit of work.
///
/// Reads issued through the transaction observe its own uncommitted writes.
/// Dropping a transaction without committing discards its writes.
#[async_trait]
pub trait StoreTx: Send {
    async fn insert_block(&mut self, block: &BlockRecord) -> Result<(), IndexerError>;

    async fn insert_transaction(&mut self, tx: &TransactionRecord) -> Result<(), IndexerError>;

    async fn insert_output(&mut self, output: &OutputRecord) -> Result<(), IndexerError>;

    async fn insert_input(&mut self, input: &InputRecord) -> Result<(), IndexerError>;

    async fn output(&mut self, outpoint: &OutPoint) -> Result<Option<OutputRecord>, IndexerError>;

    /// Flip an unspent output to spent. Returns `false` if the output is
    /// unknown or already spent.
    async fn mark_output_spent(
        &mut self,
        outpoint: &OutPoint,
        spend: &SpendRef,
    ) -> Result<bool, IndexerError>;

    async fn insert_extension_output(
        &mut self,
        output: &ExtensionOutputRecord,
    ) -> Result<(), IndexerError>;

    async fn insert_extension_input(
        &mut self,
        input: &ExtensionInputRecord,
    ) -> Result<(), IndexerError>;

    async fn extension_output(
        &mut self,
        outpoint: &OutPoint,
    ) -> Result<Option<ExtensionOutputRecord>, IndexerError>;

    async fn insert_verifier(&mut self, verifier: &Verifier) -> Result<(), IndexerError>;

    async fn verifier(&mut self, id: &str) -> Result<Option<Verifier>, IndexerError>;

    async fn set_verifier_balance(&mut self, id: &str, balance: i64) -> Result<(), IndexerError>;

    async fn insert_proof(&mut self, proof: &ProofRecord) -> Result<(), IndexerError>;

    /// The proof with the lowest input index recorded for `txid`.
    async fn proof_by_txid(&mut self, txid: &str) -> Result<Option<ProofRecord>, IndexerError>;

    async fn insert_state_transition(
        &mut self,
        fact: &StateTransitionFact,
    ) -> Result<(), IndexerError>;

    /// Fold a block's delta into the account, creating it on first sight.
    async fn apply_account_delta(&mut self, delta: &AccountDelta) -> Result<(), IndexerError>;

    async fn save_cursor(&mut self, cursor: &Cursor) -> Result<(), IndexerError>;

    async fn commit(&mut self) -> Result<(), IndexerError>;

    async fn rollback(&mut self) -> Result<(), IndexerError>;
}

/// Store-level handle: transactions, cursor, rollback, and read queries.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Start a block's unit of work.
    async fn begin(&self) -> Result<Box<dyn StoreTx>, IndexerError>;

    async fn load_cursor(&self) -> Result<Option<Cursor>, IndexerError>;

    /// Hash of the stored block at `height`, if one has been indexed.
    async fn block_hash_at(&self, height: u64) -> Result<Option<String>, IndexerError>;

    /// Delete every row above `height` in one transaction, un-spend outputs
    /// spent above it, revert account and verifier balances, and move the
    /// cursor back to `height`. Returns the number of blocks removed.
    async fn rollback_after(&self, height: u64) -> Result<u64, IndexerError>;

    // ── Read-only query surface ─────────────────────────────────────────────

    async fn block(&self, height: u64) -> Result<Option<BlockRecord>, IndexerError>;

    async fn transaction(&self, txid: &str) -> Result<Option<TransactionRecord>, IndexerError>;

    async fn output(&self, outpoint: &OutPoint) -> Result<Option<OutputRecord>, IndexerError>;

    async fn outputs_of(&self, txid: &str) -> Result<Vec<OutputRecord>, IndexerError>;

    async fn inputs_of(&self, txid: &str) -> Result<Vec<InputRecord>, IndexerError>;

    async fn extension_outputs_of(
        &self,
        txid: &str,
    ) -> Result<Vec<ExtensionOutputRecord>, IndexerError>;

    async fn extension_inputs_of(
        &self,
        txid: &str,
    ) -> Result<Vec<ExtensionInputRecord>, IndexerError>;

    async fn verifier(&self, id: &str) -> Result<Option<Verifier>, IndexerError>;

    async fn proofs_for(&self, verifier_id: &str) -> Result<Vec<ProofRecord>, IndexerError>;

    async fn state_transitions_for(
        &self,
        verifier_id: &str,
    ) -> Result<Vec<StateTransitionFact>, IndexerError>;

    async fn account(&self, address: &str) -> Result<Option<Account>, IndexerError>;
}
