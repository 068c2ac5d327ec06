//! In-memory storage backend.
//!
//! Each transaction works on a private copy of every table; `commit` swaps
//! the copy in. Useful for tests and short-lived indexers that don't need
//! persistence.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tzeindex_core::cursor::Cursor;
use tzeindex_core::error::IndexerError;
use tzeindex_core::store::{
    Account, AccountDelta, BlockRecord, ExtensionInputRecord, ExtensionOutputRecord,
    IndexStore, InputRecord, OutputRecord, ProofRecord, SpendRef, StateTransitionFact, StoreTx,
    TransactionRecord, Verifier,
};
use tzeindex_core::types::OutPoint;

type Key = (String, u32);

fn key(outpoint: &OutPoint) -> Key {
    (outpoint.txid.clone(), outpoint.vout)
}

#[derive(Debug, Clone, Default)]
struct Tables {
    blocks: BTreeMap<u64, BlockRecord>,
    transactions: HashMap<String, TransactionRecord>,
    outputs: BTreeMap<Key, OutputRecord>,
    inputs: BTreeMap<Key, InputRecord>,
    extension_outputs: BTreeMap<Key, ExtensionOutputRecord>,
    extension_inputs: BTreeMap<Key, ExtensionInputRecord>,
    verifiers: HashMap<String, Verifier>,
    /// Insertion order is commit order.
    proofs: Vec<ProofRecord>,
    state_transitions: Vec<StateTransitionFact>,
    accounts: HashMap<String, Account>,
    account_deltas: Vec<AccountDelta>,
    cursor: Option<Cursor>,
}

impl Tables {
    fn apply_account_delta(&mut self, delta: &AccountDelta) {
        let account = self
            .accounts
            .entry(delta.address.clone())
            .or_insert_with(|| Account {
                address: delta.address.clone(),
                balance: 0,
                received: 0,
                sent: 0,
                tx_count: 0,
                first_seen_height: delta.height,
                last_seen_height: delta.height,
            });
        account.balance += delta.balance_change();
        account.received += delta.received;
        account.sent += delta.sent;
        account.tx_count += delta.tx_count;
        account.last_seen_height = account.last_seen_height.max(delta.height);

        match self
            .account_deltas
            .iter_mut()
            .find(|d| d.address == delta.address && d.height == delta.height)
        {
            Some(existing) => {
                existing.received += delta.received;
                existing.sent += delta.sent;
                existing.tx_count += delta.tx_count;
            }
            None => self.account_deltas.push(delta.clone()),
        }
    }

    fn rollback_after(&mut self, height: u64) -> u64 {
        // Revert balances before the deltas disappear.
        let (reverted, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.account_deltas)
            .into_iter()
            .partition(|d| d.height > height);
        self.account_deltas = kept;
        for delta in &reverted {
            if let Some(account) = self.accounts.get_mut(&delta.address) {
                account.balance -= delta.balance_change();
                account.received -= delta.received;
                account.sent -= delta.sent;
                account.tx_count -= delta.tx_count;
            }
        }
        self.accounts.retain(|_, a| a.first_seen_height <= height);
        for account in self.accounts.values_mut() {
            account.last_seen_height = self
                .account_deltas
                .iter()
                .filter(|d| d.address == account.address)
                .map(|d| d.height)
                .max()
                .unwrap_or(account.first_seen_height);
        }

        for output in self.outputs.values_mut() {
            if output.spent_by.as_ref().is_some_and(|s| s.height > height) {
                output.spent_by = None;
            }
        }

        let before = self.blocks.len();
        self.blocks.retain(|h, _| *h <= height);
        let removed = (before - self.blocks.len()) as u64;

        self.transactions.retain(|_, t| t.block_height <= height);
        self.outputs.retain(|_, o| o.block_height <= height);
        self.inputs.retain(|_, i| i.block_height <= height);
        self.extension_outputs.retain(|_, o| o.block_height <= height);
        self.extension_inputs.retain(|_, i| i.block_height <= height);
        self.verifiers.retain(|_, v| v.created_height <= height);
        self.proofs.retain(|p| p.block_height <= height);
        self.state_transitions.retain(|f| f.block_height <= height);

        for verifier in self.verifiers.values_mut() {
            verifier.balance = self
                .proofs
                .iter()
                .rev()
                .find(|p| p.verifier_id == verifier.id && p.balance_after.is_some())
                .and_then(|p| p.balance_after)
                .unwrap_or(verifier.initial_balance);
        }

        self.cursor = self
            .blocks
            .values()
            .next_back()
            .map(|b| Cursor::new(b.height, b.hash.clone()));
        removed
    }
}

/// In-memory indexer storage.
///
/// All data is lost when the process exits. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, IndexerError> {
        self.tables
            .lock()
            .map_err(|_| IndexerError::Storage("memory store lock poisoned".into()))
    }

    /// Number of stored blocks.
    pub fn block_count(&self) -> Result<usize, IndexerError> {
        Ok(self.lock()?.blocks.len())
    }

    /// Every stored output, ordered by outpoint.
    pub fn all_outputs(&self) -> Result<Vec<OutputRecord>, IndexerError> {
        Ok(self.lock()?.outputs.values().cloned().collect())
    }

    /// Every stored input, ordered by spending outpoint.
    pub fn all_inputs(&self) -> Result<Vec<InputRecord>, IndexerError> {
        Ok(self.lock()?.inputs.values().cloned().collect())
    }
}

/// A block transaction against [`MemoryStorage`].
pub struct MemoryTx {
    staged: Option<Tables>,
    target: Arc<Mutex<Tables>>,
}

impl MemoryTx {
    fn tables(&mut self) -> Result<&mut Tables, IndexerError> {
        self.staged
            .as_mut()
            .ok_or_else(|| IndexerError::Storage("transaction already finished".into()))
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn insert_block(&mut self, block: &BlockRecord) -> Result<(), IndexerError> {
        let t = self.tables()?;
        if t.blocks.contains_key(&block.height) {
            return Err(IndexerError::Storage(format!(
                "block {} already indexed",
                block.height
            )));
        }
        t.blocks.insert(block.height, block.clone());
        Ok(())
    }

    async fn insert_transaction(&mut self, tx: &TransactionRecord) -> Result<(), IndexerError> {
        self.tables()?.transactions.insert(tx.txid.clone(), tx.clone());
        Ok(())
    }

    async fn insert_output(&mut self, output: &OutputRecord) -> Result<(), IndexerError> {
        self.tables()?
            .outputs
            .insert((output.txid.clone(), output.index), output.clone());
        Ok(())
    }

    async fn insert_input(&mut self, input: &InputRecord) -> Result<(), IndexerError> {
        self.tables()?
            .inputs
            .insert((input.txid.clone(), input.index), input.clone());
        Ok(())
    }

    async fn output(&mut self, outpoint: &OutPoint) -> Result<Option<OutputRecord>, IndexerError> {
        Ok(self.tables()?.outputs.get(&key(outpoint)).cloned())
    }

    async fn mark_output_spent(
        &mut self,
        outpoint: &OutPoint,
        spend: &SpendRef,
    ) -> Result<bool, IndexerError> {
        match self.tables()?.outputs.get_mut(&key(outpoint)) {
            Some(output) if output.spent_by.is_none() => {
                output.spent_by = Some(spend.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_extension_output(
        &mut self,
        output: &ExtensionOutputRecord,
    ) -> Result<(), IndexerError> {
        self.tables()?
            .extension_outputs
            .insert((output.txid.clone(), output.index), output.clone());
        Ok(())
    }

    async fn insert_extension_input(
        &mut self,
        input: &ExtensionInputRecord,
    ) -> Result<(), IndexerError> {
        self.tables()?
            .extension_inputs
            .insert((input.txid.clone(), input.index), input.clone());
        Ok(())
    }

    async fn extension_output(
        &mut self,
        outpoint: &OutPoint,
    ) -> Result<Option<ExtensionOutputRecord>, IndexerError> {
        Ok(self.tables()?.extension_outputs.get(&key(outpoint)).cloned())
    }

    async fn insert_verifier(&mut self, verifier: &Verifier) -> Result<(), IndexerError> {
        self.tables()?
            .verifiers
            .insert(verifier.id.clone(), verifier.clone());
        Ok(())
    }

    async fn verifier(&mut self, id: &str) -> Result<Option<Verifier>, IndexerError> {
        Ok(self.tables()?.verifiers.get(id).cloned())
    }

    async fn set_verifier_balance(&mut self, id: &str, balance: i64) -> Result<(), IndexerError> {
        match self.tables()?.verifiers.get_mut(id) {
            Some(v) => {
                v.balance = balance;
                Ok(())
            }
            None => Err(IndexerError::Storage(format!("unknown verifier {id}"))),
        }
    }

    async fn insert_proof(&mut self, proof: &ProofRecord) -> Result<(), IndexerError> {
        self.tables()?.proofs.push(proof.clone());
        Ok(())
    }

    async fn proof_by_txid(&mut self, txid: &str) -> Result<Option<ProofRecord>, IndexerError> {
        Ok(self
            .tables()?
            .proofs
            .iter()
            .filter(|p| p.txid == txid)
            .min_by_key(|p| p.input_index)
            .cloned())
    }

    async fn insert_state_transition(
        &mut self,
        fact: &StateTransitionFact,
    ) -> Result<(), IndexerError> {
        self.tables()?.state_transitions.push(fact.clone());
        Ok(())
    }

    async fn apply_account_delta(&mut self, delta: &AccountDelta) -> Result<(), IndexerError> {
        self.tables()?.apply_account_delta(delta);
        Ok(())
    }

    async fn save_cursor(&mut self, cursor: &Cursor) -> Result<(), IndexerError> {
        self.tables()?.cursor = Some(cursor.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), IndexerError> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| IndexerError::Storage("transaction already finished".into()))?;
        let mut target = self
            .target
            .lock()
            .map_err(|_| IndexerError::Storage("memory store lock poisoned".into()))?;
        *target = staged;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), IndexerError> {
        self.staged = None;
        Ok(())
    }
}

#[async_trait]
impl IndexStore for MemoryStorage {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, IndexerError> {
        let snapshot = self.lock()?.clone();
        Ok(Box::new(MemoryTx {
            staged: Some(snapshot),
            target: Arc::clone(&self.tables),
        }))
    }

    async fn load_cursor(&self) -> Result<Option<Cursor>, IndexerError> {
        Ok(self.lock()?.cursor.clone())
    }

    async fn block_hash_at(&self, height: u64) -> Result<Option<String>, IndexerError> {
        Ok(self.lock()?.blocks.get(&height).map(|b| b.hash.clone()))
    }

    async fn rollback_after(&self, height: u64) -> Result<u64, IndexerError> {
        let removed = self.lock()?.rollback_after(height);
        tracing::debug!(height, removed, "rolled back memory store");
        Ok(removed)
    }

    async fn block(&self, height: u64) -> Result<Option<BlockRecord>, IndexerError> {
        Ok(self.lock()?.blocks.get(&height).cloned())
    }

    async fn transaction(&self, txid: &str) -> Result<Option<TransactionRecord>, IndexerError> {
        Ok(self.lock()?.transactions.get(txid).cloned())
    }

    async fn output(&self, outpoint: &OutPoint) -> Result<Option<OutputRecord>, IndexerError> {
        Ok(self.lock()?.outputs.get(&key(outpoint)).cloned())
    }

    async fn outputs_of(&self, txid: &str) -> Result<Vec<OutputRecord>, IndexerError> {
        Ok(self
            .lock()?
            .outputs
            .values()
            .filter(|o| o.txid == txid)
            .cloned()
            .collect())
    }

    async fn inputs_of(&self, txid: &str) -> Result<Vec<InputRecord>, IndexerError> {
        Ok(self
            .lock()?
            .inputs
            .values()
            .filter(|i| i.txid == txid)
            .cloned()
            .collect())
    }

    async fn extension_outputs_of(
        &self,
        txid: &str,
    ) -> Result<Vec<ExtensionOutputRecord>, IndexerError> {
        Ok(self
            .lock()?
            .extension_outputs
            .values()
            .filter(|o| o.txid == txid)
            .cloned()
            .collect())
    }

    async fn extension_inputs_of(
        &self,
        txid: &str,
    ) -> Result<Vec<ExtensionInputRecord>, IndexerError> {
        Ok(self
            .lock()?
            .extension_inputs
            .values()
            .filter(|i| i.txid == txid)
            .cloned()
            .collect())
    }

    async fn verifier(&self, id: &str) -> Result<Option<Verifier>, IndexerError> {
        Ok(self.lock()?.verifiers.get(id).cloned())
    }

    async fn proofs_for(&self, verifier_id: &str) -> Result<Vec<ProofRecord>, IndexerError> {
        Ok(self
            .lock()?
            .proofs
            .iter()
            .filter(|p| p.verifier_id == verifier_id)
            .cloned()
            .collect())
    }

    async fn state_transitions_for(
        &self,
        verifier_id: &str,
    ) -> Result<Vec<StateTransitionFact>, IndexerError> {
        Ok(self
            .lock()?
            .state_transitions
            .iter()
            .filter(|f| f.verifier_id == verifier_id)
            .cloned()
            .collect())
    }

    async fn account(&self, address: &str) -> Result<Option<Account>, IndexerError> {
        Ok(self.lock()?.accounts.get(address).cloned())
    }
}
