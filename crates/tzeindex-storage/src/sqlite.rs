//! SQLite storage backend.
//!
//! Persists the block/transaction/UTXO graph, extension rows, verifiers,
//! proofs, accounts, and the cursor in a single SQLite file. Uses `sqlx`
//! with WAL mode for concurrent read performance.
//!
//! # Usage
//! ```rust,no_run
//! use tzeindex_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./tzeindex.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Executor, Row, Sqlite, SqlitePool, Transaction};
use tracing::debug;

use tzeindex_core::cursor::Cursor;
use tzeindex_core::error::IndexerError;
use tzeindex_core::graph::TxKind;
use tzeindex_core::store::{
    Account, AccountDelta, BlockRecord, ExtensionInputRecord, ExtensionOutputRecord,
    IndexStore, InputRecord, OutputRecord, ProofRecord, SpendRef, StateTransitionFact, StoreTx,
    TransactionRecord, Verifier,
};
use tzeindex_core::types::OutPoint;

fn db_err(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS blocks (
        height        INTEGER PRIMARY KEY,
        hash          TEXT    NOT NULL,
        previous_hash TEXT    NOT NULL,
        merkle_root   TEXT    NOT NULL,
        timestamp     INTEGER NOT NULL,
        tx_count      INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS transactions (
        txid         TEXT    PRIMARY KEY,
        block_height INTEGER NOT NULL,
        kind         TEXT    NOT NULL,
        version      INTEGER NOT NULL,
        lock_time    INTEGER NOT NULL,
        size         INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS outputs (
        txid         TEXT    NOT NULL,
        idx          INTEGER NOT NULL,
        value        INTEGER NOT NULL,
        address      TEXT,
        block_height INTEGER NOT NULL,
        spent_txid   TEXT,
        spent_input  INTEGER,
        spent_height INTEGER,
        PRIMARY KEY (txid, idx)
    );",
    "CREATE TABLE IF NOT EXISTS inputs (
        txid         TEXT    NOT NULL,
        idx          INTEGER NOT NULL,
        value        INTEGER NOT NULL,
        prev_txid    TEXT    NOT NULL,
        prev_vout    INTEGER NOT NULL,
        sequence     INTEGER NOT NULL,
        block_height INTEGER NOT NULL,
        PRIMARY KEY (txid, idx)
    );",
    "CREATE TABLE IF NOT EXISTS extension_outputs (
        txid         TEXT    NOT NULL,
        idx          INTEGER NOT NULL,
        extension_id INTEGER NOT NULL,
        mode         INTEGER NOT NULL,
        payload      BLOB    NOT NULL,
        value        INTEGER NOT NULL,
        block_height INTEGER NOT NULL,
        PRIMARY KEY (txid, idx)
    );",
    "CREATE TABLE IF NOT EXISTS extension_inputs (
        txid         TEXT    NOT NULL,
        idx          INTEGER NOT NULL,
        extension_id INTEGER NOT NULL,
        mode         INTEGER NOT NULL,
        payload      BLOB    NOT NULL,
        prev_txid    TEXT    NOT NULL,
        prev_vout    INTEGER NOT NULL,
        block_height INTEGER NOT NULL,
        PRIMARY KEY (txid, idx)
    );",
    "CREATE TABLE IF NOT EXISTS verifiers (
        id                 TEXT    PRIMARY KEY,
        name               TEXT    NOT NULL,
        balance            INTEGER NOT NULL,
        initial_balance    INTEGER NOT NULL,
        root               TEXT    NOT NULL,
        inner_program_hash TEXT    NOT NULL,
        program_hash       TEXT    NOT NULL,
        created_height     INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS proofs (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        verifier_id   TEXT    NOT NULL,
        txid          TEXT    NOT NULL,
        input_index   INTEGER NOT NULL,
        block_height  INTEGER NOT NULL,
        proof_size    INTEGER NOT NULL,
        balance_after INTEGER
    );",
    "CREATE TABLE IF NOT EXISTS state_transitions (
        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
        verifier_id        TEXT    NOT NULL,
        txid               TEXT    NOT NULL,
        input_index        INTEGER NOT NULL,
        block_height       INTEGER NOT NULL,
        old_state          TEXT    NOT NULL,
        new_state          TEXT    NOT NULL,
        program_hash       TEXT    NOT NULL,
        inner_program_hash TEXT    NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS accounts (
        address           TEXT    PRIMARY KEY,
        balance           INTEGER NOT NULL,
        received          INTEGER NOT NULL,
        sent              INTEGER NOT NULL,
        tx_count          INTEGER NOT NULL,
        first_seen_height INTEGER NOT NULL,
        last_seen_height  INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS account_deltas (
        address  TEXT    NOT NULL,
        height   INTEGER NOT NULL,
        received INTEGER NOT NULL,
        sent     INTEGER NOT NULL,
        tx_count INTEGER NOT NULL,
        PRIMARY KEY (address, height)
    );",
    "CREATE TABLE IF NOT EXISTS cursor (
        id         INTEGER PRIMARY KEY CHECK (id = 0),
        height     INTEGER NOT NULL,
        hash       TEXT    NOT NULL,
        updated_at INTEGER NOT NULL
    );",
    "CREATE INDEX IF NOT EXISTS idx_transactions_height ON transactions (block_height);",
    "CREATE INDEX IF NOT EXISTS idx_outputs_height ON outputs (block_height);",
    "CREATE INDEX IF NOT EXISTS idx_outputs_spent_height ON outputs (spent_height);",
    "CREATE INDEX IF NOT EXISTS idx_outputs_address ON outputs (address);",
    "CREATE INDEX IF NOT EXISTS idx_inputs_height ON inputs (block_height);",
    "CREATE INDEX IF NOT EXISTS idx_proofs_txid ON proofs (txid, input_index);",
    "CREATE INDEX IF NOT EXISTS idx_proofs_verifier ON proofs (verifier_id);",
    "CREATE INDEX IF NOT EXISTS idx_facts_verifier ON state_transitions (verifier_id);",
];

// ─── Row mapping ─────────────────────────────────────────────────────────────

fn block_from_row(r: &SqliteRow) -> BlockRecord {
    BlockRecord {
        height: r.get::<i64, _>("height") as u64,
        hash: r.get("hash"),
        previous_hash: r.get("previous_hash"),
        merkle_root: r.get("merkle_root"),
        timestamp: r.get("timestamp"),
        tx_count: r.get::<i64, _>("tx_count") as u32,
    }
}

fn output_from_row(r: &SqliteRow) -> OutputRecord {
    let spent_txid: Option<String> = r.get("spent_txid");
    OutputRecord {
        txid: r.get("txid"),
        index: r.get::<i64, _>("idx") as u32,
        value: r.get("value"),
        address: r.get("address"),
        block_height: r.get::<i64, _>("block_height") as u64,
        spent_by: spent_txid.map(|txid| SpendRef {
            txid,
            input_index: r.get::<Option<i64>, _>("spent_input").unwrap_or_default() as u32,
            height: r.get::<Option<i64>, _>("spent_height").unwrap_or_default() as u64,
        }),
    }
}

fn input_from_row(r: &SqliteRow) -> InputRecord {
    InputRecord {
        txid: r.get("txid"),
        index: r.get::<i64, _>("idx") as u32,
        value: r.get("value"),
        previous: OutPoint::new(
            r.get::<String, _>("prev_txid"),
            r.get::<i64, _>("prev_vout") as u32,
        ),
        sequence: r.get::<i64, _>("sequence") as u32,
        block_height: r.get::<i64, _>("block_height") as u64,
    }
}

fn extension_output_from_row(r: &SqliteRow) -> ExtensionOutputRecord {
    ExtensionOutputRecord {
        txid: r.get("txid"),
        index: r.get::<i64, _>("idx") as u32,
        extension_id: r.get::<i64, _>("extension_id") as i32,
        mode: r.get::<i64, _>("mode") as i32,
        payload: r.get("payload"),
        value: r.get("value"),
        block_height: r.get::<i64, _>("block_height") as u64,
    }
}

fn extension_input_from_row(r: &SqliteRow) -> ExtensionInputRecord {
    ExtensionInputRecord {
        txid: r.get("txid"),
        index: r.get::<i64, _>("idx") as u32,
        extension_id: r.get::<i64, _>("extension_id") as i32,
        mode: r.get::<i64, _>("mode") as i32,
        payload: r.get("payload"),
        previous: OutPoint::new(
            r.get::<String, _>("prev_txid"),
            r.get::<i64, _>("prev_vout") as u32,
        ),
        block_height: r.get::<i64, _>("block_height") as u64,
    }
}

fn verifier_from_row(r: &SqliteRow) -> Verifier {
    Verifier {
        id: r.get("id"),
        name: r.get("name"),
        balance: r.get("balance"),
        initial_balance: r.get("initial_balance"),
        root: r.get("root"),
        inner_program_hash: r.get("inner_program_hash"),
        program_hash: r.get("program_hash"),
        created_height: r.get::<i64, _>("created_height") as u64,
    }
}

fn proof_from_row(r: &SqliteRow) -> ProofRecord {
    ProofRecord {
        verifier_id: r.get("verifier_id"),
        txid: r.get("txid"),
        input_index: r.get::<i64, _>("input_index") as u32,
        block_height: r.get::<i64, _>("block_height") as u64,
        proof_size: r.get::<i64, _>("proof_size") as u64,
        balance_after: r.get("balance_after"),
    }
}

// ─── Queries shared by the pool and open transactions ────────────────────────

async fn fetch_output<'e, E>(ex: E, outpoint: &OutPoint) -> Result<Option<OutputRecord>, IndexerError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT * FROM outputs WHERE txid = ? AND idx = ?")
        .bind(&outpoint.txid)
        .bind(outpoint.vout as i64)
        .fetch_optional(ex)
        .await
        .map_err(db_err)?;
    Ok(row.as_ref().map(output_from_row))
}

async fn fetch_verifier<'e, E>(ex: E, id: &str) -> Result<Option<Verifier>, IndexerError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT * FROM verifiers WHERE id = ?")
        .bind(id)
        .fetch_optional(ex)
        .await
        .map_err(db_err)?;
    Ok(row.as_ref().map(verifier_from_row))
}

// ─── Storage ─────────────────────────────────────────────────────────────────

/// SQLite-backed index storage.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./tzeindex.db"`) or a full
    /// SQLite URL (`"sqlite:./tzeindex.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(db_err)?;
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Every pooled connection would get its own empty database, so the pool
    /// is capped at one connection.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    /// Number of stored blocks.
    pub async fn block_count(&self) -> Result<u64, IndexerError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM blocks")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.get::<i64, _>("cnt") as u64)
    }
}

/// A block transaction against [`SqliteStorage`].
pub struct SqliteTx {
    tx: Option<Transaction<'static, Sqlite>>,
}

impl SqliteTx {
    fn conn(&mut self) -> Result<&mut Transaction<'static, Sqlite>, IndexerError> {
        self.tx
            .as_mut()
            .ok_or_else(|| IndexerError::Storage("transaction already finished".into()))
    }
}

#[async_trait]
impl StoreTx for SqliteTx {
    async fn insert_block(&mut self, block: &BlockRecord) -> Result<(), IndexerError> {
        let tx = self.conn()?;
        sqlx::query(
            "INSERT INTO blocks (height, hash, previous_hash, merkle_root, timestamp, tx_count)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(block.height as i64)
        .bind(&block.hash)
        .bind(&block.previous_hash)
        .bind(&block.merkle_root)
        .bind(block.timestamp)
        .bind(block.tx_count as i64)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn insert_transaction(&mut self, record: &TransactionRecord) -> Result<(), IndexerError> {
        let tx = self.conn()?;
        sqlx::query(
            "INSERT OR REPLACE INTO transactions (txid, block_height, kind, version, lock_time, size)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.txid)
        .bind(record.block_height as i64)
        .bind(record.kind.as_str())
        .bind(record.version as i64)
        .bind(record.lock_time as i64)
        .bind(record.size as i64)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn insert_output(&mut self, output: &OutputRecord) -> Result<(), IndexerError> {
        let tx = self.conn()?;
        let spent = output.spent_by.as_ref();
        sqlx::query(
            "INSERT OR REPLACE INTO outputs
             (txid, idx, value, address, block_height, spent_txid, spent_input, spent_height)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&output.txid)
        .bind(output.index as i64)
        .bind(output.value)
        .bind(&output.address)
        .bind(output.block_height as i64)
        .bind(spent.map(|s| s.txid.clone()))
        .bind(spent.map(|s| s.input_index as i64))
        .bind(spent.map(|s| s.height as i64))
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn insert_input(&mut self, input: &InputRecord) -> Result<(), IndexerError> {
        let tx = self.conn()?;
        sqlx::query(
            "INSERT OR REPLACE INTO inputs
             (txid, idx, value, prev_txid, prev_vout, sequence, block_height)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&input.txid)
        .bind(input.index as i64)
        .bind(input.value)
        .bind(&input.previous.txid)
        .bind(input.previous.vout as i64)
        .bind(input.sequence as i64)
        .bind(input.block_height as i64)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn output(&mut self, outpoint: &OutPoint) -> Result<Option<OutputRecord>, IndexerError> {
        let tx = self.conn()?;
        fetch_output(&mut **tx, outpoint).await
    }

    async fn mark_output_spent(
        &mut self,
        outpoint: &OutPoint,
        spend: &SpendRef,
    ) -> Result<bool, IndexerError> {
        let tx = self.conn()?;
        let result = sqlx::query(
            "UPDATE outputs SET spent_txid = ?, spent_input = ?, spent_height = ?
             WHERE txid = ? AND idx = ? AND spent_txid IS NULL",
        )
        .bind(&spend.txid)
        .bind(spend.input_index as i64)
        .bind(spend.height as i64)
        .bind(&outpoint.txid)
        .bind(outpoint.vout as i64)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_extension_output(
        &mut self,
        output: &ExtensionOutputRecord,
    ) -> Result<(), IndexerError> {
        let tx = self.conn()?;
        sqlx::query(
            "INSERT OR REPLACE INTO extension_outputs
             (txid, idx, extension_id, mode, payload, value, block_height)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&output.txid)
        .bind(output.index as i64)
        .bind(output.extension_id as i64)
        .bind(output.mode as i64)
        .bind(&output.payload)
        .bind(output.value)
        .bind(output.block_height as i64)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn insert_extension_input(
        &mut self,
        input: &ExtensionInputRecord,
    ) -> Result<(), IndexerError> {
        let tx = self.conn()?;
        sqlx::query(
            "INSERT OR REPLACE INTO extension_inputs
             (txid, idx, extension_id, mode, payload, prev_txid, prev_vout, block_height)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&input.txid)
        .bind(input.index as i64)
        .bind(input.extension_id as i64)
        .bind(input.mode as i64)
        .bind(&input.payload)
        .bind(&input.previous.txid)
        .bind(input.previous.vout as i64)
        .bind(input.block_height as i64)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn extension_output(
        &mut self,
        outpoint: &OutPoint,
    ) -> Result<Option<ExtensionOutputRecord>, IndexerError> {
        let tx = self.conn()?;
        let row = sqlx::query("SELECT * FROM extension_outputs WHERE txid = ? AND idx = ?")
            .bind(&outpoint.txid)
            .bind(outpoint.vout as i64)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?;
        Ok(row.as_ref().map(extension_output_from_row))
    }

    async fn insert_verifier(&mut self, verifier: &Verifier) -> Result<(), IndexerError> {
        let tx = self.conn()?;
        sqlx::query(
            "INSERT OR REPLACE INTO verifiers
             (id, name, balance, initial_balance, root, inner_program_hash, program_hash, created_height)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&verifier.id)
        .bind(&verifier.name)
        .bind(verifier.balance)
        .bind(verifier.initial_balance)
        .bind(&verifier.root)
        .bind(&verifier.inner_program_hash)
        .bind(&verifier.program_hash)
        .bind(verifier.created_height as i64)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn verifier(&mut self, id: &str) -> Result<Option<Verifier>, IndexerError> {
        let tx = self.conn()?;
        fetch_verifier(&mut **tx, id).await
    }

    async fn set_verifier_balance(&mut self, id: &str, balance: i64) -> Result<(), IndexerError> {
        let tx = self.conn()?;
        let result = sqlx::query("UPDATE verifiers SET balance = ? WHERE id = ?")
            .bind(balance)
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(IndexerError::Storage(format!("unknown verifier {id}")));
        }
        Ok(())
    }

    async fn insert_proof(&mut self, proof: &ProofRecord) -> Result<(), IndexerError> {
        let tx = self.conn()?;
        sqlx::query(
            "INSERT INTO proofs (verifier_id, txid, input_index, block_height, proof_size, balance_after)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&proof.verifier_id)
        .bind(&proof.txid)
        .bind(proof.input_index as i64)
        .bind(proof.block_height as i64)
        .bind(proof.proof_size as i64)
        .bind(proof.balance_after)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn proof_by_txid(&mut self, txid: &str) -> Result<Option<ProofRecord>, IndexerError> {
        let tx = self.conn()?;
        let row = sqlx::query(
            "SELECT * FROM proofs WHERE txid = ? ORDER BY input_index ASC, id ASC LIMIT 1",
        )
        .bind(txid)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(row.as_ref().map(proof_from_row))
    }

    async fn insert_state_transition(
        &mut self,
        fact: &StateTransitionFact,
    ) -> Result<(), IndexerError> {
        let tx = self.conn()?;
        sqlx::query(
            "INSERT INTO state_transitions
             (verifier_id, txid, input_index, block_height, old_state, new_state, program_hash, inner_program_hash)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&fact.verifier_id)
        .bind(&fact.txid)
        .bind(fact.input_index as i64)
        .bind(fact.block_height as i64)
        .bind(&fact.old_state)
        .bind(&fact.new_state)
        .bind(&fact.program_hash)
        .bind(&fact.inner_program_hash)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn apply_account_delta(&mut self, delta: &AccountDelta) -> Result<(), IndexerError> {
        let tx = self.conn()?;
        sqlx::query(
            "INSERT INTO accounts
             (address, balance, received, sent, tx_count, first_seen_height, last_seen_height)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (address) DO UPDATE SET
                balance          = balance + excluded.balance,
                received         = received + excluded.received,
                sent             = sent + excluded.sent,
                tx_count         = tx_count + excluded.tx_count,
                last_seen_height = MAX(last_seen_height, excluded.last_seen_height)",
        )
        .bind(&delta.address)
        .bind(delta.balance_change())
        .bind(delta.received)
        .bind(delta.sent)
        .bind(delta.tx_count as i64)
        .bind(delta.height as i64)
        .bind(delta.height as i64)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "INSERT INTO account_deltas (address, height, received, sent, tx_count)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (address, height) DO UPDATE SET
                received = received + excluded.received,
                sent     = sent + excluded.sent,
                tx_count = tx_count + excluded.tx_count",
        )
        .bind(&delta.address)
        .bind(delta.height as i64)
        .bind(delta.received)
        .bind(delta.sent)
        .bind(delta.tx_count as i64)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn save_cursor(&mut self, cursor: &Cursor) -> Result<(), IndexerError> {
        let tx = self.conn()?;
        sqlx::query(
            "INSERT OR REPLACE INTO cursor (id, height, hash, updated_at) VALUES (0, ?, ?, ?)",
        )
        .bind(cursor.height as i64)
        .bind(&cursor.hash)
        .bind(cursor.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), IndexerError> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| IndexerError::Storage("transaction already finished".into()))?;
        tx.commit().await.map_err(db_err)
    }

    async fn rollback(&mut self) -> Result<(), IndexerError> {
        match self.tx.take() {
            Some(tx) => tx.rollback().await.map_err(db_err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl IndexStore for SqliteStorage {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, IndexerError> {
        let tx = self.pool.begin().await.map_err(db_err)?;
        Ok(Box::new(SqliteTx { tx: Some(tx) }))
    }

    async fn load_cursor(&self) -> Result<Option<Cursor>, IndexerError> {
        let row = sqlx::query("SELECT height, hash, updated_at FROM cursor WHERE id = 0")
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| Cursor {
            height: r.get::<i64, _>("height") as u64,
            hash: r.get("hash"),
            updated_at: r.get("updated_at"),
        }))
    }

    async fn block_hash_at(&self, height: u64) -> Result<Option<String>, IndexerError> {
        let row = sqlx::query("SELECT hash FROM blocks WHERE height = ?")
            .bind(height as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| r.get::<String, _>("hash")))
    }

    async fn rollback_after(&self, height: u64) -> Result<u64, IndexerError> {
        let h = height as i64;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let deltas = sqlx::query(
            "SELECT address, received, sent, tx_count FROM account_deltas WHERE height > ?",
        )
        .bind(h)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;
        for d in &deltas {
            let received: i64 = d.get("received");
            let sent: i64 = d.get("sent");
            sqlx::query(
                "UPDATE accounts SET balance = balance - ?, received = received - ?,
                 sent = sent - ?, tx_count = tx_count - ? WHERE address = ?",
            )
            .bind(received - sent)
            .bind(received)
            .bind(sent)
            .bind(d.get::<i64, _>("tx_count"))
            .bind(d.get::<String, _>("address"))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        let removed = sqlx::query("SELECT COUNT(*) AS cnt FROM blocks WHERE height > ?")
            .bind(h)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?
            .get::<i64, _>("cnt") as u64;

        let statements = [
            "DELETE FROM account_deltas WHERE height > ?",
            "DELETE FROM accounts WHERE first_seen_height > ?",
            "UPDATE outputs SET spent_txid = NULL, spent_input = NULL, spent_height = NULL
             WHERE spent_height > ?",
            "DELETE FROM blocks WHERE height > ?",
            "DELETE FROM transactions WHERE block_height > ?",
            "DELETE FROM outputs WHERE block_height > ?",
            "DELETE FROM inputs WHERE block_height > ?",
            "DELETE FROM extension_outputs WHERE block_height > ?",
            "DELETE FROM extension_inputs WHERE block_height > ?",
            "DELETE FROM verifiers WHERE created_height > ?",
            "DELETE FROM proofs WHERE block_height > ?",
            "DELETE FROM state_transitions WHERE block_height > ?",
        ];
        for statement in statements {
            sqlx::query(statement)
                .bind(h)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        sqlx::query(
            "UPDATE accounts SET last_seen_height = COALESCE(
                (SELECT MAX(height) FROM account_deltas d WHERE d.address = accounts.address),
                first_seen_height)",
        )
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "UPDATE verifiers SET balance = COALESCE(
                (SELECT balance_after FROM proofs p
                 WHERE p.verifier_id = verifiers.id AND p.balance_after IS NOT NULL
                 ORDER BY p.id DESC LIMIT 1),
                initial_balance)",
        )
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let tip = sqlx::query("SELECT height, hash FROM blocks ORDER BY height DESC LIMIT 1")
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        match tip {
            Some(r) => {
                let cursor = Cursor::new(r.get::<i64, _>("height") as u64, r.get::<String, _>("hash"));
                sqlx::query(
                    "INSERT OR REPLACE INTO cursor (id, height, hash, updated_at) VALUES (0, ?, ?, ?)",
                )
                .bind(cursor.height as i64)
                .bind(&cursor.hash)
                .bind(cursor.updated_at)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
            None => {
                sqlx::query("DELETE FROM cursor")
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
            }
        }

        tx.commit().await.map_err(db_err)?;
        debug!(height, removed, "rolled back storage");
        Ok(removed)
    }

    async fn block(&self, height: u64) -> Result<Option<BlockRecord>, IndexerError> {
        let row = sqlx::query("SELECT * FROM blocks WHERE height = ?")
            .bind(height as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.as_ref().map(block_from_row))
    }

    async fn transaction(&self, txid: &str) -> Result<Option<TransactionRecord>, IndexerError> {
        let row = sqlx::query("SELECT * FROM transactions WHERE txid = ?")
            .bind(txid)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        let Some(r) = row else {
            return Ok(None);
        };
        let kind: String = r.get("kind");
        let kind = TxKind::parse(&kind)
            .ok_or_else(|| IndexerError::Storage(format!("unknown transaction kind {kind}")))?;
        Ok(Some(TransactionRecord {
            txid: r.get("txid"),
            block_height: r.get::<i64, _>("block_height") as u64,
            kind,
            version: r.get::<i64, _>("version") as i32,
            lock_time: r.get::<i64, _>("lock_time") as u32,
            size: r.get::<i64, _>("size") as u32,
        }))
    }

    async fn output(&self, outpoint: &OutPoint) -> Result<Option<OutputRecord>, IndexerError> {
        fetch_output(&self.pool, outpoint).await
    }

    async fn outputs_of(&self, txid: &str) -> Result<Vec<OutputRecord>, IndexerError> {
        let rows = sqlx::query("SELECT * FROM outputs WHERE txid = ? ORDER BY idx")
            .bind(txid)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(output_from_row).collect())
    }

    async fn inputs_of(&self, txid: &str) -> Result<Vec<InputRecord>, IndexerError> {
        let rows = sqlx::query("SELECT * FROM inputs WHERE txid = ? ORDER BY idx")
            .bind(txid)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(input_from_row).collect())
    }

    async fn extension_outputs_of(
        &self,
        txid: &str,
    ) -> Result<Vec<ExtensionOutputRecord>, IndexerError> {
        let rows = sqlx::query("SELECT * FROM extension_outputs WHERE txid = ? ORDER BY idx")
            .bind(txid)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(extension_output_from_row).collect())
    }

    async fn extension_inputs_of(
        &self,
        txid: &str,
    ) -> Result<Vec<ExtensionInputRecord>, IndexerError> {
        let rows = sqlx::query("SELECT * FROM extension_inputs WHERE txid = ? ORDER BY idx")
            .bind(txid)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(extension_input_from_row).collect())
    }

    async fn verifier(&self, id: &str) -> Result<Option<Verifier>, IndexerError> {
        fetch_verifier(&self.pool, id).await
    }

    async fn proofs_for(&self, verifier_id: &str) -> Result<Vec<ProofRecord>, IndexerError> {
        let rows = sqlx::query("SELECT * FROM proofs WHERE verifier_id = ? ORDER BY id")
            .bind(verifier_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(proof_from_row).collect())
    }

    async fn state_transitions_for(
        &self,
        verifier_id: &str,
    ) -> Result<Vec<StateTransitionFact>, IndexerError> {
        let rows = sqlx::query("SELECT * FROM state_transitions WHERE verifier_id = ? ORDER BY id")
            .bind(verifier_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows
            .iter()
            .map(|r| StateTransitionFact {
                verifier_id: r.get("verifier_id"),
                txid: r.get("txid"),
                input_index: r.get::<i64, _>("input_index") as u32,
                block_height: r.get::<i64, _>("block_height") as u64,
                old_state: r.get("old_state"),
                new_state: r.get("new_state"),
                program_hash: r.get("program_hash"),
                inner_program_hash: r.get("inner_program_hash"),
            })
            .collect())
    }

    async fn account(&self, address: &str) -> Result<Option<Account>, IndexerError> {
        let row = sqlx::query("SELECT * FROM accounts WHERE address = ?")
            .bind(address)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| Account {
            address: r.get("address"),
            balance: r.get("balance"),
            received: r.get("received"),
            sent: r.get("sent"),
            tx_count: r.get::<i64, _>("tx_count") as u64,
            first_seen_height: r.get::<i64, _>("first_seen_height") as u64,
            last_seen_height: r.get::<i64, _>("last_seen_height") as u64,
        }))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn block(height: u64) -> BlockRecord {
        BlockRecord {
            height,
            hash: format!("h{height}"),
            previous_hash: format!("h{}", height.saturating_sub(1)),
            merkle_root: "mr".into(),
            timestamp: 1_700_000_000,
            tx_count: 1,
        }
    }

    async fn commit_block(store: &SqliteStorage, height: u64) {
        let mut tx = store.begin().await.unwrap();
        tx.insert_block(&block(height)).await.unwrap();
        tx.insert_transaction(&TransactionRecord {
            txid: format!("tx{height}"),
            block_height: height,
            kind: TxKind::TransparentToTransparent,
            version: 4,
            lock_time: 0,
            size: 250,
        })
        .await
        .unwrap();
        tx.insert_output(&OutputRecord {
            txid: format!("tx{height}"),
            index: 0,
            value: 5_000,
            address: Some("t1bob".into()),
            block_height: height,
            spent_by: None,
        })
        .await
        .unwrap();
        tx.apply_account_delta(&AccountDelta {
            address: "t1bob".into(),
            height,
            received: 5_000,
            sent: 0,
            tx_count: 1,
        })
        .await
        .unwrap();
        tx.save_cursor(&Cursor::new(height, format!("h{height}")))
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn block_and_cursor_roundtrip() {
        let store = SqliteStorage::in_memory().await.unwrap();
        commit_block(&store, 10).await;

        let stored = store.block(10).await.unwrap().unwrap();
        assert_eq!(stored, block(10));
        assert_eq!(store.load_cursor().await.unwrap().unwrap().height, 10);

        let tx = store.transaction("tx10").await.unwrap().unwrap();
        assert_eq!(tx.kind, TxKind::TransparentToTransparent);
    }

    #[tokio::test]
    async fn dropped_transaction_is_discarded() {
        let store = SqliteStorage::in_memory().await.unwrap();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_block(&block(1)).await.unwrap();
            tx.rollback().await.unwrap();
        }
        assert!(store.block(1).await.unwrap().is_none());
        assert!(store.load_cursor().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn spend_flag_flips_once() {
        let store = SqliteStorage::in_memory().await.unwrap();
        commit_block(&store, 1).await;

        let spend = SpendRef {
            txid: "spender".into(),
            input_index: 3,
            height: 2,
        };
        let mut tx = store.begin().await.unwrap();
        assert!(tx.mark_output_spent(&OutPoint::new("tx1", 0), &spend).await.unwrap());
        assert!(!tx.mark_output_spent(&OutPoint::new("tx1", 0), &spend).await.unwrap());
        tx.commit().await.unwrap();

        let out = store.output(&OutPoint::new("tx1", 0)).await.unwrap().unwrap();
        assert_eq!(out.spent_by, Some(spend));
    }

    #[tokio::test]
    async fn accounts_accumulate_deltas() {
        let store = SqliteStorage::in_memory().await.unwrap();
        commit_block(&store, 1).await;
        commit_block(&store, 2).await;

        let account = store.account("t1bob").await.unwrap().unwrap();
        assert_eq!(account.balance, 10_000);
        assert_eq!(account.tx_count, 2);
        assert_eq!(account.first_seen_height, 1);
        assert_eq!(account.last_seen_height, 2);
    }

    #[tokio::test]
    async fn rollback_removes_future_data() {
        let store = SqliteStorage::in_memory().await.unwrap();
        for h in 100..=105 {
            commit_block(&store, h).await;
        }

        let mut tx = store.begin().await.unwrap();
        tx.mark_output_spent(
            &OutPoint::new("tx100", 0),
            &SpendRef {
                txid: "tx104".into(),
                input_index: 0,
                height: 104,
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let removed = store.rollback_after(102).await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(store.block_count().await.unwrap(), 3);
        assert!(store.block_hash_at(103).await.unwrap().is_none());
        assert!(store.block_hash_at(102).await.unwrap().is_some());
        assert!(store.transaction("tx104").await.unwrap().is_none());

        let out = store.output(&OutPoint::new("tx100", 0)).await.unwrap().unwrap();
        assert!(!out.is_spent());

        let account = store.account("t1bob").await.unwrap().unwrap();
        assert_eq!(account.balance, 15_000);
        assert_eq!(account.last_seen_height, 102);

        let cursor = store.load_cursor().await.unwrap().unwrap();
        assert_eq!(cursor.height, 102);
        assert_eq!(cursor.hash, "h102");
    }

    #[tokio::test]
    async fn verifier_balance_restored_from_surviving_proof() {
        let store = SqliteStorage::in_memory().await.unwrap();
        commit_block(&store, 1).await;

        let mut tx = store.begin().await.unwrap();
        tx.insert_verifier(&Verifier {
            id: "tx1:0".into(),
            name: "verifier-tx1-0".into(),
            balance: 1_000,
            initial_balance: 1_000,
            root: "00".repeat(32),
            inner_program_hash: "11".repeat(32),
            program_hash: "22".repeat(32),
            created_height: 1,
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();

        for (height, balance) in [(2u64, 900i64), (3, 800)] {
            commit_block(&store, height).await;
            let mut tx = store.begin().await.unwrap();
            tx.insert_proof(&ProofRecord {
                verifier_id: "tx1:0".into(),
                txid: format!("tx{height}"),
                input_index: 0,
                block_height: height,
                proof_size: 128,
                balance_after: Some(balance),
            })
            .await
            .unwrap();
            tx.set_verifier_balance("tx1:0", balance).await.unwrap();
            tx.commit().await.unwrap();
        }
        assert_eq!(store.verifier("tx1:0").await.unwrap().unwrap().balance, 800);

        store.rollback_after(2).await.unwrap();
        assert_eq!(store.verifier("tx1:0").await.unwrap().unwrap().balance, 900);
        assert_eq!(store.proofs_for("tx1:0").await.unwrap().len(), 1);

        store.rollback_after(1).await.unwrap();
        assert_eq!(store.verifier("tx1:0").await.unwrap().unwrap().balance, 1_000);
    }
}
