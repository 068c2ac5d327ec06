//! tzeindex-core: the block-ingestion and graph-reconstruction core.
//!
//! # Architecture
//!
//! ```text
//! IndexLoop (tzeindex-zcash) → BlockOrchestrator
//!                                  ├── ReorgDetector      (detect, common ancestor, rollback)
//!                                  └── IndexModule, in order, inside one StoreTx
//!                                        ├── Blocks     (block + transaction rows)
//!                                        ├── Accounts   (address balances)
//!                                        ├── Graph      (outputs, inputs, spent flags)
//!                                        ├── Extension  (codec → extension rows)
//!                                        └── Verifiers  (verifier chains, proofs, facts)
//! ```

pub mod accounts;
pub mod codec;
pub mod cursor;
pub mod error;
pub mod extension;
pub mod graph;
pub mod indexer;
pub mod modules;
pub mod reorg;
pub mod retry;
pub mod store;
pub mod types;
pub mod verifier;

pub use codec::{ExtensionScript, Precondition, Witness};
pub use cursor::Cursor;
pub use error::{FormatError, IndexerError};
pub use graph::TxKind;
pub use indexer::{IndexContext, IndexerConfig, IndexerState, ModuleConfig, ReorgConfig};
pub use modules::IndexModule;
pub use reorg::{ChainView, ReorgDetector, ReorgEvent};
pub use retry::{RetryConfig, RetryPolicy};
pub use store::{IndexStore, StoreTx};
pub use types::{Block, BlockSummary, OutPoint, Transaction, TxInput, TxOutput};
