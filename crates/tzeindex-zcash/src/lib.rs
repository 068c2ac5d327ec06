//! tzeindex-zcash: Zcash node client, block orchestrator, and ingestion loop.

pub mod builder;
pub mod fetcher;
pub mod index_loop;
pub mod orchestrator;
pub mod parser;

pub use builder::IndexerBuilder;
pub use fetcher::{HttpNodeClient, NodeChainView, NodeClient, NodeConfig};
pub use index_loop::{IndexLoop, IndexerHandle, LoopState, Step};
pub use orchestrator::{BlockOrchestrator, BlockOutcome};
pub use parser::parse_block;
