//! Error types for the tzeindex pipeline.

use thiserror::Error;

/// Errors raised while decoding an extension script or one of its payloads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("extension script too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },

    #[error("not an extension script: first byte is 0x{found:02x}")]
    BadMarker { found: u8 },

    #[error("invalid script hex: {0}")]
    InvalidHex(String),

    #[error("witness too short: {len} bytes, need at least 2")]
    WitnessTooShort { len: usize },
}

/// Errors that can occur during indexing.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("Block parse error: {0}")]
    Parse(String),

    #[error("Node returned block {got} when block {requested} was requested")]
    HeightMismatch { requested: u64, got: u64 },

    #[error("Cannot resolve verifier for input spending {prev_txid}:{prev_vout}")]
    UnresolvedVerifier { prev_txid: String, prev_vout: u32 },

    #[error("Reorg from block {from} is deeper than the configured maximum of {max_depth}")]
    ReorgTooDeep { from: u64, max_depth: u64 },

    #[error("Reorg search from block {from} reached genesis without a common ancestor")]
    GenesisReached { from: u64 },

    #[error("Giving up on block {height} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        height: u64,
        attempts: u32,
        last_error: String,
    },

    #[error("Indexer aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if the loop must stop instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ReorgTooDeep { .. }
                | Self::GenesisReached { .. }
                | Self::RetriesExhausted { .. }
                | Self::Aborted { .. }
        )
    }

    /// Returns `true` if the failed block may be rolled back and retried.
    pub fn is_retryable(&self) -> bool {
        !self.is_fatal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reorg_exhaustion_is_fatal() {
        assert!(IndexerError::ReorgTooDeep { from: 10, max_depth: 2 }.is_fatal());
        assert!(IndexerError::GenesisReached { from: 3 }.is_fatal());
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(IndexerError::Rpc("connection refused".into()).is_retryable());
        assert!(IndexerError::HeightMismatch { requested: 5, got: 6 }.is_retryable());
        assert!(IndexerError::from(FormatError::BadMarker { found: 0 }).is_retryable());
    }
}
