//! Indexer cursor: the single persisted checkpoint.

use serde::{Deserialize, Serialize};

/// The last block whose writes committed successfully.
///
/// The cursor is written inside the same store transaction as the block it
/// points at, so it never runs ahead of the indexed data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Last indexed block height.
    pub height: u64,
    /// Last indexed block hash.
    pub hash: String,
    /// Unix timestamp of when this cursor was saved.
    pub updated_at: i64,
}

impl Cursor {
    pub fn new(height: u64, hash: impl Into<String>) -> Self {
        Self {
            height,
            hash: hash.into(),
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Advance the cursor to a newly committed block.
    pub fn advance(&mut self, height: u64, hash: impl Into<String>) {
        self.height = height;
        self.hash = hash.into();
        self.updated_at = chrono::Utc::now().timestamp();
    }

    /// Returns the next block to process (cursor + 1).
    pub fn next_height(&self) -> u64 {
        self.height + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_advance() {
        let mut cursor = Cursor::new(100, "aaa");
        cursor.advance(101, "bbb");
        assert_eq!(cursor.height, 101);
        assert_eq!(cursor.hash, "bbb");
    }

    #[test]
    fn cursor_next_height() {
        let cursor = Cursor::new(500, "123");
        assert_eq!(cursor.next_height(), 501);
    }
}
