//! Persisted position of a reader.
//!
//! The checkpoint is written by the store inside every block commit, so the
//! stored head always matches the stored rows. On restart the sequencer
//! resumes at `head_block + 1` instead of re-indexing from scratch.

use serde::{Deserialize, Serialize};

use crate::types::ShipBlock;

/// A persisted checkpoint for a reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Reader name (e.g. `"atomicassets-1"`).
    pub reader: String,
    /// Last committed block, `None` before the first commit or after a full rollback.
    pub head_block: Option<u64>,
    /// Id of the last committed block.
    pub head_id: Option<String>,
    /// Highest block known to be final. Rollbacks at or below it are rejected.
    pub irreversible_block: u64,
    /// Unix timestamp (ms) of the last write.
    pub updated_at: i64,
}

impl Checkpoint {
    /// A checkpoint for a reader that has not processed anything yet.
    pub fn empty(reader: impl Into<String>) -> Self {
        Self {
            reader: reader.into(),
            head_block: None,
            head_id: None,
            irreversible_block: 0,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Move the head to a freshly committed block.
    pub fn advance(&mut self, block_number: u64, block_id: &str) {
        self.head_block = Some(block_number);
        self.head_id = Some(block_id.to_string());
        self.touch();
    }

    /// Record a committed block. A block delivered as non-reversible is final
    /// on arrival, so it also raises the irreversible mark.
    pub fn commit(&mut self, block: &ShipBlock) {
        self.advance(block.number, &block.id);
        if !block.is_reversible {
            self.mark_irreversible(block.number);
        }
    }

    /// Move the head back below `block_number` after a rollback.
    ///
    /// The id of the new head is unknown to the store and is cleared.
    pub fn rewind(&mut self, block_number: u64) {
        // Chain numbering starts at 1, so a head of 0 means nothing is applied.
        self.head_block = self
            .head_block
            .and(block_number.checked_sub(1))
            .filter(|n| *n > 0);
        self.head_id = None;
        self.touch();
    }

    /// Raise the irreversible mark. Never lowers it.
    pub fn mark_irreversible(&mut self, block_number: u64) {
        if block_number > self.irreversible_block {
            self.irreversible_block = block_number;
            self.touch();
        }
    }

    /// The first block that still has to be applied.
    pub fn next_block(&self) -> Option<u64> {
        self.head_block.map(|n| n + 1)
    }

    fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }
}
