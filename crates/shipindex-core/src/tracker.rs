//! Sliding window of recently applied blocks, used to tell re-delivered
//! blocks apart from forks.
//!
//! The state-history feed re-sends a block number when the chain switches
//! forks. If the id matches what was applied it is a duplicate; otherwise
//! everything from that number on has to be rolled back first.

use std::collections::VecDeque;

use crate::types::ShipBlock;

/// Number and id of an applied block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub number: u64,
    pub id: String,
}

impl From<&ShipBlock> for BlockInfo {
    fn from(block: &ShipBlock) -> Self {
        Self {
            number: block.number,
            id: block.id.clone(),
        }
    }
}

/// How an incoming block relates to the applied chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockPosition {
    /// The next block after the head (or the very first block).
    Extends,
    /// Already applied with the same id.
    Duplicate,
    /// Already applied with a different id, or older than the window.
    Fork,
    /// Skips at least one block.
    Gap { expected: u64 },
}

/// Tracks the last N applied blocks.
pub struct BlockTracker {
    /// Sliding window of recent blocks (oldest first).
    window: VecDeque<BlockInfo>,
    /// Maximum number of blocks to retain.
    window_size: usize,
    /// Head number, kept even when the window has been emptied by pruning.
    head: Option<u64>,
}

impl BlockTracker {
    /// Create a new tracker with the given window size.
    pub fn new(window_size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size.min(1024)),
            window_size: window_size.max(1),
            head: None,
        }
    }

    /// Start from a persisted head whose id may be unknown.
    pub fn resume(&mut self, head: Option<u64>, head_id: Option<&str>) {
        self.window.clear();
        self.head = head;
        if let (Some(number), Some(id)) = (head, head_id) {
            self.window.push_back(BlockInfo {
                number,
                id: id.to_string(),
            });
        }
    }

    /// Classify `block` against the applied chain.
    pub fn position(&self, block: &ShipBlock) -> BlockPosition {
        let Some(head) = self.head else {
            return BlockPosition::Extends;
        };
        if block.number == head + 1 {
            return BlockPosition::Extends;
        }
        if block.number > head + 1 {
            return BlockPosition::Gap { expected: head + 1 };
        }
        match self.get(block.number) {
            Some(seen) if seen.id == block.id => BlockPosition::Duplicate,
            _ => BlockPosition::Fork,
        }
    }

    /// Record a block that has just been committed.
    pub fn push(&mut self, block: BlockInfo) {
        self.head = Some(block.number);
        if self.window.len() >= self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(block);
    }

    /// Returns the current head (most recently added block).
    pub fn head(&self) -> Option<u64> {
        self.head
    }

    /// Returns a block by number if it's in the window.
    pub fn get(&self, number: u64) -> Option<&BlockInfo> {
        self.window.iter().rev().find(|b| b.number == number)
    }

    /// Number of blocks in the window.
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// Returns `true` if the window is empty.
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Discard every block `>= block_number` after a rollback.
    pub fn rewind_to(&mut self, block_number: u64) {
        while let Some(back) = self.window.back() {
            if back.number >= block_number {
                self.window.pop_back();
            } else {
                break;
            }
        }
        if let Some(head) = self.head {
            if head >= block_number {
                self.head = block_number.checked_sub(1).filter(|n| *n > 0);
            }
        }
    }

    /// Forget blocks `< block_number`; they can no longer fork.
    ///
    /// The block at the irreversible mark itself is kept so a re-delivery of
    /// it is still recognised as a duplicate.
    pub fn prune_below(&mut self, block_number: u64) {
        while let Some(front) = self.window.front() {
            if front.number < block_number {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}
