//! Indexer configuration and state types.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// Configuration for an indexer instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Unique name for this reader (used as the checkpoint key).
    pub reader: String,
    /// First block to apply when there is no checkpoint.
    pub start_block: u64,
    /// Optional last block. `None` = follow the stream until it ends.
    pub stop_block: Option<u64>,
    /// How many times a block failing with a transient storage error is retried.
    pub max_block_retries: u32,
    /// Pause between two attempts of the same block (milliseconds).
    pub retry_backoff_ms: u64,
    /// Capacity of the change notification broadcast channel.
    pub notification_capacity: usize,
    /// How many applied blocks are remembered for duplicate/fork detection.
    pub tracker_window: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            reader: "default".into(),
            start_block: 1,
            stop_block: None,
            max_block_retries: 3,
            retry_backoff_ms: 500,
            notification_capacity: 1024,
            tracker_window: 720,
        }
    }
}

impl IndexerConfig {
    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.reader.is_empty() {
            return Err(IndexerError::Config("reader name must not be empty".into()));
        }
        if let Some(stop) = self.stop_block {
            if stop < self.start_block {
                return Err(IndexerError::Config(format!(
                    "stop_block {stop} is before start_block {}",
                    self.start_block
                )));
            }
        }
        if self.notification_capacity == 0 {
            return Err(IndexerError::Config("notification_capacity must be positive".into()));
        }
        Ok(())
    }
}

/// Runtime state of the indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerState {
    /// Not yet started.
    Idle,
    /// Applying blocks from the stream.
    Syncing,
    /// Undoing blocks after a fork.
    RollingBack,
    /// Terminated (stream ended or stop block reached).
    Stopped,
    /// Encountered an unrecoverable error.
    Error,
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Syncing => write!(f, "syncing"),
            Self::RollingBack => write!(f, "rolling-back"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}
