//! Fluent builder API for assembling a block sequencer.
//!
//! # Example
//!
//! ```rust,ignore
//! let sequencer = IndexerBuilder::new()
//!     .reader("atomicassets-1")
//!     .start_block(100_000_000)
//!     .max_block_retries(5)
//!     .store(store)
//!     .handler(Arc::new(AtomicAssetsHandler::new(config, registry.clone())))
//!     .registry(registry)
//!     .build()?;
//! ```

use std::sync::Arc;

use crate::dispatcher::{DeltaDispatcher, DeltaHandler};
use crate::error::IndexerError;
use crate::indexer::IndexerConfig;
use crate::schema::SchemaRegistry;
use crate::sequencer::BlockSequencer;
use crate::writer::BlockStore;

/// Fluent builder for `IndexerConfig` and [`BlockSequencer`].
#[derive(Default)]
pub struct IndexerBuilder {
    config: IndexerConfig,
    store: Option<Arc<dyn BlockStore>>,
    handlers: Vec<Arc<dyn DeltaHandler>>,
    registry: Option<Arc<SchemaRegistry>>,
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration (e.g. loaded from a file).
    pub fn config(mut self, config: IndexerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the reader name (used as the checkpoint key).
    pub fn reader(mut self, reader: impl Into<String>) -> Self {
        self.config.reader = reader.into();
        self
    }

    /// Set the first block applied when there is no checkpoint.
    pub fn start_block(mut self, block: u64) -> Self {
        self.config.start_block = block;
        self
    }

    /// Stop after applying this block.
    pub fn stop_block(mut self, block: u64) -> Self {
        self.config.stop_block = Some(block);
        self
    }

    /// Set how often a block is retried after a transient storage error.
    pub fn max_block_retries(mut self, n: u32) -> Self {
        self.config.max_block_retries = n;
        self
    }

    /// Set the pause between retries in milliseconds.
    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    /// Set the capacity of the change notification channel.
    pub fn notification_capacity(mut self, capacity: usize) -> Self {
        self.config.notification_capacity = capacity;
        self
    }

    /// Set how many applied blocks are remembered for fork detection.
    pub fn tracker_window(mut self, blocks: usize) -> Self {
        self.config.tracker_window = blocks;
        self
    }

    /// Set the storage backend.
    pub fn store(mut self, store: Arc<dyn BlockStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Add a contract module.
    pub fn handler(mut self, handler: Arc<dyn DeltaHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Share a schema registry with the handlers. A fresh one is created otherwise.
    pub fn registry(mut self, registry: Arc<SchemaRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build the `IndexerConfig`.
    pub fn build_config(self) -> IndexerConfig {
        self.config
    }

    /// Validate the configuration and assemble the sequencer.
    pub fn build(self) -> Result<BlockSequencer, IndexerError> {
        self.config.validate()?;
        let store = self
            .store
            .ok_or_else(|| IndexerError::Config("no storage backend configured".into()))?;
        if self.handlers.is_empty() {
            return Err(IndexerError::Config("no delta handlers registered".into()));
        }
        let dispatcher = DeltaDispatcher::new(self.handlers)?;
        let registry = self.registry.unwrap_or_default();
        Ok(BlockSequencer::new(self.config, store, dispatcher, registry))
    }
}
