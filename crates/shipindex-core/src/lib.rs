//! shipindex-core — foundation for the fork-aware state-history indexer.
//!
//! # Architecture
//!
//! ```text
//! IndexerBuilder → BlockSequencer
//!                      ├── BlockTracker     (applied window, duplicate / fork detection)
//!                      ├── DeltaDispatcher  (delta → DeltaHandler → prioritized Job)
//!                      ├── JobQueue         (ordered execution within a block)
//!                      ├── SchemaRegistry   (on-chain payload layouts)
//!                      └── BlockStore       (unit of work, undo log, checkpoint)
//! ```

pub mod builder;
pub mod checkpoint;
pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod indexer;
pub mod job;
pub mod schema;
pub mod sequencer;
pub mod tracker;
pub mod types;
pub mod writer;

pub use builder::IndexerBuilder;
pub use checkpoint::Checkpoint;
pub use codec::{AttributeMap, AttributeValue, PayloadCodec};
pub use dispatcher::{DeltaDispatcher, DeltaHandler, DeltaRoute};
pub use error::{DecodeError, IndexerError};
pub use indexer::{IndexerConfig, IndexerState};
pub use job::{DeltaKind, JobQueue, JobTask, PriorityClass, PriorityTable};
pub use schema::{AttributeType, FormatEntry, SchemaKey, SchemaRegistry, SchemaSpec};
pub use sequencer::{BlockSequencer, ChannelStream, ReplayStream, SequencerStats, ShipStream};
pub use tracker::{BlockInfo, BlockPosition, BlockTracker};
pub use types::{BlockMessage, ShipBlock, StreamMessage, TableDelta, TransactionTrace};
pub use writer::{
    BlockStore, ChangeNotification, ChangeOperation, CommitSummary, Filter, Row, RollbackReport,
    UndoEntry, UnitOfWork,
};
