//! shipindex-storage — block store backends for shipindex.
//!
//! Backends:
//! - [`memory`] — in-memory (dev/testing, no persistence)
//! - [`sqlite`] — SQLite via `sqlx` (embedded, single-file persistence)
//!
//! Both implement [`BlockStore`](shipindex_core::writer::BlockStore): one
//! unit of work per block, an undo log for reversible blocks, and a reader
//! checkpoint written atomically with each commit.

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryStorage;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
