//! shipindex-atomicassets — AtomicAssets NFT contract module.
//!
//! Provides the [`AtomicAssetsHandler`] delta handler, the attribute
//! [`AtomicCodec`] and the SQLite table layout its jobs write into.

pub mod codec;
pub mod handler;
pub mod migrations;
pub mod schemas;
pub mod tables;

pub use codec::AtomicCodec;
pub use handler::{AtomicAssetsConfig, AtomicAssetsHandler};
pub use migrations::SQLITE_MIGRATIONS;
