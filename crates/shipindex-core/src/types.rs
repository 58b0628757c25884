//! Shared types for the indexing pipeline.

use chrono::{NaiveDateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, IndexerError};

// ─── ShipBlock ───────────────────────────────────────────────────────────────

/// A block as delivered by the state-history feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipBlock {
    /// Block number.
    pub number: u64,
    /// Block id (hex).
    pub id: String,
    /// Block time in milliseconds since the Unix epoch. The feed may also
    /// send the eosio text form, e.g. `"2021-01-01T00:00:00.500"`.
    #[serde(deserialize_with = "block_time::deserialize")]
    pub timestamp: i64,
    /// `true` while the block may still be dropped by a fork.
    pub is_reversible: bool,
}

impl ShipBlock {
    pub fn new(number: u64, id: impl Into<String>, timestamp: i64, is_reversible: bool) -> Self {
        Self {
            number,
            id: id.into(),
            timestamp,
            is_reversible,
        }
    }
}

/// Parse an eosio block timestamp (`"2021-01-01T00:00:00.500"`, always UTC)
/// into milliseconds since the Unix epoch.
pub fn parse_eosio_timestamp(value: &str) -> Result<i64, IndexerError> {
    let trimmed = value.trim_end_matches('Z');
    let naive = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .map_err(|e| IndexerError::Stream(format!("invalid block timestamp '{value}': {e}")))?;
    Ok(Utc.from_utc_datetime(&naive).timestamp_millis())
}

// ─── TableDelta ──────────────────────────────────────────────────────────────

/// A single contract-row mutation inside a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDelta {
    /// Contract account owning the table.
    pub contract: String,
    /// Table name.
    pub table: String,
    /// Table scope.
    pub scope: String,
    /// Row primary key.
    pub primary_key: u64,
    /// ABI-deserialized row, JSON encoded (hex on the wire).
    #[serde(default, with = "hex_payload")]
    pub payload: Option<Vec<u8>>,
    /// `false` when the row was removed.
    pub present: bool,
}

impl TableDelta {
    /// Returns `true` if this delta removes the row.
    pub fn is_removal(&self) -> bool {
        !self.present
    }

    /// Decode the row payload into its typed representation.
    pub fn decode_row<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        let bytes = self.payload.as_deref().ok_or_else(|| DecodeError::MalformedRow {
            table: self.table.clone(),
            reason: "payload is missing".into(),
        })?;
        serde_json::from_slice(bytes).map_err(|e| DecodeError::MalformedRow {
            table: self.table.clone(),
            reason: e.to_string(),
        })
    }
}

mod block_time {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(i64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Millis(ms) => Ok(ms),
            Raw::Text(text) => super::parse_eosio_timestamp(&text).map_err(serde::de::Error::custom),
        }
    }
}

mod hex_payload {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|h| hex::decode(h.trim_start_matches("0x")).map_err(serde::de::Error::custom))
            .transpose()
    }
}

// ─── Traces ──────────────────────────────────────────────────────────────────

/// Summary of a transaction trace carried alongside the block.
///
/// Table deltas already reflect the state effects; traces are kept for logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionTrace {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub action_count: u32,
}

// ─── Stream messages ─────────────────────────────────────────────────────────

/// Everything the feed delivers for one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMessage {
    pub block: ShipBlock,
    #[serde(default)]
    pub deltas: Vec<TableDelta>,
    #[serde(default)]
    pub traces: Vec<TransactionTrace>,
}

/// A message from the state-history feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    /// A new block to apply.
    Block(BlockMessage),
    /// The chain forked: every block `>= block_number` must be undone.
    Fork { block_number: u64 },
    /// Every block `<= block_number` is now final.
    Irreversible { block_number: u64 },
}

// ─── Tests ───────────────────────────────────────────────────────────────────
