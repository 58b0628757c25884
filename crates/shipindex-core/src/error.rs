//! Error types for the shipindex pipeline.

use thiserror::Error;

/// Errors that can occur during indexing.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Storage error: {0}")]
    Storage(String),

    /// Connection loss, timeouts, busy databases. The block is retried from scratch.
    #[error("Transient storage failure: {0}")]
    TransientStorage(String),

    #[error("Protocol violation in '{table}' at block {block_number}: {reason}")]
    ProtocolViolation {
        block_number: u64,
        table: String,
        reason: String,
    },

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Job '{job}' failed at block {block_number}: {source}")]
    JobFailed {
        job: String,
        block_number: u64,
        #[source]
        source: Box<IndexerError>,
    },

    #[error("Block {got} received out of order: expected {expected}")]
    OutOfOrder { expected: u64, got: u64 },

    #[error("Rollback to block {target} rejected: blocks up to {irreversible} are irreversible")]
    IrreversibleRollback { target: u64, irreversible: u64 },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if retrying the whole block from a clean slate may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientStorage(_) => true,
            Self::JobFailed { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Returns `true` if the error means the stored state and the chain disagree.
    ///
    /// These halt the pipeline at the current block until an operator intervenes.
    pub fn is_protocol_violation(&self) -> bool {
        match self {
            Self::ProtocolViolation { .. } | Self::Decode(_) => true,
            Self::JobFailed { source, .. } => source.is_protocol_violation(),
            _ => false,
        }
    }

    pub fn violation(
        block_number: u64,
        table: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::ProtocolViolation {
            block_number,
            table: table.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while decoding or encoding a versioned attribute payload.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Unexpected end of payload: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Varint overflows 64 bits")]
    VarintOverflow,

    #[error("Unknown attribute type '{0}'")]
    UnknownAttributeType(String),

    #[error("Attribute index {index} is not defined by schema '{schema}'")]
    UnknownAttributeIndex { schema: String, index: u64 },

    #[error("Attribute '{0}' is not defined by the schema")]
    UnknownAttribute(String),

    #[error("Attribute '{attribute}': expected {expected}")]
    TypeMismatch { attribute: String, expected: String },

    #[error("Value out of range for {ty}")]
    OutOfRange { ty: String },

    #[error("Invalid UTF-8 in string attribute")]
    InvalidUtf8,

    #[error("Malformed '{table}' row: {reason}")]
    MalformedRow { table: String, reason: String },
}
