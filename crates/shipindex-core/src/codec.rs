//! Decoded attribute values and the payload codec seam.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::schema::SchemaSpec;

/// A single decoded attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Str(String),
    Array(Vec<AttributeValue>),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// JSON projection used when the value is stored in a row.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            // u64 above i64::MAX would not survive an INTEGER column.
            Self::Uint(u) if *u > i64::MAX as u64 => serde_json::Value::String(u.to_string()),
            Self::Uint(u) => serde_json::Value::from(*u),
            Self::Float(f) => serde_json::Value::from(*f),
            Self::Str(s) => serde_json::Value::String(s.clone()),
            Self::Array(items) => serde_json::Value::Array(items.iter().map(Self::to_json).collect()),
        }
    }
}

/// Decoded attributes in wire order.
pub type AttributeMap = IndexMap<String, AttributeValue>;

/// Convert a decoded map into a JSON object.
pub fn attributes_to_json(map: &AttributeMap) -> serde_json::Value {
    serde_json::Value::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
}

/// Decodes and encodes versioned attribute payloads against a [`SchemaSpec`].
///
/// Implementations are pure and stateless; the schema to use is always passed in.
pub trait PayloadCodec: Send + Sync {
    fn decode(&self, bytes: &[u8], spec: &SchemaSpec) -> Result<AttributeMap, DecodeError>;

    fn encode(&self, values: &AttributeMap, spec: &SchemaSpec) -> Result<Vec<u8>, DecodeError>;
}
