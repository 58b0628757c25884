//! Schema specs and the schema registry.
//!
//! A [`SchemaSpec`] describes the field layout of an opaque attribute blob.
//! The layout itself lives on-chain (e.g. a contract's `config` or `schemas`
//! table), so the registry is filled by the jobs that observe those tables and
//! read by every job that decodes a payload.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

// ─── AttributeType ───────────────────────────────────────────────────────────

/// The closed set of attribute types a schema can declare.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AttributeType {
    /// Signed integer, zigzag varint encoded. Width in bits.
    Int(u8),
    /// Unsigned integer, varint encoded. Width in bits.
    Uint(u8),
    /// Unsigned integer, fixed-width little endian. Width in bits.
    Fixed(u8),
    Float,
    Double,
    String,
    /// Image reference (URL or hash), stored as a string.
    Image,
    /// IPFS multihash. Raw bytes on the wire, base58 text once decoded.
    Ipfs,
    Bool,
    /// Opaque byte string, hex text once decoded.
    Bytes,
    Array(Box<AttributeType>),
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(bits) => write!(f, "int{bits}"),
            Self::Uint(bits) => write!(f, "uint{bits}"),
            Self::Fixed(bits) => write!(f, "fixed{bits}"),
            Self::Float => write!(f, "float"),
            Self::Double => write!(f, "double"),
            Self::String => write!(f, "string"),
            Self::Image => write!(f, "image"),
            Self::Ipfs => write!(f, "ipfs"),
            Self::Bool => write!(f, "bool"),
            Self::Bytes => write!(f, "bytes"),
            Self::Array(inner) => write!(f, "{inner}[]"),
        }
    }
}

impl FromStr for AttributeType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(inner) = s.strip_suffix("[]") {
            return Ok(Self::Array(Box::new(inner.parse()?)));
        }
        let sized = |prefix: &str| -> Option<u8> {
            match s.strip_prefix(prefix)? {
                "8" => Some(8),
                "16" => Some(16),
                "32" => Some(32),
                "64" => Some(64),
                _ => None,
            }
        };
        if let Some(bits) = sized("uint") {
            return Ok(Self::Uint(bits));
        }
        if let Some(bits) = sized("int") {
            return Ok(Self::Int(bits));
        }
        if let Some(bits) = sized("fixed") {
            return Ok(Self::Fixed(bits));
        }
        match s {
            "float" => Ok(Self::Float),
            "double" => Ok(Self::Double),
            "string" => Ok(Self::String),
            "image" => Ok(Self::Image),
            "ipfs" => Ok(Self::Ipfs),
            "bool" => Ok(Self::Bool),
            "bytes" => Ok(Self::Bytes),
            other => Err(DecodeError::UnknownAttributeType(other.to_string())),
        }
    }
}

// ─── SchemaSpec ──────────────────────────────────────────────────────────────

/// One `{name, type}` entry of an on-chain format definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

impl FormatEntry {
    pub fn new(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
        }
    }
}

/// A single typed attribute of a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeDescriptor {
    pub name: String,
    pub ty: AttributeType,
}

/// Named, ordered list of attribute descriptors.
///
/// The position of an attribute is part of the wire format, so specs are
/// only ever replaced as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaSpec {
    pub name: String,
    pub attributes: Vec<AttributeDescriptor>,
}

impl SchemaSpec {
    /// Build a spec from an on-chain format definition.
    ///
    /// Fails on the first attribute with an unknown type.
    pub fn from_format(name: impl Into<String>, format: &[FormatEntry]) -> Result<Self, DecodeError> {
        let attributes = format
            .iter()
            .map(|entry| {
                Ok(AttributeDescriptor {
                    name: entry.name.clone(),
                    ty: entry.ty.parse()?,
                })
            })
            .collect::<Result<Vec<_>, DecodeError>>()?;
        Ok(Self {
            name: name.into(),
            attributes,
        })
    }

    /// Render the spec back into its on-chain format definition.
    pub fn to_format(&self) -> Vec<FormatEntry> {
        self.attributes
            .iter()
            .map(|a| FormatEntry::new(a.name.clone(), a.ty.to_string()))
            .collect()
    }

    /// Returns the attribute at wire position `index`.
    pub fn attribute(&self, index: usize) -> Option<&AttributeDescriptor> {
        self.attributes.get(index)
    }

    /// Returns the wire position and descriptor of the attribute called `name`.
    pub fn position(&self, name: &str) -> Option<(usize, &AttributeDescriptor)> {
        self.attributes.iter().enumerate().find(|(_, a)| a.name == name)
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Lookup key of a spec: owning contract, scope (e.g. a collection) and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaKey {
    pub contract: String,
    pub scope: String,
    pub name: String,
}

impl SchemaKey {
    pub fn new(contract: impl Into<String>, scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            contract: contract.into(),
            scope: scope.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SchemaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.contract, self.scope, self.name)
    }
}

/// Thread-safe registry of the current spec for every key.
///
/// Single writer (the control job of a block), many readers. A write swaps
/// the whole `Arc`, so readers holding an older spec are never affected.
#[derive(Default)]
pub struct SchemaRegistry {
    specs: RwLock<HashMap<SchemaKey, Arc<SchemaSpec>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current spec for `key`, if known.
    pub fn get(&self, key: &SchemaKey) -> Option<Arc<SchemaSpec>> {
        self.specs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Install `spec` as the current spec for `key`, replacing any previous one.
    pub fn put(&self, key: SchemaKey, spec: SchemaSpec) -> Arc<SchemaSpec> {
        let spec = Arc::new(spec);
        tracing::debug!(key = %key, attributes = spec.attributes.len(), "schema registered");
        self.specs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, spec.clone());
        spec
    }

    /// Forget every cached spec. They are re-read from storage on next use.
    pub fn clear(&self) {
        let mut specs = self.specs.write().unwrap_or_else(PoisonError::into_inner);
        if !specs.is_empty() {
            tracing::debug!(cached = specs.len(), "schema registry cleared");
        }
        specs.clear();
    }

    pub fn len(&self) -> usize {
        self.specs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
