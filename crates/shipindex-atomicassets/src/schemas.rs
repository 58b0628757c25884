//! Resolution of attribute schemas through the registry, falling back to
//! the rows that define them.
//!
//! The registry only caches what storage holds. A miss (fresh process, or a
//! registry cleared after a rollback) reads the defining row through the
//! current unit of work, so staged writes of earlier jobs in the same block
//! are visible.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use shipindex_core::error::IndexerError;
use shipindex_core::schema::{FormatEntry, SchemaKey, SchemaRegistry, SchemaSpec};
use shipindex_core::writer::{Filter, UnitOfWork};

pub const CONFIG_TABLE: &str = "atomicassets_config";
pub const SCHEMAS_TABLE: &str = "atomicassets_schemas";

const COLLECTION_FORMAT: &str = "collection_format";

/// Registry key of the collection attribute format of `contract`.
pub fn collection_format_key(contract: &str) -> SchemaKey {
    SchemaKey::new(contract, "", COLLECTION_FORMAT)
}

/// Registry key of schema `schema` in `collection`.
pub fn schema_key(contract: &str, collection: &str, schema: &str) -> SchemaKey {
    SchemaKey::new(contract, collection, schema)
}

/// Read a JSON column back into `T`.
///
/// Backends that lack a JSON type hand arrays and objects back as text.
pub fn json_column<T: DeserializeOwned>(table: &str, column: &str, value: &Value) -> Result<T, IndexerError> {
    let parsed = match value {
        Value::String(text) => serde_json::from_str(text),
        other => serde_json::from_value(other.clone()),
    };
    parsed.map_err(|e| IndexerError::Storage(format!("column {table}.{column} is not valid JSON: {e}")))
}

fn build(block: u64, table: &str, name: &str, format: &[FormatEntry]) -> Result<SchemaSpec, IndexerError> {
    SchemaSpec::from_format(name, format)
        .map_err(|e| IndexerError::violation(block, table, format!("format of '{name}': {e}")))
}

/// Register the collection format of `contract`.
pub fn register_collection_format(
    registry: &SchemaRegistry,
    block: u64,
    contract: &str,
    format: &[FormatEntry],
) -> Result<Arc<SchemaSpec>, IndexerError> {
    let spec = build(block, CONFIG_TABLE, COLLECTION_FORMAT, format)?;
    Ok(registry.put(collection_format_key(contract), spec))
}

/// Register schema `schema` of `collection`.
pub fn register_schema(
    registry: &SchemaRegistry,
    block: u64,
    contract: &str,
    collection: &str,
    schema: &str,
    format: &[FormatEntry],
) -> Result<Arc<SchemaSpec>, IndexerError> {
    let spec = build(block, SCHEMAS_TABLE, schema, format)?;
    Ok(registry.put(schema_key(contract, collection, schema), spec))
}

/// Resolve the collection format of `contract`.
///
/// A contract without a config row cannot have collections.
pub async fn collection_format(
    uow: &mut dyn UnitOfWork,
    registry: &SchemaRegistry,
    contract: &str,
) -> Result<Arc<SchemaSpec>, IndexerError> {
    if let Some(spec) = registry.get(&collection_format_key(contract)) {
        return Ok(spec);
    }
    let block = uow.block().number;
    let rows = uow
        .select(CONFIG_TABLE, &Filter::all().eq("contract", contract))
        .await?;
    let format = rows
        .first()
        .and_then(|row| row.get(COLLECTION_FORMAT))
        .filter(|v| !v.is_null())
        .ok_or_else(|| {
            IndexerError::violation(block, "collections", format!("no collection format stored for '{contract}'"))
        })?;
    let format: Vec<FormatEntry> = json_column(CONFIG_TABLE, COLLECTION_FORMAT, format)?;
    tracing::debug!(contract, attributes = format.len(), "collection format loaded from storage");
    register_collection_format(registry, block, contract, &format)
}

/// Resolve schema `schema` of `collection`. `table` names the table whose
/// row needs it, for the error.
pub async fn collection_schema(
    uow: &mut dyn UnitOfWork,
    registry: &SchemaRegistry,
    contract: &str,
    collection: &str,
    schema: &str,
    table: &str,
) -> Result<Arc<SchemaSpec>, IndexerError> {
    if let Some(spec) = registry.get(&schema_key(contract, collection, schema)) {
        return Ok(spec);
    }
    let block = uow.block().number;
    let filter = Filter::all()
        .eq("contract", contract)
        .eq("collection_name", collection)
        .eq("schema_name", schema);
    let rows = uow.select(SCHEMAS_TABLE, &filter).await?;
    let format = rows.first().and_then(|row| row.get("format")).ok_or_else(|| {
        IndexerError::violation(block, table, format!("schema '{collection}/{schema}' not found"))
    })?;
    let format: Vec<FormatEntry> = json_column(SCHEMAS_TABLE, "format", format)?;
    tracing::debug!(collection, schema, "schema loaded from storage");
    register_schema(registry, block, contract, collection, schema, &format)
}
