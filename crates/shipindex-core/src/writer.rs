//! The transactional writer contract.
//!
//! Every block is applied through one [`UnitOfWork`] opened by a
//! [`BlockStore`]. Mutations staged on a unit are invisible to everybody else
//! until [`UnitOfWork::commit`] succeeds; dropping the unit discards them.
//!
//! While a block is reversible each mutation also records an [`UndoEntry`]
//! holding the information needed to revert it. [`BlockStore::rollback_to`]
//! replays those entries newest first, and
//! [`BlockStore::prune_irreversible`] drops them once finality is reached.
//!
//! ```text
//! operation        key               previous        undo action
//! insert           new row key       absent          delete by key
//! replace (new)    row key           absent          delete by key
//! replace (over)   row key           prior row       delete by key, reinsert prior
//! update           post-update key   prior row       delete by key, reinsert prior
//! delete           absent            prior row       reinsert prior
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;
use crate::error::IndexerError;
use crate::types::ShipBlock;

/// A stored row: column name to JSON value, ordered by column name.
pub type Row = BTreeMap<String, serde_json::Value>;

/// Project `row` onto `key_columns`.
///
/// Fails if the row does not carry one of the key columns.
pub fn key_of(table: &str, row: &Row, key_columns: &[&str]) -> Result<Row, IndexerError> {
    key_columns
        .iter()
        .map(|col| {
            row.get(*col)
                .map(|v| (col.to_string(), v.clone()))
                .ok_or_else(|| {
                    IndexerError::Storage(format!("row for '{table}' is missing key column '{col}'"))
                })
        })
        .collect()
}

// ─── Filters ─────────────────────────────────────────────────────────────────

/// One predicate of a [`Filter`].
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `column = value`
    Eq(String, serde_json::Value),
    /// `column NOT IN (values)`; an empty list matches every row.
    NotIn(String, Vec<serde_json::Value>),
    /// `column IS NULL`
    IsNull(String),
}

impl Condition {
    pub fn column(&self) -> &str {
        match self {
            Self::Eq(c, _) | Self::NotIn(c, _) | Self::IsNull(c) => c,
        }
    }

    fn matches(&self, row: &Row) -> bool {
        let value = row.get(self.column()).unwrap_or(&serde_json::Value::Null);
        match self {
            // SQL semantics: NULL never compares equal.
            Self::Eq(_, expected) => !value.is_null() && value == expected,
            Self::NotIn(_, values) => !value.is_null() && !values.contains(value),
            Self::IsNull(_) => value.is_null(),
        }
    }
}

/// Conjunction of conditions, evaluated identically by every backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    /// A filter matching every row.
    pub fn all() -> Self {
        Self::default()
    }

    /// Equality filter on every column of `key`.
    pub fn by_key(key: &Row) -> Self {
        Self {
            conditions: key
                .iter()
                .map(|(c, v)| Condition::Eq(c.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.conditions.push(Condition::Eq(column.into(), value.into()));
        self
    }

    pub fn not_in<V: Into<serde_json::Value>>(
        mut self,
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.conditions.push(Condition::NotIn(
            column.into(),
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn is_null(mut self, column: impl Into<String>) -> Self {
        self.conditions.push(Condition::IsNull(column.into()));
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Returns `true` if `row` satisfies every condition.
    pub fn matches(&self, row: &Row) -> bool {
        self.conditions.iter().all(|c| c.matches(row))
    }
}

// ─── Undo log ────────────────────────────────────────────────────────────────

/// The kind of mutation an undo entry reverts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Insert,
    Replace,
    Update,
    Delete,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Replace => "replace",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationKind {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(Self::Insert),
            "replace" => Ok(Self::Replace),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(IndexerError::Storage(format!("unknown undo operation '{other}'"))),
        }
    }
}

/// Record of one mutation applied while its block was reversible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoEntry {
    pub block_number: u64,
    /// Position of the mutation within its block.
    pub sequence: u64,
    pub table: String,
    pub operation: MutationKind,
    /// Key of the row after the mutation. Absent for deletes.
    pub key: Option<Row>,
    /// Full row image before the mutation. Absent for fresh inserts.
    pub previous: Option<Row>,
}

impl UndoEntry {
    /// Keys reported to subscribers when this entry is reverted.
    pub fn revert_keys(&self) -> Row {
        self.key
            .clone()
            .or_else(|| self.previous.clone())
            .unwrap_or_default()
    }
}

// ─── Notifications ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
    /// A mutation of a rolled-back block was undone.
    Revert,
}

/// Emitted once per committed mutation, after the commit succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub block_number: u64,
    pub table: String,
    pub operation: ChangeOperation,
    pub keys: Row,
}

impl ChangeNotification {
    pub fn new(block_number: u64, table: &str, operation: ChangeOperation, keys: Row) -> Self {
        Self {
            block_number,
            table: table.to_string(),
            operation,
            keys,
        }
    }
}

/// Result of a successful commit.
#[derive(Debug, Clone, Default)]
pub struct CommitSummary {
    pub block_number: u64,
    /// Undo entries persisted with the block (zero for irreversible blocks).
    pub undo_entries: usize,
    pub notifications: Vec<ChangeNotification>,
}

/// Result of [`BlockStore::rollback_to`].
#[derive(Debug, Clone, Default)]
pub struct RollbackReport {
    pub target: u64,
    /// Number of undo entries replayed.
    pub reverted: usize,
    /// Head after the rollback, `None` if nothing remains.
    pub head_block: Option<u64>,
    pub notifications: Vec<ChangeNotification>,
}

impl RollbackReport {
    /// A rollback that found nothing to undo.
    pub fn noop(target: u64, head_block: Option<u64>) -> Self {
        Self {
            target,
            reverted: 0,
            head_block,
            notifications: vec![],
        }
    }
}

// ─── Traits ──────────────────────────────────────────────────────────────────

/// Staged mutations of a single block.
///
/// Reads through [`select`](UnitOfWork::select) observe the unit's own staged
/// writes.
#[async_trait]
pub trait UnitOfWork: Send {
    /// The block this unit applies. Its `is_reversible` flag decides whether
    /// undo entries are recorded.
    fn block(&self) -> &ShipBlock;

    /// Insert one or more rows. A duplicate key is a storage error.
    async fn insert(
        &mut self,
        table: &str,
        rows: Vec<Row>,
        key_columns: &[&str],
    ) -> Result<(), IndexerError>;

    /// Insert `row`, or overwrite the row with the same key.
    ///
    /// On overwrite the `excluded` columns keep their stored value.
    async fn replace(
        &mut self,
        table: &str,
        row: Row,
        key_columns: &[&str],
        excluded: &[&str],
    ) -> Result<(), IndexerError>;

    /// Set `values` on every row matching `filter`. Returns the number of rows changed.
    async fn update(
        &mut self,
        table: &str,
        values: Row,
        filter: &Filter,
        key_columns: &[&str],
    ) -> Result<u64, IndexerError>;

    /// Remove every row matching `filter`. Returns the number of rows removed.
    ///
    /// `key_columns` only shapes the change notifications.
    async fn delete(
        &mut self,
        table: &str,
        filter: &Filter,
        key_columns: &[&str],
    ) -> Result<u64, IndexerError>;

    async fn select(&mut self, table: &str, filter: &Filter) -> Result<Vec<Row>, IndexerError>;

    /// Atomically apply every staged mutation, the undo entries and the new
    /// checkpoint head.
    async fn commit(self: Box<Self>) -> Result<CommitSummary, IndexerError>;

    /// Discard every staged mutation.
    async fn abort(self: Box<Self>) -> Result<(), IndexerError>;
}

/// Durable storage that applies blocks and undoes reversible ones.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Open a unit of work for `block`.
    async fn begin(&self, block: &ShipBlock) -> Result<Box<dyn UnitOfWork>, IndexerError>;

    /// Undo every mutation of blocks `>= block_number`, newest first, and move
    /// the head to `block_number - 1`.
    ///
    /// A target above the head is a no-op. A target at or below the
    /// irreversible mark is rejected.
    async fn rollback_to(&self, block_number: u64) -> Result<RollbackReport, IndexerError>;

    /// Drop undo entries of blocks `<= block_number` and raise the
    /// irreversible mark. Entity rows are never touched. Returns the number of
    /// entries removed.
    async fn prune_irreversible(&self, block_number: u64) -> Result<u64, IndexerError>;

    /// The persisted position of this store's reader.
    async fn load_checkpoint(&self) -> Result<Option<Checkpoint>, IndexerError>;
}
