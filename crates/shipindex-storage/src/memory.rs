//! In-memory storage backend.
//!
//! Keeps entity rows, the undo log and the checkpoint in RAM. A unit of work
//! operates on a private copy of the tables and swaps it in on commit, so an
//! aborted or dropped unit leaves no trace.
//!
//! Useful for testing and short-lived indexers that don't need persistence.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use shipindex_core::checkpoint::Checkpoint;
use shipindex_core::error::IndexerError;
use shipindex_core::types::ShipBlock;
use shipindex_core::writer::{
    key_of, BlockStore, ChangeNotification, ChangeOperation, CommitSummary, Filter, MutationKind,
    RollbackReport, Row, UndoEntry, UnitOfWork,
};

type Tables = BTreeMap<String, Vec<Row>>;

#[derive(Debug, Default)]
struct MemoryState {
    tables: Tables,
    undo: Vec<UndoEntry>,
    checkpoint: Option<Checkpoint>,
    /// Bumped on every commit, rollback and prune.
    generation: u64,
}

/// In-memory block store.
///
/// All data is lost when the process exits. Cloning shares the same state.
#[derive(Clone)]
pub struct InMemoryStorage {
    reader: String,
    state: Arc<Mutex<MemoryState>>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new("default")
    }
}

impl InMemoryStorage {
    pub fn new(reader: impl Into<String>) -> Self {
        Self {
            reader: reader.into(),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, IndexerError> {
        self.state
            .lock()
            .map_err(|_| IndexerError::Storage("memory store lock poisoned".into()))
    }

    /// Committed rows of `table` matching `filter`.
    pub fn rows(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, IndexerError> {
        let state = self.lock()?;
        Ok(state
            .tables
            .get(table)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default())
    }

    /// Committed undo entries, oldest first.
    pub fn undo_entries(&self) -> Result<Vec<UndoEntry>, IndexerError> {
        Ok(self.lock()?.undo.clone())
    }

    /// Snapshot of every non-empty table with rows in a canonical order.
    ///
    /// Two stores holding the same data produce equal dumps regardless of the
    /// order in which rows were written.
    pub fn dump(&self) -> Result<BTreeMap<String, Vec<Row>>, IndexerError> {
        let state = self.lock()?;
        Ok(state
            .tables
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(name, rows)| {
                let mut rows = rows.clone();
                rows.sort_by_cached_key(|r| serde_json::to_string(r).unwrap_or_default());
                (name.clone(), rows)
            })
            .collect())
    }
}

fn checkpoint_of<'a>(state: &'a mut MemoryState, reader: &str) -> &'a mut Checkpoint {
    state
        .checkpoint
        .get_or_insert_with(|| Checkpoint::empty(reader))
}

/// Revert a single mutation.
fn apply_undo(tables: &mut Tables, entry: &UndoEntry) {
    let rows = tables.entry(entry.table.clone()).or_default();
    if let Some(key) = &entry.key {
        let filter = Filter::by_key(key);
        rows.retain(|r| !filter.matches(r));
    }
    if let Some(previous) = &entry.previous {
        rows.push(previous.clone());
    }
}

#[async_trait]
impl BlockStore for InMemoryStorage {
    async fn begin(&self, block: &ShipBlock) -> Result<Box<dyn UnitOfWork>, IndexerError> {
        let state = self.lock()?;
        Ok(Box::new(MemoryUnit {
            store: self.clone(),
            block: block.clone(),
            base_generation: state.generation,
            tables: state.tables.clone(),
            undo: Vec::new(),
            notifications: Vec::new(),
            sequence: 0,
        }))
    }

    async fn rollback_to(&self, block_number: u64) -> Result<RollbackReport, IndexerError> {
        let mut state = self.lock()?;
        let (head, irreversible) = match &state.checkpoint {
            Some(cp) => (cp.head_block, cp.irreversible_block),
            None => (None, 0),
        };
        if block_number <= irreversible {
            return Err(IndexerError::IrreversibleRollback {
                target: block_number,
                irreversible,
            });
        }
        match head {
            Some(h) if block_number <= h => {}
            _ => return Ok(RollbackReport::noop(block_number, head)),
        }

        // Work on a copy so a failure leaves the committed state intact.
        let mut tables = state.tables.clone();
        let mut reverted: Vec<&UndoEntry> = state
            .undo
            .iter()
            .filter(|e| e.block_number >= block_number)
            .collect();
        reverted.sort_by_key(|e| std::cmp::Reverse((e.block_number, e.sequence)));

        let mut notifications = Vec::with_capacity(reverted.len());
        for entry in &reverted {
            apply_undo(&mut tables, entry);
            notifications.push(ChangeNotification::new(
                entry.block_number,
                &entry.table,
                ChangeOperation::Revert,
                entry.revert_keys(),
            ));
        }
        let count = reverted.len();

        state.tables = tables;
        state.undo.retain(|e| e.block_number < block_number);
        let cp = checkpoint_of(&mut state, &self.reader);
        cp.rewind(block_number);
        let head_block = cp.head_block;
        state.generation += 1;

        tracing::debug!(to = block_number, reverted = count, "memory store rolled back");
        Ok(RollbackReport {
            target: block_number,
            reverted: count,
            head_block,
            notifications,
        })
    }

    async fn prune_irreversible(&self, block_number: u64) -> Result<u64, IndexerError> {
        let mut state = self.lock()?;
        let before = state.undo.len();
        state.undo.retain(|e| e.block_number > block_number);
        let pruned = (before - state.undo.len()) as u64;
        checkpoint_of(&mut state, &self.reader).mark_irreversible(block_number);
        state.generation += 1;
        Ok(pruned)
    }

    async fn load_checkpoint(&self) -> Result<Option<Checkpoint>, IndexerError> {
        Ok(self.lock()?.checkpoint.clone())
    }
}

// ─── Unit of work ────────────────────────────────────────────────────────────

struct MemoryUnit {
    store: InMemoryStorage,
    block: ShipBlock,
    base_generation: u64,
    tables: Tables,
    undo: Vec<UndoEntry>,
    notifications: Vec<ChangeNotification>,
    sequence: u64,
}

impl MemoryUnit {
    fn record(
        &mut self,
        table: &str,
        operation: MutationKind,
        key: Option<Row>,
        previous: Option<Row>,
    ) {
        if !self.block.is_reversible {
            return;
        }
        self.undo.push(UndoEntry {
            block_number: self.block.number,
            sequence: self.sequence,
            table: table.to_string(),
            operation,
            key,
            previous,
        });
        self.sequence += 1;
    }

    fn notify(&mut self, table: &str, operation: ChangeOperation, keys: Row) {
        self.notifications
            .push(ChangeNotification::new(self.block.number, table, operation, keys));
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnit {
    fn block(&self) -> &ShipBlock {
        &self.block
    }

    async fn insert(
        &mut self,
        table: &str,
        rows: Vec<Row>,
        key_columns: &[&str],
    ) -> Result<(), IndexerError> {
        for row in rows {
            let key = key_of(table, &row, key_columns)?;
            let filter = Filter::by_key(&key);
            let stored = self.tables.entry(table.to_string()).or_default();
            if stored.iter().any(|r| filter.matches(r)) {
                return Err(IndexerError::Storage(format!(
                    "duplicate key {} in '{table}'",
                    serde_json::Value::Object(key.into_iter().collect())
                )));
            }
            stored.push(row);
            self.record(table, MutationKind::Insert, Some(key.clone()), None);
            self.notify(table, ChangeOperation::Insert, key);
        }
        Ok(())
    }

    async fn replace(
        &mut self,
        table: &str,
        row: Row,
        key_columns: &[&str],
        excluded: &[&str],
    ) -> Result<(), IndexerError> {
        let key = key_of(table, &row, key_columns)?;
        let filter = Filter::by_key(&key);
        let stored = self.tables.entry(table.to_string()).or_default();

        match stored.iter_mut().find(|r| filter.matches(r)) {
            Some(existing) => {
                let previous = existing.clone();
                // Columns absent from `row` keep their stored value.
                for (col, value) in row {
                    if !excluded.contains(&col.as_str()) {
                        existing.insert(col, value);
                    }
                }
                self.record(table, MutationKind::Replace, Some(key.clone()), Some(previous));
                self.notify(table, ChangeOperation::Update, key);
            }
            None => {
                stored.push(row);
                self.record(table, MutationKind::Replace, Some(key.clone()), None);
                self.notify(table, ChangeOperation::Insert, key);
            }
        }
        Ok(())
    }

    async fn update(
        &mut self,
        table: &str,
        values: Row,
        filter: &Filter,
        key_columns: &[&str],
    ) -> Result<u64, IndexerError> {
        let mut changed = Vec::new();
        if let Some(stored) = self.tables.get_mut(table) {
            for existing in stored.iter_mut().filter(|r| filter.matches(r)) {
                let previous = existing.clone();
                for (col, value) in &values {
                    existing.insert(col.clone(), value.clone());
                }
                changed.push((key_of(table, existing, key_columns)?, previous));
            }
        }
        let count = changed.len() as u64;
        for (key, previous) in changed {
            self.record(table, MutationKind::Update, Some(key.clone()), Some(previous));
            self.notify(table, ChangeOperation::Update, key);
        }
        Ok(count)
    }

    async fn delete(
        &mut self,
        table: &str,
        filter: &Filter,
        key_columns: &[&str],
    ) -> Result<u64, IndexerError> {
        let Some(stored) = self.tables.get_mut(table) else {
            return Ok(0);
        };
        let (removed, kept): (Vec<Row>, Vec<Row>) =
            std::mem::take(stored).into_iter().partition(|r| filter.matches(r));
        *stored = kept;

        let count = removed.len() as u64;
        for previous in removed {
            let key = key_of(table, &previous, key_columns)?;
            self.record(table, MutationKind::Delete, None, Some(previous));
            self.notify(table, ChangeOperation::Delete, key);
        }
        Ok(count)
    }

    async fn select(&mut self, table: &str, filter: &Filter) -> Result<Vec<Row>, IndexerError> {
        Ok(self
            .tables
            .get(table)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default())
    }

    async fn commit(self: Box<Self>) -> Result<CommitSummary, IndexerError> {
        let unit = *self;
        let mut state = unit.store.lock()?;
        if state.generation != unit.base_generation {
            return Err(IndexerError::Storage(format!(
                "block {} was staged against a stale snapshot",
                unit.block.number
            )));
        }

        let undo_entries = unit.undo.len();
        state.tables = unit.tables;
        state.undo.extend(unit.undo);
        checkpoint_of(&mut state, &unit.store.reader).commit(&unit.block);
        state.generation += 1;

        Ok(CommitSummary {
            block_number: unit.block.number,
            undo_entries,
            notifications: unit.notifications,
        })
    }

    async fn abort(self: Box<Self>) -> Result<(), IndexerError> {
        tracing::trace!(block = self.block.number, "memory unit discarded");
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
