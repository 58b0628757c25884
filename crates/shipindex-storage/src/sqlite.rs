//! SQLite storage backend for shipindex.
//!
//! Every block is applied inside one SQLite transaction. Entity rows, undo
//! entries and the checkpoint head are written through that transaction, so
//! a crash at any point leaves either the whole block or nothing.
//!
//! Entity tables are created by the contract modules through
//! [`SqliteStorage::run_migrations`]; this backend only owns the undo log and
//! the checkpoint table.
//!
//! # Usage
//! ```rust,no_run
//! use shipindex_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./index.db").await?.with_reader("atomicassets-1");
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row as _, Sqlite, Transaction, TypeInfo, ValueRef};
use tracing::debug;

use shipindex_core::checkpoint::Checkpoint;
use shipindex_core::error::IndexerError;
use shipindex_core::types::ShipBlock;
use shipindex_core::writer::{
    key_of, BlockStore, ChangeNotification, ChangeOperation, CommitSummary, Condition, Filter,
    MutationKind, RollbackReport, Row, UndoEntry, UnitOfWork,
};

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

const UNDO_TABLE: &str = "shipindex_undo_log";

/// SQLite-backed block store.
pub struct SqliteStorage {
    pool: SqlitePool,
    reader: String,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./index.db"`) or a full
    /// SQLite URL (`"sqlite:./index.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;

        let storage = Self {
            pool,
            reader: "default".into(),
        };
        storage.init_schema(true).await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// All data is lost when the pool is dropped. Ideal for tests. The pool
    /// holds a single connection that is never recycled, since every
    /// connection to `sqlite::memory:` is a separate database.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let storage = Self {
            pool,
            reader: "default".into(),
        };
        storage.init_schema(false).await?;
        Ok(storage)
    }

    /// Set the reader name used as the checkpoint key.
    pub fn with_reader(mut self, reader: impl Into<String>) -> Self {
        self.reader = reader.into();
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Execute DDL statements (e.g. a contract module's table definitions).
    pub async fn run_migrations(&self, statements: &[&str]) -> Result<(), IndexerError> {
        for stmt in statements {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        }
        debug!(statements = statements.len(), "migrations applied");
        Ok(())
    }

    /// Committed rows of `table` matching `filter`.
    pub async fn rows(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, IndexerError> {
        let mut conn = self.pool.acquire().await.map_err(storage_err)?;
        fetch_rows(&mut conn, table, filter).await
    }

    /// Committed undo entries, oldest first.
    pub async fn undo_entries(&self) -> Result<Vec<UndoEntry>, IndexerError> {
        let mut conn = self.pool.acquire().await.map_err(storage_err)?;
        fetch_undo(&mut conn, 0, false).await
    }

    /// Create the undo log and checkpoint tables, optionally enabling WAL mode.
    async fn init_schema(&self, wal: bool) -> Result<(), IndexerError> {
        if wal {
            // WAL lets readers proceed during a block commit.
            sqlx::query("PRAGMA journal_mode=WAL;")
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        }

        self.run_migrations(&[
            "CREATE TABLE IF NOT EXISTS shipindex_undo_log (
                block_number  INTEGER NOT NULL,
                seq           INTEGER NOT NULL,
                tbl           TEXT    NOT NULL,
                operation     TEXT    NOT NULL,
                key_json      TEXT,
                previous_json TEXT,
                PRIMARY KEY (block_number, seq)
            );",
            "CREATE TABLE IF NOT EXISTS shipindex_checkpoints (
                reader             TEXT    NOT NULL PRIMARY KEY,
                head_block         INTEGER,
                head_id            TEXT,
                irreversible_block INTEGER NOT NULL DEFAULT 0,
                updated_at         INTEGER NOT NULL
            );",
        ])
        .await
    }
}

// ─── Error mapping ───────────────────────────────────────────────────────────

/// Map a sqlx error, flagging the ones worth retrying the block for.
fn storage_err(e: sqlx::Error) -> IndexerError {
    let transient = match &e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => {
            let msg = db.message();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    };
    if transient {
        IndexerError::TransientStorage(e.to_string())
    } else {
        IndexerError::Storage(e.to_string())
    }
}

// ─── SQL helpers ─────────────────────────────────────────────────────────────

/// Quote an identifier. Only ASCII alphanumerics and `_` are accepted.
fn ident(name: &str) -> Result<String, IndexerError> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(IndexerError::Storage(format!("invalid identifier '{name}'")));
    }
    Ok(format!("\"{name}\""))
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => query.bind(i),
            // u64 beyond i64::MAX is kept exact as text.
            (None, _) if n.is_u64() => query.bind(n.to_string()),
            (None, Some(f)) => query.bind(f),
            (None, None) => query.bind(n.to_string()),
        },
        Value::String(s) => query.bind(s.clone()),
        Value::Array(_) | Value::Object(_) => query.bind(value.to_string()),
    }
}

fn bind_all<'q>(mut query: SqliteQuery<'q>, values: &[Value]) -> SqliteQuery<'q> {
    for v in values {
        query = bind_value(query, v);
    }
    query
}

/// Render `filter` as a `WHERE` clause plus its bind values.
fn render_where(filter: &Filter) -> Result<(String, Vec<Value>), IndexerError> {
    let mut clauses = Vec::with_capacity(filter.conditions().len());
    let mut params = Vec::new();
    for condition in filter.conditions() {
        let col = ident(condition.column())?;
        match condition {
            Condition::Eq(_, v) => {
                clauses.push(format!("{col} = ?"));
                params.push(v.clone());
            }
            Condition::NotIn(_, values) if values.is_empty() => {
                clauses.push(format!("{col} IS NOT NULL"));
            }
            Condition::NotIn(_, values) => {
                let marks = vec!["?"; values.len()].join(", ");
                clauses.push(format!("{col} NOT IN ({marks})"));
                params.extend(values.iter().cloned());
            }
            Condition::IsNull(_) => clauses.push(format!("{col} IS NULL")),
        }
    }
    if clauses.is_empty() {
        return Ok(("1 = 1".into(), params));
    }
    Ok((clauses.join(" AND "), params))
}

/// Convert a result row into a JSON row, column by column.
fn row_to_json(row: &SqliteRow) -> Result<Row, IndexerError> {
    let mut out = Row::new();
    for column in row.columns() {
        let i = column.ordinal();
        let raw = row.try_get_raw(i).map_err(storage_err)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let ty = raw.type_info().name().to_string();
            match ty.as_str() {
                "INTEGER" => Value::from(row.try_get::<i64, _>(i).map_err(storage_err)?),
                "REAL" => Value::from(row.try_get::<f64, _>(i).map_err(storage_err)?),
                "BLOB" => Value::String(hex::encode(
                    row.try_get::<Vec<u8>, _>(i).map_err(storage_err)?,
                )),
                _ => Value::String(row.try_get::<String, _>(i).map_err(storage_err)?),
            }
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

async fn fetch_rows(
    conn: &mut SqliteConnection,
    table: &str,
    filter: &Filter,
) -> Result<Vec<Row>, IndexerError> {
    let (clause, params) = render_where(filter)?;
    let sql = format!("SELECT * FROM {} WHERE {clause}", ident(table)?);
    let rows = bind_all(sqlx::query(&sql), &params)
        .fetch_all(&mut *conn)
        .await
        .map_err(storage_err)?;
    rows.iter().map(row_to_json).collect()
}

async fn insert_row(conn: &mut SqliteConnection, table: &str, row: &Row) -> Result<(), IndexerError> {
    let columns = row.keys().map(|c| ident(c)).collect::<Result<Vec<_>, _>>()?;
    let marks = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({marks})",
        ident(table)?,
        columns.join(", ")
    );
    let values: Vec<Value> = row.values().cloned().collect();
    bind_all(sqlx::query(&sql), &values)
        .execute(&mut *conn)
        .await
        .map_err(storage_err)?;
    Ok(())
}

async fn update_rows(
    conn: &mut SqliteConnection,
    table: &str,
    values: &Row,
    filter: &Filter,
) -> Result<u64, IndexerError> {
    if values.is_empty() {
        return Ok(0);
    }
    let sets = values
        .keys()
        .map(|c| Ok(format!("{} = ?", ident(c)?)))
        .collect::<Result<Vec<_>, IndexerError>>()?;
    let (clause, params) = render_where(filter)?;
    let sql = format!("UPDATE {} SET {} WHERE {clause}", ident(table)?, sets.join(", "));

    let mut binds: Vec<Value> = values.values().cloned().collect();
    binds.extend(params);
    let result = bind_all(sqlx::query(&sql), &binds)
        .execute(&mut *conn)
        .await
        .map_err(storage_err)?;
    Ok(result.rows_affected())
}

async fn delete_rows(conn: &mut SqliteConnection, table: &str, filter: &Filter) -> Result<u64, IndexerError> {
    let (clause, params) = render_where(filter)?;
    let sql = format!("DELETE FROM {} WHERE {clause}", ident(table)?);
    let result = bind_all(sqlx::query(&sql), &params)
        .execute(&mut *conn)
        .await
        .map_err(storage_err)?;
    Ok(result.rows_affected())
}

fn row_json(row: &Option<Row>) -> Result<Option<String>, IndexerError> {
    row.as_ref()
        .map(|r| serde_json::to_string(r).map_err(|e| IndexerError::Storage(e.to_string())))
        .transpose()
}

fn parse_row_json(raw: Option<String>) -> Result<Option<Row>, IndexerError> {
    raw.map(|s| serde_json::from_str(&s).map_err(|e| IndexerError::Storage(format!("corrupt undo entry: {e}"))))
        .transpose()
}

async fn write_undo(conn: &mut SqliteConnection, entry: &UndoEntry) -> Result<(), IndexerError> {
    sqlx::query(
        "INSERT INTO shipindex_undo_log
         (block_number, seq, tbl, operation, key_json, previous_json)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(entry.block_number as i64)
    .bind(entry.sequence as i64)
    .bind(&entry.table)
    .bind(entry.operation.as_str())
    .bind(row_json(&entry.key)?)
    .bind(row_json(&entry.previous)?)
    .execute(&mut *conn)
    .await
    .map_err(storage_err)?;
    Ok(())
}

/// Undo entries of blocks `>= from`, oldest first or newest first.
async fn fetch_undo(
    conn: &mut SqliteConnection,
    from: u64,
    newest_first: bool,
) -> Result<Vec<UndoEntry>, IndexerError> {
    let order = if newest_first { "DESC" } else { "ASC" };
    let sql = format!(
        "SELECT block_number, seq, tbl, operation, key_json, previous_json
         FROM {UNDO_TABLE} WHERE block_number >= ?
         ORDER BY block_number {order}, seq {order}"
    );
    let rows = sqlx::query(&sql)
        .bind(from as i64)
        .fetch_all(&mut *conn)
        .await
        .map_err(storage_err)?;

    rows.into_iter()
        .map(|r| {
            Ok(UndoEntry {
                block_number: r.try_get::<i64, _>("block_number").map_err(storage_err)? as u64,
                sequence: r.try_get::<i64, _>("seq").map_err(storage_err)? as u64,
                table: r.try_get("tbl").map_err(storage_err)?,
                operation: r.try_get::<String, _>("operation").map_err(storage_err)?.parse()?,
                key: parse_row_json(r.try_get("key_json").map_err(storage_err)?)?,
                previous: parse_row_json(r.try_get("previous_json").map_err(storage_err)?)?,
            })
        })
        .collect()
}

async fn load_checkpoint_in(
    conn: &mut SqliteConnection,
    reader: &str,
) -> Result<Option<Checkpoint>, IndexerError> {
    let row = sqlx::query(
        "SELECT reader, head_block, head_id, irreversible_block, updated_at
         FROM shipindex_checkpoints WHERE reader = ?",
    )
    .bind(reader)
    .fetch_optional(&mut *conn)
    .await
    .map_err(storage_err)?;

    row.map(|r| {
        Ok(Checkpoint {
            reader: r.try_get("reader").map_err(storage_err)?,
            head_block: r
                .try_get::<Option<i64>, _>("head_block")
                .map_err(storage_err)?
                .map(|n| n as u64),
            head_id: r.try_get("head_id").map_err(storage_err)?,
            irreversible_block: r.try_get::<i64, _>("irreversible_block").map_err(storage_err)? as u64,
            updated_at: r.try_get("updated_at").map_err(storage_err)?,
        })
    })
    .transpose()
}

async fn save_checkpoint_in(conn: &mut SqliteConnection, cp: &Checkpoint) -> Result<(), IndexerError> {
    sqlx::query(
        "INSERT OR REPLACE INTO shipindex_checkpoints
         (reader, head_block, head_id, irreversible_block, updated_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&cp.reader)
    .bind(cp.head_block.map(|n| n as i64))
    .bind(&cp.head_id)
    .bind(cp.irreversible_block as i64)
    .bind(cp.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(storage_err)?;
    Ok(())
}

// ─── BlockStore impl ─────────────────────────────────────────────────────────

#[async_trait]
impl BlockStore for SqliteStorage {
    async fn begin(&self, block: &ShipBlock) -> Result<Box<dyn UnitOfWork>, IndexerError> {
        let tx = self.pool.begin().await.map_err(storage_err)?;
        Ok(Box::new(SqliteUnit {
            tx,
            reader: self.reader.clone(),
            block: block.clone(),
            sequence: 0,
            notifications: Vec::new(),
        }))
    }

    async fn rollback_to(&self, block_number: u64) -> Result<RollbackReport, IndexerError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let mut cp = load_checkpoint_in(&mut tx, &self.reader)
            .await?
            .unwrap_or_else(|| Checkpoint::empty(&self.reader));

        if block_number <= cp.irreversible_block {
            return Err(IndexerError::IrreversibleRollback {
                target: block_number,
                irreversible: cp.irreversible_block,
            });
        }
        match cp.head_block {
            Some(h) if block_number <= h => {}
            head => return Ok(RollbackReport::noop(block_number, head)),
        }

        let entries = fetch_undo(&mut tx, block_number, true).await?;
        let mut notifications = Vec::with_capacity(entries.len());
        for entry in &entries {
            if let Some(key) = &entry.key {
                delete_rows(&mut tx, &entry.table, &Filter::by_key(key)).await?;
            }
            if let Some(previous) = &entry.previous {
                insert_row(&mut tx, &entry.table, previous).await?;
            }
            notifications.push(ChangeNotification::new(
                entry.block_number,
                &entry.table,
                ChangeOperation::Revert,
                entry.revert_keys(),
            ));
        }

        sqlx::query("DELETE FROM shipindex_undo_log WHERE block_number >= ?")
            .bind(block_number as i64)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        cp.rewind(block_number);
        save_checkpoint_in(&mut tx, &cp).await?;
        tx.commit().await.map_err(storage_err)?;

        debug!(to = block_number, reverted = entries.len(), "sqlite store rolled back");
        Ok(RollbackReport {
            target: block_number,
            reverted: entries.len(),
            head_block: cp.head_block,
            notifications,
        })
    }

    async fn prune_irreversible(&self, block_number: u64) -> Result<u64, IndexerError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let pruned = sqlx::query("DELETE FROM shipindex_undo_log WHERE block_number <= ?")
            .bind(block_number as i64)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?
            .rows_affected();

        let mut cp = load_checkpoint_in(&mut tx, &self.reader)
            .await?
            .unwrap_or_else(|| Checkpoint::empty(&self.reader));
        cp.mark_irreversible(block_number);
        save_checkpoint_in(&mut tx, &cp).await?;
        tx.commit().await.map_err(storage_err)?;

        debug!(irreversible = block_number, pruned, "undo log pruned");
        Ok(pruned)
    }

    async fn load_checkpoint(&self) -> Result<Option<Checkpoint>, IndexerError> {
        let mut conn = self.pool.acquire().await.map_err(storage_err)?;
        load_checkpoint_in(&mut conn, &self.reader).await
    }
}

// ─── Unit of work ────────────────────────────────────────────────────────────

struct SqliteUnit {
    tx: Transaction<'static, Sqlite>,
    reader: String,
    block: ShipBlock,
    sequence: u64,
    notifications: Vec<ChangeNotification>,
}

impl SqliteUnit {
    async fn record(
        &mut self,
        table: &str,
        operation: MutationKind,
        key: Option<Row>,
        previous: Option<Row>,
    ) -> Result<(), IndexerError> {
        if !self.block.is_reversible {
            return Ok(());
        }
        let entry = UndoEntry {
            block_number: self.block.number,
            sequence: self.sequence,
            table: table.to_string(),
            operation,
            key,
            previous,
        };
        write_undo(&mut self.tx, &entry).await?;
        self.sequence += 1;
        Ok(())
    }

    fn notify(&mut self, table: &str, operation: ChangeOperation, keys: Row) {
        self.notifications
            .push(ChangeNotification::new(self.block.number, table, operation, keys));
    }
}

#[async_trait]
impl UnitOfWork for SqliteUnit {
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
            insert_row(&mut self.tx, table, &row).await?;
            self.record(table, MutationKind::Insert, Some(key.clone()), None).await?;
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
        let previous = fetch_rows(&mut self.tx, table, &filter).await?.into_iter().next();

        match previous {
            Some(previous) => {
                let values: Row = row
                    .into_iter()
                    .filter(|(c, _)| !key.contains_key(c) && !excluded.contains(&c.as_str()))
                    .collect();
                update_rows(&mut self.tx, table, &values, &filter).await?;
                self.record(table, MutationKind::Replace, Some(key.clone()), Some(previous))
                    .await?;
                self.notify(table, ChangeOperation::Update, key);
            }
            None => {
                insert_row(&mut self.tx, table, &row).await?;
                self.record(table, MutationKind::Replace, Some(key.clone()), None).await?;
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
        let prior = fetch_rows(&mut self.tx, table, filter).await?;
        if prior.is_empty() {
            return Ok(0);
        }
        let changed = update_rows(&mut self.tx, table, &values, filter).await?;
        for previous in prior {
            let mut updated = previous.clone();
            updated.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
            let key = key_of(table, &updated, key_columns)?;
            self.record(table, MutationKind::Update, Some(key.clone()), Some(previous))
                .await?;
            self.notify(table, ChangeOperation::Update, key);
        }
        Ok(changed)
    }

    async fn delete(
        &mut self,
        table: &str,
        filter: &Filter,
        key_columns: &[&str],
    ) -> Result<u64, IndexerError> {
        let prior = fetch_rows(&mut self.tx, table, filter).await?;
        if prior.is_empty() {
            return Ok(0);
        }
        let removed = delete_rows(&mut self.tx, table, filter).await?;
        for previous in prior {
            let key = key_of(table, &previous, key_columns)?;
            self.record(table, MutationKind::Delete, None, Some(previous)).await?;
            self.notify(table, ChangeOperation::Delete, key);
        }
        Ok(removed)
    }

    async fn select(&mut self, table: &str, filter: &Filter) -> Result<Vec<Row>, IndexerError> {
        fetch_rows(&mut self.tx, table, filter).await
    }

    async fn commit(self: Box<Self>) -> Result<CommitSummary, IndexerError> {
        let mut unit = *self;
        let mut cp = load_checkpoint_in(&mut unit.tx, &unit.reader)
            .await?
            .unwrap_or_else(|| Checkpoint::empty(&unit.reader));
        cp.commit(&unit.block);
        save_checkpoint_in(&mut unit.tx, &cp).await?;
        unit.tx.commit().await.map_err(storage_err)?;

        debug!(block = unit.block.number, undo = unit.sequence, "block committed");
        Ok(CommitSummary {
            block_number: unit.block.number,
            undo_entries: unit.sequence as usize,
            notifications: unit.notifications,
        })
    }

    async fn abort(self: Box<Self>) -> Result<(), IndexerError> {
        let unit = *self;
        unit.tx.rollback().await.map_err(storage_err)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const COLLECTIONS: &str = "CREATE TABLE IF NOT EXISTS collections (
        collection_name  TEXT    NOT NULL PRIMARY KEY,
        author           TEXT    NOT NULL,
        data             TEXT,
        created_at_block INTEGER NOT NULL,
        updated_at_block INTEGER NOT NULL
    );";

    const KEY: &[&str] = &["collection_name"];
    const EXCLUDED: &[&str] = &["created_at_block"];

    async fn store() -> SqliteStorage {
        let store = SqliteStorage::in_memory().await.unwrap().with_reader("test");
        store.run_migrations(&[COLLECTIONS]).await.unwrap();
        store
    }

    fn block(number: u64) -> ShipBlock {
        ShipBlock::new(number, format!("{number:08x}"), 0, true)
    }

    fn collection(name: &str, author: &str, block: u64) -> Row {
        [
            ("collection_name", json!(name)),
            ("author", json!(author)),
            ("data", json!({"name": name})),
            ("created_at_block", json!(block)),
            ("updated_at_block", json!(block)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    #[test]
    fn where_clause_rendering() {
        let filter = Filter::all()
            .eq("owner", "alice")
            .not_in("symbol", ["WAX", "EOS"])
            .is_null("burned_by");
        let (clause, params) = render_where(&filter).unwrap();
        assert_eq!(
            clause,
            "\"owner\" = ? AND \"symbol\" NOT IN (?, ?) AND \"burned_by\" IS NULL"
        );
        assert_eq!(params.len(), 3);
        assert!(ident("bad name; --").is_err());
    }

    #[tokio::test]
    async fn alice_collection_rollback() {
        let store = store().await;

        let mut uow = store.begin(&block(100)).await.unwrap();
        uow.replace("collections", collection("alice", "a1", 100), KEY, EXCLUDED)
            .await
            .unwrap();
        uow.commit().await.unwrap();

        let mut uow = store.begin(&block(105)).await.unwrap();
        uow.replace("collections", collection("alice", "a2", 105), KEY, EXCLUDED)
            .await
            .unwrap();
        uow.commit().await.unwrap();

        let rows = store.rows("collections", &Filter::all()).await.unwrap();
        assert_eq!(rows[0]["author"], json!("a2"));
        assert_eq!(rows[0]["created_at_block"], json!(100));

        let report = store.rollback_to(103).await.unwrap();
        assert_eq!(report.reverted, 1);
        assert_eq!(report.head_block, Some(102));

        let rows = store.rows("collections", &Filter::all()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["author"], json!("a1"));
        assert_eq!(rows[0]["updated_at_block"], json!(100));
        assert_eq!(store.undo_entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replace_merges_into_the_stored_row() {
        let store = store().await;

        let mut uow = store.begin(&block(1)).await.unwrap();
        uow.replace("collections", collection("alice", "a1", 1), KEY, EXCLUDED)
            .await
            .unwrap();
        uow.commit().await.unwrap();

        // The second write carries no `data` column.
        let mut second = collection("alice", "a2", 2);
        second.remove("data");
        let mut uow = store.begin(&block(2)).await.unwrap();
        uow.replace("collections", second, KEY, EXCLUDED).await.unwrap();
        uow.commit().await.unwrap();

        let rows = store.rows("collections", &Filter::all()).await.unwrap();
        assert_eq!(rows[0]["author"], json!("a2"));
        assert_eq!(rows[0]["data"], json!(r#"{"name":"alice"}"#));
        assert_eq!(rows[0]["created_at_block"], json!(1));
        assert_eq!(rows[0]["updated_at_block"], json!(2));
    }

    #[tokio::test]
    async fn aborted_unit_leaves_no_trace() {
        let store = store().await;

        let mut uow = store.begin(&block(1)).await.unwrap();
        uow.insert("collections", vec![collection("alice", "a", 1)], KEY)
            .await
            .unwrap();
        assert_eq!(uow.select("collections", &Filter::all()).await.unwrap().len(), 1);
        uow.abort().await.unwrap();

        assert!(store.rows("collections", &Filter::all()).await.unwrap().is_empty());
        assert!(store.undo_entries().await.unwrap().is_empty());
        assert!(store.load_checkpoint().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_and_prune() {
        let store = store().await;

        let mut uow = store.begin(&block(1)).await.unwrap();
        uow.insert(
            "collections",
            vec![collection("a", "x", 1), collection("b", "x", 1)],
            KEY,
        )
        .await
        .unwrap();
        uow.commit().await.unwrap();

        let mut uow = store.begin(&block(2)).await.unwrap();
        let removed = uow
            .delete("collections", &Filter::all().not_in("collection_name", ["a"]), KEY)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let summary = uow.commit().await.unwrap();
        assert_eq!(summary.notifications[0].operation, ChangeOperation::Delete);

        assert_eq!(store.prune_irreversible(1).await.unwrap(), 2);
        assert_eq!(store.prune_irreversible(1).await.unwrap(), 0);

        store.rollback_to(2).await.unwrap();
        let names: Vec<_> = store
            .rows("collections", &Filter::all())
            .await
            .unwrap()
            .into_iter()
            .map(|r| r["collection_name"].clone())
            .collect();
        assert_eq!(names.len(), 2);

        let cp = store.load_checkpoint().await.unwrap().unwrap();
        assert_eq!(cp.head_block, Some(1));
        assert_eq!(cp.irreversible_block, 1);
        assert!(matches!(
            store.rollback_to(1).await,
            Err(IndexerError::IrreversibleRollback { .. })
        ));
    }

    #[tokio::test]
    async fn final_blocks_cannot_be_rolled_back() {
        let store = store().await;
        for (n, reversible) in [(1, false), (2, false), (3, true)] {
            let block = ShipBlock::new(n, format!("{n:08x}"), 0, reversible);
            let mut uow = store.begin(&block).await.unwrap();
            if n == 2 {
                uow.insert("collections", vec![collection("final", "x", 2)], KEY)
                    .await
                    .unwrap();
            }
            uow.commit().await.unwrap();
        }

        let err = store.rollback_to(2).await.unwrap_err();
        assert!(matches!(
            err,
            IndexerError::IrreversibleRollback { target: 2, irreversible: 2 }
        ));
        assert_eq!(store.rows("collections", &Filter::all()).await.unwrap().len(), 1);
        let cp = store.load_checkpoint().await.unwrap().unwrap();
        assert_eq!(cp.head_block, Some(3));
        assert_eq!(cp.irreversible_block, 2);

        let report = store.rollback_to(3).await.unwrap();
        assert_eq!(report.head_block, Some(2));
        assert_eq!(store.rows("collections", &Filter::all()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_captures_prior_rows() {
        let store = store().await;
        let mut uow = store.begin(&block(1)).await.unwrap();
        uow.insert("collections", vec![collection("a", "x", 1)], KEY).await.unwrap();
        uow.commit().await.unwrap();

        let mut uow = store.begin(&block(2)).await.unwrap();
        let values: Row = [("author".to_string(), json!("y"))].into_iter().collect();
        let n = uow
            .update("collections", values, &Filter::all().eq("collection_name", "a"), KEY)
            .await
            .unwrap();
        assert_eq!(n, 1);
        uow.commit().await.unwrap();

        let undo = store.undo_entries().await.unwrap();
        assert_eq!(undo.last().unwrap().operation, MutationKind::Update);
        assert_eq!(undo.last().unwrap().previous.as_ref().unwrap()["author"], json!("x"));

        store.rollback_to(2).await.unwrap();
        let rows = store.rows("collections", &Filter::all()).await.unwrap();
        assert_eq!(rows[0]["author"], json!("x"));
    }
}
