//! End-to-end tests: stream messages through the sequencer, the AtomicAssets
//! handler and the in-memory store.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use shipindex_atomicassets::handler::{
    ASSETS_TABLE, BALANCES_TABLE, COLLECTIONS_TABLE, OFFERS_ASSETS_TABLE, OFFERS_TABLE,
    TEMPLATES_DATA_TABLE, TEMPLATES_TABLE, TOKEN_SYMBOLS_TABLE,
};
use shipindex_atomicassets::schemas::{schema_key, SCHEMAS_TABLE};
use shipindex_core::{
    BlockMessage, BlockStore, ChangeOperation, Checkpoint, CommitSummary, Filter, IndexerError,
    IndexerState, RollbackReport, Row, ShipBlock, StreamMessage, UnitOfWork,
};
use shipindex_storage::InMemoryStorage;

use common::*;

fn one(store: &InMemoryStorage, table: &str, filter: Filter) -> Row {
    let mut rows = store.rows(table, &filter).unwrap();
    assert_eq!(rows.len(), 1, "{table}: {rows:?}");
    rows.remove(0)
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn alice_rollback_restores_block_100_image() {
    let store = InMemoryStorage::new("test");
    let mut seq = sequencer(Arc::new(store.clone()));
    let mut changes = seq.subscribe();

    let mut messages = vec![msg(100, vec![collection("alice", "Alice", "alice"), config()])];
    messages.extend((101..105).map(|n| msg(n, vec![])));
    messages.push(msg(105, vec![collection("alice", "Alice Reloaded", "bob")]));
    replay(&mut seq, messages).await.unwrap();

    let by_name = || Filter::all().eq("collection_name", "alice");
    let row = one(&store, COLLECTIONS_TABLE, by_name());
    assert_eq!(row["readable_name"], json!("Alice Reloaded"));
    assert_eq!(row["author"], json!("bob"));
    assert_eq!(row["created_at_block"], json!(100));
    assert_eq!(row["updated_at_block"], json!(105));

    replay(&mut seq, vec![StreamMessage::Fork { block_number: 103 }])
        .await
        .unwrap();

    let row = one(&store, COLLECTIONS_TABLE, by_name());
    assert_eq!(row["readable_name"], json!("Alice"));
    assert_eq!(row["author"], json!("alice"));
    assert_eq!(row["data"], json!({"name": "Alice"}));
    assert_eq!(row["updated_at_block"], json!(100));
    assert_eq!(seq.head(), Some(102));
    assert_eq!(store.load_checkpoint().await.unwrap().unwrap().head_block, Some(102));

    let mut last = None;
    while let Ok(n) = changes.try_recv() {
        last = Some(n);
    }
    let last = last.unwrap();
    assert_eq!(last.operation, ChangeOperation::Revert);
    assert_eq!(last.table, COLLECTIONS_TABLE);
    assert_eq!(last.keys["collection_name"], json!("alice"));
}

#[tokio::test]
async fn schema_and_template_in_one_block() {
    let store = InMemoryStorage::new("test");
    let mut seq = sequencer(Arc::new(store.clone()));

    // The template arrives first but runs after the schema it needs.
    replay(
        &mut seq,
        vec![msg(
            1,
            vec![
                template("alice", 7, "cards", "Goblin"),
                schema("alice", "cards"),
                collection("alice", "Alice", "alice"),
                config(),
            ],
        )],
    )
    .await
    .unwrap();

    let row = one(&store, TEMPLATES_TABLE, Filter::all().eq("template_id", 7));
    assert_eq!(row["readable_name"], json!("Goblin"));
    assert_eq!(row["immutable_data"], json!({"name": "Goblin", "level": 1}));

    let data = store
        .rows(TEMPLATES_DATA_TABLE, &Filter::all().eq("template_id", 7))
        .unwrap();
    let pairs: Vec<(Value, Value)> = data.iter().map(|r| (r["key"].clone(), r["value"].clone())).collect();
    assert_eq!(pairs.len(), 2);
    assert!(pairs.contains(&(json!("name"), json!("\"Goblin\""))));
    assert!(pairs.contains(&(json!("level"), json!("1"))));
}

#[tokio::test]
async fn template_update_replaces_data_rows() {
    let store = InMemoryStorage::new("test");
    let mut seq = sequencer(Arc::new(store.clone()));

    replay(
        &mut seq,
        vec![
            genesis(),
            msg(2, vec![template("alice", 7, "cards", "Goblin")]),
            msg(3, vec![template("alice", 7, "cards", "Hobgoblin")]),
        ],
    )
    .await
    .unwrap();

    let data = store.rows(TEMPLATES_DATA_TABLE, &Filter::all()).unwrap();
    assert_eq!(data.len(), 2);
    let name = one(&store, TEMPLATES_DATA_TABLE, Filter::all().eq("key", "name"));
    assert_eq!(name["value"], json!("\"Hobgoblin\""));

    let row = one(&store, TEMPLATES_TABLE, Filter::all());
    assert_eq!(row["created_at_block"], json!(2));
    assert_eq!(row["updated_at_block"], json!(3));
}

#[tokio::test]
async fn registry_miss_falls_back_to_stored_schema() {
    let store = InMemoryStorage::new("test");
    let mut seq = sequencer(Arc::new(store.clone()));
    replay(&mut seq, vec![genesis()]).await.unwrap();

    seq.registry().clear();
    replay(&mut seq, vec![msg(2, vec![asset("bob", 1, 3)])]).await.unwrap();

    let row = one(&store, ASSETS_TABLE, Filter::all().eq("asset_id", "1"));
    assert_eq!(row["owner"], json!("bob"));
    assert_eq!(row["readable_name"], json!("Dragon"));
    assert_eq!(row["mutable_data"], json!({"level": 3}));
    assert_eq!(row["template_id"], Value::Null);
    assert!(seq.registry().get(&schema_key(AA, "alice", "cards")).is_some());
}

#[tokio::test]
async fn failed_block_leaves_store_and_registry_untouched() {
    let store = InMemoryStorage::new("test");
    let mut seq = sequencer(Arc::new(store.clone()));
    replay(&mut seq, vec![genesis()]).await.unwrap();
    let before = store.dump().unwrap();

    let err = replay(
        &mut seq,
        vec![msg(
            2,
            vec![
                balance("alice", &["1.00000000 WAX"]),
                schema("alice", "heroes"),
                template("alice", 9, "missing", "Ghost"),
            ],
        )],
    )
    .await
    .unwrap_err();

    assert!(err.is_protocol_violation());
    assert!(!err.is_transient());
    assert_eq!(seq.state(), IndexerState::Error);
    assert_eq!(seq.stats().retries, 0);
    assert_eq!(store.dump().unwrap(), before);
    assert_eq!(store.load_checkpoint().await.unwrap().unwrap().head_block, Some(1));
    assert!(seq.registry().get(&schema_key(AA, "alice", "heroes")).is_none());
}

#[tokio::test]
async fn removing_a_collection_is_a_violation() {
    let store = InMemoryStorage::new("test");
    let mut seq = sequencer(Arc::new(store.clone()));
    let err = replay(&mut seq, vec![genesis(), msg(2, vec![removal("collections", AA, 1)])])
        .await
        .unwrap_err();

    assert!(err.is_protocol_violation());
    assert_eq!(seq.head(), Some(1));
}

#[tokio::test]
async fn same_input_same_state() {
    let messages = || {
        vec![
            genesis(),
            msg(2, vec![asset("bob", 1, 1), asset("carol", 2, 2), balance("alice", &["3.00000000 WAX"])]),
            msg(3, vec![removal("assets", "bob", 1), asset("carol", 1, 5)]),
            StreamMessage::Irreversible { block_number: 2 },
            msg(4, vec![template("alice", 7, "cards", "Goblin")]),
            StreamMessage::Fork { block_number: 4 },
            StreamMessage::Block(BlockMessage {
                block: block(4, "b"),
                deltas: vec![template("alice", 8, "cards", "Orc")],
                traces: vec![],
            }),
        ]
    };

    let mut dumps = Vec::new();
    for _ in 0..2 {
        let store = InMemoryStorage::new("test");
        let mut seq = sequencer(Arc::new(store.clone()));
        replay(&mut seq, messages()).await.unwrap();
        dumps.push(store.dump().unwrap());
    }
    assert_eq!(dumps[0], dumps[1]);
    assert!(dumps[0][TEMPLATES_TABLE].iter().all(|r| r["template_id"] == json!(8)));
}

#[tokio::test]
async fn asset_removal_only_clears_current_owner() {
    let store = InMemoryStorage::new("test");
    let mut seq = sequencer(Arc::new(store.clone()));
    let owner = |store: &InMemoryStorage| one(store, ASSETS_TABLE, Filter::all().eq("asset_id", "1"))["owner"].clone();

    replay(&mut seq, vec![genesis(), msg(2, vec![asset("bob", 1, 1)])])
        .await
        .unwrap();
    assert_eq!(owner(&store), json!("bob"));

    // Transfer delivered as (new scope, old scope removal): the stale removal
    // must not clear the new owner.
    replay(&mut seq, vec![msg(3, vec![asset("carol", 1, 1), removal("assets", "bob", 1)])])
        .await
        .unwrap();
    assert_eq!(owner(&store), json!("carol"));

    replay(&mut seq, vec![msg(4, vec![removal("assets", "carol", 1)])])
        .await
        .unwrap();
    assert_eq!(owner(&store), Value::Null);
}

#[tokio::test]
async fn balances_follow_held_quantities() {
    let store = InMemoryStorage::new("test");
    let mut seq = sequencer(Arc::new(store.clone()));
    let alice = || Filter::all().eq("owner", "alice");

    replay(
        &mut seq,
        vec![
            genesis(),
            msg(2, vec![balance("alice", &["1.00000000 WAX", "5.0000 TLM"])]),
            msg(3, vec![balance("alice", &["2.50000000 WAX"])]),
        ],
    )
    .await
    .unwrap();

    let row = one(&store, BALANCES_TABLE, alice());
    assert_eq!(row["token_symbol"], json!("WAX"));
    assert_eq!(row["amount"], json!("250000000"));
    assert_eq!(row["updated_at_block"], json!(3));

    // No payload: the owner comes from the primary key.
    replay(&mut seq, vec![msg(4, vec![removal("balances", AA, ALICE_NAME)])])
        .await
        .unwrap();
    assert!(store.rows(BALANCES_TABLE, &alice()).unwrap().is_empty());

    let symbols = store.rows(TOKEN_SYMBOLS_TABLE, &Filter::all()).unwrap();
    assert_eq!(symbols.len(), 1);
    assert_eq!(symbols[0]["token_precision"], json!(8));
}

#[tokio::test]
async fn offer_lifecycle() {
    let store = InMemoryStorage::new("test");
    let mut seq = sequencer(Arc::new(store.clone()));
    let offer = || {
        delta(
            "offers",
            AA,
            7,
            json!({
                "offer_id": 7,
                "sender": "alice",
                "recipient": "bob",
                "sender_asset_ids": [1, 2],
                "recipient_asset_ids": ["3"],
                "memo": "trade",
                "ram_payer": "alice",
            }),
        )
    };

    replay(&mut seq, vec![genesis(), msg(2, vec![offer()]), msg(3, vec![offer()])])
        .await
        .unwrap();

    let row = one(&store, OFFERS_TABLE, Filter::all().eq("offer_id", "7"));
    assert_eq!(row["state"], json!("pending"));
    assert_eq!(row["created_at_block"], json!(2));
    let linked = store.rows(OFFERS_ASSETS_TABLE, &Filter::all()).unwrap();
    assert_eq!(linked.len(), 3);
    assert_eq!(
        linked.iter().filter(|r| r["owner"] == json!("alice")).count(),
        2
    );

    replay(&mut seq, vec![msg(4, vec![removal("offers", AA, 7)])])
        .await
        .unwrap();
    let row = one(&store, OFFERS_TABLE, Filter::all().eq("offer_id", "7"));
    assert_eq!(row["state"], json!("unknown"));
}

#[tokio::test]
async fn pruning_is_idempotent_and_protects_final_blocks() {
    let store = InMemoryStorage::new("test");
    let mut seq = sequencer(Arc::new(store.clone()));

    replay(
        &mut seq,
        vec![
            genesis(),
            msg(2, vec![asset("bob", 1, 1)]),
            msg(3, vec![asset("bob", 2, 1)]),
            StreamMessage::Irreversible { block_number: 2 },
        ],
    )
    .await
    .unwrap();
    let after_first = (store.dump().unwrap(), store.undo_entries().unwrap());
    assert!(after_first.1.iter().all(|e| e.block_number == 3));

    replay(&mut seq, vec![StreamMessage::Irreversible { block_number: 2 }])
        .await
        .unwrap();
    assert_eq!((store.dump().unwrap(), store.undo_entries().unwrap()), after_first);

    let err = replay(&mut seq, vec![StreamMessage::Fork { block_number: 2 }])
        .await
        .unwrap_err();
    assert!(matches!(err, IndexerError::IrreversibleRollback { target: 2, irreversible: 2 }));
    assert_eq!(store.rows(ASSETS_TABLE, &Filter::all()).unwrap().len(), 2);
}

#[tokio::test]
async fn schema_rows_are_stored_with_their_format() {
    let store = InMemoryStorage::new("test");
    let mut seq = sequencer(Arc::new(store.clone()));
    replay(&mut seq, vec![genesis()]).await.unwrap();

    let row = one(&store, SCHEMAS_TABLE, Filter::all().eq("schema_name", "cards"));
    assert_eq!(row["collection_name"], json!("alice"));
    assert_eq!(row["format"], card_format());
}

// ─── Transient failures ──────────────────────────────────────────────────────

/// Fails the commit of the first `failures` units with a transient error.
struct FlakyStore {
    inner: InMemoryStorage,
    failures: AtomicU32,
}

struct FlakyUnit {
    inner: Box<dyn UnitOfWork>,
    fail: bool,
}

#[async_trait]
impl BlockStore for FlakyStore {
    async fn begin(&self, block: &ShipBlock) -> Result<Box<dyn UnitOfWork>, IndexerError> {
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Ok(Box::new(FlakyUnit {
            inner: self.inner.begin(block).await?,
            fail,
        }))
    }

    async fn rollback_to(&self, block_number: u64) -> Result<RollbackReport, IndexerError> {
        self.inner.rollback_to(block_number).await
    }

    async fn prune_irreversible(&self, block_number: u64) -> Result<u64, IndexerError> {
        self.inner.prune_irreversible(block_number).await
    }

    async fn load_checkpoint(&self) -> Result<Option<Checkpoint>, IndexerError> {
        self.inner.load_checkpoint().await
    }
}

#[async_trait]
impl UnitOfWork for FlakyUnit {
    fn block(&self) -> &ShipBlock {
        self.inner.block()
    }

    async fn insert(&mut self, table: &str, rows: Vec<Row>, key_columns: &[&str]) -> Result<(), IndexerError> {
        self.inner.insert(table, rows, key_columns).await
    }

    async fn replace(
        &mut self,
        table: &str,
        row: Row,
        key_columns: &[&str],
        excluded: &[&str],
    ) -> Result<(), IndexerError> {
        self.inner.replace(table, row, key_columns, excluded).await
    }

    async fn update(
        &mut self,
        table: &str,
        values: Row,
        filter: &Filter,
        key_columns: &[&str],
    ) -> Result<u64, IndexerError> {
        self.inner.update(table, values, filter, key_columns).await
    }

    async fn delete(&mut self, table: &str, filter: &Filter, key_columns: &[&str]) -> Result<u64, IndexerError> {
        self.inner.delete(table, filter, key_columns).await
    }

    async fn select(&mut self, table: &str, filter: &Filter) -> Result<Vec<Row>, IndexerError> {
        self.inner.select(table, filter).await
    }

    async fn commit(self: Box<Self>) -> Result<CommitSummary, IndexerError> {
        let FlakyUnit { inner, fail } = *self;
        if fail {
            inner.abort().await?;
            return Err(IndexerError::TransientStorage("database is locked".into()));
        }
        inner.commit().await
    }

    async fn abort(self: Box<Self>) -> Result<(), IndexerError> {
        self.inner.abort().await
    }
}

#[tokio::test]
async fn transient_commit_failure_retries_from_scratch() {
    let store = InMemoryStorage::new("test");
    let flaky = Arc::new(FlakyStore {
        inner: store.clone(),
        failures: AtomicU32::new(2),
    });
    let mut seq = sequencer(flaky);

    // Inserting offer assets twice would fail on duplicate keys if the first
    // attempt leaked.
    replay(
        &mut seq,
        vec![msg(
            1,
            vec![
                config(),
                delta(
                    "offers",
                    AA,
                    1,
                    json!({
                        "offer_id": 1,
                        "sender": "alice",
                        "recipient": "bob",
                        "sender_asset_ids": [10],
                        "recipient_asset_ids": [],
                        "ram_payer": "alice",
                    }),
                ),
            ],
        )],
    )
    .await
    .unwrap();

    assert_eq!(seq.stats().retries, 2);
    assert_eq!(seq.stats().blocks_applied, 1);
    assert_eq!(store.rows(OFFERS_ASSETS_TABLE, &Filter::all()).unwrap().len(), 1);
    assert_eq!(store.rows(TOKEN_SYMBOLS_TABLE, &Filter::all()).unwrap().len(), 1);
}
