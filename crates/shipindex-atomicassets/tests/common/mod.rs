//! Stream fixtures shared by the pipeline tests: a sequencer wired to the
//! AtomicAssets handler and builders for contract table deltas.

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};

use shipindex_atomicassets::{AtomicAssetsConfig, AtomicAssetsHandler, AtomicCodec};
use shipindex_core::codec::{AttributeMap, AttributeValue, PayloadCodec};
use shipindex_core::schema::{FormatEntry, SchemaSpec};
use shipindex_core::{
    BlockMessage, BlockSequencer, BlockStore, IndexerBuilder, IndexerError, ReplayStream,
    SchemaRegistry, ShipBlock, StreamMessage, TableDelta,
};

pub const AA: &str = "atomicassets";
pub const ALICE_NAME: u64 = 3_773_036_822_876_127_232;

pub fn sequencer(store: Arc<dyn BlockStore>) -> BlockSequencer {
    let registry = Arc::new(SchemaRegistry::new());
    IndexerBuilder::new()
        .reader("test")
        .start_block(1)
        .retry_backoff_ms(1)
        .store(store)
        .handler(Arc::new(AtomicAssetsHandler::new(
            AtomicAssetsConfig::default(),
            registry.clone(),
        )))
        .registry(registry)
        .build()
        .unwrap()
}

pub fn block(number: u64, fork: &str) -> ShipBlock {
    ShipBlock::new(number, format!("{number:08x}{fork}"), 1_600_000_000_000 + number as i64 * 500, true)
}

pub fn msg(number: u64, deltas: Vec<TableDelta>) -> StreamMessage {
    StreamMessage::Block(BlockMessage {
        block: block(number, "a"),
        deltas,
        traces: vec![],
    })
}

pub fn delta(table: &str, scope: &str, primary_key: u64, row: Value) -> TableDelta {
    TableDelta {
        contract: AA.into(),
        table: table.into(),
        scope: scope.into(),
        primary_key,
        payload: Some(serde_json::to_vec(&row).unwrap()),
        present: true,
    }
}

pub fn removal(table: &str, scope: &str, primary_key: u64) -> TableDelta {
    TableDelta {
        contract: AA.into(),
        table: table.into(),
        scope: scope.into(),
        primary_key,
        payload: None,
        present: false,
    }
}

pub fn serialize(format: &Value, attrs: &[(&str, AttributeValue)]) -> Vec<u8> {
    let format: Vec<FormatEntry> = serde_json::from_value(format.clone()).unwrap();
    let spec = SchemaSpec::from_format("fixture", &format).unwrap();
    let map: AttributeMap = attrs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
    AtomicCodec.encode(&map, &spec).unwrap()
}

pub fn collection_format() -> Value {
    json!([{"name": "name", "type": "string"}, {"name": "img", "type": "image"}])
}

pub fn card_format() -> Value {
    json!([{"name": "name", "type": "string"}, {"name": "level", "type": "uint8"}])
}

pub fn config() -> TableDelta {
    delta(
        "config",
        AA,
        0,
        json!({
            "collection_format": collection_format(),
            "supported_tokens": [{"token_contract": "eosio.token", "token_symbol": "8,WAX"}],
        }),
    )
}

pub fn collection(name: &str, display: &str, author: &str) -> TableDelta {
    delta(
        "collections",
        AA,
        1,
        json!({
            "collection_name": name,
            "author": author,
            "allow_notify": true,
            "authorized_accounts": [author],
            "notify_accounts": [],
            "market_fee": 0.05,
            "serialized_data": serialize(&collection_format(), &[("name", AttributeValue::Str(display.into()))]),
        }),
    )
}

pub fn schema(collection: &str, name: &str) -> TableDelta {
    delta(
        "schemas",
        collection,
        2,
        json!({"schema_name": name, "format": card_format()}),
    )
}

pub fn template(collection: &str, id: i32, schema: &str, name: &str) -> TableDelta {
    delta(
        "templates",
        collection,
        id as u64,
        json!({
            "template_id": id,
            "schema_name": schema,
            "transferable": true,
            "burnable": true,
            "max_supply": 0,
            "issued_supply": 1,
            "immutable_serialized_data": serialize(&card_format(), &[
                ("name", AttributeValue::Str(name.into())),
                ("level", AttributeValue::Uint(1)),
            ]),
        }),
    )
}

pub fn asset(owner: &str, id: u64, level: u64) -> TableDelta {
    delta(
        "assets",
        owner,
        id,
        json!({
            "asset_id": id,
            "collection_name": "alice",
            "schema_name": "cards",
            "template_id": -1,
            "ram_payer": "alice",
            "backed_tokens": [],
            "immutable_serialized_data": serialize(&card_format(), &[("name", AttributeValue::Str("Dragon".into()))]),
            "mutable_serialized_data": serialize(&card_format(), &[("level", AttributeValue::Uint(level))]),
        }),
    )
}

pub fn balance(owner: &str, quantities: &[&str]) -> TableDelta {
    delta("balances", AA, ALICE_NAME, json!({"owner": owner, "quantities": quantities}))
}

/// Config, collection `alice`, schema `alice/cards` at block 1.
pub fn genesis() -> StreamMessage {
    msg(1, vec![config(), collection("alice", "Alice", "alice"), schema("alice", "cards")])
}

pub async fn replay(seq: &mut BlockSequencer, messages: Vec<StreamMessage>) -> Result<(), IndexerError> {
    seq.run(&mut ReplayStream::new(messages)).await.map(|_| ())
}
