//! SQLite DDL for the AtomicAssets tables.
//!
//! JSON columns are `TEXT`; ids above 2^63 are stored as decimal text.

pub const SQLITE_MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS atomicassets_config (
        contract          TEXT    NOT NULL PRIMARY KEY,
        version           TEXT,
        collection_format TEXT,
        updated_at_block  INTEGER NOT NULL,
        updated_at_time   INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS atomicassets_token_symbols (
        contract        TEXT    NOT NULL,
        token_symbol    TEXT    NOT NULL,
        token_contract  TEXT    NOT NULL,
        token_precision INTEGER NOT NULL,
        PRIMARY KEY (contract, token_symbol)
    )",
    "CREATE TABLE IF NOT EXISTS atomicassets_collections (
        contract            TEXT    NOT NULL,
        collection_name     TEXT    NOT NULL,
        readable_name       TEXT,
        author              TEXT    NOT NULL,
        allow_notify        INTEGER NOT NULL,
        authorized_accounts TEXT    NOT NULL,
        notify_accounts     TEXT    NOT NULL,
        market_fee          REAL    NOT NULL,
        data                TEXT    NOT NULL,
        created_at_block    INTEGER NOT NULL,
        created_at_time     INTEGER NOT NULL,
        updated_at_block    INTEGER NOT NULL,
        updated_at_time     INTEGER NOT NULL,
        PRIMARY KEY (contract, collection_name)
    )",
    "CREATE TABLE IF NOT EXISTS atomicassets_schemas (
        contract         TEXT    NOT NULL,
        collection_name  TEXT    NOT NULL,
        schema_name      TEXT    NOT NULL,
        format           TEXT    NOT NULL,
        created_at_block INTEGER NOT NULL,
        created_at_time  INTEGER NOT NULL,
        updated_at_block INTEGER NOT NULL,
        updated_at_time  INTEGER NOT NULL,
        PRIMARY KEY (contract, collection_name, schema_name)
    )",
    "CREATE TABLE IF NOT EXISTS atomicassets_templates (
        contract         TEXT    NOT NULL,
        template_id      INTEGER NOT NULL,
        collection_name  TEXT    NOT NULL,
        schema_name      TEXT    NOT NULL,
        readable_name    TEXT,
        transferable     INTEGER NOT NULL,
        burnable         INTEGER NOT NULL,
        max_supply       INTEGER NOT NULL,
        issued_supply    INTEGER NOT NULL,
        immutable_data   TEXT    NOT NULL,
        created_at_block INTEGER NOT NULL,
        created_at_time  INTEGER NOT NULL,
        updated_at_block INTEGER NOT NULL,
        updated_at_time  INTEGER NOT NULL,
        PRIMARY KEY (contract, template_id)
    )",
    "CREATE INDEX IF NOT EXISTS atomicassets_templates_collection
        ON atomicassets_templates (contract, collection_name, schema_name)",
    "CREATE TABLE IF NOT EXISTS atomicassets_templates_data (
        contract    TEXT    NOT NULL,
        template_id INTEGER NOT NULL,
        key         TEXT    NOT NULL,
        value       TEXT    NOT NULL,
        PRIMARY KEY (contract, template_id, key)
    )",
    "CREATE TABLE IF NOT EXISTS atomicassets_assets (
        contract         TEXT    NOT NULL,
        asset_id         TEXT    NOT NULL,
        collection_name  TEXT    NOT NULL,
        schema_name      TEXT    NOT NULL,
        template_id      INTEGER,
        owner            TEXT,
        ram_payer        TEXT    NOT NULL,
        backed_tokens    TEXT    NOT NULL,
        readable_name    TEXT,
        immutable_data   TEXT    NOT NULL,
        mutable_data     TEXT    NOT NULL,
        created_at_block INTEGER NOT NULL,
        created_at_time  INTEGER NOT NULL,
        updated_at_block INTEGER NOT NULL,
        updated_at_time  INTEGER NOT NULL,
        PRIMARY KEY (contract, asset_id)
    )",
    "CREATE INDEX IF NOT EXISTS atomicassets_assets_owner
        ON atomicassets_assets (contract, owner)",
    "CREATE TABLE IF NOT EXISTS atomicassets_offers (
        contract         TEXT    NOT NULL,
        offer_id         TEXT    NOT NULL,
        sender           TEXT    NOT NULL,
        recipient        TEXT    NOT NULL,
        memo             TEXT    NOT NULL,
        ram_payer        TEXT    NOT NULL,
        state            TEXT    NOT NULL,
        created_at_block INTEGER NOT NULL,
        created_at_time  INTEGER NOT NULL,
        updated_at_block INTEGER NOT NULL,
        updated_at_time  INTEGER NOT NULL,
        PRIMARY KEY (contract, offer_id)
    )",
    "CREATE TABLE IF NOT EXISTS atomicassets_offers_assets (
        contract TEXT NOT NULL,
        offer_id TEXT NOT NULL,
        owner    TEXT NOT NULL,
        asset_id TEXT NOT NULL,
        PRIMARY KEY (contract, offer_id, asset_id)
    )",
    "CREATE TABLE IF NOT EXISTS atomicassets_balances (
        contract         TEXT    NOT NULL,
        owner            TEXT    NOT NULL,
        token_symbol     TEXT    NOT NULL,
        amount           TEXT    NOT NULL,
        updated_at_block INTEGER NOT NULL,
        updated_at_time  INTEGER NOT NULL,
        PRIMARY KEY (contract, owner, token_symbol)
    )",
];
