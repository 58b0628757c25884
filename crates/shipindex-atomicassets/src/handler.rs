//! AtomicAssets delta handler.
//!
//! Each contract table maps to one [`DeltaKind`]. Control tables (`config`,
//! `tokenconfigs`, `schemas`) run before the entities that are decoded with
//! the formats they define.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use shipindex_core::codec::{attributes_to_json, AttributeMap, PayloadCodec};
use shipindex_core::dispatcher::DeltaHandler;
use shipindex_core::error::IndexerError;
use shipindex_core::job::{DeltaKind, JobTask, PriorityClass};
use shipindex_core::schema::{SchemaRegistry, SchemaSpec};
use shipindex_core::types::{ShipBlock, TableDelta};
use shipindex_core::writer::{Filter, Row, UnitOfWork};

use crate::codec::AtomicCodec;
use crate::schemas::{self, CONFIG_TABLE, SCHEMAS_TABLE};
use crate::tables::{
    name_from_u64, parse_quantity, parse_symbol, AssetRow, BalanceRow, CollectionRow, ConfigRow,
    OfferRow, SchemaRow, TemplateRow, TokenConfigsRow,
};

pub const CONFIG: DeltaKind = DeltaKind("atomicassets/config");
pub const TOKENCONFIGS: DeltaKind = DeltaKind("atomicassets/tokenconfigs");
pub const COLLECTIONS: DeltaKind = DeltaKind("atomicassets/collections");
pub const SCHEMAS: DeltaKind = DeltaKind("atomicassets/schemas");
pub const TEMPLATES: DeltaKind = DeltaKind("atomicassets/templates");
pub const ASSETS: DeltaKind = DeltaKind("atomicassets/assets");
pub const OFFERS: DeltaKind = DeltaKind("atomicassets/offers");
pub const BALANCES: DeltaKind = DeltaKind("atomicassets/balances");

pub const TOKEN_SYMBOLS_TABLE: &str = "atomicassets_token_symbols";
pub const COLLECTIONS_TABLE: &str = "atomicassets_collections";
pub const TEMPLATES_TABLE: &str = "atomicassets_templates";
pub const TEMPLATES_DATA_TABLE: &str = "atomicassets_templates_data";
pub const ASSETS_TABLE: &str = "atomicassets_assets";
pub const OFFERS_TABLE: &str = "atomicassets_offers";
pub const OFFERS_ASSETS_TABLE: &str = "atomicassets_offers_assets";
pub const BALANCES_TABLE: &str = "atomicassets_balances";

pub const OFFER_PENDING: &str = "pending";
pub const OFFER_UNKNOWN: &str = "unknown";

const CREATED: &[&str] = &["created_at_block", "created_at_time"];
const READABLE_NAME_MAX: usize = 64;

/// Configuration of the AtomicAssets module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtomicAssetsConfig {
    /// Account the contract is deployed on.
    pub contract: String,
}

impl Default for AtomicAssetsConfig {
    fn default() -> Self {
        Self {
            contract: "atomicassets".into(),
        }
    }
}

struct Context {
    contract: String,
    registry: Arc<SchemaRegistry>,
    codec: Arc<dyn PayloadCodec>,
}

/// Turns AtomicAssets table deltas into jobs.
pub struct AtomicAssetsHandler {
    ctx: Arc<Context>,
}

impl AtomicAssetsHandler {
    /// `registry` must be the one the sequencer clears on rollback.
    pub fn new(config: AtomicAssetsConfig, registry: Arc<SchemaRegistry>) -> Self {
        Self {
            ctx: Arc::new(Context {
                contract: config.contract,
                registry,
                codec: Arc::new(AtomicCodec),
            }),
        }
    }

    /// Decode attribute blobs with `codec` instead of [`AtomicCodec`].
    pub fn with_codec(self, codec: Arc<dyn PayloadCodec>) -> Self {
        Self {
            ctx: Arc::new(Context {
                contract: self.ctx.contract.clone(),
                registry: self.ctx.registry.clone(),
                codec,
            }),
        }
    }
}

impl DeltaHandler for AtomicAssetsHandler {
    fn contract(&self) -> &str {
        &self.ctx.contract
    }

    fn priorities(&self) -> Vec<(DeltaKind, PriorityClass)> {
        vec![
            (CONFIG, PriorityClass(10)),
            (TOKENCONFIGS, PriorityClass(10)),
            (COLLECTIONS, PriorityClass(20)),
            (SCHEMAS, PriorityClass(30)),
            (TEMPLATES, PriorityClass(40)),
            (ASSETS, PriorityClass(50)),
            (OFFERS, PriorityClass(60)),
            (BALANCES, PriorityClass(70)),
        ]
    }

    fn classify(&self, delta: &TableDelta) -> Option<DeltaKind> {
        let contract_scope = delta.scope == self.ctx.contract;
        match delta.table.as_str() {
            "config" if contract_scope => Some(CONFIG),
            "tokenconfigs" if contract_scope => Some(TOKENCONFIGS),
            "collections" if contract_scope => Some(COLLECTIONS),
            "schemas" => Some(SCHEMAS),
            "templates" => Some(TEMPLATES),
            "assets" => Some(ASSETS),
            "offers" if contract_scope => Some(OFFERS),
            "balances" if contract_scope => Some(BALANCES),
            _ => None,
        }
    }

    fn build_job(
        &self,
        kind: DeltaKind,
        delta: &TableDelta,
        block: &ShipBlock,
    ) -> Result<Box<dyn JobTask>, IndexerError> {
        if !self.priorities().iter().any(|(k, _)| *k == kind) {
            return Err(IndexerError::Config(format!("atomicassets cannot handle '{kind}'")));
        }
        Ok(Box::new(TableJob {
            ctx: self.ctx.clone(),
            kind,
            delta: delta.clone(),
            block: block.clone(),
        }))
    }
}

// ─── Jobs ────────────────────────────────────────────────────────────────────

struct TableJob {
    ctx: Arc<Context>,
    kind: DeltaKind,
    delta: TableDelta,
    block: ShipBlock,
}

#[async_trait]
impl JobTask for TableJob {
    async fn run(self: Box<Self>, uow: &mut dyn UnitOfWork) -> Result<(), IndexerError> {
        tracing::trace!(
            block = self.block.number,
            kind = %self.kind,
            scope = %self.delta.scope,
            primary_key = self.delta.primary_key,
            removal = self.delta.is_removal(),
            "applying delta"
        );
        match self.kind.as_str() {
            "atomicassets/config" => self.config(uow).await,
            "atomicassets/tokenconfigs" => self.tokenconfigs(uow).await,
            "atomicassets/collections" => self.collections(uow).await,
            "atomicassets/schemas" => self.schemas(uow).await,
            "atomicassets/templates" => self.templates(uow).await,
            "atomicassets/assets" => self.assets(uow).await,
            "atomicassets/offers" => self.offers(uow).await,
            "atomicassets/balances" => self.balances(uow).await,
            other => Err(IndexerError::Config(format!("atomicassets cannot handle '{other}'"))),
        }
    }
}

impl TableJob {
    fn contract(&self) -> &str {
        &self.ctx.contract
    }

    fn immutable_removed(&self) -> IndexerError {
        IndexerError::violation(
            self.block.number,
            self.delta.table.clone(),
            format!("row {} was removed but the contract never deletes it", self.delta.primary_key),
        )
    }

    fn stamp(&self, row: &mut Row, created: bool) {
        let time = json!(self.block.timestamp);
        let number = json!(self.block.number);
        if created {
            row.insert("created_at_block".into(), number.clone());
            row.insert("created_at_time".into(), time.clone());
        }
        row.insert("updated_at_block".into(), number);
        row.insert("updated_at_time".into(), time);
    }

    fn decode(&self, bytes: &[u8], spec: &SchemaSpec) -> Result<AttributeMap, IndexerError> {
        Ok(self.ctx.codec.decode(bytes, spec)?)
    }

    async fn config(&self, uow: &mut dyn UnitOfWork) -> Result<(), IndexerError> {
        if self.delta.is_removal() {
            tracing::warn!(block = self.block.number, "atomicassets config row removed, ignored");
            return Ok(());
        }
        let data: ConfigRow = self.delta.decode_row()?;

        let stored = uow
            .select(TOKEN_SYMBOLS_TABLE, &Filter::all().eq("contract", self.contract()))
            .await?;
        if stored.len() < data.supported_tokens.len() {
            for token in &data.supported_tokens {
                let (precision, symbol) = parse_symbol(&token.token_symbol)?;
                let symbol_row = row([
                    ("contract", json!(self.contract())),
                    ("token_symbol", json!(symbol)),
                    ("token_contract", json!(token.token_contract)),
                    ("token_precision", json!(precision)),
                ]);
                uow.replace(TOKEN_SYMBOLS_TABLE, symbol_row, &["contract", "token_symbol"], &[])
                    .await?;
            }
        }

        let mut config = row([
            ("contract", json!(self.contract())),
            ("collection_format", json!(data.collection_format)),
        ]);
        self.stamp(&mut config, false);
        uow.replace(CONFIG_TABLE, config, &["contract"], &["version"]).await?;

        schemas::register_collection_format(
            &self.ctx.registry,
            self.block.number,
            self.contract(),
            &data.collection_format,
        )?;
        Ok(())
    }

    async fn tokenconfigs(&self, uow: &mut dyn UnitOfWork) -> Result<(), IndexerError> {
        if self.delta.is_removal() {
            tracing::warn!(block = self.block.number, "atomicassets tokenconfigs row removed, ignored");
            return Ok(());
        }
        let data: TokenConfigsRow = self.delta.decode_row()?;
        tracing::debug!(standard = %data.standard, version = %data.version, "contract version");

        let mut config = row([
            ("contract", json!(self.contract())),
            ("version", json!(data.version)),
        ]);
        self.stamp(&mut config, false);
        uow.replace(CONFIG_TABLE, config, &["contract"], &["collection_format"])
            .await
    }

    async fn collections(&self, uow: &mut dyn UnitOfWork) -> Result<(), IndexerError> {
        if self.delta.is_removal() {
            return Err(self.immutable_removed());
        }
        let data: CollectionRow = self.delta.decode_row()?;
        let format = schemas::collection_format(uow, &self.ctx.registry, self.contract()).await?;
        let attributes = self.decode(&data.serialized_data, &format)?;

        let mut collection = row([
            ("contract", json!(self.contract())),
            ("collection_name", json!(data.collection_name)),
            ("readable_name", readable_name(&[&attributes])),
            ("author", json!(data.author)),
            ("allow_notify", json!(data.allow_notify)),
            ("authorized_accounts", json!(data.authorized_accounts)),
            ("notify_accounts", json!(data.notify_accounts)),
            ("market_fee", json!(data.market_fee)),
            ("data", attributes_to_json(&attributes)),
        ]);
        self.stamp(&mut collection, true);
        uow.replace(COLLECTIONS_TABLE, collection, &["contract", "collection_name"], CREATED)
            .await
    }

    async fn schemas(&self, uow: &mut dyn UnitOfWork) -> Result<(), IndexerError> {
        if self.delta.is_removal() {
            return Err(self.immutable_removed());
        }
        let data: SchemaRow = self.delta.decode_row()?;
        let collection = self.delta.scope.as_str();

        schemas::register_schema(
            &self.ctx.registry,
            self.block.number,
            self.contract(),
            collection,
            &data.schema_name,
            &data.format,
        )?;

        let mut schema = row([
            ("contract", json!(self.contract())),
            ("collection_name", json!(collection)),
            ("schema_name", json!(data.schema_name)),
            ("format", json!(data.format)),
        ]);
        self.stamp(&mut schema, true);
        uow.replace(
            SCHEMAS_TABLE,
            schema,
            &["contract", "collection_name", "schema_name"],
            CREATED,
        )
        .await
    }

    async fn templates(&self, uow: &mut dyn UnitOfWork) -> Result<(), IndexerError> {
        if self.delta.is_removal() {
            return Err(self.immutable_removed());
        }
        let data: TemplateRow = self.delta.decode_row()?;
        let collection = self.delta.scope.as_str();
        let spec = schemas::collection_schema(
            uow,
            &self.ctx.registry,
            self.contract(),
            collection,
            &data.schema_name,
            &self.delta.table,
        )
        .await?;
        let immutable = self.decode(&data.immutable_serialized_data, &spec)?;

        let mut template = row([
            ("contract", json!(self.contract())),
            ("template_id", json!(data.template_id)),
            ("collection_name", json!(collection)),
            ("schema_name", json!(data.schema_name)),
            ("readable_name", readable_name(&[&immutable])),
            ("transferable", json!(data.transferable)),
            ("burnable", json!(data.burnable)),
            ("max_supply", json!(data.max_supply)),
            ("issued_supply", json!(data.issued_supply)),
            ("immutable_data", attributes_to_json(&immutable)),
        ]);
        self.stamp(&mut template, true);
        uow.replace(TEMPLATES_TABLE, template, &["contract", "template_id"], CREATED)
            .await?;

        let key = ["contract", "template_id", "key"];
        let filter = Filter::all()
            .eq("contract", self.contract())
            .eq("template_id", data.template_id);
        uow.delete(TEMPLATES_DATA_TABLE, &filter, &key).await?;

        let rows: Vec<Row> = immutable
            .iter()
            .map(|(name, value)| {
                row([
                    ("contract", json!(self.contract())),
                    ("template_id", json!(data.template_id)),
                    ("key", json!(name)),
                    ("value", json!(value.to_json().to_string())),
                ])
            })
            .collect();
        if !rows.is_empty() {
            uow.insert(TEMPLATES_DATA_TABLE, rows, &key).await?;
        }
        Ok(())
    }

    async fn assets(&self, uow: &mut dyn UnitOfWork) -> Result<(), IndexerError> {
        let owner = self.delta.scope.as_str();
        let key = ["contract", "asset_id"];

        if self.delta.is_removal() {
            // Burned, or moved to another owner's scope by a transfer.
            let mut values = row([("owner", Value::Null)]);
            self.stamp(&mut values, false);
            let filter = Filter::all()
                .eq("contract", self.contract())
                .eq("asset_id", self.delta.primary_key.to_string())
                .eq("owner", owner);
            let cleared = uow.update(ASSETS_TABLE, values, &filter, &key).await?;
            tracing::trace!(asset = self.delta.primary_key, owner, cleared, "asset left scope");
            return Ok(());
        }

        let data: AssetRow = self.delta.decode_row()?;
        let spec = schemas::collection_schema(
            uow,
            &self.ctx.registry,
            self.contract(),
            &data.collection_name,
            &data.schema_name,
            &self.delta.table,
        )
        .await?;
        let immutable = self.decode(&data.immutable_serialized_data, &spec)?;
        let mutable = self.decode(&data.mutable_serialized_data, &spec)?;
        let template_id = if data.template_id < 0 {
            Value::Null
        } else {
            json!(data.template_id)
        };

        let mut asset = row([
            ("contract", json!(self.contract())),
            ("asset_id", json!(data.asset_id.to_string())),
            ("collection_name", json!(data.collection_name)),
            ("schema_name", json!(data.schema_name)),
            ("template_id", template_id),
            ("owner", json!(owner)),
            ("ram_payer", json!(data.ram_payer)),
            ("backed_tokens", json!(data.backed_tokens)),
            ("readable_name", readable_name(&[&mutable, &immutable])),
            ("immutable_data", attributes_to_json(&immutable)),
            ("mutable_data", attributes_to_json(&mutable)),
        ]);
        self.stamp(&mut asset, true);
        uow.replace(ASSETS_TABLE, asset, &key, CREATED).await
    }

    async fn offers(&self, uow: &mut dyn UnitOfWork) -> Result<(), IndexerError> {
        let key = ["contract", "offer_id"];

        if self.delta.is_removal() {
            let mut values = row([("state", json!(OFFER_UNKNOWN))]);
            self.stamp(&mut values, false);
            let filter = Filter::all()
                .eq("contract", self.contract())
                .eq("offer_id", self.delta.primary_key.to_string());
            uow.update(OFFERS_TABLE, values, &filter, &key).await?;
            return Ok(());
        }

        let data: OfferRow = self.delta.decode_row()?;
        let offer_id = data.offer_id.to_string();
        let filter = Filter::all()
            .eq("contract", self.contract())
            .eq("offer_id", offer_id.as_str());
        let fresh = uow.select(OFFERS_TABLE, &filter).await?.is_empty();

        let mut offer = row([
            ("contract", json!(self.contract())),
            ("offer_id", json!(offer_id)),
            ("sender", json!(data.sender)),
            ("recipient", json!(data.recipient)),
            ("memo", json!(data.memo)),
            ("ram_payer", json!(data.ram_payer)),
            ("state", json!(OFFER_PENDING)),
        ]);
        self.stamp(&mut offer, true);
        uow.replace(OFFERS_TABLE, offer, &key, CREATED).await?;

        if fresh {
            let sides = [
                (&data.sender, &data.sender_asset_ids),
                (&data.recipient, &data.recipient_asset_ids),
            ];
            let rows: Vec<Row> = sides
                .iter()
                .flat_map(|(owner, ids)| ids.iter().map(move |id| (*owner, id)))
                .map(|(owner, id)| {
                    row([
                        ("contract", json!(self.contract())),
                        ("offer_id", json!(offer_id)),
                        ("owner", json!(owner)),
                        ("asset_id", json!(id.to_string())),
                    ])
                })
                .collect();
            if !rows.is_empty() {
                uow.insert(OFFERS_ASSETS_TABLE, rows, &["contract", "offer_id", "asset_id"])
                    .await?;
            }
        }
        Ok(())
    }

    async fn balances(&self, uow: &mut dyn UnitOfWork) -> Result<(), IndexerError> {
        let key = ["contract", "owner", "token_symbol"];

        if self.delta.is_removal() {
            let owner = match self.delta.payload {
                Some(_) => self.delta.decode_row::<BalanceRow>()?.owner,
                None => name_from_u64(self.delta.primary_key),
            };
            let filter = Filter::all().eq("contract", self.contract()).eq("owner", owner);
            uow.delete(BALANCES_TABLE, &filter, &key).await?;
            return Ok(());
        }

        let data: BalanceRow = self.delta.decode_row()?;
        let held = data
            .quantities
            .iter()
            .map(|q| parse_quantity(q))
            .collect::<Result<Vec<_>, _>>()?;

        let filter = Filter::all()
            .eq("contract", self.contract())
            .eq("owner", data.owner.as_str())
            .not_in("token_symbol", held.iter().map(|(_, symbol)| symbol.clone()));
        uow.delete(BALANCES_TABLE, &filter, &key).await?;

        for (amount, symbol) in held {
            let mut balance = row([
                ("contract", json!(self.contract())),
                ("owner", json!(data.owner)),
                ("token_symbol", json!(symbol)),
                ("amount", json!(amount)),
            ]);
            self.stamp(&mut balance, false);
            uow.replace(BALANCES_TABLE, balance, &key, &[]).await?;
        }
        Ok(())
    }
}

fn row<const N: usize>(pairs: [(&str, Value); N]) -> Row {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// First string `name` attribute, cut to 64 characters.
fn readable_name(sources: &[&AttributeMap]) -> Value {
    sources
        .iter()
        .find_map(|attrs| attrs.get("name").and_then(|v| v.as_str()))
        .map(|name| Value::String(name.chars().take(READABLE_NAME_MAX).collect()))
        .unwrap_or(Value::Null)
}
