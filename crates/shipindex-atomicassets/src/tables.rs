//! Row layouts of the AtomicAssets contract tables, as delivered in delta payloads.

use serde::{Deserialize, Deserializer};

use shipindex_core::error::DecodeError;
use shipindex_core::schema::FormatEntry;

/// Singleton `config` row.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigRow {
    pub collection_format: Vec<FormatEntry>,
    #[serde(default)]
    pub supported_tokens: Vec<SupportedToken>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupportedToken {
    pub token_contract: String,
    /// Extended symbol, e.g. `"8,WAX"`.
    pub token_symbol: String,
}

/// Singleton `tokenconfigs` row.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfigsRow {
    #[serde(default)]
    pub standard: String,
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectionRow {
    pub collection_name: String,
    pub author: String,
    pub allow_notify: bool,
    #[serde(default)]
    pub authorized_accounts: Vec<String>,
    #[serde(default)]
    pub notify_accounts: Vec<String>,
    pub market_fee: f64,
    #[serde(deserialize_with = "bytes")]
    pub serialized_data: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaRow {
    pub schema_name: String,
    pub format: Vec<FormatEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateRow {
    pub template_id: i32,
    pub schema_name: String,
    pub transferable: bool,
    pub burnable: bool,
    pub max_supply: u32,
    pub issued_supply: u32,
    #[serde(deserialize_with = "bytes")]
    pub immutable_serialized_data: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetRow {
    #[serde(deserialize_with = "id")]
    pub asset_id: u64,
    pub collection_name: String,
    pub schema_name: String,
    /// `-1` when the asset has no template.
    pub template_id: i32,
    pub ram_payer: String,
    #[serde(default)]
    pub backed_tokens: Vec<String>,
    #[serde(deserialize_with = "bytes")]
    pub immutable_serialized_data: Vec<u8>,
    #[serde(deserialize_with = "bytes")]
    pub mutable_serialized_data: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OfferRow {
    #[serde(deserialize_with = "id")]
    pub offer_id: u64,
    pub sender: String,
    pub recipient: String,
    #[serde(deserialize_with = "ids")]
    pub sender_asset_ids: Vec<u64>,
    #[serde(deserialize_with = "ids")]
    pub recipient_asset_ids: Vec<u64>,
    #[serde(default)]
    pub memo: String,
    pub ram_payer: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BalanceRow {
    pub owner: String,
    /// Asset strings, e.g. `"1.50000000 WAX"`.
    pub quantities: Vec<String>,
}

// ─── Token strings ───────────────────────────────────────────────────────────

/// Split an extended symbol `"8,WAX"` into precision and code.
pub fn parse_symbol(value: &str) -> Result<(u8, String), DecodeError> {
    let malformed = || DecodeError::MalformedRow {
        table: "config".into(),
        reason: format!("invalid token symbol '{value}'"),
    };
    let (precision, code) = value.split_once(',').ok_or_else(malformed)?;
    let precision = precision.trim().parse::<u8>().map_err(|_| malformed())?;
    let code = code.trim();
    if code.is_empty() {
        return Err(malformed());
    }
    Ok((precision, code.to_string()))
}

/// Split an asset string `"1.50000000 WAX"` into its raw integer amount
/// (`"150000000"`) and symbol code.
pub fn parse_quantity(value: &str) -> Result<(String, String), DecodeError> {
    let malformed = || DecodeError::MalformedRow {
        table: "balances".into(),
        reason: format!("invalid quantity '{value}'"),
    };
    let (amount, symbol) = value.trim().split_once(' ').ok_or_else(malformed)?;
    let digits: String = amount.chars().filter(|c| *c != '.').collect();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) || symbol.is_empty() {
        return Err(malformed());
    }
    Ok((digits, symbol.to_string()))
}

/// Decode an eosio account name from its 64-bit representation.
///
/// Removal deltas may arrive without a payload; the primary key is then the
/// only way to learn which row went away.
pub fn name_from_u64(value: u64) -> String {
    const CHARMAP: &[u8] = b".12345abcdefghijklmnopqrstuvwxyz";
    let mut chars = [b'.'; 13];
    let mut tmp = value;
    for i in 0..13 {
        let (mask, shift) = if i == 0 { (0x0f, 4) } else { (0x1f, 5) };
        chars[12 - i] = CHARMAP[(tmp & mask) as usize];
        tmp >>= shift;
    }
    String::from_utf8_lossy(&chars).trim_end_matches('.').to_string()
}

// ─── Field deserializers ─────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum RawBytes {
    Hex(String),
    List(Vec<u8>),
}

/// ABI `bytes` / `uint8[]` arrive either as a number list or as hex.
fn bytes<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
    match RawBytes::deserialize(d)? {
        RawBytes::List(list) => Ok(list),
        RawBytes::Hex(h) => hex::decode(h.trim_start_matches("0x")).map_err(serde::de::Error::custom),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Num(u64),
    Str(String),
}

impl RawId {
    fn into_u64<E: serde::de::Error>(self) -> Result<u64, E> {
        match self {
            RawId::Num(n) => Ok(n),
            RawId::Str(s) => s.parse().map_err(E::custom),
        }
    }
}

/// `uint64` fields are stringified by ABI serializers above 2^53.
fn id<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    RawId::deserialize(d)?.into_u64()
}

fn ids<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u64>, D::Error> {
    Vec::<RawId>::deserialize(d)?
        .into_iter()
        .map(RawId::into_u64)
        .collect()
}
