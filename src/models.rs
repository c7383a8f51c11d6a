//! Wire types for the venue's streaming feed. The venue string-encodes most
//! decimals and extends payloads with trailing fields, so every struct here
//! decodes a known-field subset and ignores the rest.

use serde::{Deserialize, Serialize};

// =============== String-encoded decimal helpers =================

pub(crate) mod de {
    use serde::{Deserialize, Deserializer};

    pub fn f64_from_str<'de, D>(d: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(d)?;
        s.parse::<f64>().map_err(serde::de::Error::custom)
    }

    /// Tolerates a missing or null field; `#[serde(default)]` supplies the None.
    pub fn opt_f64_from_str<'de, D>(d: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(d)?;
        match s {
            Some(s) => s.parse::<f64>().map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }

    pub fn vec_f64_from_str<'de, D>(d: D) -> Result<Vec<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Vec<String> = Vec::deserialize(d)?;
        raw.into_iter()
            .map(|s| s.parse::<f64>().map_err(serde::de::Error::custom))
            .collect()
    }
}

// =============== Order primitives =================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "B")]
    Bid,
    #[serde(rename = "A")]
    Ask,
}

impl Side {
    pub fn sign(self) -> f64 {
        match self {
            Side::Bid => 1.0,
            Side::Ask => -1.0,
        }
    }

    pub fn is_buy(self) -> bool {
        matches!(self, Side::Bid)
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Bid => write!(f, "B"),
            Side::Ask => write!(f, "A"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String")]
pub enum Tif {
    Alo,
    Gtc,
    Ioc,
    FrontendMarket,
    Other,
}

impl From<String> for Tif {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "Alo" => Tif::Alo,
            "Gtc" => Tif::Gtc,
            "Ioc" => Tif::Ioc,
            "FrontendMarket" => Tif::FrontendMarket,
            _ => Tif::Other,
        }
    }
}

impl Tif {
    pub fn as_str(self) -> &'static str {
        match self {
            Tif::Alo => "Alo",
            Tif::Gtc => "Gtc",
            Tif::Ioc => "Ioc",
            Tif::FrontendMarket => "FrontendMarket",
            Tif::Other => "Other",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrder {
    pub coin: String,
    pub side: Side,
    #[serde(deserialize_with = "de::f64_from_str")]
    pub limit_px: f64,
    #[serde(deserialize_with = "de::f64_from_str")]
    pub sz: f64,
    #[serde(default, deserialize_with = "de::opt_f64_from_str")]
    pub orig_sz: Option<f64>,
    #[serde(default)]
    pub oid: i64,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub tif: Option<Tif>,
    #[serde(default)]
    pub cloid: Option<String>,
}

impl OpenOrder {
    pub fn orig_sz(&self) -> f64 {
        self.orig_sz.unwrap_or(self.sz)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub coin: String,
    #[serde(deserialize_with = "de::f64_from_str")]
    pub szi: f64,
    #[serde(default)]
    pub leverage: Leverage,
    #[serde(default, deserialize_with = "de::opt_f64_from_str")]
    pub entry_px: Option<f64>,
    #[serde(default, deserialize_with = "de::opt_f64_from_str")]
    pub position_value: Option<f64>,
    #[serde(default, deserialize_with = "de::opt_f64_from_str")]
    pub unrealized_pnl: Option<f64>,
    #[serde(default, deserialize_with = "de::opt_f64_from_str")]
    pub margin_used: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Leverage {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub value: f64,
}

// =============== webData2 (account snapshot) =================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarginSummary {
    #[serde(deserialize_with = "de::f64_from_str")]
    pub account_value: f64,
    #[serde(default, deserialize_with = "de::opt_f64_from_str")]
    pub total_ntl_pos: Option<f64>,
    #[serde(default, deserialize_with = "de::opt_f64_from_str")]
    pub total_margin_used: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetPosition {
    pub position: Position,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearinghouseState {
    pub margin_summary: MarginSummary,
    #[serde(default)]
    pub asset_positions: Vec<AssetPosition>,
    pub time: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetCtx {
    #[serde(default, deserialize_with = "de::opt_f64_from_str")]
    pub mark_px: Option<f64>,
    #[serde(default, deserialize_with = "de::opt_f64_from_str")]
    pub oracle_px: Option<f64>,
    #[serde(default, deserialize_with = "de::opt_f64_from_str")]
    pub mid_px: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebData2 {
    pub clearinghouse_state: ClearinghouseState,
    #[serde(default)]
    pub open_orders: Vec<OpenOrder>,
    #[serde(default)]
    pub asset_ctxs: Vec<AssetCtx>,
    pub server_time: i64,
    pub user: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebData2Message {
    pub channel: String,
    pub data: WebData2,
}

// =============== activeAssetData =================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAssetData {
    pub user: String,
    pub coin: String,
    #[serde(default)]
    pub leverage: Leverage,
    #[serde(default, deserialize_with = "de::vec_f64_from_str")]
    pub max_trade_szs: Vec<f64>,
    #[serde(default, deserialize_with = "de::vec_f64_from_str")]
    pub available_to_trade: Vec<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActiveAssetDataMessage {
    pub channel: String,
    pub data: UserAssetData,
}

// =============== orderUpdates =================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderUpdate {
    pub status: String,
    #[serde(default)]
    pub status_timestamp: i64,
    pub order: OpenOrder,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderMessage {
    pub channel: String,
    #[serde(default)]
    pub data: Vec<OrderUpdate>,
}

// =============== l2Book =================

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BookLevel {
    #[serde(deserialize_with = "de::f64_from_str")]
    pub px: f64,
    #[serde(deserialize_with = "de::f64_from_str")]
    pub sz: f64,
    #[serde(default)]
    pub n: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct L2BookData {
    pub coin: String,
    pub time: i64,
    #[serde(default)]
    pub levels: Vec<Vec<BookLevel>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct L2BookMessage {
    pub channel: String,
    pub data: L2BookData,
}

impl L2BookMessage {
    pub fn best_bid(&self) -> Option<BookLevel> {
        self.data.levels.first().and_then(|side| side.first()).copied()
    }

    pub fn best_ask(&self) -> Option<BookLevel> {
        self.data.levels.get(1).and_then(|side| side.first()).copied()
    }

    /// Midpoint of the top of book, when both sides are present.
    pub fn mid(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b.px + a.px) / 2.0),
            _ => None,
        }
    }
}

// =============== Subscriptions =================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, rename = "nSigFigs", skip_serializing_if = "Option::is_none")]
    pub n_sig_figs: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionRequest {
    pub method: &'static str,
    pub subscription: Subscription,
}

impl SubscriptionRequest {
    pub fn new(kind: &str, user: Option<&str>, coin: Option<&str>) -> Self {
        Self {
            method: "subscribe",
            subscription: Subscription {
                kind: kind.to_string(),
                coin: coin.map(|c| c.to_string()),
                user: user.map(|u| u.to_string()),
                n_sig_figs: None,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionResponse {
    pub channel: String,
    #[serde(default)]
    pub data: Option<SubscriptionAck>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionAck {
    pub subscription: Subscription,
}
