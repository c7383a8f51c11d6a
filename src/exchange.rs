//! Venue HTTP capability: bulk order placement, bulk cancel by client id,
//! cancel-all, metadata and account state. Engines depend on the `VenueApi`
//! trait only; the reqwest-backed implementation signs every exchange action
//! with the account's secp256k1 key (msgpack body, keccak digest, recoverable
//! signature).

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha3::{Digest, Keccak256};
use tracing::warn;

use crate::models::{de, ClearinghouseState, Tif};

// =============== Request/response models =================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetMeta {
    pub name: String,
    #[serde(default)]
    pub sz_decimals: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct MetaResponse {
    universe: Vec<AssetMeta>,
}

/// One order of an outgoing batch, still in engine terms; the client maps it
/// onto the venue's compact wire keys.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub coin: String,
    pub asset: u32,
    pub is_buy: bool,
    pub limit_px: f64,
    pub sz: f64,
    pub reduce_only: bool,
    pub tif: Tif,
    pub cloid: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CancelByCloid {
    pub asset: u32,
    pub cloid: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestingStatus {
    #[serde(default)]
    pub oid: i64,
    #[serde(default)]
    pub cloid: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilledStatus {
    #[serde(default)]
    pub oid: i64,
    #[serde(default, deserialize_with = "de::opt_f64_from_str")]
    pub total_sz: Option<f64>,
    #[serde(default)]
    pub cloid: Option<String>,
}

/// Per-item outcome in a batch response. The venue emits either a bare status
/// string ("success") or an object carrying one of `resting`, `filled`,
/// `error`.
#[derive(Debug, Clone, Default)]
pub struct OrderStatus {
    pub status: String,
    pub error: String,
    pub resting: Option<RestingStatus>,
    pub filled: Option<FilledStatus>,
}

impl OrderStatus {
    pub fn is_err(&self) -> bool {
        !self.error.is_empty()
    }
}

impl<'de> Deserialize<'de> for OrderStatus {
    fn deserialize<D>(d: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Plain(String),
            Detail {
                #[serde(default)]
                status: String,
                #[serde(default)]
                error: String,
                #[serde(default)]
                resting: Option<RestingStatus>,
                #[serde(default)]
                filled: Option<FilledStatus>,
            },
        }
        Ok(match Wire::deserialize(d)? {
            Wire::Plain(status) => OrderStatus {
                status,
                ..Default::default()
            },
            Wire::Detail {
                status,
                error,
                resting,
                filled,
            } => OrderStatus {
                status,
                error,
                resting,
                filled,
            },
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseData {
    #[serde(default)]
    pub statuses: Vec<OrderStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseBody {
    #[serde(default)]
    pub data: ResponseData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExchangeResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub response: ResponseBody,
}

impl ExchangeResponse {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    pub fn statuses(&self) -> &[OrderStatus] {
        &self.response.data.statuses
    }
}

// =============== Capability trait =================

#[async_trait]
pub trait VenueApi: Send + Sync {
    async fn fetch_meta(&self) -> Result<Vec<AssetMeta>>;
    async fn fetch_user_state(&self, user: &str) -> Result<ClearinghouseState>;
    async fn fetch_all_mids(&self) -> Result<ahash::AHashMap<String, f64>>;
    async fn bulk_orders(&self, orders: &[OrderRequest]) -> Result<ExchangeResponse>;
    async fn bulk_cancel_by_cloid(&self, cancels: &[CancelByCloid]) -> Result<ExchangeResponse>;
    async fn cancel_all(&self, asset_ids: &[u32]) -> Result<()>;
}

// =============== HTTP client =================

const HTTP_TIMEOUT_SECS: u64 = 10;
const RETRY_BASE_MS: u64 = 250;
const MAX_RETRIES: u32 = 4;

pub struct HttpVenueClient {
    http: reqwest::Client,
    info_url: String,
    exchange_url: String,
    signing_key: SigningKey,
    vault_address: Option<String>,
}

impl HttpVenueClient {
    pub fn new(
        secret_key_hex: &str,
        info_url: String,
        exchange_url: String,
        vault_address: Option<String>,
    ) -> Result<Self> {
        let trimmed = secret_key_hex.trim_start_matches("0x");
        let key_bytes = hex::decode(trimmed).context("secret key is not valid hex")?;
        let signing_key =
            SigningKey::from_slice(&key_bytes).context("secret key is not a valid secp256k1 key")?;
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(HTTP_TIMEOUT_SECS))
            .tcp_nodelay(true)
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            info_url,
            exchange_url,
            signing_key,
            vault_address,
        })
    }

    async fn post_json<T: for<'de> Deserialize<'de>>(&self, url: &str, body: &Value) -> Result<T> {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let resp = self.http.post(url).json(body).send().await?;
            let status = resp.status();
            if status.as_u16() == 429 || status.is_server_error() {
                if attempts <= MAX_RETRIES {
                    let backoff = RETRY_BASE_MS * (1u64 << (attempts - 1).min(6));
                    warn!(%status, url, attempts, "venue http busy, backing off {backoff}ms");
                    tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                    continue;
                }
                let text = resp.text().await.unwrap_or_default();
                return Err(anyhow!("POST {url} failed after {attempts} attempts: {status} — {text}"));
            }
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(anyhow!("POST {url} failed: {status} — {text}"));
            }
            return Ok(resp.json().await?);
        }
    }

    async fn post_action(&self, action: Value) -> Result<ExchangeResponse> {
        let nonce = chrono::Utc::now().timestamp_millis() as u64;
        let signature = sign_action(&action, nonce, &self.signing_key)?;
        let payload = json!({
            "action": action,
            "nonce": nonce,
            "signature": signature,
            "vaultAddress": self.vault_address,
        });
        self.post_json(&self.exchange_url, &payload).await
    }
}

#[async_trait]
impl VenueApi for HttpVenueClient {
    async fn fetch_meta(&self) -> Result<Vec<AssetMeta>> {
        let resp: MetaResponse = self
            .post_json(&self.info_url, &json!({"type": "meta"}))
            .await
            .context("fetch venue meta")?;
        Ok(resp.universe)
    }

    async fn fetch_user_state(&self, user: &str) -> Result<ClearinghouseState> {
        self.post_json(
            &self.info_url,
            &json!({"type": "clearinghouseState", "user": user}),
        )
        .await
        .with_context(|| format!("fetch clearinghouse state for {user}"))
    }

    async fn fetch_all_mids(&self) -> Result<ahash::AHashMap<String, f64>> {
        let raw: ahash::AHashMap<String, String> = self
            .post_json(&self.info_url, &json!({"type": "allMids"}))
            .await
            .context("fetch all mids")?;
        let mut out = ahash::AHashMap::with_capacity(raw.len());
        for (coin, px) in raw {
            if let Ok(px) = px.parse::<f64>() {
                out.insert(coin, px);
            }
        }
        Ok(out)
    }

    async fn bulk_orders(&self, orders: &[OrderRequest]) -> Result<ExchangeResponse> {
        let wire: Vec<Value> = orders
            .iter()
            .map(|o| {
                json!({
                    "a": o.asset,
                    "b": o.is_buy,
                    "p": fmt_decimal(o.limit_px),
                    "s": fmt_decimal(o.sz),
                    "r": o.reduce_only,
                    "t": { "limit": { "tif": o.tif.as_str() } },
                    "c": o.cloid,
                })
            })
            .collect();
        self.post_action(json!({
            "type": "order",
            "orders": wire,
            "grouping": "na",
        }))
        .await
    }

    async fn bulk_cancel_by_cloid(&self, cancels: &[CancelByCloid]) -> Result<ExchangeResponse> {
        let wire: Vec<Value> = cancels
            .iter()
            .map(|c| json!({ "asset": c.asset, "cloid": c.cloid }))
            .collect();
        self.post_action(json!({
            "type": "cancelByCloid",
            "cancels": wire,
        }))
        .await
    }

    async fn cancel_all(&self, asset_ids: &[u32]) -> Result<()> {
        for asset in asset_ids {
            let resp = self
                .post_action(json!({ "type": "cancelAll", "asset": asset }))
                .await?;
            if !resp.is_ok() {
                warn!(asset, status = %resp.status, "cancel-all returned non-ok status");
            }
        }
        Ok(())
    }
}

/// Venue decimal rendering: fixed precision with trailing zeros trimmed.
fn fmt_decimal(v: f64) -> String {
    let mut s = format!("{v:.8}");
    while s.ends_with('0') {
        s.pop();
    }
    if s.ends_with('.') {
        s.pop();
    }
    s
}

#[derive(Debug, Serialize)]
struct SignedPayload {
    action: Value,
    nonce: u64,
}

fn sign_action(action: &Value, nonce: u64, signing_key: &SigningKey) -> Result<Value> {
    let payload = SignedPayload {
        action: action.clone(),
        nonce,
    };
    let packed = rmp_serde::to_vec_named(&payload)?;
    let digest = Keccak256::new().chain_update(&packed);
    let (sig, recid) = signing_key.sign_digest_recoverable(digest)?;
    let (r, s) = sig.split_bytes();
    Ok(json!({
        "r": format!("0x{}", hex::encode(r)),
        "s": format!("0x{}", hex::encode(s)),
        "v": recid.to_byte(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fmt_decimal_trims_trailing_zeros() {
        assert_eq!(fmt_decimal(108.0), "108");
        assert_eq!(fmt_decimal(0.012346), "0.012346");
        assert_eq!(fmt_decimal(1999.5), "1999.5");
    }

    #[test]
    fn status_items_decode_both_wire_forms() {
        let raw = r#"{
            "status": "ok",
            "response": {"type": "order", "data": {"statuses": [
                "success",
                {"resting": {"oid": 77, "cloid": "0xabc"}},
                {"filled": {"oid": 78, "totalSz": "1.5", "avgPx": "100.0"}},
                {"error": "Order must have minimum value of $10"}
            ]}}
        }"#;
        let resp: ExchangeResponse = serde_json::from_str(raw).unwrap();
        assert!(resp.is_ok());
        let statuses = resp.statuses();
        assert_eq!(statuses.len(), 4);
        assert_eq!(statuses[0].status, "success");
        assert!(!statuses[0].is_err());
        assert_eq!(statuses[1].resting.as_ref().unwrap().oid, 77);
        assert_eq!(statuses[2].filled.as_ref().unwrap().total_sz, Some(1.5));
        assert!(statuses[3].is_err());
    }

    #[test]
    fn non_ok_top_level_status() {
        let resp: ExchangeResponse = serde_json::from_str(r#"{"status": "err"}"#).unwrap();
        assert!(!resp.is_ok());
        assert!(resp.statuses().is_empty());
    }

    #[tokio::test]
    async fn http_client_round_trips_bulk_orders() {
        use std::io::Read;
        use tiny_http::{Response, Server};

        let server = Server::http("127.0.0.1:0").expect("bind server");
        let addr = server.server_addr();
        let url = format!("http://{addr}");
        std::thread::spawn(move || {
            for mut request in server.incoming_requests().take(1) {
                let mut body = String::new();
                let _ = request.as_reader().read_to_string(&mut body);
                assert!(body.contains(r#""type":"order""#));
                assert!(body.contains(r#""signature""#));
                let resp = Response::from_string(
                    r#"{"status":"ok","response":{"type":"order","data":{"statuses":[{"resting":{"oid":1,"cloid":"0x0000000000000000000000000000002a"}}]}}}"#,
                );
                let _ = request.respond(resp);
            }
        });

        let client = HttpVenueClient::new(
            "0000000000000000000000000000000000000000000000000000000000000001",
            url.clone(),
            url,
            None,
        )
        .expect("client");
        let orders = vec![OrderRequest {
            coin: "ETH".to_string(),
            asset: 1,
            is_buy: true,
            limit_px: 108.0,
            sz: 4.0,
            reduce_only: false,
            tif: Tif::Alo,
            cloid: Some("0x0000000000000000000000000000002a".to_string()),
        }];
        let resp = client.bulk_orders(&orders).await.expect("bulk orders");
        assert!(resp.is_ok());
        assert_eq!(resp.statuses()[0].resting.as_ref().unwrap().oid, 1);
    }
}
