//! Operator configuration. A JSON file holds the follower's signing key, the
//! two account addresses, and the per-coin risk multipliers; the path comes
//! from `MIRROR_CONFIG` (with `.env` support) and falls back to `config.json`
//! beside or above the working directory. Any problem here is fatal before
//! the session starts.

use std::path::Path;

use ahash::AHashMap;
use anyhow::{bail, Context, Result};
use serde::Deserialize;

fn default_ws_url() -> String {
    "wss://api.hyperliquid.xyz/ws".to_string()
}

fn default_info_url() -> String {
    "https://api.hyperliquid.xyz/info".to_string()
}

fn default_exchange_url() -> String {
    "https://api.hyperliquid.xyz/exchange".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub comments: String,
    pub secret_key: String,
    /// The driven account.
    #[serde(rename = "account_address")]
    pub follower_address: String,
    /// The observed account.
    #[serde(rename = "copy_address")]
    pub leader_address: String,
    /// Coin -> risk multiplier; zero or missing disables the coin.
    #[serde(rename = "coins")]
    pub coin_risk: AHashMap<String, f64>,
    #[serde(default)]
    pub disable_alo_engine: bool,
    #[serde(default)]
    pub disable_ioc_engine: bool,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_info_url")]
    pub info_url: String,
    #[serde(default = "default_exchange_url")]
    pub exchange_url: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("MIRROR_CONFIG") {
            return Self::from_file(Path::new(&path));
        }
        for candidate in ["config.json", "../config.json"] {
            let path = Path::new(candidate);
            if path.is_file() {
                return Self::from_file(path);
            }
        }
        bail!("no config file found (set MIRROR_CONFIG or place config.json in the working directory)")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut cfg: Config = serde_json::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        cfg.leader_address = cfg.leader_address.to_lowercase();
        cfg.follower_address = cfg.follower_address.to_lowercase();
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.secret_key.trim().is_empty() {
            bail!("config: secret_key is empty");
        }
        if self.leader_address.is_empty() || self.follower_address.is_empty() {
            bail!("config: both copy_address and account_address are required");
        }
        if self.leader_address == self.follower_address {
            bail!("config: copy_address and account_address must differ");
        }
        if self.coin_risk.is_empty() {
            bail!("config: at least one coin with a risk multiplier is required");
        }
        for (coin, mult) in &self.coin_risk {
            if !mult.is_finite() || *mult < 0.0 {
                bail!("config: coin {coin} has invalid risk multiplier {mult}");
            }
        }
        Ok(())
    }
}
