//! Immutable per-session view of venue metadata plus the operator's risk
//! configuration. Built once at startup; every engine reads it through an Arc.

use ahash::AHashMap;

#[derive(Debug, Clone, Copy)]
pub struct AssetInfo {
    pub asset_id: u32,
    pub sz_decimals: u32,
}

/// Coins without venue metadata fall back to this when asked for decimals.
const DEFAULT_SZ_DECIMALS: u32 = 2;

#[derive(Debug)]
pub struct AssetRegistry {
    assets: AHashMap<String, AssetInfo>,
    risk: AHashMap<String, f64>,
    enabled: Vec<String>,
}

impl AssetRegistry {
    /// `universe` is the venue's asset list in asset-id order. A coin is
    /// enabled when it exists in the universe and carries a positive risk
    /// multiplier; the enabled set is kept sorted so reconciliation passes
    /// walk coins in a stable order.
    pub fn new(universe: &[(String, u32)], risk: AHashMap<String, f64>) -> Self {
        let mut assets = AHashMap::with_capacity(universe.len());
        for (id, (name, sz_decimals)) in universe.iter().enumerate() {
            assets.insert(
                name.clone(),
                AssetInfo {
                    asset_id: id as u32,
                    sz_decimals: *sz_decimals,
                },
            );
        }
        let mut enabled: Vec<String> = risk
            .iter()
            .filter(|(coin, mult)| **mult > 0.0 && assets.contains_key(*coin))
            .map(|(coin, _)| coin.clone())
            .collect();
        enabled.sort();
        Self { assets, risk, enabled }
    }

    pub fn info(&self, coin: &str) -> Option<AssetInfo> {
        self.assets.get(coin).copied()
    }

    pub fn asset_id(&self, coin: &str) -> Option<u32> {
        self.info(coin).map(|i| i.asset_id)
    }

    pub fn decimals(&self, coin: &str) -> u32 {
        self.info(coin).map(|i| i.sz_decimals).unwrap_or(DEFAULT_SZ_DECIMALS)
    }

    pub fn is_enabled(&self, coin: &str) -> bool {
        self.enabled.iter().any(|c| c == coin)
    }

    pub fn enabled_coins(&self) -> &[String] {
        &self.enabled
    }

    /// Risk multiplier for a coin; zero for anything not configured, which
    /// suppresses all orders for that coin downstream.
    pub fn risk(&self, coin: &str) -> f64 {
        self.risk.get(coin).copied().unwrap_or(0.0)
    }
}
