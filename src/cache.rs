//! Shared read-mostly stores: last mid price per coin, per-(user, coin)
//! margin availability, and the two-sided readiness latch. All writers go
//! through single entry points; readers see whole entries, never partial
//! updates.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use ahash::AHashMap;
use tracing::warn;

use crate::models::UserAssetData;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

#[derive(Debug, Default)]
pub struct PriceCache {
    mids: RwLock<AHashMap<String, f64>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_mid(&self, coin: &str, mid: f64) {
        if mid <= 0.0 {
            return;
        }
        let mut mids = self.mids.write().expect("price cache poisoned");
        mids.insert(coin.to_string(), mid);
    }

    /// Last observed mid for a coin; 0 when nothing has arrived yet, which
    /// downstream guards treat as "skip this coin".
    pub fn mid(&self, coin: &str) -> f64 {
        let mids = self.mids.read().expect("price cache poisoned");
        match mids.get(coin) {
            Some(mid) => *mid,
            None => {
                warn!(coin, "no mid price cached");
                0.0
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssetDetails {
    pub leverage: f64,
    pub max_trade_szs: [f64; 2],
    pub available_to_trade: [f64; 2],
}

impl AssetDetails {
    fn from_wire(data: &UserAssetData) -> Self {
        let pair = |v: &Vec<f64>| [
            v.first().copied().unwrap_or(0.0),
            v.get(1).copied().unwrap_or(0.0),
        ];
        Self {
            leverage: data.leverage.value,
            max_trade_szs: pair(&data.max_trade_szs),
            available_to_trade: pair(&data.available_to_trade),
        }
    }
}

/// Margin availability per (user, coin), fed by `activeAssetData` frames.
/// Tracks how many distinct coins each user has reported so readiness can be
/// derived from coverage of the enabled set.
#[derive(Debug, Default)]
pub struct MarginStore {
    inner: RwLock<MarginStoreInner>,
}

#[derive(Debug, Default)]
struct MarginStoreInner {
    details: AHashMap<(String, String), AssetDetails>,
    seen: HashSet<(String, String)>,
}

impl MarginStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store one margin entry; returns the number of distinct coins this user
    /// has reported so far.
    pub fn update(&self, data: &UserAssetData) -> usize {
        let user = data.user.to_lowercase();
        let key = (user.clone(), data.coin.clone());
        let mut inner = self.inner.write().expect("margin store poisoned");
        inner.details.insert(key.clone(), AssetDetails::from_wire(data));
        inner.seen.insert(key);
        inner.seen.iter().filter(|(u, _)| *u == user).count()
    }

    pub fn margin(&self, user: &str, coin: &str) -> Option<AssetDetails> {
        let user = user.to_lowercase();
        let inner = self.inner.read().expect("margin store poisoned");
        inner.details.get(&(user, coin.to_string())).cloned()
    }
}

/// Both sides must have produced an account snapshot and full asset-data
/// coverage before any engine may emit orders. Flags only ever latch on;
/// a transport reconnect does not reset them.
#[derive(Debug, Default)]
pub struct Readiness {
    leader_web: AtomicBool,
    follower_web: AtomicBool,
    leader_assets: AtomicBool,
    follower_assets: AtomicBool,
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_web_ready(&self, role: Role) {
        match role {
            Role::Leader => self.leader_web.store(true, Ordering::Release),
            Role::Follower => self.follower_web.store(true, Ordering::Release),
        }
    }

    pub fn set_asset_ready(&self, role: Role) {
        match role {
            Role::Leader => self.leader_assets.store(true, Ordering::Release),
            Role::Follower => self.follower_assets.store(true, Ordering::Release),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.leader_web.load(Ordering::Acquire)
            && self.follower_web.load(Ordering::Acquire)
            && self.leader_assets.load(Ordering::Acquire)
            && self.follower_assets.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Leverage;

    fn asset_data(user: &str, coin: &str) -> UserAssetData {
        UserAssetData {
            user: user.to_string(),
            coin: coin.to_string(),
            leverage: Leverage {
                kind: "cross".to_string(),
                value: 10.0,
            },
            max_trade_szs: vec![5.0, 6.0],
            available_to_trade: vec![100.0, 120.0],
        }
    }

    #[test]
    fn mid_defaults_to_zero_when_unknown() {
        let cache = PriceCache::new();
        assert_eq!(cache.mid("ETH"), 0.0);
        cache.update_mid("ETH", 2000.0);
        assert_eq!(cache.mid("ETH"), 2000.0);
    }

    #[test]
    fn non_positive_mids_are_ignored() {
        let cache = PriceCache::new();
        cache.update_mid("ETH", 2000.0);
        cache.update_mid("ETH", 0.0);
        cache.update_mid("ETH", -1.0);
        assert_eq!(cache.mid("ETH"), 2000.0);
    }

    #[test]
    fn margin_store_counts_distinct_coins_per_user() {
        let store = MarginStore::new();
        assert_eq!(store.update(&asset_data("0xA", "ETH")), 1);
        // Repeated coin does not advance coverage.
        assert_eq!(store.update(&asset_data("0xA", "ETH")), 1);
        assert_eq!(store.update(&asset_data("0xA", "BTC")), 2);
        // Other user counts independently.
        assert_eq!(store.update(&asset_data("0xB", "ETH")), 1);
    }

    #[test]
    fn margin_lookup_is_case_insensitive_on_user() {
        let store = MarginStore::new();
        store.update(&asset_data("0xAbC", "ETH"));
        let details = store.margin("0xabc", "ETH").unwrap();
        assert_eq!(details.leverage, 10.0);
        assert_eq!(details.available_to_trade, [100.0, 120.0]);
        assert!(store.margin("0xabc", "BTC").is_none());
    }

    #[test]
    fn readiness_requires_all_four_latches() {
        let readiness = Readiness::new();
        assert!(!readiness.is_ready());
        readiness.set_web_ready(Role::Leader);
        readiness.set_web_ready(Role::Follower);
        readiness.set_asset_ready(Role::Leader);
        assert!(!readiness.is_ready());
        readiness.set_asset_ready(Role::Follower);
        assert!(readiness.is_ready());
    }
}
