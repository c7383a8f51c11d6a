//! Account frames and the per-account chain. A frame is an immutable snapshot
//! of one account at one clearinghouse block; frames of the same account are
//! chained in arrival order, and frames of opposite accounts that share a
//! block time are cross-linked. Forward and cross pointers are weak and set
//! exactly once; the chain owner retains a bounded window of recent frames so
//! a frame's predecessor stays alive for diffing without the chain growing
//! for the whole session.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock, Weak};

use ahash::AHashMap;

use crate::error::ChainError;
use crate::models::{OpenOrder, Position, Tif, WebData2};
use crate::pipeline::DistinctKey;
use crate::registry::AssetRegistry;

/// How many frames per account stay reachable behind the head.
const RETAIN_FRAMES: usize = 64;

#[derive(Debug)]
pub struct AccountFrame {
    pub user: String,
    pub server_time_ms: i64,
    pub clearinghouse_time_ms: i64,
    pub account_value: f64,
    pub positions: Vec<Position>,
    pub open_orders: Vec<OpenOrder>,
    seq: u64,
    prev: Option<Weak<AccountFrame>>,
    next: OnceLock<Weak<AccountFrame>>,
    other: OnceLock<Weak<AccountFrame>>,
}

impl AccountFrame {
    fn from_snapshot(snapshot: WebData2) -> Self {
        let positions = snapshot
            .clearinghouse_state
            .asset_positions
            .into_iter()
            .map(|ap| ap.position)
            .collect();
        Self {
            user: snapshot.user.to_lowercase(),
            server_time_ms: snapshot.server_time,
            clearinghouse_time_ms: snapshot.clearinghouse_state.time,
            account_value: snapshot.clearinghouse_state.margin_summary.account_value,
            positions,
            open_orders: snapshot.open_orders,
            seq: 0,
            prev: None,
            next: OnceLock::new(),
            other: OnceLock::new(),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn prev(&self) -> Option<Arc<AccountFrame>> {
        self.prev.as_ref().and_then(Weak::upgrade)
    }

    pub fn next(&self) -> Option<Arc<AccountFrame>> {
        self.next.get().and_then(Weak::upgrade)
    }

    pub fn other(&self) -> Option<Arc<AccountFrame>> {
        self.other.get().and_then(Weak::upgrade)
    }

    pub fn is_head(&self) -> bool {
        self.seq == 0
    }

    pub fn address_short(&self) -> &str {
        if self.user.len() <= 6 {
            &self.user
        } else {
            &self.user[..6]
        }
    }

    pub fn orders_by_cloid(&self) -> AHashMap<String, OpenOrder> {
        let mut out = AHashMap::with_capacity(self.open_orders.len());
        for order in &self.open_orders {
            if let Some(cloid) = &order.cloid {
                if !cloid.is_empty() {
                    out.insert(cloid.clone(), order.clone());
                }
            }
        }
        out
    }

    pub fn positions_by_coin(&self) -> AHashMap<String, Position> {
        let mut out = AHashMap::with_capacity(self.positions.len());
        for pos in &self.positions {
            out.insert(pos.coin.clone(), pos.clone());
        }
        out
    }

    /// Passive leader orders that appeared since the previous frame, keyed by
    /// cloid and restricted to enabled coins. Empty when the previous frame is
    /// absent or already aged out of retention.
    pub fn new_alo_orders(&self, registry: &AssetRegistry) -> AHashMap<String, OpenOrder> {
        let mut out = AHashMap::new();
        let Some(prev) = self.prev() else {
            return out;
        };
        let prev_orders = prev.orders_by_cloid();
        for (cloid, order) in self.orders_by_cloid() {
            if order.tif != Some(Tif::Alo) {
                continue;
            }
            if registry.is_enabled(&order.coin) && !prev_orders.contains_key(&cloid) {
                out.insert(cloid, order);
            }
        }
        out
    }

    /// Passive leader orders that disappeared since the previous frame.
    pub fn cancelled_alo_orders(&self, registry: &AssetRegistry) -> AHashMap<String, OpenOrder> {
        let mut out = AHashMap::new();
        let Some(prev) = self.prev() else {
            return out;
        };
        let current = self.orders_by_cloid();
        for (cloid, order) in prev.orders_by_cloid() {
            if registry.is_enabled(&order.coin) && !current.contains_key(&cloid) {
                out.insert(cloid, order);
            }
        }
        out
    }

    /// Fingerprint of the account's margin allocation: per-coin margin usage
    /// as a percentage of account value, plus the free remainder. Stable under
    /// coin ordering, so it doubles as the frame's distinct key.
    pub fn positions_key(&self) -> String {
        if self.positions.is_empty() {
            return "{}".to_string();
        }
        if self.account_value <= 0.0 {
            return "{Free: 100}".to_string();
        }
        let mut entries: Vec<(String, f64)> = self
            .positions
            .iter()
            .map(|p| {
                let pct = (p.margin_used.unwrap_or(0.0) / self.account_value) * 100.0;
                (p.coin.clone(), crate::scale::round_to_precision(pct.max(0.0), 1))
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let total = crate::scale::round_to_precision(entries.iter().map(|e| e.1).sum(), 1);
        let mut parts: Vec<String> = entries
            .iter()
            .map(|(coin, pct)| format!("{coin}: {pct}"))
            .collect();
        if total < 100.0 {
            parts.push(format!("Free: {}", crate::scale::round_to_precision(100.0 - total, 1)));
        }
        format!("{{{}}}", parts.join(", "))
    }
}

impl DistinctKey for Arc<AccountFrame> {
    fn distinct_key(&self) -> String {
        self.positions_key()
    }
}

/// Per-account frame history. Owns the retention window; everything else
/// reaches frames through Arcs handed out by `link`.
#[derive(Debug, Default)]
pub struct FrameChain {
    head: Option<Arc<AccountFrame>>,
    recent: VecDeque<Arc<AccountFrame>>,
}

impl FrameChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&self) -> Option<&Arc<AccountFrame>> {
        self.head.as_ref()
    }

    /// Append a decoded snapshot to the chain, enforcing the chain invariants
    /// against the current head. Violations are venue or decoding bugs and
    /// surface as fatal errors.
    pub fn link(&mut self, snapshot: WebData2) -> Result<Arc<AccountFrame>, ChainError> {
        let mut frame = AccountFrame::from_snapshot(snapshot);
        if let Some(head) = &self.head {
            if head.user != frame.user {
                return Err(ChainError::UserMismatch {
                    prev: head.user.clone(),
                    next: frame.user.clone(),
                });
            }
            if head.server_time_ms >= frame.server_time_ms {
                return Err(ChainError::ServerTimeOrder {
                    prev: head.server_time_ms,
                    next: frame.server_time_ms,
                });
            }
            if head.clearinghouse_time_ms > frame.clearinghouse_time_ms {
                return Err(ChainError::ClearinghouseTimeOrder {
                    prev: head.clearinghouse_time_ms,
                    next: frame.clearinghouse_time_ms,
                });
            }
            frame.seq = head.seq + 1;
            frame.prev = Some(Arc::downgrade(head));
        }
        let frame = Arc::new(frame);
        if let Some(head) = &self.head {
            if head.next.set(Arc::downgrade(&frame)).is_err() {
                return Err(ChainError::NextAlreadyLinked { seq: head.seq });
            }
        }
        self.head = Some(frame.clone());
        self.recent.push_back(frame.clone());
        while self.recent.len() > RETAIN_FRAMES {
            self.recent.pop_front();
        }
        Ok(frame)
    }
}

/// Cross-link two frames of opposite accounts that share a clearinghouse
/// block time. Both frames must have a predecessor; linking the same pair
/// twice is a no-op, linking to a different partner is fatal. Returns whether
/// a link was established.
pub fn cross_link(a: &Arc<AccountFrame>, b: &Arc<AccountFrame>) -> Result<bool, ChainError> {
    if a.user == b.user {
        return Err(ChainError::CrossLinkSameUser { user: a.user.clone() });
    }
    if a.clearinghouse_time_ms != b.clearinghouse_time_ms {
        return Err(ChainError::CrossLinkTimeMismatch {
            left: a.clearinghouse_time_ms,
            right: b.clearinghouse_time_ms,
        });
    }
    if a.is_head() || b.is_head() {
        return Ok(false);
    }
    for (frame, partner) in [(a, b), (b, a)] {
        if let Some(existing) = frame.other.get() {
            match existing.upgrade() {
                Some(current) if Arc::ptr_eq(&current, partner) => continue,
                _ => return Err(ChainError::CrossLinkConflict),
            }
        }
        if frame.other.set(Arc::downgrade(partner)).is_err() {
            // Raced with itself; only conflicting partners are fatal.
            match frame.other.get().and_then(Weak::upgrade) {
                Some(current) if Arc::ptr_eq(&current, partner) => continue,
                _ => return Err(ChainError::CrossLinkConflict),
            }
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AssetPosition, ClearinghouseState, MarginSummary, Side,
    };
    use ahash::AHashMap as Map;

    fn snapshot(user: &str, server_time: i64, ch_time: i64, account_value: f64) -> WebData2 {
        WebData2 {
            clearinghouse_state: ClearinghouseState {
                margin_summary: MarginSummary {
                    account_value,
                    total_ntl_pos: None,
                    total_margin_used: None,
                },
                asset_positions: Vec::new(),
                time: ch_time,
            },
            open_orders: Vec::new(),
            asset_ctxs: Vec::new(),
            server_time,
            user: user.to_string(),
        }
    }

    fn alo_order(coin: &str, cloid: &str, px: f64, sz: f64) -> OpenOrder {
        OpenOrder {
            coin: coin.to_string(),
            side: Side::Bid,
            limit_px: px,
            sz,
            orig_sz: Some(sz),
            oid: 0,
            timestamp: 0,
            reduce_only: false,
            tif: Some(Tif::Alo),
            cloid: Some(cloid.to_string()),
        }
    }

    fn registry() -> AssetRegistry {
        let universe = vec![("ETH".to_string(), 4)];
        let mut risk = Map::new();
        risk.insert("ETH".to_string(), 1.0);
        AssetRegistry::new(&universe, risk)
    }

    #[test]
    fn links_assign_sequence_and_pointers() {
        let mut chain = FrameChain::new();
        let a = chain.link(snapshot("0xA", 100, 10, 50.0)).unwrap();
        let b = chain.link(snapshot("0xA", 200, 20, 50.0)).unwrap();
        assert_eq!(a.seq(), 0);
        assert_eq!(b.seq(), 1);
        assert!(a.is_head());
        assert!(Arc::ptr_eq(&b.prev().unwrap(), &a));
        assert!(Arc::ptr_eq(&a.next().unwrap(), &b));
        assert!(b.next().is_none());
    }

    #[test]
    fn user_is_lowercased_on_ingest() {
        let mut chain = FrameChain::new();
        let a = chain.link(snapshot("0xAbCd", 100, 10, 50.0)).unwrap();
        assert_eq!(a.user, "0xabcd");
        assert_eq!(a.address_short(), "0xabcd");
    }

    #[test]
    fn server_time_must_strictly_increase() {
        let mut chain = FrameChain::new();
        chain.link(snapshot("0xA", 100, 10, 50.0)).unwrap();
        let err = chain.link(snapshot("0xA", 100, 20, 50.0)).unwrap_err();
        assert!(matches!(err, ChainError::ServerTimeOrder { .. }));
    }

    #[test]
    fn clearinghouse_time_must_not_decrease() {
        let mut chain = FrameChain::new();
        chain.link(snapshot("0xA", 100, 10, 50.0)).unwrap();
        let err = chain.link(snapshot("0xA", 200, 9, 50.0)).unwrap_err();
        assert!(matches!(err, ChainError::ClearinghouseTimeOrder { .. }));
        // Equal clearinghouse time with advancing server time is allowed.
        chain.link(snapshot("0xA", 300, 10, 50.0)).unwrap();
    }

    #[test]
    fn user_mismatch_is_fatal() {
        let mut chain = FrameChain::new();
        chain.link(snapshot("0xA", 100, 10, 50.0)).unwrap();
        let err = chain.link(snapshot("0xB", 200, 20, 50.0)).unwrap_err();
        assert!(matches!(err, ChainError::UserMismatch { .. }));
    }

    #[test]
    fn cross_link_requires_predecessors() {
        let mut leader = FrameChain::new();
        let mut follower = FrameChain::new();
        let l0 = leader.link(snapshot("0xA", 100, 10, 50.0)).unwrap();
        let f0 = follower.link(snapshot("0xB", 101, 10, 80.0)).unwrap();
        // Both are chain heads with no predecessor: skipped, not fatal.
        assert!(!cross_link(&l0, &f0).unwrap());

        let l1 = leader.link(snapshot("0xA", 200, 20, 50.0)).unwrap();
        let f1 = follower.link(snapshot("0xB", 201, 20, 80.0)).unwrap();
        assert!(cross_link(&l1, &f1).unwrap());
        assert!(Arc::ptr_eq(&l1.other().unwrap(), &f1));
        assert!(Arc::ptr_eq(&f1.other().unwrap(), &l1));
    }

    #[test]
    fn cross_link_is_idempotent_but_conflicts_are_fatal() {
        let mut leader = FrameChain::new();
        let mut follower = FrameChain::new();
        leader.link(snapshot("0xA", 100, 10, 50.0)).unwrap();
        follower.link(snapshot("0xB", 101, 10, 80.0)).unwrap();
        let l1 = leader.link(snapshot("0xA", 200, 20, 50.0)).unwrap();
        let f1 = follower.link(snapshot("0xB", 201, 20, 80.0)).unwrap();
        assert!(cross_link(&l1, &f1).unwrap());
        // Same pair again: idempotent.
        assert!(cross_link(&l1, &f1).unwrap());

        // A different follower frame at a later block must not steal the link.
        let f2 = follower.link(snapshot("0xB", 301, 20, 80.0)).unwrap();
        let err = cross_link(&l1, &f2).unwrap_err();
        assert!(matches!(err, ChainError::CrossLinkConflict));
    }

    #[test]
    fn cross_link_validates_user_and_time() {
        let mut leader = FrameChain::new();
        let mut follower = FrameChain::new();
        leader.link(snapshot("0xA", 100, 10, 50.0)).unwrap();
        follower.link(snapshot("0xB", 101, 11, 80.0)).unwrap();
        let l1 = leader.link(snapshot("0xA", 200, 20, 50.0)).unwrap();
        let f1 = follower.link(snapshot("0xB", 201, 21, 80.0)).unwrap();
        assert!(matches!(
            cross_link(&l1, &f1).unwrap_err(),
            ChainError::CrossLinkTimeMismatch { .. }
        ));
        let mut leader2 = FrameChain::new();
        leader2.link(snapshot("0xA", 110, 20, 50.0)).unwrap();
        let l2 = leader2.link(snapshot("0xA", 210, 20, 50.0)).unwrap();
        assert!(matches!(
            cross_link(&l1, &l2).unwrap_err(),
            ChainError::CrossLinkSameUser { .. }
        ));
    }

    #[test]
    fn alo_diffs_track_appearing_and_disappearing_cloids() {
        let reg = registry();
        let mut chain = FrameChain::new();
        let mut snap_a = snapshot("0xA", 100, 10, 50.0);
        snap_a.open_orders = vec![alo_order("ETH", "0xaaa", 100.0, 1.0)];
        chain.link(snap_a).unwrap();

        let mut snap_b = snapshot("0xA", 200, 20, 50.0);
        snap_b.open_orders = vec![
            alo_order("ETH", "0xaaa", 100.0, 1.0),
            alo_order("ETH", "0xbbb", 101.0, 2.0),
        ];
        let b = chain.link(snap_b).unwrap();
        let created = b.new_alo_orders(&reg);
        assert_eq!(created.len(), 1);
        assert!(created.contains_key("0xbbb"));
        assert!(b.cancelled_alo_orders(&reg).is_empty());

        let mut snap_c = snapshot("0xA", 300, 30, 50.0);
        snap_c.open_orders = vec![alo_order("ETH", "0xbbb", 101.0, 2.0)];
        let c = chain.link(snap_c).unwrap();
        let cancelled = c.cancelled_alo_orders(&reg);
        assert_eq!(cancelled.len(), 1);
        assert!(cancelled.contains_key("0xaaa"));
        assert!(c.new_alo_orders(&reg).is_empty());
    }

    #[test]
    fn alo_diffs_ignore_non_alo_and_disabled_coins() {
        let reg = registry();
        let mut chain = FrameChain::new();
        chain.link(snapshot("0xA", 100, 10, 50.0)).unwrap();
        let mut snap = snapshot("0xA", 200, 20, 50.0);
        let mut ioc = alo_order("ETH", "0xioc", 100.0, 1.0);
        ioc.tif = Some(Tif::Ioc);
        let disabled = alo_order("BTC", "0xbtc", 100.0, 1.0);
        snap.open_orders = vec![ioc, disabled];
        let frame = chain.link(snap).unwrap();
        assert!(frame.new_alo_orders(&reg).is_empty());
    }

    #[test]
    fn head_frame_diffs_are_empty() {
        let reg = registry();
        let mut chain = FrameChain::new();
        let mut snap = snapshot("0xA", 100, 10, 50.0);
        snap.open_orders = vec![alo_order("ETH", "0xaaa", 100.0, 1.0)];
        let head = chain.link(snap).unwrap();
        assert!(head.new_alo_orders(&reg).is_empty());
        assert!(head.cancelled_alo_orders(&reg).is_empty());
    }

    #[test]
    fn positions_key_fingerprints_margin_allocation() {
        let mut chain = FrameChain::new();
        let mut snap = snapshot("0xA", 100, 10, 200.0);
        snap.clearinghouse_state.asset_positions = vec![AssetPosition {
            position: Position {
                coin: "ETH".to_string(),
                szi: 1.0,
                leverage: Default::default(),
                entry_px: None,
                position_value: None,
                unrealized_pnl: None,
                margin_used: Some(50.0),
            },
        }];
        let frame = chain.link(snap).unwrap();
        assert_eq!(frame.positions_key(), "{ETH: 25, Free: 75}");
        assert_eq!(frame.distinct_key(), frame.positions_key());
    }

    #[test]
    fn empty_positions_key() {
        let mut chain = FrameChain::new();
        let frame = chain.link(snapshot("0xA", 100, 10, 200.0)).unwrap();
        assert_eq!(frame.positions_key(), "{}");
    }
}
