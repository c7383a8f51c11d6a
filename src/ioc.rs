//! Aggressive-order reconciler. Compares the leader's positions (risk-scaled)
//! against a speculative projection of the follower's positions and closes
//! any drift above the minimum notional with marketable taker orders. The
//! projection is advanced optimistically as orders go out and overwritten by
//! every authoritative follower frame. A per-block usage set stops the engine
//! from acting twice on the same follower snapshot.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::cache::{MarginStore, PriceCache, Readiness};
use crate::cloid::mint_cloid;
use crate::exchange::{OrderRequest, VenueApi};
use crate::frame::AccountFrame;
use crate::logging::LogSink;
use crate::models::{OrderMessage, Side, Tif};
use crate::registry::AssetRegistry;
use crate::scale;

pub const MIN_NOTIONAL: f64 = 20.0;

const SZ_EPSILON: f64 = 1e-9;

/// One drift-closing decision for a single coin.
#[derive(Debug, Clone, PartialEq)]
pub struct DriftOrder {
    pub side: Side,
    pub sz: f64,
    pub reduce_only: bool,
}

/// Classify the (scaled leader, follower) position relation and decide the
/// order that closes the drift. `diff_sz` is the pre-rounded size gap; the
/// caller has already established that the drift notional clears the minimum.
pub fn classify_drift(
    scaled_szi: f64,
    paste_szi: f64,
    copy_notional: f64,
    paste_notional: f64,
    diff_sz: f64,
    min_notional: f64,
) -> Option<DriftOrder> {
    let mut reduce_only = false;
    let (side, sz) = if copy_notional > min_notional && paste_notional < min_notional {
        // Leader has a position the follower effectively lacks: open it.
        let side = if scaled_szi < 0.0 { Side::Ask } else { Side::Bid };
        (side, scaled_szi.abs())
    } else if copy_notional < min_notional && paste_notional > min_notional {
        // Leader is effectively flat: close the follower out.
        reduce_only = true;
        let side = if paste_szi < 0.0 { Side::Bid } else { Side::Ask };
        (side, paste_szi.abs())
    } else if scaled_szi > 0.0 && paste_szi > 0.0 {
        if copy_notional > paste_notional - min_notional {
            (Side::Bid, diff_sz)
        } else if copy_notional < paste_notional + min_notional {
            reduce_only = true;
            (Side::Ask, diff_sz)
        } else {
            return None;
        }
    } else if scaled_szi < 0.0 && paste_szi < 0.0 {
        if copy_notional > paste_notional - min_notional {
            (Side::Ask, diff_sz)
        } else if copy_notional < paste_notional + min_notional {
            reduce_only = true;
            (Side::Bid, diff_sz)
        } else {
            return None;
        }
    } else if scaled_szi > 0.0 && paste_szi < 0.0 {
        // Opposite directions: flip through zero in one order.
        (Side::Bid, paste_szi.abs() + scaled_szi.abs())
    } else if scaled_szi < 0.0 && paste_szi > 0.0 {
        (Side::Ask, paste_szi.abs() + scaled_szi.abs())
    } else {
        return None;
    };
    if sz < SZ_EPSILON {
        return None;
    }
    Some(DriftOrder { side, sz, reduce_only })
}

#[derive(Default)]
struct IocState {
    projected: Option<AHashMap<String, f64>>,
    latest_follower: Option<Arc<AccountFrame>>,
    used_follower_blocks: HashSet<i64>,
}

pub struct IocEngine {
    venue: Arc<dyn VenueApi>,
    registry: Arc<AssetRegistry>,
    prices: Arc<PriceCache>,
    margins: Arc<MarginStore>,
    readiness: Arc<Readiness>,
    sink: Arc<LogSink>,
    follower_addr: String,
    enabled: bool,
    state: Mutex<IocState>,
}

impl IocEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        venue: Arc<dyn VenueApi>,
        registry: Arc<AssetRegistry>,
        prices: Arc<PriceCache>,
        margins: Arc<MarginStore>,
        readiness: Arc<Readiness>,
        sink: Arc<LogSink>,
        follower_addr: &str,
        enabled: bool,
    ) -> Self {
        Self {
            venue,
            registry,
            prices,
            margins,
            readiness,
            sink,
            follower_addr: follower_addr.to_lowercase(),
            enabled,
            state: Mutex::new(IocState::default()),
        }
    }

    pub async fn run(
        self: Arc<Self>,
        mut leader_rx: mpsc::Receiver<Arc<AccountFrame>>,
        mut follower_rx: mpsc::Receiver<Arc<AccountFrame>>,
        mut orders_rx: mpsc::Receiver<OrderMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("ioc engine stopping");
                        return;
                    }
                }
                frame = leader_rx.recv() => match frame {
                    Some(frame) => self.on_leader_frame(&frame).await,
                    None => return,
                },
                frame = follower_rx.recv() => match frame {
                    Some(frame) => self.on_follower_frame(&frame),
                    None => return,
                },
                msg = orders_rx.recv() => match msg {
                    Some(msg) => self.on_order_updates(&msg).await,
                    None => return,
                },
            }
        }
    }

    /// Rebase the projection onto an authoritative follower snapshot.
    pub fn on_follower_frame(&self, frame: &Arc<AccountFrame>) {
        let mut st = self.state.lock().expect("ioc state poisoned");
        let mut projected = AHashMap::with_capacity(frame.positions.len());
        for pos in &frame.positions {
            projected.insert(pos.coin.clone(), pos.szi);
        }
        st.projected = Some(projected);
        st.latest_follower = Some(frame.clone());
    }

    pub async fn on_leader_frame(&self, frame: &Arc<AccountFrame>) {
        if !self.enabled || !self.readiness.is_ready() {
            return;
        }
        let orders = {
            let mut st = self.state.lock().expect("ioc state poisoned");
            if st.projected.is_none() {
                return;
            }
            self.plan_reconcile(frame, &mut st)
        };
        if !orders.is_empty() {
            self.send_ioc_orders(&orders).await;
        }
    }

    /// Diff every enabled coin against the projection and build the order
    /// batch. Runs under the state lock: the pass is atomic with respect to
    /// the projection it updates.
    fn plan_reconcile(&self, frame: &Arc<AccountFrame>, st: &mut IocState) -> Vec<OrderRequest> {
        let Some(follower) = st.latest_follower.clone() else {
            return Vec::new();
        };
        info!(leader = %frame.positions_key(), "ioc reconcile pass");

        let leader_positions = frame.positions_by_coin();
        let mut out = Vec::new();
        for coin in self.registry.enabled_coins() {
            let copy_szi = leader_positions.get(coin).map(|p| p.szi).unwrap_or(0.0);
            let paste_szi = st
                .projected
                .as_ref()
                .and_then(|p| p.get(coin).copied())
                .unwrap_or(0.0);
            let mid = self.prices.mid(coin);
            if copy_szi.abs() * mid < MIN_NOTIONAL && paste_szi.abs() * mid < MIN_NOTIONAL {
                continue;
            }
            if mid <= 0.0 {
                continue;
            }

            let decimals = self.registry.decimals(coin);
            let factor = scale::scale_factor(
                frame.account_value,
                follower.account_value,
                self.registry.risk(coin),
            );
            let scaled_szi = scale::round_to_precision(copy_szi * factor, decimals);
            let diff_sz = scale::round_to_precision((paste_szi - scaled_szi).abs(), decimals);
            let diff_notional = scale::round2(diff_sz * mid);
            if diff_notional < MIN_NOTIONAL {
                continue;
            }

            let copy_notional = scale::round2(scaled_szi.abs() * mid);
            let paste_notional = scale::round2(paste_szi.abs() * mid);
            let Some(drift) = classify_drift(
                scaled_szi,
                paste_szi,
                copy_notional,
                paste_notional,
                diff_sz,
                MIN_NOTIONAL,
            ) else {
                continue;
            };

            // One action per follower snapshot: a block time that was already
            // consumed means this drift was (or is being) handled.
            let follower_block = follower.clearinghouse_time_ms;
            if !st.used_follower_blocks.insert(follower_block) {
                warn!(
                    coin = %coin,
                    follower_block,
                    "follower snapshot already reconciled, skipping"
                );
                continue;
            }

            if !self.has_margin(coin, drift.side, drift.sz, mid) {
                continue;
            }

            let Some(asset) = self.registry.asset_id(coin) else {
                warn!(coin = %coin, "no asset id for ioc order, skipping");
                continue;
            };
            let request = OrderRequest {
                coin: coin.clone(),
                asset,
                is_buy: drift.side.is_buy(),
                limit_px: scale::marketable_price(mid, drift.side, decimals),
                sz: drift.sz,
                reduce_only: drift.reduce_only,
                tif: Tif::FrontendMarket,
                cloid: Some(mint_cloid(frame.clearinghouse_time_ms as u64)),
            };
            if let Some(projected) = st.projected.as_mut() {
                *projected.entry(coin.clone()).or_insert(0.0) += drift.side.sign() * drift.sz;
            }
            out.push(request);
        }
        out
    }

    /// Leader fills bridged straight to follower market orders, without
    /// waiting for the next snapshot diff. An (open -> filled) pair with the
    /// same venue order id carries the filled quantity.
    pub async fn on_order_updates(&self, msg: &OrderMessage) {
        if !self.enabled || !self.readiness.is_ready() {
            return;
        }
        let mut by_coin: AHashMap<&str, Vec<&crate::models::OrderUpdate>> = AHashMap::new();
        for update in &msg.data {
            if !self.registry.is_enabled(&update.order.coin) {
                continue;
            }
            by_coin.entry(update.order.coin.as_str()).or_default().push(update);
        }

        let mut orders = Vec::new();
        for (coin, updates) in by_coin {
            for pair in updates.windows(2) {
                let (current, next) = (pair[0], pair[1]);
                let open_filled = current.status == "open" && next.status == "filled";
                let same_oid = current.order.oid == next.order.oid;
                let filled_sz = next.order.orig_sz() - next.order.sz;
                if !(open_filled && same_oid && filled_sz.abs() > SZ_EPSILON) {
                    continue;
                }
                let mid = self.prices.mid(coin);
                let notional = scale::round2(filled_sz * mid);
                if notional < MIN_NOTIONAL {
                    continue;
                }
                if !self.has_margin(coin, next.order.side, filled_sz, mid) {
                    continue;
                }
                let Some(asset) = self.registry.asset_id(coin) else {
                    continue;
                };
                let decimals = self.registry.decimals(coin);
                let side = next.order.side;
                orders.push(OrderRequest {
                    coin: coin.to_string(),
                    asset,
                    is_buy: side.is_buy(),
                    limit_px: scale::marketable_price(mid, side, decimals),
                    sz: filled_sz,
                    reduce_only: next.order.reduce_only,
                    tif: Tif::FrontendMarket,
                    cloid: Some(mint_cloid(next.order.oid as u64)),
                });
                self.sink.log(
                    &self.follower_addr,
                    &format!("fill bridge {} {} {} (leader oid {})", side, filled_sz, coin, next.order.oid),
                );
            }
        }
        if orders.is_empty() {
            return;
        }
        {
            let mut st = self.state.lock().expect("ioc state poisoned");
            if let Some(projected) = st.projected.as_mut() {
                for order in &orders {
                    let sign = if order.is_buy { 1.0 } else { -1.0 };
                    *projected.entry(order.coin.clone()).or_insert(0.0) += sign * order.sz;
                }
            }
        }
        self.send_ioc_orders(&orders).await;
    }

    /// Margin availability guard: skip an order whose notional exceeds what
    /// the follower can still put on for that side.
    fn has_margin(&self, coin: &str, side: Side, sz: f64, mid: f64) -> bool {
        let Some(details) = self.margins.margin(&self.follower_addr, coin) else {
            warn!(coin, "no margin data for follower, skipping order");
            return false;
        };
        let idx = if side.is_buy() { 0 } else { 1 };
        let order_notional = scale::round2(sz * mid);
        let available = scale::round2(details.available_to_trade[idx] * details.leverage * mid);
        if available < order_notional {
            warn!(
                coin,
                wanted = order_notional,
                available,
                "insufficient follower margin, skipping order"
            );
            return false;
        }
        true
    }

    async fn send_ioc_orders(&self, orders: &[OrderRequest]) {
        match self.venue.bulk_orders(orders).await {
            Err(err) => error!(%err, "ioc bulk order submit failed"),
            Ok(resp) => {
                if !resp.is_ok() {
                    error!(status = %resp.status, "ioc bulk order returned non-ok status");
                    return;
                }
                for (i, status) in resp.statuses().iter().enumerate() {
                    let Some(req) = orders.get(i) else { break };
                    if status.is_err() {
                        error!(coin = %req.coin, error = %status.error, "ioc order rejected");
                        continue;
                    }
                    let filled = status
                        .filled
                        .as_ref()
                        .and_then(|f| f.total_sz)
                        .unwrap_or(0.0);
                    self.sink.log(
                        &self.follower_addr,
                        &format!(
                            "IOC {} {} filled {}",
                            if req.is_buy { "LONG" } else { "SHORT" },
                            req.coin,
                            filled
                        ),
                    );
                }
            }
        }
    }
}
