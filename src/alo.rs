//! Passive-order reconciler. Watches consecutive leader frames for resting
//! limit orders that appeared or disappeared and mirrors them on the follower
//! at risk-scaled size, keyed by the leader's own client ids so later frames
//! compare cleanly. Created and cancelled cloid sets only ever grow within a
//! session, which makes resubmission after venue errors harmless.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::exchange::{CancelByCloid, OrderRequest, VenueApi};
use crate::frame::AccountFrame;
use crate::logging::LogSink;
use crate::models::{OpenOrder, Tif};
use crate::registry::AssetRegistry;
use crate::scale;

pub const MIN_NOTIONAL: f64 = 20.0;

#[derive(Default)]
struct AloState {
    created: HashSet<String>,
    cancelled: HashSet<String>,
    follower_orders: Option<AHashMap<String, OpenOrder>>,
    latest_follower: Option<Arc<AccountFrame>>,
}

pub struct AloEngine {
    venue: Arc<dyn VenueApi>,
    registry: Arc<AssetRegistry>,
    sink: Arc<LogSink>,
    follower_addr: String,
    enabled: bool,
    state: Mutex<AloState>,
}

impl AloEngine {
    pub fn new(
        venue: Arc<dyn VenueApi>,
        registry: Arc<AssetRegistry>,
        sink: Arc<LogSink>,
        follower_addr: &str,
        enabled: bool,
    ) -> Self {
        Self {
            venue,
            registry,
            sink,
            follower_addr: follower_addr.to_lowercase(),
            enabled,
            state: Mutex::new(AloState::default()),
        }
    }

    pub async fn run(
        self: Arc<Self>,
        mut leader_rx: mpsc::Receiver<Arc<AccountFrame>>,
        mut follower_rx: mpsc::Receiver<Arc<AccountFrame>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("alo engine stopping");
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
            }
        }
    }

    /// Refresh the view of the follower's resting book. Until the first
    /// follower frame arrives no reconciliation runs.
    pub fn on_follower_frame(&self, frame: &Arc<AccountFrame>) {
        let mut st = self.state.lock().expect("alo state poisoned");
        st.follower_orders = Some(frame.orders_by_cloid());
        st.latest_follower = Some(frame.clone());
    }

    pub async fn on_leader_frame(&self, frame: &Arc<AccountFrame>) {
        if !self.enabled {
            return;
        }
        let (creates, cancels) = {
            let mut st = self.state.lock().expect("alo state poisoned");
            let Some(follower_orders) = st.follower_orders.clone() else {
                return;
            };
            let follower_av = st
                .latest_follower
                .as_ref()
                .map(|f| f.account_value)
                .unwrap_or(0.0);

            let mut creates = Vec::new();
            for (cloid, order) in frame.new_alo_orders(&self.registry) {
                if st.created.insert(cloid) {
                    creates.push(order);
                }
            }

            // Orders the leader dropped, plus follower orders with no leader
            // counterpart left (orphans from restarts or manual activity).
            let mut cancel_map = frame.cancelled_alo_orders(&self.registry);
            let leader_orders = frame.orders_by_cloid();
            for (cloid, order) in follower_orders {
                if !leader_orders.contains_key(&cloid) {
                    cancel_map.insert(cloid, order);
                }
            }
            let mut cancels = Vec::new();
            for (cloid, order) in cancel_map {
                if st.cancelled.insert(cloid.clone()) {
                    cancels.push((cloid, order));
                }
            }

            let creates = self.build_create_requests(creates, frame.account_value, follower_av);
            let cancels = self.build_cancel_requests(cancels);
            (creates, cancels)
        };

        if !creates.is_empty() {
            self.submit_creates(&creates).await;
        }
        if !cancels.is_empty() {
            self.submit_cancels(&cancels).await;
        }
    }

    fn build_create_requests(
        &self,
        orders: Vec<OpenOrder>,
        leader_av: f64,
        follower_av: f64,
    ) -> Vec<OrderRequest> {
        let mut out = Vec::with_capacity(orders.len());
        for order in orders {
            let Some(asset) = self.registry.asset_id(&order.coin) else {
                warn!(coin = %order.coin, "no asset id for create, skipping");
                continue;
            };
            let decimals = self.registry.decimals(&order.coin);
            let factor = scale::scale_factor(leader_av, follower_av, self.registry.risk(&order.coin));
            let sz = scale::round_to_precision(order.sz * factor, decimals);
            if sz <= 0.0 {
                warn!(coin = %order.coin, cloid = ?order.cloid, "scaled size rounded to zero, skipping");
                continue;
            }
            let notional = scale::round2(sz * order.limit_px);
            if notional < MIN_NOTIONAL {
                warn!(
                    coin = %order.coin,
                    notional,
                    "create below minimum notional, skipping"
                );
                continue;
            }
            out.push(OrderRequest {
                coin: order.coin.clone(),
                asset,
                is_buy: order.side.is_buy(),
                limit_px: order.limit_px,
                sz,
                reduce_only: order.reduce_only,
                tif: Tif::Alo,
                cloid: order.cloid.clone(),
            });
        }
        out
    }

    fn build_cancel_requests(&self, cancels: Vec<(String, OpenOrder)>) -> Vec<CancelByCloid> {
        let mut out = Vec::with_capacity(cancels.len());
        for (cloid, order) in cancels {
            if cloid.is_empty() {
                error!(coin = %order.coin, "cancel candidate with empty cloid");
                continue;
            }
            let Some(asset) = self.registry.asset_id(&order.coin) else {
                warn!(coin = %order.coin, %cloid, "no asset id for cancel, skipping");
                continue;
            };
            out.push(CancelByCloid { asset, cloid });
        }
        out
    }

    async fn submit_creates(&self, requests: &[OrderRequest]) {
        match self.venue.bulk_orders(requests).await {
            Err(err) => error!(%err, "alo bulk order submit failed"),
            Ok(resp) => {
                if !resp.is_ok() {
                    error!(status = %resp.status, "alo bulk order returned non-ok status");
                }
                for (i, status) in resp.statuses().iter().enumerate() {
                    if status.is_err() {
                        error!(
                            coin = requests.get(i).map(|r| r.coin.as_str()).unwrap_or("?"),
                            error = %status.error,
                            "alo order rejected"
                        );
                    } else if let Some(req) = requests.get(i) {
                        let resting_cloid = status
                            .resting
                            .as_ref()
                            .and_then(|r| r.cloid.as_deref())
                            .unwrap_or("");
                        if resting_cloid.is_empty() {
                            error!(coin = %req.coin, status = %status.status, "alo order came back without a resting cloid");
                        } else {
                            self.sink.log(
                                &self.follower_addr,
                                &format!(
                                    "ALO {} {} {} @ {} cloid={}",
                                    if req.is_buy { "BUY" } else { "SELL" },
                                    req.sz,
                                    req.coin,
                                    req.limit_px,
                                    resting_cloid
                                ),
                            );
                        }
                    }
                }
            }
        }
    }

    async fn submit_cancels(&self, cancels: &[CancelByCloid]) {
        match self.venue.bulk_cancel_by_cloid(cancels).await {
            Err(err) => error!(%err, "alo bulk cancel failed"),
            Ok(resp) => {
                if !resp.is_ok() {
                    error!(status = %resp.status, "alo bulk cancel returned non-ok status");
                }
                for (i, status) in resp.statuses().iter().enumerate() {
                    if status.is_err() {
                        let cloid = cancels.get(i).map(|c| c.cloid.as_str()).unwrap_or("?");
                        error!(cloid, error = %status.error, "alo cancel rejected");
                    } else if let Some(cancel) = cancels.get(i) {
                        self.sink.log(
                            &self.follower_addr,
                            &format!("ALO cancel asset={} cloid={}", cancel.asset, cancel.cloid),
                        );
                    }
                }
            }
        }
    }
}
