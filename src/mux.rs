//! Stream multiplexer: decodes raw feed frames by their channel tag, keeps
//! the per-account frame chains and cross-links, refreshes the price and
//! margin caches, and fans decoded items out to the reconcilers over bounded
//! queues. Publishing never blocks the socket: when a subscriber queue is
//! full the chain still advances and only that subscriber's notification is
//! dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::{MarginStore, PriceCache, Readiness, Role};
use crate::error::ChainError;
use crate::frame::{cross_link, AccountFrame, FrameChain};
use crate::logging::LogSink;
use crate::models::{
    ActiveAssetDataMessage, L2BookMessage, OrderMessage, SubscriptionResponse, UserAssetData,
    WebData2, WebData2Message,
};
use crate::registry::AssetRegistry;

/// Decoded inbound frame, discriminated by the feed's `channel` tag.
#[derive(Debug)]
pub enum StreamFrame {
    AccountSnapshot(Box<WebData2>),
    AssetData(UserAssetData),
    OrderUpdates(OrderMessage),
    Book(L2BookMessage),
    SubscriptionAck(SubscriptionResponse),
}

/// Decode one raw feed frame. Unknown channels and undecodable payloads yield
/// None; the transport drops them.
pub fn decode_frame(raw: &str) -> Option<StreamFrame> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let channel = value.get("channel")?.as_str()?.to_string();
    match channel.as_str() {
        "webData2" => serde_json::from_value::<WebData2Message>(value)
            .ok()
            .map(|m| StreamFrame::AccountSnapshot(Box::new(m.data))),
        "activeAssetData" => serde_json::from_value::<ActiveAssetDataMessage>(value)
            .ok()
            .map(|m| StreamFrame::AssetData(m.data)),
        "orderUpdates" => serde_json::from_value::<OrderMessage>(value)
            .ok()
            .map(StreamFrame::OrderUpdates),
        "l2Book" => serde_json::from_value::<L2BookMessage>(value)
            .ok()
            .map(StreamFrame::Book),
        "subscriptionResponse" => serde_json::from_value::<SubscriptionResponse>(value)
            .ok()
            .map(StreamFrame::SubscriptionAck),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct Chains {
    leader: FrameChain,
    follower: FrameChain,
}

pub struct Multiplexer {
    registry: Arc<AssetRegistry>,
    prices: Arc<PriceCache>,
    margins: Arc<MarginStore>,
    readiness: Arc<Readiness>,
    sink: Arc<LogSink>,
    leader_addr: String,
    follower_addr: String,
    chains: Mutex<Chains>,
    leader_tx: mpsc::Sender<Arc<AccountFrame>>,
    follower_tx: mpsc::Sender<Arc<AccountFrame>>,
    orders_tx: mpsc::Sender<OrderMessage>,
    acks_seen: AtomicUsize,
    acks_needed: usize,
}

impl Multiplexer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<AssetRegistry>,
        prices: Arc<PriceCache>,
        margins: Arc<MarginStore>,
        readiness: Arc<Readiness>,
        sink: Arc<LogSink>,
        leader_addr: &str,
        follower_addr: &str,
        leader_tx: mpsc::Sender<Arc<AccountFrame>>,
        follower_tx: mpsc::Sender<Arc<AccountFrame>>,
        orders_tx: mpsc::Sender<OrderMessage>,
    ) -> Self {
        // webData2 and one activeAssetData per enabled coin for each account,
        // plus orderUpdates on the leader.
        let acks_needed = 2 * (registry.enabled_coins().len() + 1) + 1;
        Self {
            registry,
            prices,
            margins,
            readiness,
            sink,
            leader_addr: leader_addr.to_lowercase(),
            follower_addr: follower_addr.to_lowercase(),
            chains: Mutex::new(Chains::default()),
            leader_tx,
            follower_tx,
            orders_tx,
            acks_seen: AtomicUsize::new(0),
            acks_needed,
        }
    }

    fn role_of(&self, user: &str) -> Option<Role> {
        if user.eq_ignore_ascii_case(&self.leader_addr) {
            Some(Role::Leader)
        } else if user.eq_ignore_ascii_case(&self.follower_addr) {
            Some(Role::Follower)
        } else {
            None
        }
    }

    /// Route one raw frame. Only frame-chain invariant violations surface as
    /// errors; everything else is handled or dropped in place.
    pub fn handle_raw(&self, raw: &str) -> Result<(), ChainError> {
        match decode_frame(raw) {
            Some(StreamFrame::AccountSnapshot(snapshot)) => self.on_account_snapshot(*snapshot),
            Some(StreamFrame::AssetData(data)) => {
                self.on_asset_data(data);
                Ok(())
            }
            Some(StreamFrame::OrderUpdates(msg)) => {
                self.on_order_updates(msg);
                Ok(())
            }
            Some(StreamFrame::Book(book)) => {
                self.on_book(&book);
                Ok(())
            }
            Some(StreamFrame::SubscriptionAck(_)) => {
                let seen = self.acks_seen.fetch_add(1, Ordering::Relaxed) + 1;
                if seen == self.acks_needed {
                    info!("all {seen} feed subscriptions acknowledged");
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn on_account_snapshot(&self, snapshot: WebData2) -> Result<(), ChainError> {
        let Some(role) = self.role_of(&snapshot.user) else {
            warn!(user = %snapshot.user, "account snapshot for unknown user");
            return Ok(());
        };

        for coin in self.registry.enabled_coins() {
            let Some(info) = self.registry.info(coin) else {
                continue;
            };
            if let Some(ctx) = snapshot.asset_ctxs.get(info.asset_id as usize) {
                if let Some(mid) = ctx.mid_px {
                    self.prices.update_mid(coin, mid);
                }
            }
        }

        let mut guard = self.chains.lock().expect("frame chains poisoned");
        let chains = &mut *guard;
        let (chain, other_chain, tx) = match role {
            Role::Leader => (&mut chains.leader, &chains.follower, &self.leader_tx),
            Role::Follower => (&mut chains.follower, &chains.leader, &self.follower_tx),
        };

        if let Some(head) = chain.head() {
            if head.clearinghouse_time_ms == snapshot.clearinghouse_state.time {
                debug!(
                    user = %snapshot.user,
                    ch_time = snapshot.clearinghouse_state.time,
                    "duplicate clearinghouse block, dropping snapshot"
                );
                return Ok(());
            }
        }

        let frame = chain.link(snapshot)?;
        if let Some(opposite) = other_chain.head() {
            if opposite.clearinghouse_time_ms == frame.clearinghouse_time_ms
                && opposite.user != frame.user
            {
                cross_link(&frame, opposite)?;
            }
        }
        drop(guard);

        self.readiness.set_web_ready(role);
        match tx.try_send(frame.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.sink.log(
                    &frame.user,
                    &format!(
                        "{} slow subscriber, dropped frame notification n={} ch={}",
                        frame.address_short(),
                        frame.seq(),
                        frame.clearinghouse_time_ms
                    ),
                );
                warn!(user = %frame.user, seq = frame.seq(), "fan-out queue full, dropping frame notification");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(user = %frame.user, "fan-out queue closed");
            }
        }
        Ok(())
    }

    fn on_asset_data(&self, data: UserAssetData) {
        let Some(role) = self.role_of(&data.user) else {
            warn!(user = %data.user, coin = %data.coin, "asset data for unknown user");
            return;
        };
        let distinct = self.margins.update(&data);
        if distinct >= self.registry.enabled_coins().len() {
            self.readiness.set_asset_ready(role);
        }
    }

    fn on_order_updates(&self, msg: OrderMessage) {
        // Dropped silently until both sides are ready.
        if !self.readiness.is_ready() {
            return;
        }
        if let Err(err) = self.orders_tx.try_send(msg) {
            warn!(%err, "order updates fan-out full or closed, dropping message");
        }
    }

    fn on_book(&self, book: &L2BookMessage) {
        if !self.registry.is_enabled(&book.data.coin) {
            return;
        }
        if let Some(mid) = book.mid() {
            self.prices.update_mid(&book.data.coin, mid);
        }
    }
}
