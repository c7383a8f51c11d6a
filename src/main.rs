use std::sync::Arc;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use hypermirror::alo::AloEngine;
use hypermirror::cache::{MarginStore, PriceCache, Readiness};
use hypermirror::config::Config;
use hypermirror::exchange::{HttpVenueClient, OrderRequest, VenueApi};
use hypermirror::ioc::IocEngine;
use hypermirror::logging::{init_tracing, LogSink};
use hypermirror::models::Tif;
use hypermirror::mux::Multiplexer;
use hypermirror::pipeline::{Pipeline, QUEUE_DEPTH};
use hypermirror::registry::AssetRegistry;
use hypermirror::scale;
use hypermirror::ws::WsSession;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    let cfg = Config::load()?;
    info!(leader = %cfg.leader_address, follower = %cfg.follower_address, "config loaded");

    let venue: Arc<dyn VenueApi> = Arc::new(HttpVenueClient::new(
        &cfg.secret_key,
        cfg.info_url.clone(),
        cfg.exchange_url.clone(),
        None,
    )?);

    let universe: Vec<(String, u32)> = venue
        .fetch_meta()
        .await
        .context("fetch venue metadata")?
        .into_iter()
        .map(|m| (m.name, m.sz_decimals))
        .collect();
    let registry = Arc::new(AssetRegistry::new(&universe, cfg.coin_risk.clone()));
    info!(coins = ?registry.enabled_coins(), "asset registry built");

    reset_follower(&venue, &registry, &cfg.follower_address).await;

    let prices = Arc::new(PriceCache::new());
    let margins = Arc::new(MarginStore::new());
    let readiness = Arc::new(Readiness::new());
    let (sink, mut log_rx) = LogSink::new(
        &[cfg.leader_address.as_str(), cfg.follower_address.as_str()],
        10_000,
        QUEUE_DEPTH,
    );
    let sink = Arc::new(sink);

    let (leader_tx, leader_rx) = mpsc::channel(QUEUE_DEPTH);
    let (follower_tx, follower_rx) = mpsc::channel(QUEUE_DEPTH);
    let (orders_tx, orders_rx) = mpsc::channel(QUEUE_DEPTH);

    let mux = Arc::new(Multiplexer::new(
        registry.clone(),
        prices.clone(),
        margins.clone(),
        readiness.clone(),
        sink.clone(),
        &cfg.leader_address,
        &cfg.follower_address,
        leader_tx,
        follower_tx,
        orders_tx,
    ));

    // Each account's frame stream feeds both reconcilers.
    let mut leader_tees = Pipeline::new(leader_rx).tee(2);
    let mut follower_tees = Pipeline::new(follower_rx).tee(2);
    let ioc_leader = leader_tees.remove(0).into_receiver();
    let alo_leader = leader_tees.remove(0).into_receiver();
    let ioc_follower = follower_tees.remove(0).into_receiver();
    let alo_follower = follower_tees.remove(0).into_receiver();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let alo = Arc::new(AloEngine::new(
        venue.clone(),
        registry.clone(),
        sink.clone(),
        &cfg.follower_address,
        !cfg.disable_alo_engine,
    ));
    let ioc = Arc::new(IocEngine::new(
        venue.clone(),
        registry.clone(),
        prices.clone(),
        margins.clone(),
        readiness.clone(),
        sink.clone(),
        &cfg.follower_address,
        !cfg.disable_ioc_engine,
    ));
    tokio::spawn(alo.run(alo_leader, alo_follower, shutdown_rx.clone()));
    tokio::spawn(ioc.run(ioc_leader, ioc_follower, orders_rx, shutdown_rx.clone()));

    tokio::spawn(async move {
        while let Some(line) = log_rx.recv().await {
            println!("{line}");
        }
    });

    let session = WsSession::new(
        mux,
        registry.clone(),
        cfg.ws_url.clone(),
        &cfg.leader_address,
        &cfg.follower_address,
    );
    let mut session_task = tokio::spawn(session.run(shutdown_rx.clone()));

    let fatal = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            None
        }
        joined = &mut session_task => match joined {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(err) => Some(anyhow::anyhow!("session task panicked: {err}")),
        },
    };

    // Engines finish the pass they are in; no new HTTP calls after this.
    let _ = shutdown_tx.send(true);

    // Best-effort hygiene on the way out.
    let asset_ids: Vec<u32> = registry
        .enabled_coins()
        .iter()
        .filter_map(|coin| registry.asset_id(coin))
        .collect();
    if let Err(err) = venue.cancel_all(&asset_ids).await {
        warn!(%err, "shutdown cancel-all failed");
    }

    match fatal {
        Some(err) => {
            error!(%err, "session ended fatally");
            Err(err)
        }
        None => Ok(()),
    }
}

/// Startup hygiene on the follower: cancel every resting order in the enabled
/// assets, then flatten any enabled position with a reduce-only marketable
/// order so the mirrored book starts from a clean slate.
async fn reset_follower(venue: &Arc<dyn VenueApi>, registry: &Arc<AssetRegistry>, follower: &str) {
    let asset_ids: Vec<u32> = registry
        .enabled_coins()
        .iter()
        .filter_map(|coin| registry.asset_id(coin))
        .collect();
    if let Err(err) = venue.cancel_all(&asset_ids).await {
        warn!(%err, "startup cancel-all failed");
    }

    let state = match venue.fetch_user_state(follower).await {
        Ok(state) => state,
        Err(err) => {
            warn!(%err, "startup position fetch failed, skipping flatten");
            return;
        }
    };
    let mids = match venue.fetch_all_mids().await {
        Ok(mids) => mids,
        Err(err) => {
            warn!(%err, "startup mid fetch failed, skipping flatten");
            return;
        }
    };

    let mut orders = Vec::new();
    for ap in &state.asset_positions {
        let pos = &ap.position;
        if !registry.is_enabled(&pos.coin) || pos.szi == 0.0 {
            continue;
        }
        let Some(asset) = registry.asset_id(&pos.coin) else {
            continue;
        };
        let Some(mid) = mids.get(&pos.coin).copied().filter(|m| *m > 0.0) else {
            warn!(coin = %pos.coin, "no mid for startup flatten, skipping");
            continue;
        };
        let side = if pos.szi > 0.0 {
            hypermirror::models::Side::Ask
        } else {
            hypermirror::models::Side::Bid
        };
        let decimals = registry.decimals(&pos.coin);
        orders.push(OrderRequest {
            coin: pos.coin.clone(),
            asset,
            is_buy: side.is_buy(),
            limit_px: scale::marketable_price(mid, side, decimals),
            sz: pos.szi.abs(),
            reduce_only: true,
            tif: Tif::FrontendMarket,
            cloid: None,
        });
    }
    if orders.is_empty() {
        return;
    }
    info!(count = orders.len(), "flattening follower positions at startup");
    match venue.bulk_orders(&orders).await {
        Err(err) => warn!(%err, "startup flatten failed"),
        Ok(resp) if !resp.is_ok() => {
            warn!(status = %resp.status, "startup flatten returned non-ok status");
        }
        Ok(resp) => {
            for (i, status) in resp.statuses().iter().enumerate() {
                if status.is_err() {
                    warn!(
                        coin = orders.get(i).map(|o| o.coin.as_str()).unwrap_or("?"),
                        error = %status.error,
                        "startup flatten order rejected"
                    );
                }
            }
        }
    }
}
