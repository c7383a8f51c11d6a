//! Websocket transport for the venue feed. One socket carries both accounts:
//! the session subscribes each account's snapshot and asset-data streams
//! (plus order updates for the leader), keeps the connection alive with
//! application-level pings under a read deadline, and feeds every text frame
//! to the multiplexer. Transport failures reconnect with capped exponential
//! backoff; frame-chain violations are fatal and bubble out.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use rand::Rng;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

use crate::mux::Multiplexer;
use crate::registry::AssetRegistry;
use crate::models::SubscriptionRequest;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const READ_TIMEOUT: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(16);
/// Pause after a read-loop failure before redialing.
const REREAD_DELAY: Duration = Duration::from_secs(3);

pub struct WsSession {
    mux: Arc<Multiplexer>,
    registry: Arc<AssetRegistry>,
    url: String,
    leader_addr: String,
    follower_addr: String,
}

enum SessionEnd {
    Transport,
    Shutdown,
}

impl WsSession {
    pub fn new(
        mux: Arc<Multiplexer>,
        registry: Arc<AssetRegistry>,
        url: String,
        leader_addr: &str,
        follower_addr: &str,
    ) -> Self {
        Self {
            mux,
            registry,
            url,
            leader_addr: leader_addr.to_lowercase(),
            follower_addr: follower_addr.to_lowercase(),
        }
    }

    /// Connect-subscribe-read until shutdown. Returns an error only for fatal
    /// conditions; readiness and engine state survive reconnects untouched.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            info!(url = %self.url, attempt = attempt + 1, "connecting to venue feed");
            let connected =
                tokio::time::timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str())).await;
            let ws = match connected {
                Ok(Ok((ws, _resp))) => ws,
                Ok(Err(err)) => {
                    warn!(%err, "feed dial failed");
                    attempt = attempt.saturating_add(1);
                    self.backoff(attempt, &mut shutdown).await;
                    continue;
                }
                Err(_) => {
                    warn!("feed dial timed out after {CONNECT_TIMEOUT:?}");
                    attempt = attempt.saturating_add(1);
                    self.backoff(attempt, &mut shutdown).await;
                    continue;
                }
            };
            info!("venue feed connected");
            attempt = 0;

            let (mut write, mut read) = ws.split();
            if let Err(err) = self.subscribe_all(&mut write).await {
                warn!(%err, "subscription writes failed, reconnecting");
                tokio::time::sleep(REREAD_DELAY).await;
                continue;
            }

            match self.read_loop(&mut write, &mut read, &mut shutdown).await? {
                SessionEnd::Shutdown => return Ok(()),
                SessionEnd::Transport => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                    warn!("feed read loop ended, reconnecting");
                    tokio::time::sleep(REREAD_DELAY).await;
                }
            }
        }
    }

    async fn subscribe_all<W>(&self, write: &mut W) -> Result<()>
    where
        W: Sink<Message> + Unpin,
        W::Error: std::error::Error + Send + Sync + 'static,
    {
        for user in [&self.follower_addr, &self.leader_addr] {
            for coin in self.registry.enabled_coins() {
                let req = SubscriptionRequest::new("activeAssetData", Some(user), Some(coin));
                self.send_json(write, &req).await?;
            }
            let req = SubscriptionRequest::new("webData2", Some(user), None);
            self.send_json(write, &req).await?;
            if user == &self.leader_addr {
                let req = SubscriptionRequest::new("orderUpdates", Some(user), None);
                self.send_json(write, &req).await?;
            }
        }
        Ok(())
    }

    async fn send_json<W>(&self, write: &mut W, body: &impl serde::Serialize) -> Result<()>
    where
        W: Sink<Message> + Unpin,
        W::Error: std::error::Error + Send + Sync + 'static,
    {
        let text = serde_json::to_string(body)?;
        write
            .send(Message::Text(text))
            .await
            .context("feed write failed")
    }

    async fn read_loop<W, R>(
        &self,
        write: &mut W,
        read: &mut R,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd>
    where
        W: Sink<Message> + Unpin,
        W::Error: std::error::Error + Send + Sync + 'static,
        R: Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_timer.tick().await; // skip the immediate first tick

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(SessionEnd::Shutdown);
                    }
                }
                _ = ping_timer.tick() => {
                    if let Err(err) = write.send(Message::Text(r#"{"method":"ping"}"#.to_string())).await {
                        warn!(%err, "feed ping failed");
                        return Ok(SessionEnd::Transport);
                    }
                }
                frame = tokio::time::timeout(READ_TIMEOUT, read.next()) => {
                    let msg = match frame {
                        Err(_) => {
                            warn!("feed read deadline missed ({READ_TIMEOUT:?})");
                            return Ok(SessionEnd::Transport);
                        }
                        Ok(None) => return Ok(SessionEnd::Transport),
                        Ok(Some(Err(err))) => {
                            warn!(%err, "feed read error");
                            return Ok(SessionEnd::Transport);
                        }
                        Ok(Some(Ok(msg))) => msg,
                    };
                    match msg {
                        Message::Text(text) => {
                            self.mux
                                .handle_raw(&text)
                                .context("frame chain invariant violated")?;
                        }
                        Message::Ping(payload) => {
                            if write.send(Message::Pong(payload)).await.is_err() {
                                return Ok(SessionEnd::Transport);
                            }
                        }
                        Message::Close(_) => {
                            warn!("feed closed by venue");
                            return Ok(SessionEnd::Transport);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    async fn backoff(&self, attempt: u32, shutdown: &mut watch::Receiver<bool>) {
        let exp = BACKOFF_BASE * 2u32.saturating_pow(attempt.saturating_sub(1).min(4));
        let delay = exp.min(BACKOFF_CAP);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
        let total = delay + jitter;
        warn!(?total, "feed reconnect backoff");
        tokio::select! {
            _ = tokio::time::sleep(total) => {}
            _ = shutdown.changed() => {}
        }
    }
}
