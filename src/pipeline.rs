//! Bounded stream combinators over tokio mpsc channels: fan a stream out to
//! several consumers, drop repeated items by a key projection, or pass only
//! the leading edge of a burst. Every stage owns its input receiver and runs
//! on its own task.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

/// Depth of every intermediate channel a combinator creates.
pub const QUEUE_DEPTH: usize = 256;

/// Key projection used by [`Pipeline::distinct`].
pub trait DistinctKey {
    fn distinct_key(&self) -> String;
}

pub struct Pipeline<T> {
    rx: mpsc::Receiver<T>,
}

impl<T: Clone + Send + 'static> Pipeline<T> {
    pub fn new(rx: mpsc::Receiver<T>) -> Self {
        Self { rx }
    }

    pub fn into_receiver(self) -> mpsc::Receiver<T> {
        self.rx
    }

    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Duplicate this stream into `n` independent pipelines. Every item is
    /// delivered to every consumer, in order, one consumer at a time; a slow
    /// consumer therefore slows the rest rather than missing items.
    pub fn tee(mut self, n: usize) -> Vec<Pipeline<T>> {
        let mut txs = Vec::with_capacity(n);
        let mut outs = Vec::with_capacity(n);
        for _ in 0..n {
            let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
            txs.push(tx);
            outs.push(Pipeline::new(rx));
        }
        tokio::spawn(async move {
            while let Some(item) = self.rx.recv().await {
                for tx in &txs {
                    if tx.send(item.clone()).await.is_err() {
                        return;
                    }
                }
            }
        });
        outs
    }

    /// Forward every item into an externally owned sender.
    pub fn forward_to(mut self, dst: mpsc::Sender<T>) {
        tokio::spawn(async move {
            while let Some(item) = self.rx.recv().await {
                if dst.send(item).await.is_err() {
                    return;
                }
            }
        });
    }

    /// Pass the first item immediately, then suppress items until `delay`
    /// has elapsed since the last one that passed.
    pub fn debounce_leading(mut self, delay: Duration) -> Pipeline<T> {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(async move {
            let mut next_allowed: Option<Instant> = None;
            while let Some(item) = self.rx.recv().await {
                let now = Instant::now();
                let pass = match next_allowed {
                    None => true,
                    Some(at) => now >= at,
                };
                if pass {
                    next_allowed = Some(now + delay);
                    if tx.send(item).await.is_err() {
                        return;
                    }
                }
            }
        });
        Pipeline::new(rx)
    }
}

impl<T: Clone + Send + DistinctKey + 'static> Pipeline<T> {
    /// Drop items whose key has already been seen this session.
    pub fn distinct(mut self) -> Pipeline<T> {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(async move {
            let mut seen: HashSet<String> = HashSet::new();
            while let Some(item) = self.rx.recv().await {
                if seen.insert(item.distinct_key()) {
                    if tx.send(item).await.is_err() {
                        return;
                    }
                }
            }
        });
        Pipeline::new(rx)
    }
}
