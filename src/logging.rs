//! Human-readable log plumbing. Engine log lines go through `tracing` for
//! severity filtering and, in parallel, into per-account ring buffers plus a
//! bounded channel a display consumer can drain. Nothing here touches disk.

use std::sync::Mutex;

use ahash::AHashMap;
use chrono::Local;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Fixed-capacity line store; pushes overwrite the oldest entry.
#[derive(Debug)]
pub struct RingBuffer {
    inner: Mutex<RingInner>,
}

#[derive(Debug)]
struct RingInner {
    data: Vec<String>,
    capacity: usize,
    head: usize,
    full: bool,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RingInner {
                data: vec![String::new(); capacity.max(1)],
                capacity: capacity.max(1),
                head: 0,
                full: false,
            }),
        }
    }

    pub fn push(&self, line: String) {
        let mut inner = self.inner.lock().expect("ring buffer poisoned");
        let head = inner.head;
        inner.data[head] = line;
        inner.head = (head + 1) % inner.capacity;
        if inner.head == 0 {
            inner.full = true;
        }
    }

    /// Up to `n` most recent lines, oldest first.
    pub fn last_n(&self, n: usize) -> Vec<String> {
        let inner = self.inner.lock().expect("ring buffer poisoned");
        let size = if inner.full { inner.capacity } else { inner.head };
        let take = n.min(size);
        let mut out = Vec::with_capacity(take);
        for i in (0..take).rev() {
            let idx = (inner.head + inner.capacity - 1 - i) % inner.capacity;
            out.push(inner.data[idx].clone());
        }
        out
    }
}

/// Fan-in point for engine log lines: timestamps each line, stores it in the
/// originating account's ring, and offers it to the bounded display channel.
/// A slow or absent consumer never blocks an engine; overflow lines are
/// simply not displayed.
#[derive(Debug)]
pub struct LogSink {
    tx: mpsc::Sender<String>,
    rings: AHashMap<String, RingBuffer>,
}

impl LogSink {
    pub fn new(addresses: &[&str], ring_capacity: usize, depth: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let mut rings = AHashMap::new();
        for addr in addresses {
            rings.insert(addr.to_lowercase(), RingBuffer::new(ring_capacity));
        }
        (Self { tx, rings }, rx)
    }

    pub fn log(&self, address: &str, message: &str) {
        let line = format!("[{}] {}", Local::now().format("%H:%M:%S"), message);
        if let Some(ring) = self.rings.get(&address.to_lowercase()) {
            ring.push(line.clone());
        }
        let _ = self.tx.try_send(line);
    }

    pub fn last_n(&self, address: &str, n: usize) -> Vec<String> {
        self.rings
            .get(&address.to_lowercase())
            .map(|ring| ring.last_n(n))
            .unwrap_or_default()
    }
}

/// Install the global tracing subscriber; `RUST_LOG` overrides the default
/// `info` level.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_keeps_most_recent_lines_in_order() {
        let ring = RingBuffer::new(3);
        for i in 1..=5 {
            ring.push(format!("line{i}"));
        }
        assert_eq!(ring.last_n(2), vec!["line4".to_string(), "line5".to_string()]);
        assert_eq!(
            ring.last_n(10),
            vec!["line3".to_string(), "line4".to_string(), "line5".to_string()]
        );
    }

    #[test]
    fn ring_before_wraparound() {
        let ring = RingBuffer::new(4);
        ring.push("a".to_string());
        ring.push("b".to_string());
        assert_eq!(ring.last_n(4), vec!["a".to_string(), "b".to_string()]);
        assert!(RingBuffer::new(2).last_n(3).is_empty());
    }

    #[test]
    fn sink_routes_by_address_case_insensitively() {
        let (sink, mut rx) = LogSink::new(&["0xAbC", "0xDef"], 16, 8);
        sink.log("0xABC", "hello");
        sink.log("0xdef", "world");
        sink.log("0xunknown", "dropped from rings");
        assert_eq!(sink.last_n("0xabc", 5).len(), 1);
        assert!(sink.last_n("0xabc", 5)[0].ends_with("hello"));
        assert_eq!(sink.last_n("0xDEF", 5).len(), 1);
        // All three lines were offered to the display channel.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn sink_overflow_drops_instead_of_blocking() {
        let (sink, _rx) = LogSink::new(&["0xa"], 4, 1);
        sink.log("0xa", "one");
        sink.log("0xa", "two"); // channel full, dropped
        assert_eq!(sink.last_n("0xa", 10).len(), 2, "ring still records both");
    }
}
