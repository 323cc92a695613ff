// =============================================================================
// Signal Bus (C8) — bounded, lossy, multi-subscriber fanout
// =============================================================================
//
// The explicit seam the redesign notes call for: persistence and the
// trading engine subscribe independently rather than coupling through a
// database read or a shared websocket. Each subscriber owns an independent
// bounded ring buffer; on overflow the *oldest* queued signal is evicted to
// make room for the new one, so a slow subscriber loses history, never the
// newest signal, and the publisher is never blocked.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use crate::types::Signal;

const BUS_CAPACITY: usize = 1000;

struct SubscriberQueue {
    buf: Mutex<VecDeque<Arc<Signal>>>,
    notify: Notify,
}

pub struct SignalBus {
    subscribers: Mutex<Vec<Arc<SubscriberQueue>>>,
}

/// A single subscriber's handle onto the bus. `recv` never returns `None` —
/// the bus has no "closed" state — but mirrors `mpsc::Receiver`'s shape so
/// callers can `while let Some(signal) = rx.recv().await`.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Arc<Signal>> {
        loop {
            if let Some(signal) = self.queue.buf.lock().pop_front() {
                return Some(signal);
            }
            self.queue.notify.notified().await;
        }
    }
}

impl SignalBus {
    pub fn new() -> Self {
        Self { subscribers: Mutex::new(Vec::new()) }
    }

    /// Registers a new subscriber and returns its handle. Each subscriber
    /// owns an independent bounded, drop-oldest ring buffer.
    pub fn subscribe(&self) -> Subscription {
        let queue = Arc::new(SubscriberQueue { buf: Mutex::new(VecDeque::new()), notify: Notify::new() });
        self.subscribers.lock().push(queue.clone());
        Subscription { queue }
    }

    /// Publishes `signal` to every subscriber. If a subscriber's ring buffer
    /// is already at capacity, its oldest queued signal is evicted first so
    /// the newly published signal is always the one admitted.
    pub fn publish(&self, signal: Signal) {
        let signal = Arc::new(signal);
        let subscribers = self.subscribers.lock();
        for sub in subscribers.iter() {
            let mut buf = sub.buf.lock();
            if buf.len() >= BUS_CAPACITY {
                buf.pop_front();
                warn!(symbol = %signal.symbol, "signal bus subscriber queue full, dropping oldest queued signal");
            }
            buf.push_back(signal.clone());
            drop(buf);
            sub.notify.notify_one();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SignalKind, SignalStatus, Symbol};

    fn dummy_signal(symbol: &str) -> Signal {
        Signal {
            id: uuid::Uuid::new_v4(),
            symbol: Symbol::parse(symbol).unwrap(),
            kind: SignalKind::Buy,
            strength: 0.6,
            rules_triggered: Default::default(),
            snapshot: crate::types::Indicators {
                mm1: Default::default(),
                center: Default::default(),
                rsi: Default::default(),
                volume_sma: Default::default(),
            },
            created: chrono::Utc::now(),
            status: SignalStatus::Pending,
        }
    }

    #[tokio::test]
    async fn each_subscriber_receives_published_signal() {
        let bus = SignalBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(dummy_signal("BTC/USDT"));
        let got_a = a.recv().await.unwrap();
        let got_b = b.recv().await.unwrap();
        assert_eq!(got_a.symbol.as_str(), "BTC/USDT");
        assert_eq!(got_b.symbol.as_str(), "BTC/USDT");
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_block_publish() {
        let bus = SignalBus::new();
        let _unused_rx = bus.subscribe();
        for _ in 0..(BUS_CAPACITY + 10) {
            bus.publish(dummy_signal("ETH/USDT"));
        }
        // publishing past capacity must not panic or hang.
        assert_eq!(bus.subscriber_count(), 1);
    }
}
