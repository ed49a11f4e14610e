use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;

use sonoscope_dsp::WireFrame;

/// Frames a slow subscriber may have parked before we start dropping
/// its oldest.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 4;

/// Per-device fan-out hub. Publishing never blocks: each subscription
/// is a bounded queue with drop-oldest semantics, and delivery to the
/// transport happens on the subscriber's own task.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Hub>,
}

struct Hub {
    subscribers: RwLock<HashMap<u64, Arc<SubscriberQueue>>>,
    latest: RwLock<Option<Arc<WireFrame>>>,
    next_id: AtomicU64,
    total_published: AtomicU64,
    total_dropped: AtomicU64,
    total_bytes: AtomicU64,
}

struct SubscriberQueue {
    frames: Mutex<VecDeque<Arc<WireFrame>>>,
    notify: Notify,
    dropped_by_lag: AtomicU64,
}

impl SubscriberQueue {
    fn push(&self, frame: Arc<WireFrame>) -> bool {
        let mut frames = self.frames.lock();
        let mut dropped = false;
        if frames.len() >= SUBSCRIBER_QUEUE_CAPACITY {
            frames.pop_front();
            self.dropped_by_lag.fetch_add(1, Ordering::Relaxed);
            dropped = true;
        }
        frames.push_back(frame);
        drop(frames);
        self.notify.notify_one();
        dropped
    }

    fn pop(&self) -> Option<Arc<WireFrame>> {
        self.frames.lock().pop_front()
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BroadcastStats {
    pub subscriber_count: usize,
    pub total_published: u64,
    pub total_dropped: u64,
    pub total_bytes: u64,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Hub {
                subscribers: RwLock::new(HashMap::new()),
                latest: RwLock::new(None),
                next_id: AtomicU64::new(1),
                total_published: AtomicU64::new(0),
                total_dropped: AtomicU64::new(0),
                total_bytes: AtomicU64::new(0),
            }),
        }
    }

    /// Fan a frame out to every subscription: non-blocking enqueue,
    /// drop-oldest on a full queue.
    pub fn publish(&self, frame: WireFrame) {
        let size = frame.data_size_bytes as u64;
        let frame = Arc::new(frame);
        *self.inner.latest.write() = Some(frame.clone());

        let subscribers = self.inner.subscribers.read();
        for queue in subscribers.values() {
            if queue.push(frame.clone()) {
                self.inner.total_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.inner.total_published.fetch_add(1, Ordering::Relaxed);
        self.inner.total_bytes.fetch_add(size, Ordering::Relaxed);
    }

    /// Register a subscriber. The queue is seeded with the cached
    /// latest frame so a new client paints immediately; everything
    /// after arrives in strict sequence order.
    pub fn subscribe(&self) -> Subscription {
        let queue = Arc::new(SubscriberQueue {
            frames: Mutex::new(VecDeque::with_capacity(SUBSCRIBER_QUEUE_CAPACITY)),
            notify: Notify::new(),
            dropped_by_lag: AtomicU64::new(0),
        });
        if let Some(latest) = self.inner.latest.read().clone() {
            queue.push(latest);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.write().insert(id, queue.clone());
        tracing::debug!(subscriber = id, "Subscriber attached");

        Subscription {
            id,
            queue,
            hub: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    pub fn snapshot(&self) -> BroadcastStats {
        BroadcastStats {
            subscriber_count: self.subscriber_count(),
            total_published: self.inner.total_published.load(Ordering::Relaxed),
            total_dropped: self.inner.total_dropped.load(Ordering::Relaxed),
            total_bytes: self.inner.total_bytes.load(Ordering::Relaxed),
        }
    }
}

/// One subscriber's bounded view of the frame stream. Dropping it
/// detaches from the hub; pending frames are discarded.
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    hub: Weak<Hub>,
}

impl Subscription {
    /// Next frame, in sequence order. Resolves to `None` once the hub
    /// is gone and the queue has drained.
    pub async fn recv(&mut self) -> Option<Arc<WireFrame>> {
        loop {
            if let Some(frame) = self.queue.pop() {
                return Some(frame);
            }
            if self.hub.upgrade().is_none() {
                return None;
            }
            // Bounded wait so a dropped hub is noticed without a frame.
            tokio::select! {
                _ = self.queue.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
    }

    /// Non-blocking variant used by tests and draining paths.
    pub fn try_recv(&mut self) -> Option<Arc<WireFrame>> {
        self.queue.pop()
    }

    pub fn dropped_by_lag(&self) -> u64 {
        self.queue.dropped_by_lag.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.subscribers.write().remove(&self.id);
            tracing::debug!(subscriber = self.id, "Subscriber detached");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(seq: u64) -> WireFrame {
        WireFrame {
            sequence_id: seq,
            timestamp: seq * 10,
            sample_rate: 384_000,
            fft_size: 8192,
            bins_count: 4096,
            peak_frequency_hz: 40_000.0,
            peak_magnitude_db: -30.0,
            spl_db: 42.0,
            fps: 30.0,
            data_compressed: String::new(),
            compression_method: "gzip",
            data_size_bytes: 100,
            original_size_bytes: 16_384,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_frames_in_order() {
        let hub = Broadcaster::new();
        let mut sub = hub.subscribe();
        for seq in 1..=3 {
            hub.publish(wire(seq));
        }
        for expected in 1..=3 {
            let frame = sub.recv().await.unwrap();
            assert_eq!(frame.sequence_id, expected);
        }
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest() {
        let hub = Broadcaster::new();
        let mut sub = hub.subscribe();
        for seq in 1..=10 {
            hub.publish(wire(seq));
        }
        // Queue holds the newest four; the rest were dropped as lag.
        assert_eq!(sub.dropped_by_lag(), 6);
        let mut received = Vec::new();
        while let Some(frame) = sub.try_recv() {
            received.push(frame.sequence_id);
        }
        assert_eq!(received, vec![7, 8, 9, 10]);
        assert_eq!(hub.snapshot().total_dropped, 6);
    }

    #[tokio::test]
    async fn sequences_stay_strictly_increasing_under_lag() {
        let hub = Broadcaster::new();
        let mut sub = hub.subscribe();
        let mut last = 0u64;
        for seq in 1..=50 {
            hub.publish(wire(seq));
            if seq % 7 == 0 {
                while let Some(frame) = sub.try_recv() {
                    assert!(frame.sequence_id > last);
                    last = frame.sequence_id;
                }
            }
        }
    }

    #[tokio::test]
    async fn late_subscriber_gets_cached_latest_first() {
        let hub = Broadcaster::new();
        hub.publish(wire(41));
        hub.publish(wire(42));
        let mut sub = hub.subscribe();
        let first = sub.recv().await.unwrap();
        assert_eq!(first.sequence_id, 42);
    }

    #[tokio::test]
    async fn unsubscribe_on_drop() {
        let hub = Broadcaster::new();
        let sub = hub.subscribe();
        let _other = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn recv_ends_when_hub_is_gone() {
        let hub = Broadcaster::new();
        hub.publish(wire(1));
        let mut sub = hub.subscribe();
        drop(hub);
        // Drains the seeded frame, then observes the dead hub.
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn snapshot_counts_publishes() {
        let hub = Broadcaster::new();
        let _sub = hub.subscribe();
        hub.publish(wire(1));
        hub.publish(wire(2));
        let stats = hub.snapshot();
        assert_eq!(stats.subscriber_count, 1);
        assert_eq!(stats.total_published, 2);
        assert_eq!(stats.total_dropped, 0);
        assert_eq!(stats.total_bytes, 200);
    }
}
