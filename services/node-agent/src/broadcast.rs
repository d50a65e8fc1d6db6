//! Typed fan-out pub/sub with bounded subscriber buffers.
//!
//! Each instance manager owns a broadcaster for its event stream. Delivery is
//! at-most-once: a subscriber whose buffer is full loses the message while
//! every other subscriber is unaffected, so a slow consumer can never stall
//! the producer. An optional replay provider seeds new subscribers with the
//! cached history before any live message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tokio::sync::mpsc;
use tracing::trace;

/// Produces the replay sequence delivered to new subscribers.
pub type ReplayFn<T> = Arc<dyn Fn() -> Vec<T> + Send + Sync>;

/// Broadcaster construction options.
pub struct BroadcasterOptions<T> {
    /// Per-subscriber delivery buffer capacity.
    pub buffer_size: usize,

    /// Optional replay provider invoked on subscribe.
    pub replay: Option<ReplayFn<T>>,
}

impl<T> Default for BroadcasterOptions<T> {
    fn default() -> Self {
        Self {
            buffer_size: 16,
            replay: None,
        }
    }
}

struct Shared<T> {
    buffer_size: usize,
    replay: Option<ReplayFn<T>>,
    subscribers: RwLock<HashMap<u64, mpsc::Sender<T>>>,
    next_id: AtomicU64,
    running: AtomicBool,
}

/// Single-producer multi-consumer fan-out for typed events.
pub struct Broadcaster<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    pub fn new(options: BroadcasterOptions<T>) -> Self {
        Self {
            shared: Arc::new(Shared {
                buffer_size: options.buffer_size.max(1),
                replay: options.replay,
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Enable publishing. Publishes before `start` are discarded.
    pub fn start(&self) {
        self.shared.running.store(true, Ordering::SeqCst);
    }

    /// Close every subscriber endpoint and discard subsequent publishes.
    /// Idempotent.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let mut subs = self.shared.subscribers.write().unwrap();
        // Dropping the senders closes the receive endpoints.
        subs.clear();
    }

    /// Register a new subscriber with the broadcaster's default buffer.
    ///
    /// The replay sequence (if a provider is configured) is queued to the
    /// subscriber before it joins the live set, so a concurrent publish is
    /// observed either via replay or live, never both and never neither.
    /// Subscribing to a stopped broadcaster yields an already-closed handle.
    pub fn subscribe(&self) -> Subscriber<T> {
        self.subscribe_with_capacity(self.shared.buffer_size)
    }

    /// Register a subscriber with an explicit delivery buffer capacity.
    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscriber<T> {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);

        let mut subs = self.shared.subscribers.write().unwrap();

        let replay = match (
            self.shared.running.load(Ordering::SeqCst),
            &self.shared.replay,
        ) {
            (true, Some(provider)) => provider(),
            _ => Vec::new(),
        };

        // The buffer must hold the whole replay so seeding cannot drop.
        let capacity = capacity.max(replay.len()).max(1);
        let (tx, rx) = mpsc::channel(capacity);

        for msg in replay {
            // Cannot fail: the channel is empty and sized for the replay.
            let _ = tx.try_send(msg);
        }

        if self.shared.running.load(Ordering::SeqCst) {
            subs.insert(id, tx);
        }
        drop(subs);

        Subscriber {
            id,
            rx,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Deliver `msg` to every subscriber with buffer space. Non-blocking.
    pub fn publish(&self, msg: T) {
        if !self.shared.running.load(Ordering::SeqCst) {
            return;
        }

        let subs = self.shared.subscribers.read().unwrap();
        for (id, tx) in subs.iter() {
            match tx.try_send(msg.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!(subscriber = *id, "dropping message for slow subscriber");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.read().unwrap().len()
    }
}

/// Receive endpoint handed out by [`Broadcaster::subscribe`].
pub struct Subscriber<T> {
    id: u64,
    rx: mpsc::Receiver<T>,
    shared: Weak<Shared<T>>,
}

impl<T> Subscriber<T> {
    /// Receive the next message; `None` once the endpoint is closed and
    /// drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Non-blocking receive, for draining in tests.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Remove this subscriber and close its endpoint. Idempotent and safe
    /// concurrently with `publish`.
    pub fn unsubscribe(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.subscribers.write().unwrap().remove(&self.id);
        }
        self.rx.close();
    }
}

impl<T> Drop for Subscriber<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.subscribers.write().unwrap().remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broadcaster(buffer: usize) -> Broadcaster<u32> {
        let bc = Broadcaster::new(BroadcasterOptions {
            buffer_size: buffer,
            replay: None,
        });
        bc.start();
        bc
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bc = broadcaster(16);
        let mut sub = bc.subscribe();

        bc.publish(1);
        bc.publish(2);
        bc.publish(3);

        assert_eq!(sub.recv().await, Some(1));
        assert_eq!(sub.recv().await, Some(2));
        assert_eq!(sub.recv().await, Some(3));
    }

    #[tokio::test]
    async fn slow_subscriber_drops_but_never_blocks() {
        let bc = broadcaster(1000);
        let mut slow = bc.subscribe_with_capacity(1);
        let mut healthy = bc.subscribe();

        for i in 0..1000u32 {
            bc.publish(i);
        }

        // The slow subscriber received a bounded, in-order subset.
        let mut prev = None;
        let mut received = 0u32;
        while let Some(v) = slow.try_recv() {
            if let Some(p) = prev {
                assert!(v > p);
            }
            prev = Some(v);
            received += 1;
        }
        assert!(received >= 1);
        assert!(received <= 1000);

        // The healthy subscriber received all 1000 in order.
        let mut count = 0u32;
        while let Some(v) = healthy.try_recv() {
            assert_eq!(v, count);
            count += 1;
        }
        assert_eq!(count, 1000);
    }

    #[tokio::test]
    async fn replay_precedes_live_messages() {
        let bc = Broadcaster::new(BroadcasterOptions {
            buffer_size: 16,
            replay: Some(Arc::new(|| vec![10, 11])),
        });
        bc.start();

        let mut sub = bc.subscribe();
        bc.publish(12);

        assert_eq!(sub.recv().await, Some(10));
        assert_eq!(sub.recv().await, Some(11));
        assert_eq!(sub.recv().await, Some(12));
    }

    #[tokio::test]
    async fn replay_larger_than_buffer_is_not_truncated() {
        let bc = Broadcaster::new(BroadcasterOptions {
            buffer_size: 2,
            replay: Some(Arc::new(|| (0..8).collect())),
        });
        bc.start();

        let mut sub = bc.subscribe();
        for expected in 0..8 {
            assert_eq!(sub.recv().await, Some(expected));
        }
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let bc = broadcaster(4);
        let mut sub = bc.subscribe();
        assert_eq!(bc.subscriber_count(), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(bc.subscriber_count(), 0);

        bc.publish(1);
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn stop_closes_endpoints_and_discards_publishes() {
        let bc = broadcaster(4);
        let mut sub = bc.subscribe();

        bc.publish(1);
        bc.stop();
        bc.publish(2);

        assert_eq!(sub.recv().await, Some(1));
        assert_eq!(sub.recv().await, None);

        // Subscribing after stop yields a closed endpoint.
        let mut late = bc.subscribe();
        assert_eq!(late.recv().await, None);
    }

    #[tokio::test]
    async fn drop_unsubscribes() {
        let bc = broadcaster(4);
        let sub = bc.subscribe();
        assert_eq!(bc.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bc.subscriber_count(), 0);
    }
}
