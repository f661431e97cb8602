//! Push fan-out hub.
//!
//! Every registered subscriber gets its own delivery thread fed by a bounded
//! queue. `publish` only ever enqueues, so a slow subscriber costs the caller
//! at most `delivery_timeout` per publish, shared across all subscribers.
//!
//! ```text
//!                 publish(frame)
//!                       │
//!          ┌────────────┼────────────┐
//!          ▼            ▼            ▼
//!     [queue sub-1] [queue sub-2] [queue sub-3]    bounded(queue_depth)
//!          │            │            │
//!     push-sub-1   push-sub-2   push-sub-3         one thread each
//!     accept()     accept()     accept()
//! ```
//!
//! A subscriber is unregistered when a single `accept` call runs longer than
//! `delivery_timeout`, when its queue stays full past the deadline, or when
//! its `accept` reports `Closed` (its thread exits and the queue disconnects).
//! Overdue `accept` calls are detected on every registry access, so the
//! removal does not wait for the queue to fill up. Each queue is FIFO and `publish` calls are serialized, so
//! every subscriber sees frames in publish order with no duplicates.

use anyhow::{Context, Result};
use crossbeam_channel::{SendTimeoutError, Sender, TrySendError};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::PushSettings;
use crate::frame::EncodedFrame;

/// Result of handing one frame to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accept {
    Delivered,
    /// The consumer is gone; stop delivering.
    Closed,
}

/// A push destination.
pub trait Subscriber: Send + 'static {
    fn accept(&mut self, frame: &EncodedFrame) -> Accept;
}

impl<F> Subscriber for F
where
    F: FnMut(&EncodedFrame) -> Accept + Send + 'static,
{
    fn accept(&mut self, frame: &EncodedFrame) -> Accept {
        self(frame)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers the frame was queued for.
    pub delivered: usize,
    /// Subscribers unregistered during this publish.
    pub dropped: usize,
}

#[derive(Debug)]
enum Unreachable {
    TimedOut,
    Closed,
}

struct SubscriberEntry {
    queue: Sender<EncodedFrame>,
    alive: Arc<AtomicBool>,
    busy: Arc<BusyClock>,
}

/// When the delivery thread entered its current `accept`, in milliseconds
/// since the hub was created plus one. Zero while it waits for a frame.
struct BusyClock {
    epoch: Instant,
    since: AtomicU64,
}

impl BusyClock {
    fn new(epoch: Instant) -> Self {
        Self {
            epoch,
            since: AtomicU64::new(0),
        }
    }

    fn now(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    fn enter(&self) {
        self.since.store(self.now(), Ordering::SeqCst);
    }

    fn leave(&self) {
        self.since.store(0, Ordering::SeqCst);
    }

    /// How long the in-flight `accept` has been running, if any.
    fn busy_for(&self) -> Option<Duration> {
        match self.since.load(Ordering::SeqCst) {
            0 => None,
            since => Some(Duration::from_millis(self.now().saturating_sub(since))),
        }
    }
}

pub struct PushHub {
    epoch: Instant,
    delivery_timeout: Duration,
    queue_depth: usize,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriberId, SubscriberEntry>>,
    /// Serializes publishers so per-subscriber order matches publish order.
    publish_lock: Mutex<()>,
}

impl PushHub {
    pub fn new(settings: &PushSettings) -> Self {
        Self {
            epoch: Instant::now(),
            delivery_timeout: settings.delivery_timeout,
            queue_depth: settings.queue_depth.max(1),
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
            publish_lock: Mutex::new(()),
        }
    }

    pub fn delivery_timeout(&self) -> Duration {
        self.delivery_timeout
    }

    /// Register a subscriber. It receives every frame published after this returns.
    pub fn register<S: Subscriber>(&self, subscriber: S) -> Result<SubscriberId> {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (queue, rx) = crossbeam_channel::bounded::<EncodedFrame>(self.queue_depth);
        let alive = Arc::new(AtomicBool::new(true));
        let busy = Arc::new(BusyClock::new(self.epoch));

        let worker_alive = Arc::clone(&alive);
        let worker_busy = Arc::clone(&busy);
        std::thread::Builder::new()
            .name(format!("push-{id}"))
            .spawn(move || {
                let _alive = AliveGuard(worker_alive);
                let mut subscriber = subscriber;
                for frame in rx.iter() {
                    worker_busy.enter();
                    let accepted = subscriber.accept(&frame);
                    worker_busy.leave();
                    if accepted == Accept::Closed {
                        log::debug!("PushHub: {} closed at frame {}", id, frame.sequence);
                        break;
                    }
                }
            })
            .with_context(|| format!("spawn delivery thread for {id}"))?;

        let mut subscribers = self.lock_subscribers();
        subscribers.insert(id, SubscriberEntry { queue, alive, busy });
        log::info!(
            "PushHub: {} registered ({} subscribers)",
            id,
            subscribers.len()
        );
        Ok(id)
    }

    /// Remove a subscriber. Frames already queued for it are still delivered.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let removed = self.lock_subscribers().remove(&id).is_some();
        if removed {
            log::info!("PushHub: {} unregistered", id);
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.lock_subscribers();
        self.prune(&mut subscribers);
        subscribers.len()
    }

    pub fn is_registered(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.lock_subscribers();
        self.prune(&mut subscribers);
        subscribers.contains_key(&id)
    }

    /// Queue `frame` for every registered subscriber.
    ///
    /// Never fails: unreachable subscribers are unregistered and counted in
    /// the report.
    pub fn publish(&self, frame: EncodedFrame) -> PublishReport {
        let _order = self
            .publish_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let (pruned, targets) = {
            let mut subscribers = self.lock_subscribers();
            let pruned = self.prune(&mut subscribers);
            let targets: Vec<(SubscriberId, Sender<EncodedFrame>)> = subscribers
                .iter()
                .map(|(id, entry)| (*id, entry.queue.clone()))
                .collect();
            (pruned, targets)
        };
        if targets.is_empty() {
            return PublishReport {
                delivered: 0,
                dropped: pruned,
            };
        }

        let deadline = Instant::now() + self.delivery_timeout;
        let mut delivered = 0;
        let mut unreachable = Vec::new();
        for (id, queue) in targets {
            let outcome = match queue.try_send(frame.clone()) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(frame)) => {
                    queue.send_deadline(frame, deadline).map_err(|e| match e {
                        SendTimeoutError::Timeout(_) => Unreachable::TimedOut,
                        SendTimeoutError::Disconnected(_) => Unreachable::Closed,
                    })
                }
                Err(TrySendError::Disconnected(_)) => Err(Unreachable::Closed),
            };
            match outcome {
                Ok(()) => delivered += 1,
                Err(reason) => {
                    log::warn!(
                        "PushHub: {} unreachable ({:?}) at frame {}",
                        id,
                        reason,
                        frame.sequence
                    );
                    unreachable.push(id);
                }
            }
        }

        if !unreachable.is_empty() {
            let mut subscribers = self.lock_subscribers();
            for id in &unreachable {
                subscribers.remove(id);
            }
        }

        PublishReport {
            delivered,
            dropped: pruned + unreachable.len(),
        }
    }

    /// Drop subscribers whose thread exited or whose `accept` is overdue.
    fn prune(&self, subscribers: &mut HashMap<SubscriberId, SubscriberEntry>) -> usize {
        let before = subscribers.len();
        subscribers.retain(|id, entry| {
            if !entry.alive.load(Ordering::SeqCst) {
                log::info!("PushHub: {} closed, unregistering", id);
                return false;
            }
            match entry.busy.busy_for() {
                Some(elapsed) if elapsed > self.delivery_timeout => {
                    log::warn!(
                        "PushHub: {} stuck in accept for {:?}, unregistering",
                        id,
                        elapsed
                    );
                    false
                }
                _ => true,
            }
        });
        before - subscribers.len()
    }

    fn lock_subscribers(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<SubscriberId, SubscriberEntry>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for PushHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushHub")
            .field("delivery_timeout", &self.delivery_timeout)
            .field("queue_depth", &self.queue_depth)
            .field("subscribers", &self.lock_subscribers().len())
            .finish()
    }
}

/// Marks the subscriber dead when its delivery thread exits, panics included.
struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crossbeam_channel::Receiver;
    use std::time::SystemTime;

    fn settings(timeout_ms: u64, depth: usize) -> PushSettings {
        PushSettings {
            quality: 75,
            delivery_timeout: Duration::from_millis(timeout_ms),
            queue_depth: depth,
        }
    }

    fn frame(sequence: u64) -> EncodedFrame {
        EncodedFrame {
            sequence,
            captured_at: SystemTime::now(),
            width: 1,
            height: 1,
            data: Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]),
        }
    }

    fn forwarding() -> (impl Subscriber, Receiver<u64>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let subscriber = move |frame: &EncodedFrame| {
            if tx.send(frame.sequence).is_ok() {
                Accept::Delivered
            } else {
                Accept::Closed
            }
        };
        (subscriber, rx)
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let hub = PushHub::new(&settings(100, 4));
        assert_eq!(hub.publish(frame(1)), PublishReport::default());
    }

    #[test]
    fn subscriber_sees_frames_in_order() {
        let hub = PushHub::new(&settings(500, 4));
        let (sub, rx) = forwarding();
        hub.register(sub).unwrap();
        for seq in 1..=50 {
            assert_eq!(hub.publish(frame(seq)).delivered, 1);
        }
        let received: Vec<u64> = (0..50)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(received, (1..=50).collect::<Vec<_>>());
    }

    #[test]
    fn closed_subscriber_is_unregistered() {
        let hub = PushHub::new(&settings(100, 4));
        let id = hub
            .register(|_: &EncodedFrame| Accept::Closed)
            .unwrap();
        hub.publish(frame(1));

        let deadline = Instant::now() + Duration::from_secs(2);
        while hub.is_registered(id) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!hub.is_registered(id));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn unregister_stops_delivery() {
        let hub = PushHub::new(&settings(100, 4));
        let (sub, rx) = forwarding();
        let id = hub.register(sub).unwrap();
        hub.publish(frame(1));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);

        assert!(hub.unregister(id));
        assert!(!hub.unregister(id));
        assert_eq!(hub.publish(frame(2)).delivered, 0);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn subscriber_ids_are_unique() {
        let hub = PushHub::new(&settings(100, 1));
        let a = hub.register(|_: &EncodedFrame| Accept::Delivered).unwrap();
        let b = hub.register(|_: &EncodedFrame| Accept::Delivered).unwrap();
        assert_ne!(a, b);
        assert_eq!(hub.subscriber_count(), 2);
    }
}
