//! In-process publish/subscribe event bus.
//!
//! Each subscriber owns a bounded queue. `publish` only pushes onto those
//! queues and never awaits, so a slow or failing consumer cannot stall the
//! publisher or any other consumer. On overflow the oldest queued message is
//! dropped (fresh dashboard data matters more than completeness) and the drop
//! is counted and logged.
//!
//! Topics are plain strings: `sample.<metric>`, `alert.<metric>`,
//! `source.status` and `humidifier.state`. Subscriptions take exact topics,
//! `prefix.*` patterns, or `*`.
//!
//! There is no history: a subscriber only sees messages published after it
//! subscribed.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::models::BusMessage;
use crate::shutdown::Shutdown;

/// Default per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

pub mod topics {
    // ---
    use crate::models::Metric;

    pub const SOURCE_STATUS: &str = "source.status";
    pub const HUMIDIFIER_STATE: &str = "humidifier.state";
    pub const ALL_SAMPLES: &str = "sample.*";
    pub const ALL_ALERTS: &str = "alert.*";

    pub fn sample(metric: Metric) -> String {
        format!("sample.{metric}")
    }

    pub fn alert(metric: Metric) -> String {
        format!("alert.{metric}")
    }
}

impl BusMessage {
    /// Topic this message is published on.
    pub fn topic(&self) -> String {
        match self {
            BusMessage::Sample(s) => topics::sample(s.metric),
            BusMessage::Alert(a) => topics::alert(a.metric),
            BusMessage::SourceStatus(_) => topics::SOURCE_STATUS.to_string(),
            BusMessage::Humidifier(_) => topics::HUMIDIFIER_STATE.to_string(),
        }
    }
}

/// What a subscriber queue does when it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    DropOldest,
    DropNewest,
}

/// A delivered message together with the topic it was published on.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub topic: String,
    /// Bus-wide publish sequence number.
    pub seq: u64,
    pub message: BusMessage,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub dropped: u64,
    pub subscribers: usize,
}

/// Cloneable handle to the bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    capacity: usize,
    policy: OverflowPolicy,
    subscribers: Mutex<Vec<Weak<Queue>>>,
    closed: AtomicBool,
    published: AtomicU64,
    dropped: AtomicU64,
}

struct Queue {
    name: String,
    patterns: Vec<String>,
    capacity: usize,
    policy: OverflowPolicy,
    state: Mutex<QueueState>,
    notify: Notify,
    dropped: AtomicU64,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Envelope>,
    closed: bool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn matches(pattern: &str, topic: &str) -> bool {
    // ---
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => topic
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.')),
        None => pattern == topic,
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl EventBus {
    // ---
    pub fn new(capacity: usize) -> Self {
        Self::with_policy(capacity, OverflowPolicy::DropOldest)
    }

    pub fn with_policy(capacity: usize, policy: OverflowPolicy) -> Self {
        // ---
        Self {
            inner: Arc::new(BusInner {
                capacity: capacity.max(1),
                policy,
                subscribers: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to a single topic or pattern.
    pub fn subscribe(&self, pattern: &str) -> Subscription {
        self.subscribe_as(pattern, &[pattern])
    }

    /// Subscribe under a name (used in logs) to any of several patterns.
    pub fn subscribe_as(&self, name: &str, patterns: &[&str]) -> Subscription {
        // ---
        let queue = Arc::new(Queue {
            name: name.to_string(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            capacity: self.inner.capacity,
            policy: self.inner.policy,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: self.inner.closed.load(Ordering::Acquire),
            }),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        });

        lock(&self.inner.subscribers).push(Arc::downgrade(&queue));
        debug!(subscriber = name, ?patterns, "Subscribed to event bus");

        Subscription { queue }
    }

    /// Publish on the message's own topic. See [`EventBus::publish`].
    pub fn emit(&self, message: BusMessage) -> usize {
        let topic = message.topic();
        self.publish(&topic, message)
    }

    /// Deliver `message` to every live subscriber whose patterns match
    /// `topic`. Never blocks. Returns the number of queues it reached.
    pub fn publish(&self, topic: &str, message: BusMessage) -> usize {
        // ---
        if self.inner.closed.load(Ordering::Acquire) {
            debug!(topic, "Bus closed, message discarded");
            return 0;
        }

        let seq = self.inner.published.fetch_add(1, Ordering::Relaxed);
        let mut targets = Vec::new();
        {
            let mut subs = lock(&self.inner.subscribers);
            subs.retain(|weak| match weak.upgrade() {
                Some(queue) => {
                    if queue.patterns.iter().any(|p| matches(p, topic)) {
                        targets.push(queue);
                    }
                    true
                }
                None => false,
            });
        }

        for queue in &targets {
            let envelope = Envelope {
                topic: topic.to_string(),
                seq,
                message: message.clone(),
            };
            if !queue.push(envelope) {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        targets.len()
    }

    /// Stop accepting messages and wake every subscriber. Subscribers drain
    /// what is already queued, then see the end of their stream.
    pub fn close(&self) {
        // ---
        self.inner.closed.store(true, Ordering::Release);
        let subs = lock(&self.inner.subscribers);
        for queue in subs.iter().filter_map(Weak::upgrade) {
            lock(&queue.state).closed = true;
            queue.notify.notify_one();
        }
    }

    pub fn stats(&self) -> BusStats {
        // ---
        let subscribers = lock(&self.inner.subscribers)
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count();
        BusStats {
            published: self.inner.published.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            subscribers,
        }
    }

    /// Convenience for producers: publish one sample.
    pub fn publish_sample(&self, sample: crate::models::Sample) -> usize {
        self.publish(&topics::sample(sample.metric), BusMessage::Sample(sample))
    }
}

impl Queue {
    /// Returns false when a message had to be dropped.
    fn push(&self, envelope: Envelope) -> bool {
        // ---
        let mut state = lock(&self.state);
        if state.closed {
            return true;
        }

        let mut delivered = true;
        if state.items.len() >= self.capacity {
            let dropped_topic = match self.policy {
                OverflowPolicy::DropOldest => {
                    let old = state.items.pop_front().map(|e| e.topic);
                    state.items.push_back(envelope);
                    old
                }
                OverflowPolicy::DropNewest => Some(envelope.topic),
            };
            delivered = false;

            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            let topic = dropped_topic.unwrap_or_default();
            if topic.starts_with("alert.") {
                warn!(
                    subscriber = %self.name,
                    topic = %topic,
                    total_dropped = total,
                    "Subscriber queue full, alert message dropped"
                );
            } else if total.is_power_of_two() {
                warn!(
                    subscriber = %self.name,
                    topic = %topic,
                    total_dropped = total,
                    "Subscriber queue full, dropping messages"
                );
            }
        } else {
            state.items.push_back(envelope);
        }
        drop(state);

        self.notify.notify_one();
        delivered
    }
}

/// One subscriber's independent position on the bus.
pub struct Subscription {
    queue: Arc<Queue>,
}

impl Subscription {
    // ---
    /// Next message in FIFO order, or `None` once the bus is closed and the
    /// queue drained.
    pub async fn recv(&mut self) -> Option<Envelope> {
        // ---
        loop {
            if let Some(envelope) = self.try_recv() {
                return Some(envelope);
            }
            if lock(&self.queue.state).closed {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        lock(&self.queue.state).items.pop_front()
    }

    /// Messages this subscriber lost to overflow.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.queue.name
    }
}

/// Run `handler` for every message on `subscription` in its own task.
///
/// Each invocation is awaited in a child task, so an error or panic is logged
/// and the loop carries on with the next message. Delivery order is
/// preserved. The loop ends on shutdown (after the in-flight message) or when
/// the bus closes.
pub fn spawn_handler<H, Fut>(
    mut subscription: Subscription,
    handler: H,
    mut shutdown: Shutdown,
) -> JoinHandle<()>
where
    H: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    // ---
    tokio::spawn(async move {
        let name = subscription.name().to_string();
        loop {
            let envelope = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                next = subscription.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            let topic = envelope.topic.clone();
            let seq = envelope.seq;
            match tokio::spawn(handler(envelope)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(subscriber = %name, topic = %topic, seq, "Handler failed: {:#}", e);
                }
                Err(e) if e.is_panic() => {
                    error!(subscriber = %name, topic = %topic, seq, "Handler panicked");
                }
                Err(e) => {
                    warn!(subscriber = %name, topic = %topic, seq, "Handler task cancelled: {}", e);
                }
            }
        }
        debug!(subscriber = %name, "Subscriber loop stopped");
    })
}
