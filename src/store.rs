//! Per-queue message store with competing-consumer delivery and prefetch
//! accounting.
//!
//! Each declared queue gets a `QueueStore` holding its pending messages in
//! FIFO order. Consumers attach with a prefetch limit and pull deliveries;
//! the store's mutex is the single point where a message is assigned to a
//! consumer, so one message is never in flight for two consumers and
//! prefetch accounting is always consistent with the queue contents.
//!
//! A delivered message stays in flight, counted against its consumer's
//! prefetch allowance, until the consumer settles it (`ack`, `requeue`,
//! `requeue_reset`, or `take`) or detaches. Detaching returns the
//! consumer's in-flight messages to the head of the queue for redelivery.
//!
//! Expired messages are collected lazily on the delivery path and held
//! aside until [`QueueStore::take_expired`] drains them; the router's
//! sweep re-routes them to a dead-letter exchange when one is configured.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::config::QueueConfig;
use crate::message::Message;

/// Opaque identity of an attached consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerHandle(u64);

/// Monotonically increasing sequence number assigned to each enqueued message.
pub type SequenceNumber = u64;

/// A message with queue-assigned metadata.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message: Message,
    /// Monotonically increasing per queue; preserved when a message is
    /// returned to the head of the queue, reassigned when it is requeued
    /// at the tail.
    pub sequence_number: SequenceNumber,
    /// When the message was enqueued (milliseconds since UNIX epoch).
    pub enqueued_time_ms: u64,
    /// Effective TTL: the message's own expiration or the queue default.
    pub ttl_ms: Option<u64>,
}

impl Envelope {
    /// Returns true if this message has expired based on the given time.
    pub fn is_expired(&self, now_epoch_ms: u64) -> bool {
        match self.ttl_ms {
            Some(ttl) if ttl > 0 => now_epoch_ms >= self.enqueued_time_ms + ttl,
            _ => false,
        }
    }
}

/// A message handed to a consumer, awaiting settlement.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    /// Settlement token, unique per delivery within the queue.
    pub delivery_tag: u64,
    /// Name of the queue the message was delivered from.
    pub queue: String,
    /// True when this message has been delivered before.
    pub redelivered: bool,
}

struct ConsumerSlot {
    /// Max in-flight messages for this consumer. 0 = unlimited.
    prefetch: usize,
    /// Current in-flight count.
    outstanding: usize,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.outstanding < self.prefetch
    }
}

struct InFlight {
    envelope: Envelope,
    owner: ConsumerHandle,
}

struct QueueInner {
    pending: VecDeque<Envelope>,
    in_flight: HashMap<u64, InFlight>,
    consumers: HashMap<ConsumerHandle, ConsumerSlot>,
    /// Expired messages collected off the pending queue, awaiting a sweep.
    expired: Vec<Envelope>,
}

impl QueueInner {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: HashMap::new(),
            consumers: HashMap::new(),
            expired: Vec::new(),
        }
    }
}

/// The message store for a single queue.
///
/// Thread-safe; supports multiple concurrent consumers competing for the
/// same messages. Uses `Notify` to wake consumers when a message becomes
/// deliverable or prefetch capacity frees up.
pub struct QueueStore {
    inner: Mutex<QueueInner>,
    notify: Notify,
    next_sequence: AtomicU64,
    next_delivery_tag: AtomicU64,
    next_consumer_id: AtomicU64,
    config: QueueConfig,
}

impl QueueStore {
    /// Creates a new empty store for the given queue configuration.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Mutex::new(QueueInner::new()),
            notify: Notify::new(),
            next_sequence: AtomicU64::new(1),
            next_delivery_tag: AtomicU64::new(1),
            next_consumer_id: AtomicU64::new(1),
            config,
        }
    }

    /// Returns the queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Returns the queue name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Enqueues a message at the tail of the queue.
    ///
    /// Applies the queue's default TTL when the message carries none.
    /// Returns `true` if the message was accepted, `false` if the queue is
    /// at capacity (backpressure). When `max_size` is 0 the queue is
    /// unbounded.
    pub async fn enqueue(&self, message: Message) -> bool {
        let seq = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let now_ms = epoch_ms();

        let ttl_ms = message.expiration_ms.or(if self.config.message_ttl_ms > 0 {
            Some(self.config.message_ttl_ms)
        } else {
            None
        });

        let envelope = Envelope {
            message,
            sequence_number: seq,
            enqueued_time_ms: now_ms,
            ttl_ms,
        };

        let mut inner = self.inner.lock().await;
        self.collect_expired(&mut inner);
        if self.config.max_size > 0 {
            let depth = inner.pending.len() + inner.in_flight.len();
            if depth >= self.config.max_size {
                warn!(
                    queue = %self.config.name,
                    max_size = self.config.max_size,
                    "queue at capacity, rejecting message"
                );
                return false;
            }
        }
        inner.pending.push_back(envelope);
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Attaches a consumer with the given prefetch limit and returns its
    /// handle. Prefetch 0 means unlimited.
    pub async fn attach_consumer(&self, prefetch: usize) -> ConsumerHandle {
        let handle = ConsumerHandle(self.next_consumer_id.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.inner.lock().await;
        inner.consumers.insert(
            handle,
            ConsumerSlot {
                prefetch,
                outstanding: 0,
            },
        );
        debug!(queue = %self.config.name, consumer = handle.0, prefetch, "consumer attached");
        handle
    }

    /// Detaches a consumer. Its in-flight messages are returned to the
    /// head of the queue, in their original order, for redelivery to
    /// another consumer. Any `next_delivery` call blocked on this handle
    /// returns `None`.
    pub async fn detach_consumer(&self, handle: ConsumerHandle) {
        let mut inner = self.inner.lock().await;
        if inner.consumers.remove(&handle).is_none() {
            return;
        }
        let tags: Vec<u64> = inner
            .in_flight
            .iter()
            .filter(|(_, f)| f.owner == handle)
            .map(|(tag, _)| *tag)
            .collect();
        let mut orphaned: Vec<Envelope> = tags
            .into_iter()
            .filter_map(|tag| inner.in_flight.remove(&tag))
            .map(|f| f.envelope)
            .collect();
        orphaned.sort_by_key(|e| e.sequence_number);
        let requeued = orphaned.len();
        for envelope in orphaned.into_iter().rev() {
            inner.pending.push_front(envelope);
        }
        drop(inner);
        if requeued > 0 {
            debug!(
                queue = %self.config.name,
                consumer = handle.0,
                requeued,
                "consumer detached, in-flight messages requeued"
            );
        }
        self.notify.notify_waiters();
    }

    /// Waits for the next message assignable to the given consumer.
    ///
    /// Blocks while the queue is empty or the consumer is at its prefetch
    /// limit. Increments the message's delivery attempt counter as part of
    /// the assignment. Returns `None` once the handle has been detached.
    pub async fn next_delivery(&self, handle: ConsumerHandle) -> Option<Delivery> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                let eligible = match inner.consumers.get(&handle) {
                    None => return None,
                    Some(slot) => slot.has_capacity(),
                };
                if eligible {
                    self.collect_expired(&mut inner);
                    if let Some(delivery) = self.assign(&mut inner, handle) {
                        return Some(delivery);
                    }
                }
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`next_delivery`](Self::next_delivery).
    pub async fn try_next_delivery(&self, handle: ConsumerHandle) -> Option<Delivery> {
        let mut inner = self.inner.lock().await;
        let eligible = inner
            .consumers
            .get(&handle)
            .is_some_and(|slot| slot.has_capacity());
        if !eligible {
            return None;
        }
        self.collect_expired(&mut inner);
        self.assign(&mut inner, handle)
    }

    /// Pops the head message and records it as in flight for `handle`.
    /// Must be called with the inner lock held and capacity checked.
    fn assign(&self, inner: &mut QueueInner, handle: ConsumerHandle) -> Option<Delivery> {
        let mut envelope = inner.pending.pop_front()?;
        envelope.message.delivery_attempt += 1;
        let tag = self.next_delivery_tag.fetch_add(1, Ordering::Relaxed);
        let delivery = Delivery {
            message: envelope.message.clone(),
            delivery_tag: tag,
            queue: self.config.name.clone(),
            redelivered: envelope.message.delivery_attempt > 1,
        };
        inner.in_flight.insert(
            tag,
            InFlight {
                envelope,
                owner: handle,
            },
        );
        if let Some(slot) = inner.consumers.get_mut(&handle) {
            slot.outstanding += 1;
        }
        Some(delivery)
    }

    /// Acknowledges a delivery: the message is removed for good.
    /// Returns false if the delivery tag is unknown.
    pub async fn ack(&self, delivery_tag: u64) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.in_flight.remove(&delivery_tag) {
            None => false,
            Some(in_flight) => {
                release_slot(&mut inner, in_flight.owner);
                drop(inner);
                self.notify.notify_one();
                true
            }
        }
    }

    /// Returns an in-flight message to the head of the queue for
    /// redelivery. The attempt counter is preserved and increments again
    /// on the next assignment.
    pub async fn requeue(&self, delivery_tag: u64) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.in_flight.remove(&delivery_tag) {
            None => false,
            Some(in_flight) => {
                release_slot(&mut inner, in_flight.owner);
                inner.pending.push_front(in_flight.envelope);
                drop(inner);
                self.notify.notify_one();
                true
            }
        }
    }

    /// Returns an in-flight message to the tail of the queue with its
    /// attempt counter reset to 0 and a fresh sequence number, as if it
    /// had just been published.
    pub async fn requeue_reset(&self, delivery_tag: u64) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.in_flight.remove(&delivery_tag) {
            None => false,
            Some(mut in_flight) => {
                release_slot(&mut inner, in_flight.owner);
                in_flight.envelope.message.delivery_attempt = 0;
                in_flight.envelope.sequence_number =
                    self.next_sequence.fetch_add(1, Ordering::Relaxed);
                in_flight.envelope.enqueued_time_ms = epoch_ms();
                inner.pending.push_back(in_flight.envelope);
                drop(inner);
                self.notify.notify_one();
                true
            }
        }
    }

    /// Removes an in-flight message from the queue entirely and hands it
    /// back, e.g. for republishing to another exchange or for dropping.
    pub async fn take(&self, delivery_tag: u64) -> Option<Message> {
        let mut inner = self.inner.lock().await;
        let in_flight = inner.in_flight.remove(&delivery_tag)?;
        release_slot(&mut inner, in_flight.owner);
        drop(inner);
        self.notify.notify_one();
        Some(in_flight.envelope.message)
    }

    /// Increments the attempt counter of an in-flight message, keeping the
    /// stored envelope in step with in-place retry attempts made by the
    /// consumer before settlement.
    pub async fn bump_attempt(&self, delivery_tag: u64) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.in_flight.get_mut(&delivery_tag) {
            None => false,
            Some(in_flight) => {
                in_flight.envelope.message.delivery_attempt += 1;
                true
            }
        }
    }

    /// Removes and returns all expired messages. Expired messages are no
    /// longer deliverable the moment they are collected; draining them
    /// here is what makes dead-letter re-routing exactly-once.
    pub async fn take_expired(&self) -> Vec<Envelope> {
        let mut inner = self.inner.lock().await;
        self.collect_expired(&mut inner);
        inner.expired.drain(..).collect()
    }

    /// Returns the number of messages waiting for delivery.
    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    /// Returns the number of unacknowledged in-flight messages.
    pub async fn in_flight_count(&self) -> usize {
        self.inner.lock().await.in_flight.len()
    }

    /// Returns the number of attached consumers.
    pub async fn consumer_count(&self) -> usize {
        self.inner.lock().await.consumers.len()
    }

    /// Moves expired pending messages to the expired buffer. Must be
    /// called with the inner lock held. In-flight messages never expire;
    /// their consumer already owns them.
    fn collect_expired(&self, inner: &mut QueueInner) {
        if inner.pending.is_empty() {
            return;
        }
        let now_ms = epoch_ms();
        let mut idx = 0;
        while idx < inner.pending.len() {
            if inner.pending[idx].is_expired(now_ms) {
                if let Some(envelope) = inner.pending.remove(idx) {
                    debug!(
                        queue = %self.config.name,
                        message_id = %envelope.message.id,
                        "message expired in queue"
                    );
                    inner.expired.push(envelope);
                }
            } else {
                idx += 1;
            }
        }
    }
}

/// Frees one unit of prefetch capacity for the given consumer, if it is
/// still attached.
fn release_slot(inner: &mut QueueInner, owner: ConsumerHandle) {
    if let Some(slot) = inner.consumers.get_mut(&owner) {
        slot.outstanding = slot.outstanding.saturating_sub(1);
    }
}

/// Returns current time as milliseconds since UNIX epoch.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
