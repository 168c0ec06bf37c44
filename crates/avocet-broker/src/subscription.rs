// Durable consumption point over a topic's stream: delivery-mode policy,
// attached consumers, and the acknowledgment cursor.
use crate::{BrokerError, Result};
use arc_swap::ArcSwap;
use avocet_common::ids::ConsumerId;
use avocet_storage::{LogRecord, Offset, TopicLog};
use bytes::Bytes;
use parking_lot::Mutex;
use slab::Slab;
use smallvec::SmallVec;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Weak;
use tokio::sync::mpsc;

const REPLAY_BATCH: usize = 64;

/// Governs how entries are distributed among a subscription's consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum DeliveryMode {
    /// One consumer at a time; further attach attempts fail.
    Exclusive,
    /// All consumers receive interleaved round-robin dispatch.
    Shared,
    /// One active consumer; waiting consumers are promoted on disconnect.
    Failover,
    /// Entries are routed by their partition key; a key sticks to one
    /// consumer for as long as that consumer stays attached.
    KeyShared,
}

/// Where a newly created subscription's cursor starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    #[default]
    Latest,
    Earliest,
}

/// One entry handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub offset: Offset,
    pub partition_key: Option<String>,
    pub payload: Bytes,
}

impl From<&LogRecord> for Delivery {
    fn from(record: &LogRecord) -> Self {
        Self {
            offset: record.offset,
            partition_key: record.partition_key.clone(),
            payload: record.payload.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct ConsumerEntry {
    slot: usize,
    id: ConsumerId,
    name: String,
    priority: i32,
    ordinal: u64,
    sender: mpsc::Sender<Delivery>,
}

#[derive(Debug)]
struct ConsumerRegistry {
    slots: Slab<ConsumerEntry>,
    next_ordinal: u64,
    mode: DeliveryMode,
    // Set while the subscription is being deleted; attaches bounce.
    fenced: bool,
}

/// Dispatch snapshot rebuilt on every membership change so the publish hot
/// path never takes the registry lock.
#[derive(Debug)]
struct ActiveSet {
    mode: DeliveryMode,
    consumers: Vec<ConsumerEntry>,
}

#[derive(Debug)]
pub struct Subscription {
    name: String,
    log: Arc<dyn TopicLog>,
    queue_capacity: usize,
    registry: Mutex<ConsumerRegistry>,
    active: ArcSwap<ActiveSet>,
    // Next unacknowledged offset; advances only on ack, eviction or expiry.
    cursor: Mutex<Offset>,
    rr_cursor: AtomicUsize,
}

impl Subscription {
    pub(crate) fn new(
        name: impl Into<String>,
        mode: DeliveryMode,
        log: Arc<dyn TopicLog>,
        cursor: Offset,
        queue_capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            log,
            queue_capacity,
            registry: Mutex::new(ConsumerRegistry {
                slots: Slab::new(),
                next_ordinal: 0,
                mode,
                fenced: false,
            }),
            active: ArcSwap::from_pointee(ActiveSet {
                mode,
                consumers: Vec::new(),
            }),
            cursor: Mutex::new(cursor),
            rr_cursor: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> DeliveryMode {
        self.registry.lock().mode
    }

    pub fn consumer_count(&self) -> usize {
        self.registry.lock().slots.len()
    }

    /// Position of the next unacknowledged entry.
    pub fn cursor(&self) -> Offset {
        *self.cursor.lock()
    }

    /// Acknowledge everything up to and including `offset`.
    pub fn ack(&self, offset: Offset) {
        self.set_cursor_at_least(offset.saturating_add(1));
    }

    pub(crate) fn set_cursor_at_least(&self, position: Offset) {
        let mut cursor = self.cursor.lock();
        if position > *cursor {
            *cursor = position;
        }
    }

    pub(crate) async fn backlog_entries(&self) -> Result<u64> {
        let tail = self.log.tail().await?;
        Ok(tail.saturating_sub(self.cursor()))
    }

    /// Attach a consumer under `requested_mode`.
    ///
    /// The first consumer into an empty subscription fixes the delivery mode;
    /// later consumers must match it. Exclusive admits a single consumer.
    pub(crate) fn add_consumer(
        self: &Arc<Self>,
        consumer_name: &str,
        priority: i32,
        requested_mode: DeliveryMode,
    ) -> Result<ConsumerHandle> {
        let (id, slot, receiver, replay) = {
            let mut registry = self.registry.lock();
            if registry.fenced {
                return Err(BrokerError::SubscriptionFenced {
                    subscription: self.name.clone(),
                });
            }
            if registry.slots.is_empty() {
                registry.mode = requested_mode;
            } else if registry.mode != requested_mode
                || registry.mode == DeliveryMode::Exclusive
            {
                return Err(BrokerError::ConsumerBusy {
                    subscription: self.name.clone(),
                });
            }
            let (sender, receiver) = mpsc::channel(self.queue_capacity);
            let id = ConsumerId::new();
            let ordinal = registry.next_ordinal;
            registry.next_ordinal += 1;
            let vacant = registry.slots.vacant_entry();
            let slot = vacant.key();
            vacant.insert(ConsumerEntry {
                slot,
                id,
                name: consumer_name.to_string(),
                priority,
                ordinal,
                sender,
            });
            self.rebuild_active(&registry);
            // A consumer that just became the active one owes the backlog a
            // replay of the unacknowledged window.
            let replay = matches!(
                registry.mode,
                DeliveryMode::Exclusive | DeliveryMode::Failover
            ) && self
                .active
                .load()
                .consumers
                .first()
                .is_some_and(|active| active.id == id);
            (id, slot, receiver, replay)
        };
        if replay {
            self.spawn_redelivery();
        }
        Ok(ConsumerHandle {
            id,
            name: consumer_name.to_string(),
            subscription: Arc::downgrade(self),
            receiver,
            _guard: ConsumerGuard {
                subscription: Arc::downgrade(self),
                slot,
                id,
            },
        })
    }

    /// Mark the subscription as being deleted; fails while consumers remain.
    pub(crate) fn fence_if_empty(&self) -> Result<()> {
        let mut registry = self.registry.lock();
        if !registry.slots.is_empty() {
            return Err(BrokerError::SubscriptionBusy {
                subscription: self.name.clone(),
            });
        }
        registry.fenced = true;
        Ok(())
    }

    /// Detach every consumer. Their receivers observe a closed channel; the
    /// cursor stays where it is.
    pub(crate) fn disconnect_all(&self) {
        let mut registry = self.registry.lock();
        registry.slots.clear();
        self.rebuild_active(&registry);
    }

    fn remove_consumer(&self, slot: usize, id: ConsumerId) -> bool {
        let mut registry = self.registry.lock();
        if !registry.slots.get(slot).is_some_and(|entry| entry.id == id) {
            return false;
        }
        registry.slots.remove(slot);
        self.rebuild_active(&registry);
        // Failover hands the unacknowledged window to the promoted consumer.
        registry.mode == DeliveryMode::Failover && !registry.slots.is_empty()
    }

    fn rebuild_active(&self, registry: &ConsumerRegistry) {
        let mut consumers: Vec<ConsumerEntry> =
            registry.slots.iter().map(|(_, entry)| entry.clone()).collect();
        match registry.mode {
            DeliveryMode::Exclusive => consumers.truncate(1),
            DeliveryMode::Failover => {
                // Priority level first (lower value wins), earliest
                // registration breaks ties.
                consumers.sort_by_key(|entry| (entry.priority, entry.ordinal));
                consumers.truncate(1);
            }
            // Slab iteration is ordered by slot, which is stable for a fixed
            // membership; KeyShared routing relies on that.
            DeliveryMode::Shared | DeliveryMode::KeyShared => {}
        }
        self.active.store(Arc::new(ActiveSet {
            mode: registry.mode,
            consumers,
        }));
    }

    /// Non-blocking fan-out of one committed entry. A full queue drops the
    /// push locally; the entry stays in the backlog because the cursor only
    /// advances on ack.
    pub(crate) fn dispatch(self: &Arc<Self>, record: &LogRecord) {
        let active = self.active.load_full();
        if active.consumers.is_empty() {
            return;
        }
        let mut closed: SmallVec<[(usize, ConsumerId); 4]> = SmallVec::new();
        match active.mode {
            DeliveryMode::Exclusive | DeliveryMode::Failover => {
                offer(&active.consumers[0], Delivery::from(record), &mut closed);
            }
            DeliveryMode::KeyShared => {
                let index =
                    route_key(record.partition_key.as_deref(), active.consumers.len());
                offer(&active.consumers[index], Delivery::from(record), &mut closed);
            }
            DeliveryMode::Shared => {
                let len = active.consumers.len();
                let start = self.rr_cursor.fetch_add(1, Ordering::Relaxed);
                let mut delivery = Some(Delivery::from(record));
                for step in 0..len {
                    let consumer = &active.consumers[(start + step) % len];
                    match consumer.sender.try_reserve() {
                        Ok(permit) => {
                            if let Some(delivery) = delivery.take() {
                                permit.send(delivery);
                                metrics::counter!("avocet_dispatch_sent_total").increment(1);
                            }
                            break;
                        }
                        Err(mpsc::error::TrySendError::Full(())) => {}
                        Err(mpsc::error::TrySendError::Closed(())) => {
                            closed.push((consumer.slot, consumer.id));
                        }
                    }
                }
                if delivery.is_some() {
                    metrics::counter!("avocet_dispatch_dropped_total").increment(1);
                }
            }
        }
        for (slot, id) in closed {
            if self.remove_consumer(slot, id) {
                self.spawn_redelivery();
            }
        }
    }

    fn spawn_redelivery(self: &Arc<Self>) {
        // Promotion can also happen from a sync guard drop outside a runtime;
        // in that case the replay waits for the next attach.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let subscription = Arc::clone(self);
            handle.spawn(async move { subscription.redeliver_unacknowledged().await });
        }
    }

    /// Replay the unacknowledged window to the currently active consumer.
    /// Live dispatch may already have queued some of these entries; delivery
    /// is at-least-once and consumers dedup by offset.
    pub(crate) async fn redeliver_unacknowledged(&self) {
        let mut position = self.cursor();
        loop {
            let active = self.active.load_full();
            if !matches!(
                active.mode,
                DeliveryMode::Exclusive | DeliveryMode::Failover
            ) {
                return;
            }
            let Some(consumer) = active.consumers.first().cloned() else {
                return;
            };
            let records = match self.log.read_from(position, REPLAY_BATCH).await {
                Ok(records) => records,
                Err(err) => {
                    tracing::warn!(
                        subscription = %self.name,
                        error = %err,
                        "redelivery read failed"
                    );
                    return;
                }
            };
            if records.is_empty() {
                return;
            }
            for record in &records {
                if consumer.sender.send(Delivery::from(record)).await.is_err() {
                    // Consumer went away mid-replay; the next promotion
                    // restarts from the cursor.
                    return;
                }
            }
            if let Some(last) = records.last() {
                position = last.offset.saturating_add(1);
            }
        }
    }

    /// Advance the cursor past every retained entry older than the cutoff.
    pub(crate) async fn expire_entries(&self, cutoff_millis: u64) -> Result<()> {
        loop {
            let position = self.cursor();
            let records = self.log.read_from(position, REPLAY_BATCH).await?;
            if records.is_empty() {
                return Ok(());
            }
            let mut horizon = position;
            let mut reached_fresh = false;
            for record in &records {
                if record.timestamp_millis >= cutoff_millis {
                    reached_fresh = true;
                    break;
                }
                horizon = record.offset.saturating_add(1);
            }
            if horizon > position {
                metrics::counter!("avocet_expired_total").increment(horizon - position);
                self.set_cursor_at_least(horizon);
            }
            if reached_fresh || horizon == position {
                return Ok(());
            }
        }
    }
}

fn offer(
    consumer: &ConsumerEntry,
    delivery: Delivery,
    closed: &mut SmallVec<[(usize, ConsumerId); 4]>,
) {
    match consumer.sender.try_reserve() {
        Ok(permit) => {
            permit.send(delivery);
            metrics::counter!("avocet_dispatch_sent_total").increment(1);
        }
        Err(mpsc::error::TrySendError::Full(())) => {
            metrics::counter!("avocet_dispatch_dropped_total").increment(1);
        }
        Err(mpsc::error::TrySendError::Closed(())) => {
            closed.push((consumer.slot, consumer.id));
        }
    }
}

fn route_key(key: Option<&str>, consumer_count: usize) -> usize {
    // Stable hash of the routing key; entries without a key share one bucket.
    let mut hasher = DefaultHasher::new();
    key.unwrap_or("").hash(&mut hasher);
    (hasher.finish() % consumer_count as u64) as usize
}

/// RAII detach: dropping the guard removes the consumer from the registry.
#[derive(Debug)]
struct ConsumerGuard {
    subscription: Weak<Subscription>,
    slot: usize,
    id: ConsumerId,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.upgrade() {
            if subscription.remove_consumer(self.slot, self.id) {
                subscription.spawn_redelivery();
            }
        }
    }
}

/// Consumer-side handle: a bounded receiver plus the detach guard. Dropping
/// the handle detaches the consumer.
#[derive(Debug)]
pub struct ConsumerHandle {
    id: ConsumerId,
    name: String,
    subscription: Weak<Subscription>,
    receiver: mpsc::Receiver<Delivery>,
    _guard: ConsumerGuard,
}

impl ConsumerHandle {
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> std::result::Result<Delivery, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Acknowledge everything up to and including `offset`.
    pub fn ack(&self, offset: Offset) {
        if let Some(subscription) = self.subscription.upgrade() {
            subscription.ack(offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avocet_storage::{AppendRecord, MemoryLog};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn log_with(payloads: &[&'static [u8]]) -> Arc<MemoryLog> {
        let log = Arc::new(MemoryLog::new());
        for payload in payloads {
            log.append(AppendRecord {
                payload: Bytes::from_static(payload),
                partition_key: None,
                checksum: 0,
                timestamp_millis: 0,
            })
            .await
            .expect("append");
        }
        log
    }

    fn record(offset: Offset, key: Option<&str>, payload: &'static [u8]) -> LogRecord {
        LogRecord {
            offset,
            timestamp_millis: 0,
            checksum: 0,
            partition_key: key.map(str::to_string),
            payload: Bytes::from_static(payload),
        }
    }

    async fn recv(handle: &mut ConsumerHandle) -> Delivery {
        timeout(Duration::from_secs(1), handle.recv())
            .await
            .expect("timely delivery")
            .expect("open channel")
    }

    #[tokio::test]
    async fn exclusive_admits_one_consumer_at_a_time() {
        let log = log_with(&[]).await;
        let sub = Subscription::new("s", DeliveryMode::Exclusive, log, 0, 8);
        let first = sub
            .add_consumer("c1", 0, DeliveryMode::Exclusive)
            .expect("first consumer");
        let err = sub
            .add_consumer("c2", 0, DeliveryMode::Exclusive)
            .expect_err("second consumer");
        assert!(matches!(err, BrokerError::ConsumerBusy { .. }));
        drop(first);
        // Slot freed; the queued attach now succeeds.
        sub.add_consumer("c2", 0, DeliveryMode::Exclusive)
            .expect("after detach");
    }

    #[tokio::test]
    async fn mode_conflict_is_rejected_while_occupied() {
        let log = log_with(&[]).await;
        let sub = Subscription::new("s", DeliveryMode::Shared, log, 0, 8);
        let _c1 = sub
            .add_consumer("c1", 0, DeliveryMode::Shared)
            .expect("shared consumer");
        let err = sub
            .add_consumer("c2", 0, DeliveryMode::Failover)
            .expect_err("mode conflict");
        assert!(matches!(err, BrokerError::ConsumerBusy { .. }));
    }

    #[tokio::test]
    async fn empty_subscription_adopts_requested_mode() {
        let log = log_with(&[]).await;
        let sub = Subscription::new("s", DeliveryMode::Shared, log, 0, 8);
        let consumer = sub
            .add_consumer("c1", 0, DeliveryMode::KeyShared)
            .expect("consumer");
        assert_eq!(sub.mode(), DeliveryMode::KeyShared);
        drop(consumer);
    }

    #[tokio::test]
    async fn failover_prefers_priority_then_arrival() {
        let log = log_with(&[]).await;
        let sub = Subscription::new("s", DeliveryMode::Failover, Arc::clone(&log) as _, 0, 8);
        let mut low = sub
            .add_consumer("low", 5, DeliveryMode::Failover)
            .expect("low");
        let mut first_high = sub
            .add_consumer("high-a", 0, DeliveryMode::Failover)
            .expect("high-a");
        let mut second_high = sub
            .add_consumer("high-b", 0, DeliveryMode::Failover)
            .expect("high-b");

        sub.dispatch(&record(0, None, b"one"));
        assert_eq!(recv(&mut first_high).await.payload, &b"one"[..]);

        // Active consumer leaves; the other priority-0 consumer is promoted.
        drop(first_high);
        sub.dispatch(&record(1, None, b"two"));
        assert_eq!(recv(&mut second_high).await.payload, &b"two"[..]);

        drop(second_high);
        sub.dispatch(&record(2, None, b"three"));
        assert_eq!(recv(&mut low).await.payload, &b"three"[..]);
    }

    #[tokio::test]
    async fn shared_round_robin_interleaves() {
        let log = log_with(&[]).await;
        let sub = Subscription::new("s", DeliveryMode::Shared, log, 0, 8);
        let mut a = sub.add_consumer("a", 0, DeliveryMode::Shared).expect("a");
        let mut b = sub.add_consumer("b", 0, DeliveryMode::Shared).expect("b");
        for offset in 0..4u64 {
            sub.dispatch(&record(offset, None, b"m"));
        }
        let mut counts = [0usize; 2];
        for _ in 0..2 {
            recv(&mut a).await;
            counts[0] += 1;
        }
        for _ in 0..2 {
            recv(&mut b).await;
            counts[1] += 1;
        }
        assert_eq!(counts, [2, 2]);
        assert!(a.try_recv().is_err());
        assert!(b.try_recv().is_err());
    }

    #[tokio::test]
    async fn key_shared_is_sticky_per_key() {
        let log = log_with(&[]).await;
        let sub = Subscription::new("s", DeliveryMode::KeyShared, log, 0, 32);
        let mut a = sub.add_consumer("a", 0, DeliveryMode::KeyShared).expect("a");
        let mut b = sub.add_consumer("b", 0, DeliveryMode::KeyShared).expect("b");

        for offset in 0..6u64 {
            sub.dispatch(&record(offset, Some("order-42"), b"k"));
        }
        // All six entries share a key, so exactly one consumer saw them all.
        let mut a_count = 0;
        while a.try_recv().is_ok() {
            a_count += 1;
        }
        let mut b_count = 0;
        while b.try_recv().is_ok() {
            b_count += 1;
        }
        assert!(
            (a_count == 6 && b_count == 0) || (a_count == 0 && b_count == 6),
            "key must stick to one consumer, got {a_count}/{b_count}"
        );
    }

    #[tokio::test]
    async fn ack_advances_cursor_monotonically() {
        let log = log_with(&[b"a", b"b", b"c"]).await;
        let sub = Subscription::new("s", DeliveryMode::Shared, log, 0, 8);
        assert_eq!(sub.cursor(), 0);
        sub.ack(1);
        assert_eq!(sub.cursor(), 2);
        // Stale acks never move the cursor backwards.
        sub.ack(0);
        assert_eq!(sub.cursor(), 2);
    }

    #[tokio::test]
    async fn new_exclusive_consumer_replays_unacknowledged_backlog() {
        let log = log_with(&[b"a", b"b", b"c"]).await;
        let sub = Subscription::new("s", DeliveryMode::Exclusive, log, 0, 8);
        let mut consumer = sub
            .add_consumer("c1", 0, DeliveryMode::Exclusive)
            .expect("consumer");
        for expected in [&b"a"[..], b"b", b"c"] {
            assert_eq!(recv(&mut consumer).await.payload, expected);
        }
    }

    #[tokio::test]
    async fn failover_redelivers_from_cursor_after_promotion() {
        let log = log_with(&[b"a", b"b", b"c"]).await;
        let sub = Subscription::new(
            "s",
            DeliveryMode::Failover,
            Arc::clone(&log) as _,
            0,
            8,
        );
        let mut active = sub
            .add_consumer("active", 0, DeliveryMode::Failover)
            .expect("active");
        let mut standby = sub
            .add_consumer("standby", 1, DeliveryMode::Failover)
            .expect("standby");

        // Active consumer acknowledges the first entry only, then leaves.
        let first = recv(&mut active).await;
        active.ack(first.offset);
        drop(active);

        // The promoted consumer sees the unacknowledged window, in order.
        assert_eq!(recv(&mut standby).await.payload, &b"b"[..]);
        assert_eq!(recv(&mut standby).await.payload, &b"c"[..]);
    }

    #[tokio::test]
    async fn fenced_subscription_rejects_attaches() {
        let log = log_with(&[]).await;
        let sub = Subscription::new("s", DeliveryMode::Shared, log, 0, 8);
        sub.fence_if_empty().expect("fence");
        let err = sub
            .add_consumer("c1", 0, DeliveryMode::Shared)
            .expect_err("fenced");
        assert!(matches!(err, BrokerError::SubscriptionFenced { .. }));
    }

    #[tokio::test]
    async fn fence_fails_while_consumers_attached() {
        let log = log_with(&[]).await;
        let sub = Subscription::new("s", DeliveryMode::Shared, log, 0, 8);
        let _consumer = sub
            .add_consumer("c1", 0, DeliveryMode::Shared)
            .expect("consumer");
        let err = sub.fence_if_empty().expect_err("busy");
        assert!(matches!(err, BrokerError::SubscriptionBusy { .. }));
    }

    #[tokio::test]
    async fn expire_entries_stops_at_first_fresh_record() {
        let log = Arc::new(MemoryLog::new());
        for timestamp in [10u64, 20, 30, 1_000] {
            log.append(AppendRecord {
                payload: Bytes::from_static(b"x"),
                partition_key: None,
                checksum: 0,
                timestamp_millis: timestamp,
            })
            .await
            .expect("append");
        }
        let sub = Subscription::new("s", DeliveryMode::Shared, log, 0, 8);
        sub.expire_entries(100).await.expect("expire");
        // Entries stamped 10/20/30 are expired; the cursor rests on the
        // first fresh record.
        assert_eq!(sub.cursor(), 3);
    }
}
