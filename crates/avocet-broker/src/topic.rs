// The authoritative per-topic object: coordinates producers, subscriptions,
// replicators, backlog quota and lifecycle under concurrent access.
use crate::producer::{AccessMode, Producer};
use crate::replicator::{RemoteClusterFactory, Replicator};
use crate::stats::{
    CursorStats, ProducerStats, ReplicatorStats, SubscriptionStats, TopicInternalStats, TopicStats,
};
use crate::subscription::{ConsumerHandle, DeliveryMode, StartPosition, Subscription};
use crate::{BrokerError, Result};
use ahash::RandomState;
use arc_swap::ArcSwap;
use avocet_checksum::{Crc32c, IncrementalHash};
use avocet_common::{BacklogQuota, Policies, RetentionPolicy, TopicDefaults};
use avocet_metadata::MetadataStore;
use avocet_storage::{AppendRecord, LogRecord, Offset, StorageError, TopicLog};
use bytes::Bytes;
use hashbrown::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Topic lifecycle. `Fenced` drains in-flight publishes and rejects new
/// operations; `Closed` keeps the object in memory but inert; `Deleted`
/// additionally removed durable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicState {
    Active,
    Fenced,
    Closed,
    Deleted,
}

/// One message submitted for publication.
#[derive(Debug, Clone)]
pub struct PublishMessage {
    pub payload: Bytes,
    /// Producer-assigned, monotonically increasing; enables dedup on retry.
    pub sequence_id: Option<u64>,
    /// Routing key consumed by key-shared dispatch.
    pub partition_key: Option<String>,
    /// Checksum the producer computed over the payload; validated before
    /// anything reaches the log.
    pub checksum: Option<u32>,
}

impl PublishMessage {
    pub fn new(payload: Bytes) -> Self {
        Self {
            payload,
            sequence_id: None,
            partition_key: None,
            checksum: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub subscription: String,
    pub consumer_name: String,
    pub mode: DeliveryMode,
    /// Failover promotion order: lower value wins.
    pub priority: i32,
    pub start: StartPosition,
}

impl SubscribeOptions {
    pub fn new(
        subscription: impl Into<String>,
        consumer_name: impl Into<String>,
        mode: DeliveryMode,
    ) -> Self {
        Self {
            subscription: subscription.into(),
            consumer_name: consumer_name.into(),
            mode,
            priority: 0,
            start: StartPosition::default(),
        }
    }
}

pub struct Topic {
    name: String,
    state: parking_lot::RwLock<TopicState>,
    log: Arc<dyn TopicLog>,
    metadata: Arc<dyn MetadataStore>,
    clusters: Arc<dyn RemoteClusterFactory>,
    local_cluster: String,
    defaults: TopicDefaults,
    producers: RwLock<HashMap<String, Arc<Producer>, RandomState>>,
    subscriptions: RwLock<HashMap<String, Arc<Subscription>, RandomState>>,
    replicators: RwLock<HashMap<String, Replicator, RandomState>>,
    // Read-mostly snapshot, replaced wholesale by on_policies_update.
    policies: ArcSwap<Policies>,
    last_active: parking_lot::Mutex<Instant>,
    checksum: Crc32c,
}

impl Topic {
    pub fn new(
        name: impl Into<String>,
        log: Arc<dyn TopicLog>,
        metadata: Arc<dyn MetadataStore>,
        clusters: Arc<dyn RemoteClusterFactory>,
        local_cluster: impl Into<String>,
        policies: Policies,
        defaults: TopicDefaults,
    ) -> Self {
        Self {
            name: name.into(),
            state: parking_lot::RwLock::new(TopicState::Active),
            log,
            metadata,
            clusters,
            local_cluster: local_cluster.into(),
            defaults,
            producers: RwLock::new(HashMap::with_hasher(RandomState::new())),
            subscriptions: RwLock::new(HashMap::with_hasher(RandomState::new())),
            replicators: RwLock::new(HashMap::with_hasher(RandomState::new())),
            policies: ArcSwap::from_pointee(policies),
            last_active: parking_lot::Mutex::new(Instant::now()),
            checksum: Crc32c,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TopicState {
        *self.state.read()
    }

    pub fn policies(&self) -> Arc<Policies> {
        self.policies.load_full()
    }

    pub fn get_backlog_quota(&self) -> BacklogQuota {
        self.policies.load().backlog_quota
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state() != TopicState::Active {
            return Err(BrokerError::TopicClosing {
                topic: self.name.clone(),
            });
        }
        Ok(())
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// Accept one message: validate, enforce the backlog quota, append to the
    /// durable log, then fan the committed entry out to every subscription
    /// and replicator without blocking the publisher on dispatch.
    ///
    /// The returned future is the publish completion: exactly one terminal
    /// outcome per call, either the assigned offset or an error.
    pub async fn publish_message(
        &self,
        producer_name: &str,
        message: PublishMessage,
    ) -> Result<Offset> {
        self.ensure_active()?;

        let computed = self.checksum.calculate(&message.payload);
        if let Some(expected) = message.checksum {
            if expected != computed {
                return Err(BrokerError::ChecksumMismatch { expected, computed });
            }
        }

        let producer = self.producers.read().await.get(producer_name).cloned();
        if let (Some(producer), Some(sequence_id)) = (&producer, message.sequence_id) {
            if let Some(offset) = producer.duplicate_of(sequence_id) {
                // Duplicate retry: acknowledge with the prior position, do
                // not append again.
                return Ok(offset);
            }
        }

        let quota = self.get_backlog_quota();
        if let Some(limit) = quota.limit_bytes {
            match quota.policy {
                RetentionPolicy::RejectProducer => {
                    if self.backlog_bytes_slowest().await? > limit {
                        metrics::counter!("avocet_publish_rejected_total").increment(1);
                        return Err(BrokerError::BacklogQuotaExceeded {
                            topic: self.name.clone(),
                        });
                    }
                }
                RetentionPolicy::EvictOldest => {
                    self.evict_backlog_to(limit).await?;
                }
            }
        }

        // A concurrent close may have fenced the topic while the checks above
        // ran; nothing racing the fence may reach the log.
        self.ensure_active()?;

        let timestamp_millis = unix_millis();
        let offset = self
            .log
            .append(AppendRecord {
                payload: message.payload.clone(),
                partition_key: message.partition_key.clone(),
                checksum: computed,
                timestamp_millis,
            })
            .await?;
        if let (Some(producer), Some(sequence_id)) = (producer, message.sequence_id) {
            producer.record_published(sequence_id, offset);
        }

        let record = LogRecord {
            offset,
            timestamp_millis,
            checksum: computed,
            partition_key: message.partition_key,
            payload: message.payload,
        };
        {
            let subscriptions = self.subscriptions.read().await;
            for subscription in subscriptions.values() {
                subscription.dispatch(&record);
            }
        }
        {
            let replicators = self.replicators.read().await;
            for replicator in replicators.values() {
                replicator.notify_new_entries();
            }
        }

        metrics::counter!("avocet_publish_total").increment(1);
        self.touch();
        Ok(offset)
    }

    /// Register a producer. Fails when an exclusive claim conflicts with the
    /// producers already attached, or when the topic is not active.
    pub async fn add_producer(&self, producer: Producer) -> Result<Arc<Producer>> {
        self.ensure_active()?;
        let mut producers = self.producers.write().await;
        let conflict = producers.contains_key(producer.name())
            || (producer.access_mode() == AccessMode::Exclusive && !producers.is_empty())
            || producers
                .values()
                .any(|existing| existing.access_mode() == AccessMode::Exclusive);
        if conflict {
            return Err(BrokerError::ProducerBusy {
                topic: self.name.clone(),
                producer: producer.name().to_string(),
            });
        }
        let producer = Arc::new(producer);
        producers.insert(producer.name().to_string(), Arc::clone(&producer));
        drop(producers);
        self.touch();
        Ok(producer)
    }

    /// Idempotent removal; unknown names are a no-op.
    pub async fn remove_producer(&self, producer_name: &str) {
        self.producers.write().await.remove(producer_name);
        self.touch();
    }

    /// Create the named subscription if absent and attach a consumer under
    /// the requested delivery mode.
    pub async fn subscribe(&self, options: SubscribeOptions) -> Result<ConsumerHandle> {
        self.ensure_active()?;
        let subscription = self
            .get_or_create_subscription(&options.subscription, options.mode, options.start)
            .await?;
        let handle =
            subscription.add_consumer(&options.consumer_name, options.priority, options.mode)?;
        self.touch();
        Ok(handle)
    }

    /// Create-if-absent without attaching a consumer; the durable cursor
    /// starts at the current tail.
    pub async fn create_subscription(&self, name: &str) -> Result<Arc<Subscription>> {
        self.ensure_active()?;
        let subscription = self
            .get_or_create_subscription(name, DeliveryMode::Shared, StartPosition::Latest)
            .await?;
        self.touch();
        Ok(subscription)
    }

    /// Delete-if-empty. Fails while consumers remain attached; a concurrent
    /// subscribe racing the deletion observes the fence.
    pub async fn unsubscribe(&self, name: &str) -> Result<()> {
        let mut subscriptions = self.subscriptions.write().await;
        if let Some(subscription) = subscriptions.get(name) {
            subscription.fence_if_empty()?;
            subscriptions.remove(name);
        }
        drop(subscriptions);
        self.touch();
        Ok(())
    }

    pub async fn get_subscription(&self, name: &str) -> Option<Arc<Subscription>> {
        self.subscriptions.read().await.get(name).cloned()
    }

    pub async fn get_subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions.read().await.values().cloned().collect()
    }

    pub async fn get_producers(&self) -> Vec<Arc<Producer>> {
        self.producers.read().await.values().cloned().collect()
    }

    /// Remote cluster names with a running replicator.
    pub async fn get_replicators(&self) -> Vec<String> {
        self.replicators.read().await.keys().cloned().collect()
    }

    async fn get_or_create_subscription(
        &self,
        name: &str,
        mode: DeliveryMode,
        start: StartPosition,
    ) -> Result<Arc<Subscription>> {
        {
            let subscriptions = self.subscriptions.read().await;
            if let Some(subscription) = subscriptions.get(name) {
                return Ok(Arc::clone(subscription));
            }
        }
        let mut subscriptions = self.subscriptions.write().await;
        if let Some(subscription) = subscriptions.get(name) {
            return Ok(Arc::clone(subscription));
        }
        let cursor = match start {
            StartPosition::Latest => self.log.tail().await?,
            StartPosition::Earliest => self.log.oldest().await?,
        };
        let subscription = Subscription::new(
            name,
            mode,
            Arc::clone(&self.log),
            cursor,
            self.defaults.consumer_queue_capacity,
        );
        subscriptions.insert(name.to_string(), Arc::clone(&subscription));
        Ok(subscription)
    }

    /// Reconcile the running replicators against the configured replication
    /// cluster set. Idempotent; the local cluster is never replicated to.
    pub async fn check_replication(&self) -> Result<()> {
        if self.state() != TopicState::Active {
            return Ok(());
        }
        let configured: Vec<String> = self
            .policies
            .load()
            .replication_clusters
            .iter()
            .filter(|cluster| **cluster != self.local_cluster)
            .cloned()
            .collect();

        let mut replicators = self.replicators.write().await;
        for cluster in &configured {
            if !replicators.contains_key(cluster) {
                let remote = self.clusters.connect(cluster);
                let start_at = self.log.tail().await?;
                tracing::info!(topic = %self.name, cluster = %cluster, "starting replicator");
                replicators.insert(
                    cluster.clone(),
                    Replicator::start(
                        cluster.clone(),
                        Arc::clone(&self.log),
                        remote,
                        start_at,
                        self.defaults.replication_batch,
                        Duration::from_millis(self.defaults.replication_backoff_initial_ms),
                        Duration::from_millis(self.defaults.replication_backoff_max_ms),
                    ),
                );
            }
        }
        let stale: Vec<String> = replicators
            .keys()
            .filter(|cluster| !configured.contains(*cluster))
            .cloned()
            .collect();
        for cluster in stale {
            if let Some(replicator) = replicators.remove(&cluster) {
                tracing::info!(topic = %self.name, cluster = %cluster, "stopping replicator");
                replicator.stop().await;
            }
        }
        Ok(())
    }

    /// Garbage-collect the topic if it has been idle past `idle` with no
    /// producers and no subscriptions. A replicator holding unforwarded
    /// entries pins the topic. Returns whether the topic was collected.
    pub async fn check_gc(&self, idle: Duration) -> Result<bool> {
        if self.state() != TopicState::Active {
            return Ok(false);
        }
        if self.last_active.lock().elapsed() < idle {
            return Ok(false);
        }
        if !self.producers.read().await.is_empty() {
            return Ok(false);
        }
        if !self.subscriptions.read().await.is_empty() {
            return Ok(false);
        }
        {
            let replicators = self.replicators.read().await;
            for replicator in replicators.values() {
                if replicator.pending_backlog().await? > 0 {
                    return Ok(false);
                }
            }
        }
        tracing::info!(topic = %self.name, "garbage collecting idle topic");
        self.delete().await?;
        Ok(true)
    }

    /// Trim every subscription's backlog per the topic TTL policy.
    pub async fn check_message_expiry(&self) -> Result<()> {
        let Some(ttl_secs) = self.policies.load().message_ttl_secs else {
            return Ok(());
        };
        let cutoff = unix_millis().saturating_sub(ttl_secs.saturating_mul(1000));
        let subscriptions: Vec<Arc<Subscription>> = self
            .subscriptions
            .read()
            .await
            .values()
            .cloned()
            .collect();
        for subscription in subscriptions {
            subscription.expire_entries(cutoff).await?;
        }
        self.trim_to_horizon().await
    }

    /// Replace the policy snapshot wholesale, then re-evaluate everything
    /// that hangs off it: replication set, TTL, backlog quota.
    pub async fn on_policies_update(&self, policies: Policies) -> Result<()> {
        self.policies.store(Arc::new(policies));
        self.check_replication().await?;
        self.check_message_expiry().await?;
        let quota = self.get_backlog_quota();
        if let (RetentionPolicy::EvictOldest, Some(limit)) = (quota.policy, quota.limit_bytes) {
            self.evict_backlog_to(limit).await?;
        }
        Ok(())
    }

    /// True when the backlog of the slowest subscription exceeds the quota
    /// and the policy rejects producers. The eviction policy never rejects;
    /// it trims on the publish path instead.
    pub async fn is_backlog_quota_exceeded(&self, producer_name: &str) -> bool {
        let quota = self.get_backlog_quota();
        let Some(limit) = quota.limit_bytes else {
            return false;
        };
        if quota.policy != RetentionPolicy::RejectProducer {
            return false;
        }
        match self.backlog_bytes_slowest().await {
            Ok(bytes) if bytes > limit => {
                tracing::debug!(
                    topic = %self.name,
                    producer = %producer_name,
                    backlog_bytes = bytes,
                    "backlog quota exceeded"
                );
                true
            }
            Ok(_) => false,
            Err(err) => {
                tracing::warn!(topic = %self.name, error = %err, "backlog read failed");
                false
            }
        }
    }

    /// Drain and detach everything without removing durable state.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            match *state {
                TopicState::Closed | TopicState::Deleted => return Ok(()),
                _ => *state = TopicState::Fenced,
            }
        }
        self.producers.write().await.clear();
        {
            let subscriptions = self.subscriptions.read().await;
            for subscription in subscriptions.values() {
                subscription.disconnect_all();
            }
        }
        {
            let mut replicators = self.replicators.write().await;
            for (_, replicator) in replicators.drain() {
                replicator.stop().await;
            }
        }
        *self.state.write() = TopicState::Closed;
        tracing::info!(topic = %self.name, "topic closed");
        Ok(())
    }

    /// Close, then remove durable storage and metadata. Fails with
    /// `TopicBusy` while producers remain attached.
    pub async fn delete(&self) -> Result<()> {
        if self.state() == TopicState::Deleted {
            return Ok(());
        }
        if !self.producers.read().await.is_empty() {
            return Err(BrokerError::TopicBusy {
                topic: self.name.clone(),
            });
        }
        self.close().await?;
        match self.log.delete().await {
            Ok(()) | Err(StorageError::Deleted) => {}
            Err(err) => return Err(err.into()),
        }
        self.metadata.delete_topic(&self.name).await?;
        *self.state.write() = TopicState::Deleted;
        tracing::info!(topic = %self.name, "topic deleted");
        Ok(())
    }

    pub async fn get_stats(&self) -> Result<TopicStats> {
        let producers = self
            .producers
            .read()
            .await
            .values()
            .map(|producer| ProducerStats {
                name: producer.name().to_string(),
                access_mode: producer.access_mode(),
                last_sequence_id: producer.last_sequence_id(),
            })
            .collect();
        let mut subscriptions = Vec::new();
        let subs: Vec<Arc<Subscription>> = self
            .subscriptions
            .read()
            .await
            .values()
            .cloned()
            .collect();
        for subscription in subs {
            subscriptions.push(SubscriptionStats {
                name: subscription.name().to_string(),
                mode: subscription.mode(),
                consumer_count: subscription.consumer_count(),
                backlog_entries: subscription.backlog_entries().await?,
            });
        }
        let mut replicators = Vec::new();
        {
            let running = self.replicators.read().await;
            for replicator in running.values() {
                replicators.push(ReplicatorStats {
                    cluster: replicator.cluster().to_string(),
                    pending_entries: replicator.pending_backlog().await?,
                });
            }
        }
        Ok(TopicStats {
            name: self.name.clone(),
            state: self.state_name(),
            producers,
            subscriptions,
            replicators,
        })
    }

    pub async fn get_internal_stats(&self) -> Result<TopicInternalStats> {
        let tail_offset = self.log.tail().await?;
        let oldest_offset = self.log.oldest().await?;
        let slowest = self.slowest_cursor().await.unwrap_or(tail_offset);
        let backlog_bytes = self.log.backlog_bytes(slowest).await?;
        let cursors = self
            .subscriptions
            .read()
            .await
            .values()
            .map(|subscription| CursorStats {
                name: subscription.name().to_string(),
                position: subscription.cursor(),
            })
            .collect();
        let replicator_cursors = self
            .replicators
            .read()
            .await
            .values()
            .map(|replicator| CursorStats {
                name: replicator.cluster().to_string(),
                position: replicator.cursor(),
            })
            .collect();
        Ok(TopicInternalStats {
            tail_offset,
            oldest_offset,
            backlog_bytes,
            cursors,
            replicator_cursors,
        })
    }

    fn state_name(&self) -> &'static str {
        match self.state() {
            TopicState::Active => "active",
            TopicState::Fenced => "fenced",
            TopicState::Closed => "closed",
            TopicState::Deleted => "deleted",
        }
    }

    async fn slowest_cursor(&self) -> Option<Offset> {
        let subscriptions = self.subscriptions.read().await;
        subscriptions
            .values()
            .map(|subscription| subscription.cursor())
            .min()
    }

    async fn backlog_bytes_slowest(&self) -> Result<u64> {
        match self.slowest_cursor().await {
            Some(slowest) => Ok(self.log.backlog_bytes(slowest).await?),
            // No subscriptions means no unacknowledged backlog.
            None => Ok(0),
        }
    }

    /// Advance the slowest cursors past the oldest unacknowledged entries
    /// until the backlog fits `limit`, then trim the log below every cursor.
    async fn evict_backlog_to(&self, limit: u64) -> Result<()> {
        loop {
            let Some(slowest) = self.slowest_cursor().await else {
                return Ok(());
            };
            let backlog = self.log.backlog_bytes(slowest).await?;
            if backlog <= limit {
                break;
            }
            let records = self
                .log
                .read_from(slowest, self.defaults.replication_batch)
                .await?;
            if records.is_empty() {
                break;
            }
            let mut remaining = backlog;
            let mut horizon = slowest;
            let mut evicted = 0u64;
            for record in &records {
                if remaining <= limit {
                    break;
                }
                remaining = remaining.saturating_sub(record.payload.len() as u64);
                horizon = record.offset.saturating_add(1);
                evicted += 1;
            }
            if horizon == slowest {
                break;
            }
            metrics::counter!("avocet_backlog_evicted_total").increment(evicted);
            tracing::debug!(topic = %self.name, horizon, evicted, "evicting oldest backlog");
            let subscriptions = self.subscriptions.read().await;
            for subscription in subscriptions.values() {
                subscription.set_cursor_at_least(horizon);
            }
        }
        self.trim_to_horizon().await
    }

    // Trim retained entries nobody can still need: below every subscription
    // cursor and every replicator cursor.
    async fn trim_to_horizon(&self) -> Result<()> {
        let mut horizon = self.log.tail().await?;
        {
            let subscriptions = self.subscriptions.read().await;
            for subscription in subscriptions.values() {
                horizon = horizon.min(subscription.cursor());
            }
        }
        {
            let replicators = self.replicators.read().await;
            for replicator in replicators.values() {
                horizon = horizon.min(replicator.cursor());
            }
        }
        self.log.trim_before(horizon).await?;
        Ok(())
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
