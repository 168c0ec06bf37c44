// Per-topic runtime core of the broker: topic state machines, subscription
// delivery modes, cross-cluster replication and retry policy. Transport,
// wire codec and storage internals live in collaborator crates.
use ahash::RandomState;
use avocet_common::TopicDefaults;
use avocet_metadata::MetadataStore;
use avocet_storage::LogProvider;
use hashbrown::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

pub mod backoff;
pub mod producer;
pub mod replicator;
pub mod stats;
pub mod subscription;
pub mod topic;

pub use backoff::Backoff;
pub use producer::{AccessMode, Producer};
pub use replicator::{RemoteCluster, RemoteClusterFactory, RemoteSendError, Replicator};
pub use stats::{TopicInternalStats, TopicStats};
pub use subscription::{ConsumerHandle, Delivery, DeliveryMode, StartPosition, Subscription};
pub use topic::{PublishMessage, SubscribeOptions, Topic, TopicState};

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("topic {topic} is closing")]
    TopicClosing { topic: String },
    #[error("topic {topic} still has attached producers")]
    TopicBusy { topic: String },
    #[error("producer {producer} conflicts with an existing producer on {topic}")]
    ProducerBusy { topic: String, producer: String },
    #[error("subscription {subscription} does not admit another active consumer")]
    ConsumerBusy { subscription: String },
    #[error("subscription {subscription} still has attached consumers")]
    SubscriptionBusy { subscription: String },
    #[error("subscription {subscription} is being deleted")]
    SubscriptionFenced { subscription: String },
    #[error("backlog quota exceeded on topic {topic}")]
    BacklogQuotaExceeded { topic: String },
    #[error("checksum mismatch (expected {expected:#010x}, computed {computed:#010x})")]
    ChecksumMismatch { expected: u32, computed: u32 },
    #[error(transparent)]
    RemoteSend(#[from] RemoteSendError),
    #[error("storage error: {0}")]
    Storage(#[from] avocet_storage::StorageError),
    #[error("metadata error: {0}")]
    Metadata(#[from] avocet_metadata::MetadataError),
}

/// Name-keyed registry of live topics with create-if-absent semantics.
///
/// Topics are created lazily on first reference: the log is opened, the
/// policy snapshot is fetched from metadata and configured replicators are
/// started before the topic becomes visible to other callers.
pub struct TopicRegistry {
    topics: RwLock<HashMap<String, Arc<Topic>, RandomState>>,
    logs: Arc<dyn LogProvider>,
    metadata: Arc<dyn MetadataStore>,
    clusters: Arc<dyn RemoteClusterFactory>,
    local_cluster: String,
    defaults: TopicDefaults,
}

impl TopicRegistry {
    pub fn new(
        logs: Arc<dyn LogProvider>,
        metadata: Arc<dyn MetadataStore>,
        clusters: Arc<dyn RemoteClusterFactory>,
        local_cluster: impl Into<String>,
        defaults: TopicDefaults,
    ) -> Self {
        Self {
            topics: RwLock::new(HashMap::with_hasher(RandomState::new())),
            logs,
            metadata,
            clusters,
            local_cluster: local_cluster.into(),
            defaults,
        }
    }

    /// Resolve `name` to its live topic, creating it if absent. A topic whose
    /// storage was deleted is replaced by a fresh instance.
    pub async fn get_or_create(&self, name: &str) -> Result<Arc<Topic>> {
        {
            let topics = self.topics.read().await;
            if let Some(topic) = topics.get(name) {
                if topic.state() != TopicState::Deleted {
                    return Ok(Arc::clone(topic));
                }
            }
        }
        let mut topics = self.topics.write().await;
        if let Some(topic) = topics.get(name) {
            if topic.state() != TopicState::Deleted {
                return Ok(Arc::clone(topic));
            }
        }
        let log = self.logs.open(name).await?;
        let policies = self.metadata.get_policies(name).await?.unwrap_or_default();
        let topic = Arc::new(Topic::new(
            name,
            log,
            Arc::clone(&self.metadata),
            Arc::clone(&self.clusters),
            self.local_cluster.clone(),
            policies,
            self.defaults.clone(),
        ));
        topic.check_replication().await?;
        topics.insert(name.to_string(), Arc::clone(&topic));
        tracing::debug!(topic = %name, "topic created");
        Ok(topic)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.read().await.get(name).cloned()
    }

    /// Live topics, for the stats aggregator and periodic checks.
    pub async fn topics(&self) -> Vec<Arc<Topic>> {
        self.topics.read().await.values().cloned().collect()
    }

    /// Run the garbage-collection check over every topic and unregister the
    /// collected ones. Returns how many were collected.
    pub async fn gc_sweep(&self, idle: Duration) -> Result<usize> {
        let candidates: Vec<(String, Arc<Topic>)> = self
            .topics
            .read()
            .await
            .iter()
            .map(|(name, topic)| (name.clone(), Arc::clone(topic)))
            .collect();
        let mut collected = 0;
        for (name, topic) in candidates {
            if topic.check_gc(idle).await? {
                self.topics.write().await.remove(&name);
                collected += 1;
            }
        }
        Ok(collected)
    }
}
