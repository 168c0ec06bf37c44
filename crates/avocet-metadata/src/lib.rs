// Metadata/coordination collaborator: policy lookup and topic bookkeeping.
use async_trait::async_trait;
use avocet_common::Policies;
use std::collections::HashMap;
use tokio::sync::RwLock;

pub type Result<T> = std::result::Result<T, MetadataError>;

#[derive(thiserror::Error, Debug)]
pub enum MetadataError {
    #[error("metadata unavailable: {0}")]
    Unavailable(String),
}

/// Narrow view of the coordination service the topic core consumes.
///
/// Policy writes go through the control plane, not through topics; the core
/// only reads policies and deletes its own topic entry on topic deletion.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Policies applying to `topic`, or `None` when nothing was configured.
    async fn get_policies(&self, topic: &str) -> Result<Option<Policies>>;

    /// Remove the topic's metadata entry. No-op when absent.
    async fn delete_topic(&self, topic: &str) -> Result<()>;
}

/// In-memory metadata store for tests and single-node setups.
///
/// ```
/// use avocet_common::Policies;
/// use avocet_metadata::{MemoryMetadata, MetadataStore};
///
/// let store = MemoryMetadata::new();
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     store.set_policies("orders", Policies::default()).await;
///     let policies = store.get_policies("orders").await.expect("get");
///     assert_eq!(policies, Some(Policies::default()));
/// });
/// ```
#[derive(Debug, Default)]
pub struct MemoryMetadata {
    // RwLock keeps policy reads cheap while updates remain exclusive.
    policies: RwLock<HashMap<String, Policies>>,
}

impl MemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Control-plane-side write, exposed here so tests can stage policies.
    pub async fn set_policies(&self, topic: impl Into<String>, policies: Policies) {
        self.policies.write().await.insert(topic.into(), policies);
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadata {
    async fn get_policies(&self, topic: &str) -> Result<Option<Policies>> {
        Ok(self.policies.read().await.get(topic).cloned())
    }

    async fn delete_topic(&self, topic: &str) -> Result<()> {
        self.policies.write().await.remove(topic);
        Ok(())
    }
}
