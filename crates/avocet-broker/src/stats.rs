// Read-only snapshots served to the stats aggregator. Assembled on demand;
// the topic never pushes these anywhere itself.
use crate::producer::AccessMode;
use crate::subscription::DeliveryMode;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct TopicStats {
    pub name: String,
    pub state: &'static str,
    pub producers: Vec<ProducerStats>,
    pub subscriptions: Vec<SubscriptionStats>,
    pub replicators: Vec<ReplicatorStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProducerStats {
    pub name: String,
    pub access_mode: AccessMode,
    pub last_sequence_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStats {
    pub name: String,
    pub mode: DeliveryMode,
    pub consumer_count: usize,
    pub backlog_entries: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicatorStats {
    pub cluster: String,
    pub pending_entries: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicInternalStats {
    pub tail_offset: u64,
    pub oldest_offset: u64,
    pub backlog_bytes: u64,
    pub cursors: Vec<CursorStats>,
    pub replicator_cursors: Vec<CursorStats>,
}

/// Position of one subscription or replicator cursor.
#[derive(Debug, Clone, Serialize)]
pub struct CursorStats {
    pub name: String,
    pub position: u64,
}
