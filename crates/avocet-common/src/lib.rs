// Shared data types used across the broker core crates.
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("config error: {0}")]
    Config(String),
}

pub mod ids {
    // Strongly typed IDs so producer and consumer handles cannot be mixed up.
    use super::{Error, Result};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::str::FromStr;
    use uuid::Uuid;

    macro_rules! id_type {
        ($name:ident) => {
            #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
            pub struct $name(Uuid);

            impl $name {
                // Generate a new random ID for this namespace.
                pub fn new() -> Self {
                    Self(Uuid::new_v4())
                }

                // Wrap an existing UUID when decoding from storage.
                pub fn from_uuid(uuid: Uuid) -> Self {
                    Self(uuid)
                }

                // Expose the underlying UUID for interoperability.
                pub fn as_uuid(&self) -> Uuid {
                    self.0
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl FromStr for $name {
                type Err = Error;

                fn from_str(input: &str) -> Result<Self> {
                    // Preserve the original input for clearer error messages.
                    let uuid =
                        Uuid::parse_str(input).map_err(|_| Error::InvalidId(input.into()))?;
                    Ok(Self(uuid))
                }
            }
        };
    }

    id_type!(ProducerId);
    id_type!(ConsumerId);
    id_type!(ReplicatorId);
}

/// What to do with new publishes once the subscription backlog hits its quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionPolicy {
    /// Fail the publish without appending to the log.
    RejectProducer,
    /// Discard the oldest unacknowledged entries until under quota, then accept.
    EvictOldest,
}

/// Backlog limit for the slowest subscription on a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogQuota {
    /// Backlog byte ceiling; `None` means unlimited.
    pub limit_bytes: Option<u64>,
    pub policy: RetentionPolicy,
}

impl Default for BacklogQuota {
    fn default() -> Self {
        Self {
            limit_bytes: None,
            policy: RetentionPolicy::RejectProducer,
        }
    }
}

/// Namespace policy snapshot applied to a topic. Replaced wholesale on update.
///
/// ```
/// use avocet_common::Policies;
///
/// let policies = Policies::default();
/// assert!(policies.replication_clusters.is_empty());
/// assert!(policies.backlog_quota.limit_bytes.is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Policies {
    /// Remote clusters this topic replicates to. The local cluster is ignored.
    pub replication_clusters: Vec<String>,
    pub backlog_quota: BacklogQuota,
    /// Per-topic message TTL; entries older than this are expired from backlogs.
    pub message_ttl_secs: Option<u64>,
}

/// Tunables applied to every topic a broker hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicDefaults {
    /// Bounded delivery-queue depth per attached consumer.
    pub consumer_queue_capacity: usize,
    /// Entries a replicator reads from the log per batch.
    pub replication_batch: usize,
    pub replication_backoff_initial_ms: u64,
    pub replication_backoff_max_ms: u64,
    /// Idle interval before an unused topic is eligible for garbage collection.
    pub gc_idle_secs: u64,
}

impl Default for TopicDefaults {
    fn default() -> Self {
        // Defaults are conservative for local/dev usage.
        Self {
            consumer_queue_capacity: 1024,
            replication_batch: 64,
            replication_backoff_initial_ms: 100,
            replication_backoff_max_ms: 60_000,
            gc_idle_secs: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BacklogQuota, Error, Policies, RetentionPolicy, TopicDefaults, ids::ProducerId};
    use std::str::FromStr;

    #[test]
    fn producer_id_round_trip() {
        // IDs should serialize and parse without loss.
        let id = ProducerId::new();
        let parsed = ProducerId::from_str(&id.to_string()).expect("parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn producer_id_rejects_invalid_input() {
        let err = ProducerId::from_str("not-a-uuid").expect_err("invalid");
        assert!(matches!(err, Error::InvalidId(s) if s == "not-a-uuid"));
    }

    #[test]
    fn default_quota_is_unlimited_reject() {
        let quota = BacklogQuota::default();
        assert!(quota.limit_bytes.is_none());
        assert_eq!(quota.policy, RetentionPolicy::RejectProducer);
    }

    #[test]
    fn policies_round_trip_through_json() {
        let policies = Policies {
            replication_clusters: vec!["east".into(), "west".into()],
            backlog_quota: BacklogQuota {
                limit_bytes: Some(1024),
                policy: RetentionPolicy::EvictOldest,
            },
            message_ttl_secs: Some(300),
        };
        let encoded = serde_json::to_string(&policies).expect("encode");
        let decoded: Policies = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(policies, decoded);
    }

    #[test]
    fn topic_defaults_are_positive() {
        let defaults = TopicDefaults::default();
        assert!(defaults.consumer_queue_capacity > 0);
        assert!(defaults.replication_batch > 0);
        assert!(defaults.replication_backoff_initial_ms > 0);
        assert!(defaults.replication_backoff_max_ms >= defaults.replication_backoff_initial_ms);
    }
}
