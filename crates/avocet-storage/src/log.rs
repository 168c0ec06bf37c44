use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::sync::Arc;

use crate::{Result, StorageError};

pub type Offset = u64;

#[derive(Debug, Clone)]
pub struct AppendRecord {
    pub payload: Bytes,
    /// Routing key used by key-based dispatch; not interpreted by storage.
    pub partition_key: Option<String>,
    pub checksum: u32,
    pub timestamp_millis: u64,
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub offset: Offset,
    pub timestamp_millis: u64,
    pub checksum: u32,
    pub partition_key: Option<String>,
    pub payload: Bytes,
}

/// Append-ordered durable log for one topic.
///
/// The topic core treats the log as owned elsewhere: offsets are assigned by
/// the log, reads are restartable from any retained offset, and trimming is
/// advisory (the log may retain more than asked).
#[async_trait]
pub trait TopicLog: Send + Sync + Debug {
    /// Append one record and return its assigned offset.
    async fn append(&self, record: AppendRecord) -> Result<Offset>;

    /// Read up to `max` records starting at `from`. A `from` older than the
    /// trim horizon is clamped to the oldest retained record.
    async fn read_from(&self, from: Offset, max: usize) -> Result<Vec<LogRecord>>;

    /// Next offset to be assigned.
    async fn tail(&self) -> Result<Offset>;

    /// Oldest retained offset; equals `tail` when nothing is retained.
    async fn oldest(&self) -> Result<Offset>;

    /// Discard retained records with offsets below `offset`.
    async fn trim_before(&self, offset: Offset) -> Result<()>;

    /// Total payload bytes retained at or after `from`.
    async fn backlog_bytes(&self, from: Offset) -> Result<u64>;

    /// Remove durable state. Every later call fails with `StorageError::Deleted`.
    async fn delete(&self) -> Result<()>;
}

/// Opens the per-topic log for a topic name.
#[async_trait]
pub trait LogProvider: Send + Sync {
    async fn open(&self, topic: &str) -> Result<Arc<dyn TopicLog>>;
}

#[derive(Debug)]
struct MemoryLogInner {
    // Bounded only by trims; offsets stay monotonic across them.
    records: VecDeque<LogRecord>,
    next_offset: Offset,
    deleted: bool,
}

/// In-memory log used by the core's tests and single-node setups.
#[derive(Debug)]
pub struct MemoryLog {
    inner: Mutex<MemoryLogInner>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryLogInner {
                records: VecDeque::new(),
                next_offset: 0,
                deleted: false,
            }),
        }
    }

    fn is_deleted(&self) -> bool {
        self.inner.lock().deleted
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_live(inner: &MemoryLogInner) -> Result<()> {
    if inner.deleted {
        return Err(StorageError::Deleted);
    }
    Ok(())
}

#[async_trait]
impl TopicLog for MemoryLog {
    async fn append(&self, record: AppendRecord) -> Result<Offset> {
        let mut inner = self.inner.lock();
        ensure_live(&inner)?;
        let offset = inner.next_offset;
        inner.next_offset = inner
            .next_offset
            .checked_add(1)
            .expect("log offset overflow");
        inner.records.push_back(LogRecord {
            offset,
            timestamp_millis: record.timestamp_millis,
            checksum: record.checksum,
            partition_key: record.partition_key,
            payload: record.payload,
        });
        Ok(offset)
    }

    async fn read_from(&self, from: Offset, max: usize) -> Result<Vec<LogRecord>> {
        let inner = self.inner.lock();
        ensure_live(&inner)?;
        Ok(inner
            .records
            .iter()
            .filter(|record| record.offset >= from)
            .take(max)
            .cloned()
            .collect())
    }

    async fn tail(&self) -> Result<Offset> {
        let inner = self.inner.lock();
        ensure_live(&inner)?;
        Ok(inner.next_offset)
    }

    async fn oldest(&self) -> Result<Offset> {
        let inner = self.inner.lock();
        ensure_live(&inner)?;
        Ok(inner
            .records
            .front()
            .map(|record| record.offset)
            .unwrap_or(inner.next_offset))
    }

    async fn trim_before(&self, offset: Offset) -> Result<()> {
        let mut inner = self.inner.lock();
        ensure_live(&inner)?;
        while inner
            .records
            .front()
            .is_some_and(|record| record.offset < offset)
        {
            inner.records.pop_front();
        }
        Ok(())
    }

    async fn backlog_bytes(&self, from: Offset) -> Result<u64> {
        let inner = self.inner.lock();
        ensure_live(&inner)?;
        Ok(inner
            .records
            .iter()
            .filter(|record| record.offset >= from)
            .map(|record| record.payload.len() as u64)
            .sum())
    }

    async fn delete(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        ensure_live(&inner)?;
        inner.records.clear();
        inner.deleted = true;
        Ok(())
    }
}

/// Keeps one [`MemoryLog`] per topic name so a reopened topic sees its
/// retained records again. A deleted log is replaced on next open.
#[derive(Debug, Default)]
pub struct MemoryLogProvider {
    logs: Mutex<HashMap<String, Arc<MemoryLog>>>,
}

impl MemoryLogProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogProvider for MemoryLogProvider {
    async fn open(&self, topic: &str) -> Result<Arc<dyn TopicLog>> {
        let mut logs = self.logs.lock();
        let log = match logs.get(topic) {
            Some(log) if !log.is_deleted() => Arc::clone(log),
            _ => {
                let log = Arc::new(MemoryLog::new());
                logs.insert(topic.to_string(), Arc::clone(&log));
                log
            }
        };
        Ok(log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(payload: &'static [u8], timestamp_millis: u64) -> AppendRecord {
        AppendRecord {
            payload: Bytes::from_static(payload),
            partition_key: None,
            checksum: 0,
            timestamp_millis,
        }
    }

    #[tokio::test]
    async fn append_assigns_monotonic_offsets() {
        let log = MemoryLog::new();
        assert_eq!(log.append(record(b"a", 1)).await.expect("append"), 0);
        assert_eq!(log.append(record(b"b", 2)).await.expect("append"), 1);
        assert_eq!(log.tail().await.expect("tail"), 2);
        assert_eq!(log.oldest().await.expect("oldest"), 0);
    }

    #[tokio::test]
    async fn read_from_clamps_to_oldest_after_trim() {
        let log = MemoryLog::new();
        for i in 0..5u64 {
            log.append(record(b"x", i)).await.expect("append");
        }
        log.trim_before(3).await.expect("trim");
        assert_eq!(log.oldest().await.expect("oldest"), 3);
        // Requesting from before the horizon returns what is still retained.
        let records = log.read_from(0, 16).await.expect("read");
        let offsets: Vec<_> = records.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![3, 4]);
    }

    #[tokio::test]
    async fn read_from_respects_max() {
        let log = MemoryLog::new();
        for i in 0..10u64 {
            log.append(record(b"x", i)).await.expect("append");
        }
        let records = log.read_from(0, 3).await.expect("read");
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].offset, 2);
    }

    #[tokio::test]
    async fn backlog_bytes_counts_from_offset() {
        let log = MemoryLog::new();
        log.append(record(b"aaaa", 0)).await.expect("append");
        log.append(record(b"bb", 0)).await.expect("append");
        log.append(record(b"c", 0)).await.expect("append");
        assert_eq!(log.backlog_bytes(0).await.expect("backlog"), 7);
        assert_eq!(log.backlog_bytes(1).await.expect("backlog"), 3);
        assert_eq!(log.backlog_bytes(3).await.expect("backlog"), 0);
    }

    #[tokio::test]
    async fn empty_log_oldest_equals_tail() {
        let log = MemoryLog::new();
        assert_eq!(log.oldest().await.expect("oldest"), 0);
        assert_eq!(log.tail().await.expect("tail"), 0);
    }

    #[tokio::test]
    async fn deleted_log_rejects_every_call() {
        let log = MemoryLog::new();
        log.append(record(b"a", 0)).await.expect("append");
        log.delete().await.expect("delete");
        assert!(matches!(
            log.append(record(b"b", 0)).await,
            Err(StorageError::Deleted)
        ));
        assert!(matches!(log.tail().await, Err(StorageError::Deleted)));
        assert!(matches!(log.delete().await, Err(StorageError::Deleted)));
    }

    #[tokio::test]
    async fn provider_reuses_live_log_and_replaces_deleted() {
        let provider = MemoryLogProvider::new();
        let first = provider.open("orders").await.expect("open");
        first.append(record(b"a", 0)).await.expect("append");

        let again = provider.open("orders").await.expect("open");
        assert_eq!(again.tail().await.expect("tail"), 1);

        again.delete().await.expect("delete");
        let fresh = provider.open("orders").await.expect("open");
        assert_eq!(fresh.tail().await.expect("tail"), 0);
    }
}
