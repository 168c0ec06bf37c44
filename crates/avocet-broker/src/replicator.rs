// Per-remote-cluster forwarding agent: copies locally committed entries to
// another cluster, one in-flight send at a time, retrying with backoff.
use crate::backoff::Backoff;
use async_trait::async_trait;
use avocet_storage::{LogRecord, Offset, TopicLog};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

// How long to wait between gate probes when a retry sleep undershoots the
// current backoff interval.
const RETRY_GATE_POLL: Duration = Duration::from_millis(5);

#[derive(thiserror::Error, Debug, Clone)]
#[error("remote send to {cluster} failed: {reason}")]
pub struct RemoteSendError {
    pub cluster: String,
    pub reason: String,
}

/// Transport-side view of a remote cluster. Connection management and wire
/// encoding live behind this trait; the replicator only sequences sends.
#[async_trait]
pub trait RemoteCluster: Send + Sync {
    fn cluster(&self) -> &str;

    async fn send(&self, record: &LogRecord) -> std::result::Result<(), RemoteSendError>;
}

/// Hands out remote-cluster connections by name.
pub trait RemoteClusterFactory: Send + Sync {
    fn connect(&self, cluster: &str) -> Arc<dyn RemoteCluster>;
}

#[derive(Debug)]
struct ReplicatorShared {
    cluster: String,
    log: Arc<dyn TopicLog>,
    // Next local offset to forward. Entries below it are already on the
    // remote; the send loop is the only writer.
    cursor: AtomicU64,
    notify: Notify,
    shutdown: AtomicBool,
}

/// Forwarding agent for one remote cluster.
///
/// The send loop reads from the local log at its own cursor and forwards
/// entries strictly in order. A failed send never advances the cursor, so
/// retries cannot reorder the remote stream.
pub struct Replicator {
    shared: Arc<ReplicatorShared>,
    task: JoinHandle<()>,
}

impl Replicator {
    pub(crate) fn start(
        cluster: String,
        log: Arc<dyn TopicLog>,
        remote: Arc<dyn RemoteCluster>,
        start_at: Offset,
        batch: usize,
        backoff_initial: Duration,
        backoff_max: Duration,
    ) -> Self {
        let shared = Arc::new(ReplicatorShared {
            cluster,
            log,
            cursor: AtomicU64::new(start_at),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
        });
        let task = tokio::spawn(run(
            Arc::clone(&shared),
            remote,
            batch,
            Backoff::new(backoff_initial, backoff_max),
        ));
        Self { shared, task }
    }

    pub fn cluster(&self) -> &str {
        &self.shared.cluster
    }

    /// Next local offset the replicator will forward.
    pub fn cursor(&self) -> Offset {
        self.shared.cursor.load(Ordering::Acquire)
    }

    /// Entries committed locally but not yet forwarded.
    pub async fn pending_backlog(&self) -> crate::Result<u64> {
        let tail = self.shared.log.tail().await?;
        Ok(tail.saturating_sub(self.cursor()))
    }

    /// Wake the send loop after new entries were committed.
    pub(crate) fn notify_new_entries(&self) {
        self.shared.notify.notify_one();
    }

    /// Signal shutdown and wait for the send loop to finish its in-flight
    /// attempt. The cursor is left behind for inspection.
    pub(crate) async fn stop(self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.notify.notify_one();
        let _ = self.task.await;
    }
}

async fn run(
    shared: Arc<ReplicatorShared>,
    remote: Arc<dyn RemoteCluster>,
    batch: usize,
    mut backoff: Backoff,
) {
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        let cursor = shared.cursor.load(Ordering::Acquire);
        let records = match shared.log.read_from(cursor, batch).await {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(
                    cluster = %shared.cluster,
                    error = %err,
                    "replication read failed; stopping replicator"
                );
                return;
            }
        };
        if records.is_empty() {
            // Idle until the topic commits another entry or stop() fires.
            shared.notify.notified().await;
            continue;
        }
        for record in &records {
            if !forward(&shared, remote.as_ref(), &mut backoff, record).await {
                return;
            }
            shared
                .cursor
                .store(record.offset.saturating_add(1), Ordering::Release);
        }
    }
}

// One entry, retried until it lands or shutdown is requested. Returns false
// on shutdown.
async fn forward(
    shared: &ReplicatorShared,
    remote: &dyn RemoteCluster,
    backoff: &mut Backoff,
    record: &LogRecord,
) -> bool {
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return false;
        }
        match remote.send(record).await {
            Ok(()) => {
                backoff.reset();
                metrics::counter!("avocet_replicated_total").increment(1);
                return true;
            }
            Err(err) => {
                metrics::counter!("avocet_replication_failures_total").increment(1);
                let delay = backoff.next_delay();
                tracing::warn!(
                    cluster = %shared.cluster,
                    offset = record.offset,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "remote send failed; backing off"
                );
                // Interruptible: a stop() notification cuts the sleep short,
                // and the shutdown check at the top of the loop handles it.
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = shared.notify.notified() => {}
                }
                // The interval may have grown past the slept delay; let the
                // gate confirm the retry is due before attempting again.
                while !backoff.should_backoff(Instant::now(), Duration::ZERO) {
                    if shared.shutdown.load(Ordering::Acquire) {
                        return false;
                    }
                    tokio::time::sleep(RETRY_GATE_POLL).await;
                }
            }
        }
    }
}

// In-memory remote used by this module's tests and the topic tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Default)]
    pub(crate) struct RecordingRemote {
        delivered: Mutex<Vec<(Offset, Bytes)>>,
        fail_first: AtomicUsize,
    }

    impl RecordingRemote {
        pub(crate) fn failing(times: usize) -> Self {
            Self {
                delivered: Mutex::new(Vec::new()),
                fail_first: AtomicUsize::new(times),
            }
        }

        pub(crate) fn delivered(&self) -> Vec<(Offset, Bytes)> {
            self.delivered.lock().clone()
        }
    }

    #[async_trait]
    impl RemoteCluster for RecordingRemote {
        fn cluster(&self) -> &str {
            "remote-test"
        }

        async fn send(&self, record: &LogRecord) -> std::result::Result<(), RemoteSendError> {
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(RemoteSendError {
                    cluster: "remote-test".into(),
                    reason: "injected failure".into(),
                });
            }
            self.delivered
                .lock()
                .push((record.offset, record.payload.clone()));
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    pub(crate) struct RecordingClusterFactory {
        remotes: Mutex<std::collections::HashMap<String, Arc<RecordingRemote>>>,
        fail_sends: usize,
    }

    impl RecordingClusterFactory {
        pub(crate) fn always_failing() -> Self {
            Self {
                remotes: Mutex::new(std::collections::HashMap::new()),
                fail_sends: usize::MAX,
            }
        }

        pub(crate) fn remote(&self, cluster: &str) -> Option<Arc<RecordingRemote>> {
            self.remotes.lock().get(cluster).cloned()
        }
    }

    impl RemoteClusterFactory for RecordingClusterFactory {
        fn connect(&self, cluster: &str) -> Arc<dyn RemoteCluster> {
            let mut remotes = self.remotes.lock();
            let remote = remotes
                .entry(cluster.to_string())
                .or_insert_with(|| Arc::new(RecordingRemote::failing(self.fail_sends)));
            Arc::clone(remote) as Arc<dyn RemoteCluster>
        }
    }
}
