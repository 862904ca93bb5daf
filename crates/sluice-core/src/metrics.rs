//! Metric names and lock-free component metrics.
//!
//! Components update atomic counters on the hot path; a periodic publisher
//! mirrors snapshots into the process metrics recorder and the metrics HTTP
//! endpoints render them. All operations here are lock-free.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Canonical metric names.
pub mod names {
    /// Gauge: document events currently buffered in the worker group.
    pub const WRITE_QUEUE: &str = "write.queue";
    /// Gauge: duration of the current in-flight bulk request, in
    /// milliseconds, including retries. A high value means the connector
    /// has stalled on the index.
    pub const ES_WAIT_MS: &str = "es.wait.ms";
    /// Same as `es.wait.ms`, normalized to seconds for Prometheus.
    pub const ES_WAIT_SECONDS: &str = "es.wait.seconds";
    /// Gauge (per partition): last seqno durably applied to the index.
    pub const COMMITTED_SEQNO: &str = "committed.seqno";
    /// Gauge (per partition): last seqno seen on the stream.
    pub const OBSERVED_SEQNO: &str = "observed.seqno";
    /// Counter: bulk request attempts, including retries.
    pub const BULK_ATTEMPTS: &str = "bulk.attempts";
    /// Counter: bulk batches fully settled.
    pub const BULK_SUCCESSES: &str = "bulk.successes";
    /// Counter: bulk retry rounds.
    pub const BULK_RETRIES: &str = "bulk.retries";
    /// Counter: documents rejected permanently (logged to the reject log).
    pub const DOC_REJECTS: &str = "doc.rejects";
    /// Counter: upserts dropped because the index already held a newer
    /// version.
    pub const DOC_VERSION_CONFLICTS: &str = "doc.version_conflicts";
}

/// Canonical metric label keys.
pub mod labels {
    /// Source partition id.
    pub const PARTITION: &str = "partition";
}

#[allow(clippy::cast_possible_truncation)] // epoch millis fit in u64
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Lock-free metrics for the bulk indexing worker group.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    /// Events submitted but not yet settled.
    pub queue_size: AtomicU64,
    /// Bulk request attempts, including retries.
    pub bulk_attempts: AtomicU64,
    /// Bulk batches fully settled.
    pub bulk_successes: AtomicU64,
    /// Bulk retry rounds.
    pub bulk_retries: AtomicU64,
    /// Documents rejected permanently.
    pub doc_rejects: AtomicU64,
    /// Upserts dropped as already-newer in the index.
    pub version_conflicts: AtomicU64,
    /// Dispatch cycles currently in flight across all workers.
    outstanding: AtomicU64,
    /// Epoch millis when the oldest outstanding dispatch began; 0 when idle.
    started_ms: AtomicU64,
}

impl WorkerMetrics {
    /// Creates zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `n` events entering the queue.
    pub fn enqueued(&self, n: u64) {
        self.queue_size.fetch_add(n, Ordering::Relaxed);
    }

    /// Records `n` events leaving the queue (settled or withdrawn).
    pub fn dequeued(&self, n: u64) {
        let mut current = self.queue_size.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(n);
            match self.queue_size.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Marks the beginning of a batch dispatch cycle (spanning retries).
    pub fn dispatch_started(&self) {
        if self.outstanding.fetch_add(1, Ordering::Relaxed) == 0 {
            self.started_ms.store(now_ms(), Ordering::Relaxed);
        }
    }

    /// Marks the end of a batch dispatch cycle.
    pub fn dispatch_finished(&self) {
        if self.outstanding.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.started_ms.store(0, Ordering::Relaxed);
        }
    }

    /// Records one bulk call attempt.
    pub fn record_attempt(&self) {
        self.bulk_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a fully settled batch.
    pub fn record_success(&self) {
        self.bulk_successes.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one retry round.
    pub fn record_retry(&self) {
        self.bulk_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Milliseconds the oldest in-flight bulk dispatch has been running,
    /// or 0 when idle.
    #[must_use]
    pub fn current_wait_ms(&self) -> u64 {
        if self.outstanding.load(Ordering::Relaxed) == 0 {
            return 0;
        }
        let started = self.started_ms.load(Ordering::Relaxed);
        if started == 0 {
            0
        } else {
            now_ms().saturating_sub(started)
        }
    }

    /// Immutable snapshot for reporting.
    #[must_use]
    pub fn snapshot(&self) -> WorkerMetricsSnapshot {
        WorkerMetricsSnapshot {
            queue_size: self.queue_size.load(Ordering::Relaxed),
            bulk_attempts: self.bulk_attempts.load(Ordering::Relaxed),
            bulk_successes: self.bulk_successes.load(Ordering::Relaxed),
            bulk_retries: self.bulk_retries.load(Ordering::Relaxed),
            doc_rejects: self.doc_rejects.load(Ordering::Relaxed),
            version_conflicts: self.version_conflicts.load(Ordering::Relaxed),
            current_wait_ms: self.current_wait_ms(),
        }
    }
}

/// Immutable snapshot of [`WorkerMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerMetricsSnapshot {
    /// Events submitted but not yet settled.
    pub queue_size: u64,
    /// Bulk request attempts, including retries.
    pub bulk_attempts: u64,
    /// Bulk batches fully settled.
    pub bulk_successes: u64,
    /// Bulk retry rounds.
    pub bulk_retries: u64,
    /// Documents rejected permanently.
    pub doc_rejects: u64,
    /// Upserts dropped as already-newer in the index.
    pub version_conflicts: u64,
    /// Milliseconds the oldest in-flight bulk dispatch has been running.
    pub current_wait_ms: u64,
}
