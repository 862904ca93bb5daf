//! Periodic metrics publication and logging.
//!
//! Components keep their own lock-free counters; this module mirrors
//! their snapshots into the process metrics recorder (for the Prometheus
//! endpoint) and renders the Dropwizard-style JSON for the other metrics
//! endpoint. A background task republishes on a short cadence and emits a
//! log report at the configured interval.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::info;

use sluice_core::checkpoint::service::CheckpointService;
use sluice_core::metrics::{labels, names, WorkerMetrics};

const PUBLISH_INTERVAL: Duration = Duration::from_secs(5);

/// Bridges component metrics into the recorder and the JSON endpoint.
pub struct MetricsPublisher {
    worker: Arc<WorkerMetrics>,
    checkpoints: Arc<CheckpointService>,
}

impl MetricsPublisher {
    /// Creates a publisher over the given components.
    #[must_use]
    pub fn new(worker: Arc<WorkerMetrics>, checkpoints: Arc<CheckpointService>) -> Self {
        Self {
            worker,
            checkpoints,
        }
    }

    /// Mirrors current snapshots into the metrics recorder.
    #[allow(clippy::cast_precision_loss)] // gauge values fit comfortably in f64
    pub fn publish(&self) {
        let snap = self.worker.snapshot();
        gauge!(names::WRITE_QUEUE).set(snap.queue_size as f64);
        gauge!(names::ES_WAIT_MS).set(snap.current_wait_ms as f64);
        gauge!(names::ES_WAIT_SECONDS).set(snap.current_wait_ms as f64 / 1000.0);
        counter!(names::BULK_ATTEMPTS).absolute(snap.bulk_attempts);
        counter!(names::BULK_SUCCESSES).absolute(snap.bulk_successes);
        counter!(names::BULK_RETRIES).absolute(snap.bulk_retries);
        counter!(names::DOC_REJECTS).absolute(snap.doc_rejects);
        counter!(names::DOC_VERSION_CONFLICTS).absolute(snap.version_conflicts);

        for (partition, progress) in self.checkpoints.snapshot() {
            let label = partition.to_string();
            gauge!(names::COMMITTED_SEQNO, labels::PARTITION => label.clone())
                .set(progress.committed.seqno as f64);
            gauge!(names::OBSERVED_SEQNO, labels::PARTITION => label)
                .set(progress.observed_seqno as f64);
        }
    }

    /// Renders the Dropwizard-style JSON document.
    #[must_use]
    pub fn dropwizard_json(&self) -> Value {
        let snap = self.worker.snapshot();
        let mut gauges = serde_json::Map::new();
        gauges.insert(names::WRITE_QUEUE.into(), json!({ "value": snap.queue_size }));
        gauges.insert(
            names::ES_WAIT_MS.into(),
            json!({ "value": snap.current_wait_ms }),
        );
        gauges.insert(
            names::ES_WAIT_SECONDS.into(),
            json!({ "value": snap.current_wait_ms as f64 / 1000.0 }),
        );
        for (partition, progress) in self.checkpoints.snapshot() {
            gauges.insert(
                format!("{}.{partition}", names::COMMITTED_SEQNO),
                json!({ "value": progress.committed.seqno }),
            );
            gauges.insert(
                format!("{}.{partition}", names::OBSERVED_SEQNO),
                json!({ "value": progress.observed_seqno }),
            );
        }

        let mut counters = serde_json::Map::new();
        counters.insert(
            names::BULK_ATTEMPTS.into(),
            json!({ "count": snap.bulk_attempts }),
        );
        counters.insert(
            names::BULK_SUCCESSES.into(),
            json!({ "count": snap.bulk_successes }),
        );
        counters.insert(
            names::BULK_RETRIES.into(),
            json!({ "count": snap.bulk_retries }),
        );
        counters.insert(names::DOC_REJECTS.into(), json!({ "count": snap.doc_rejects }));
        counters.insert(
            names::DOC_VERSION_CONFLICTS.into(),
            json!({ "count": snap.version_conflicts }),
        );

        json!({
            "gauges": gauges,
            "counters": counters,
        })
    }

    /// Emits a one-line log report.
    pub fn log_report(&self) {
        let snap = self.worker.snapshot();
        info!(
            target: "sluice::metrics",
            queue = snap.queue_size,
            bulk_attempts = snap.bulk_attempts,
            bulk_successes = snap.bulk_successes,
            bulk_retries = snap.bulk_retries,
            doc_rejects = snap.doc_rejects,
            version_conflicts = snap.version_conflicts,
            es_wait_ms = snap.current_wait_ms,
            "metrics report"
        );
    }

    /// Starts the background publish/report loop.
    #[must_use]
    pub fn spawn(
        self: &Arc<Self>,
        log_interval: Option<Duration>,
    ) -> (watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let publisher = Arc::clone(self);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PUBLISH_INTERVAL);
            let mut last_log = tokio::time::Instant::now();
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => return,
                    _ = ticker.tick() => {}
                }
                publisher.publish();
                if let Some(interval) = log_interval {
                    if last_log.elapsed() >= interval {
                        publisher.log_report();
                        last_log = tokio::time::Instant::now();
                    }
                }
            }
        });
        (stop_tx, task)
    }
}

impl std::fmt::Debug for MetricsPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsPublisher").finish_non_exhaustive()
    }
}
