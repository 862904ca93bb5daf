//! Bounded, back-pressured bulk indexing workers.
//!
//! Index requests are hashed by document id onto a fixed set of worker
//! shards. Each shard owns a bounded queue and dispatches one batch at a
//! time: batch *k+1* is never sent before batch *k* has been fully
//! acknowledged, and a batch never holds two requests for the same
//! document id. Together those two rules guarantee that writes to one
//! document reach the index in submission order.
//!
//! The bounded queues are the back-pressure gate for the whole connector:
//! when they fill, event submission blocks, which stalls the replication
//! client's delivery and stops flow-control credit from reaching the
//! source.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use sluice_core::checkpoint::service::CheckpointService;
use sluice_core::event::EventPointer;
use sluice_core::fatal::PanicButton;
use sluice_core::metrics::WorkerMetrics;
use sluice_core::request::{IndexRequest, RejectEntry};

use crate::error::ConnectorError;

use super::backoff::Backoff;
use super::ops::{BulkError, BulkItemOutcome, ElasticsearchOps};
use super::reject_log::RejectLog;

/// Tunables for the worker group.
#[derive(Debug, Clone)]
pub struct WorkerGroupConfig {
    /// Number of worker shards.
    pub worker_threads: usize,
    /// Dispatch a batch once it holds this many documents.
    pub max_docs: usize,
    /// Dispatch a batch once it holds roughly this many body bytes.
    pub max_bytes: usize,
    /// Dispatch a pending batch this long after its first document, even
    /// if the size limits have not been reached (coalesces bursts).
    pub flush_deadline: Duration,
    /// Total pending events across the group; the back-pressure bound.
    pub queue_capacity: usize,
    /// First retry backoff ceiling.
    pub retry_backoff_base: Duration,
    /// Largest retry backoff ceiling.
    pub retry_backoff_cap: Duration,
}

impl Default for WorkerGroupConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            max_docs: 500,
            max_bytes: 10 * 1024 * 1024,
            flush_deadline: Duration::from_millis(500),
            queue_capacity: 16_384,
            retry_backoff_base: Duration::from_secs(1),
            retry_backoff_cap: Duration::from_secs(60),
        }
    }
}

/// Lifecycle of the worker group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Constructed; submissions rejected until `start`.
    Idle,
    /// Accepting and dispatching work.
    Running,
    /// Rejecting new submissions while pending batches flush.
    Draining,
    /// Stopped. Entered directly from `Running` on a fatal error.
    Closed,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Draining,
            3 => Self::Closed,
            _ => Self::Idle,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Running => "Running",
            Self::Draining => "Draining",
            Self::Closed => "Closed",
        }
    }
}

enum WorkItem {
    Doc(IndexRequest),
    /// An event that is already terminal (factory reject). Occupies its
    /// place in checkpoint accounting without being sent anywhere.
    Settled {
        pointer: EventPointer,
        entry: RejectEntry,
    },
    /// Flush the pending batch and acknowledge.
    Drain(oneshot::Sender<()>),
}

/// FNV-1a shard selection; the same doc id always lands on the same shard.
fn shard_for(doc_id: &str, shards: usize) -> usize {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in doc_id.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    #[allow(clippy::cast_possible_truncation)]
    {
        (hash % shards as u64) as usize
    }
}

/// Cheap submission handle, held by the pipeline listener.
#[derive(Clone)]
pub struct WorkerHandle {
    shards: Arc<Vec<mpsc::Sender<WorkItem>>>,
    state: Arc<AtomicU8>,
    metrics: Arc<WorkerMetrics>,
}

impl WorkerHandle {
    fn require_running(&self) -> Result<(), ConnectorError> {
        let state = WorkerState::from_u8(self.state.load(Ordering::Acquire));
        if state == WorkerState::Running {
            Ok(())
        } else {
            Err(ConnectorError::InvalidState {
                expected: WorkerState::Running.as_str().into(),
                actual: state.as_str().into(),
            })
        }
    }

    async fn enqueue(&self, doc_id: &str, item: WorkItem) -> Result<(), ConnectorError> {
        self.require_running()?;
        let shard = shard_for(doc_id, self.shards.len());
        if self.shards[shard].send(item).await.is_err() {
            return Err(ConnectorError::InvalidState {
                expected: WorkerState::Running.as_str().into(),
                actual: WorkerState::Closed.as_str().into(),
            });
        }
        // Counted only once the item is actually queued, so a submission
        // abandoned while blocked on capacity leaves no residue.
        self.metrics.enqueued(1);
        Ok(())
    }

    /// Submits one index request, waiting for queue capacity. The wait is
    /// the connector's back-pressure mechanism.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::InvalidState` unless the group is running.
    pub async fn submit(&self, request: IndexRequest) -> Result<(), ConnectorError> {
        let shard_key = request.doc_id().to_string();
        self.enqueue(&shard_key, WorkItem::Doc(request)).await
    }

    /// Settles a permanently rejected event: it is logged and counted, and
    /// its stream position advances checkpoints exactly like an applied
    /// document.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::InvalidState` unless the group is running.
    pub async fn settle_rejected(
        &self,
        pointer: EventPointer,
        entry: RejectEntry,
    ) -> Result<(), ConnectorError> {
        let shard_key = entry.doc_id.clone();
        self.enqueue(&shard_key, WorkItem::Settled { pointer, entry })
            .await
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Events submitted but not yet settled.
    #[must_use]
    pub fn queue_size(&self) -> u64 {
        self.metrics.queue_size.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("state", &self.state())
            .field("shards", &self.shards.len())
            .field("queue_size", &self.queue_size())
            .finish()
    }
}

/// The worker group: owns the shard queues and worker tasks.
pub struct WorkerGroup {
    handle: WorkerHandle,
    workers: Vec<tokio::task::JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerGroup {
    /// Spawns the worker tasks. The group starts `Idle`; call
    /// [`WorkerGroup::start`] once the rest of the pipeline is wired.
    #[must_use]
    pub fn spawn(
        ops: Arc<dyn ElasticsearchOps>,
        checkpoints: Arc<CheckpointService>,
        reject_log: RejectLog,
        panic_button: Arc<PanicButton>,
        metrics: Arc<WorkerMetrics>,
        config: &WorkerGroupConfig,
    ) -> Self {
        let worker_threads = config.worker_threads.max(1);
        let per_shard = (config.queue_capacity / worker_threads).max(1);
        let state = Arc::new(AtomicU8::new(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut senders = Vec::with_capacity(worker_threads);
        let mut workers = Vec::with_capacity(worker_threads);
        for idx in 0..worker_threads {
            let (tx, rx) = mpsc::channel(per_shard);
            senders.push(tx);
            workers.push(tokio::spawn(run_worker(WorkerCtx {
                idx,
                rx,
                shutdown_rx: shutdown_rx.clone(),
                ops: Arc::clone(&ops),
                checkpoints: Arc::clone(&checkpoints),
                reject_log: reject_log.clone(),
                panic_button: Arc::clone(&panic_button),
                metrics: Arc::clone(&metrics),
                state: Arc::clone(&state),
                max_docs: config.max_docs.max(1),
                max_bytes: config.max_bytes.max(1),
                flush_deadline: config.flush_deadline,
                backoff: Backoff::new(config.retry_backoff_base, config.retry_backoff_cap),
            })));
        }

        Self {
            handle: WorkerHandle {
                shards: Arc::new(senders),
                state,
                metrics,
            },
            workers,
            shutdown_tx,
        }
    }

    /// A submission handle.
    #[must_use]
    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        self.handle.state()
    }

    /// Transitions `Idle` → `Running`.
    pub fn start(&self) {
        if self
            .handle
            .state
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!(shards = self.handle.shards.len(), "worker group running");
        }
    }

    /// Drains pending work, then stops.
    ///
    /// New submissions are rejected immediately; pending batches get up to
    /// `drain_timeout` to flush before the group is forced closed. Call
    /// only after the event source has stopped feeding the pipeline, or
    /// buffered events will be dropped.
    pub async fn close(mut self, drain_timeout: Duration) {
        let state = self.handle.state();
        if state != WorkerState::Closed {
            self.handle.state.store(2, Ordering::Release);
            info!("draining worker group");
            let mut acks = Vec::new();
            for shard in self.handle.shards.iter() {
                let (ack_tx, ack_rx) = oneshot::channel();
                if shard.send(WorkItem::Drain(ack_tx)).await.is_ok() {
                    acks.push(ack_rx);
                }
            }
            let all_acked = async {
                for ack in acks {
                    let _ = ack.await;
                }
            };
            if tokio::time::timeout(drain_timeout, all_acked).await.is_err() {
                warn!("worker group drain timed out; forcing close");
            }
        }
        self.force_close().await;
    }

    /// Stops immediately without flushing pending work (fatal path).
    pub async fn shutdown(mut self) {
        self.force_close().await;
    }

    async fn force_close(&mut self) {
        self.handle.state.store(3, Ordering::Release);
        let _ = self.shutdown_tx.send(true);
        for mut worker in self.workers.drain(..) {
            if tokio::time::timeout(Duration::from_secs(5), &mut worker)
                .await
                .is_err()
            {
                worker.abort();
            }
        }
        debug!("worker group closed");
    }
}

impl std::fmt::Debug for WorkerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerGroup")
            .field("state", &self.state())
            .field("workers", &self.workers.len())
            .finish()
    }
}

struct WorkerCtx {
    idx: usize,
    rx: mpsc::Receiver<WorkItem>,
    shutdown_rx: watch::Receiver<bool>,
    ops: Arc<dyn ElasticsearchOps>,
    checkpoints: Arc<CheckpointService>,
    reject_log: RejectLog,
    panic_button: Arc<PanicButton>,
    metrics: Arc<WorkerMetrics>,
    state: Arc<AtomicU8>,
    max_docs: usize,
    max_bytes: usize,
    flush_deadline: Duration,
    backoff: Backoff,
}

fn add_to_batch(
    item: WorkItem,
    batch: &mut Vec<WorkItem>,
    bytes: &mut usize,
    doc_ids: &mut HashSet<String>,
) {
    if let WorkItem::Doc(request) = &item {
        *bytes += request.estimated_bytes();
        doc_ids.insert(request.doc_id().to_string());
    }
    batch.push(item);
}

async fn run_worker(mut ctx: WorkerCtx) {
    debug!(worker = ctx.idx, "worker started");
    let mut carryover: Option<IndexRequest> = None;

    'outer: loop {
        let mut batch: Vec<WorkItem> = Vec::new();
        let mut batch_bytes = 0usize;
        let mut doc_ids: HashSet<String> = HashSet::new();
        let mut drain_ack: Option<oneshot::Sender<()>> = None;
        let mut channel_closed = false;

        if let Some(request) = carryover.take() {
            add_to_batch(
                WorkItem::Doc(request),
                &mut batch,
                &mut batch_bytes,
                &mut doc_ids,
            );
        } else {
            let first = tokio::select! {
                biased;
                _ = ctx.shutdown_rx.changed() => break 'outer,
                item = ctx.rx.recv() => item,
            };
            match first {
                None => break 'outer,
                Some(WorkItem::Drain(ack)) => {
                    // Nothing pending on this shard.
                    let _ = ack.send(());
                    continue 'outer;
                }
                Some(item) => add_to_batch(item, &mut batch, &mut batch_bytes, &mut doc_ids),
            }
        }

        let deadline = Instant::now() + ctx.flush_deadline;
        while batch.len() < ctx.max_docs
            && batch_bytes < ctx.max_bytes
            && drain_ack.is_none()
            && !channel_closed
            && carryover.is_none()
        {
            tokio::select! {
                biased;
                _ = ctx.shutdown_rx.changed() => break 'outer,
                () = tokio::time::sleep_until(deadline) => break,
                item = ctx.rx.recv() => match item {
                    None => channel_closed = true,
                    Some(WorkItem::Drain(ack)) => drain_ack = Some(ack),
                    Some(WorkItem::Doc(request)) if doc_ids.contains(request.doc_id()) => {
                        // A second write to the same document must wait for
                        // this batch's acknowledgement.
                        carryover = Some(request);
                    }
                    Some(item) => add_to_batch(item, &mut batch, &mut batch_bytes, &mut doc_ids),
                },
            }
        }

        if !dispatch_batch(&mut ctx, batch).await {
            break 'outer;
        }
        if let Some(ack) = drain_ack {
            let _ = ack.send(());
        }
        if channel_closed {
            break 'outer;
        }
    }
    debug!(worker = ctx.idx, "worker stopped");
}

/// Dispatches one batch until every item settles. Returns `false` when the
/// worker must stop (shutdown or fatal error).
async fn dispatch_batch(ctx: &mut WorkerCtx, batch: Vec<WorkItem>) -> bool {
    if batch.is_empty() {
        return true;
    }
    let total = batch.len() as u64;
    let mut pointers: Vec<EventPointer> = Vec::with_capacity(batch.len());
    let mut current: Vec<IndexRequest> = Vec::new();
    for item in batch {
        match item {
            WorkItem::Doc(request) => {
                pointers.push(request.pointer());
                current.push(request);
            }
            WorkItem::Settled { pointer, entry } => {
                pointers.push(pointer);
                ctx.reject_log.log(entry);
                ctx.metrics.doc_rejects.fetch_add(1, Ordering::Relaxed);
            }
            WorkItem::Drain(ack) => {
                let _ = ack.send(());
            }
        }
    }

    if !current.is_empty() {
        ctx.metrics.dispatch_started();
        let mut attempt: u32 = 0;
        loop {
            ctx.metrics.record_attempt();
            let result = tokio::select! {
                biased;
                _ = ctx.shutdown_rx.changed() => {
                    ctx.metrics.dispatch_finished();
                    return false;
                }
                result = ctx.ops.bulk(&current) => result,
            };

            match result {
                Ok(outcomes) => {
                    let requests = std::mem::take(&mut current);
                    let mut retries = Vec::new();
                    for (request, outcome) in requests.into_iter().zip(outcomes) {
                        match outcome {
                            BulkItemOutcome::Success => {}
                            BulkItemOutcome::VersionConflict => {
                                // The index already holds a newer revision;
                                // applied as far as checkpointing cares.
                                ctx.metrics.version_conflicts.fetch_add(1, Ordering::Relaxed);
                            }
                            BulkItemOutcome::Rejected { status, reason } => {
                                ctx.reject_log.log(RejectEntry::new(
                                    request.doc_id(),
                                    Some(request.index().to_string()),
                                    format!("HTTP {status}: {reason}"),
                                ));
                                ctx.metrics.doc_rejects.fetch_add(1, Ordering::Relaxed);
                            }
                            BulkItemOutcome::Retry { status, reason } => {
                                debug!(
                                    doc_id = request.doc_id(),
                                    status, reason, "item failed transiently"
                                );
                                retries.push(request);
                            }
                        }
                    }
                    if retries.is_empty() {
                        ctx.metrics.record_success();
                        break;
                    }
                    warn!(
                        worker = ctx.idx,
                        retrying = retries.len(),
                        attempt,
                        "bulk items failed transiently; backing off"
                    );
                    current = retries;
                    ctx.metrics.record_retry();
                }
                Err(BulkError::Transient(reason)) => {
                    warn!(
                        worker = ctx.idx,
                        %reason,
                        attempt,
                        "bulk call failed; backing off"
                    );
                    ctx.metrics.record_retry();
                }
                Err(BulkError::Fatal(reason)) => {
                    ctx.state.store(3, Ordering::Release);
                    ctx.panic_button
                        .press(format!("bulk indexing failed fatally: {reason}"));
                    ctx.metrics.dispatch_finished();
                    return false;
                }
            }

            let delay = ctx.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                biased;
                _ = ctx.shutdown_rx.changed() => {
                    ctx.metrics.dispatch_finished();
                    return false;
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
        ctx.metrics.dispatch_finished();
    }

    let mut max_seqnos: HashMap<u16, u64> = HashMap::new();
    for pointer in pointers {
        let seqno = max_seqnos.entry(pointer.partition).or_insert(pointer.seqno);
        *seqno = (*seqno).max(pointer.seqno);
    }
    for (partition, seqno) in max_seqnos {
        ctx.checkpoints.commit(partition, seqno);
    }
    ctx.metrics.dequeued(total);
    true
}
