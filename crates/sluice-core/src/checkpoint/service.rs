//! In-memory authoritative checkpoint state with periodic durable flushes.
//!
//! The service is the only writer of committed seqnos. Bulk workers report
//! completions through [`CheckpointService::commit`], the pipeline reports
//! stream positions through [`CheckpointService::record_observed`] and
//! [`CheckpointService::record_snapshot`], and a scheduler calls
//! [`CheckpointService::save`] on a fixed cadence plus once on graceful
//! shutdown. Fatal paths skip the final save, so a crash never checkpoints
//! past an unhandled failure.
//!
//! The internal mutex guards only the in-memory maps and is never held
//! across checkpoint I/O; saves operate on a cloned snapshot and are
//! serialized by a separate async lock.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::CheckpointError;

use super::{Checkpoint, CheckpointStore};

#[derive(Debug, Clone, Default)]
struct PartitionState {
    committed: Checkpoint,
    observed: u64,
    /// Latest snapshot marker seen on the stream, in stream order.
    snapshot: Option<(u64, u64)>,
}

#[derive(Debug, Default)]
struct Inner {
    partitions: HashMap<u16, PartitionState>,
    dirty: HashSet<u16>,
}

/// Immutable per-partition progress view for diagnostics and gauges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionProgress {
    /// Last checkpoint durably applied to the index.
    pub committed: Checkpoint,
    /// Last seqno seen on the stream.
    pub observed_seqno: u64,
}

/// Authoritative in-memory view of per-partition replication progress.
pub struct CheckpointService {
    bucket_uuid: String,
    store: Arc<dyn CheckpointStore>,
    inner: Mutex<Inner>,
    save_lock: tokio::sync::Mutex<()>,
}

impl CheckpointService {
    /// Creates a service over the given durable store.
    ///
    /// `bucket_uuid` identifies the live source dataset instance; an empty
    /// string disables uuid-mismatch detection.
    #[must_use]
    pub fn new(bucket_uuid: impl Into<String>, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            bucket_uuid: bucket_uuid.into(),
            store,
            inner: Mutex::new(Inner::default()),
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The dataset instance id this service stamps into checkpoints.
    #[must_use]
    pub fn bucket_uuid(&self) -> &str {
        &self.bucket_uuid
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Loads persisted checkpoints for the given partitions.
    ///
    /// Stored checkpoints whose dataset uuid disagrees with the live uuid
    /// are discarded (those partitions stream from the beginning). For any
    /// partition without a usable record, a zero checkpoint is materialized
    /// with the partition's current live seqno as the snapshot anchor;
    /// `current_seqnos` is invoked at most once, and only when needed.
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be read or cleared, or when
    /// the seqno provider fails.
    pub async fn init<F, Fut>(
        &self,
        partitions: &[u16],
        current_seqnos: F,
    ) -> Result<(), CheckpointError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<HashMap<u16, u64>, CheckpointError>>,
    {
        let mut stored = self.store.load(partitions).await?;

        let mismatched: Vec<u16> = stored
            .iter()
            .filter(|(_, cp)| {
                !cp.vbuuid.is_empty()
                    && !self.bucket_uuid.is_empty()
                    && cp.vbuuid != self.bucket_uuid
            })
            .map(|(p, _)| *p)
            .collect();
        if !mismatched.is_empty() {
            warn!(
                partitions = ?mismatched,
                live_uuid = %self.bucket_uuid,
                "stored checkpoints belong to a different dataset instance; discarding"
            );
            self.store.clear(&mismatched).await?;
            for p in &mismatched {
                stored.remove(p);
            }
        }

        let absent: Vec<u16> = partitions
            .iter()
            .copied()
            .filter(|p| !stored.contains_key(p))
            .collect();
        let live = if absent.is_empty() {
            HashMap::new()
        } else {
            current_seqnos().await?
        };

        let mut inner = self.lock();
        for (p, cp) in stored {
            let observed = cp.seqno;
            inner.partitions.insert(
                p,
                PartitionState {
                    committed: cp,
                    observed,
                    snapshot: None,
                },
            );
        }
        for p in absent {
            let anchor = live.get(&p).copied().unwrap_or(0);
            inner.partitions.insert(
                p,
                PartitionState {
                    committed: Checkpoint::new(self.bucket_uuid.clone(), 0, 0, anchor),
                    observed: 0,
                    snapshot: None,
                },
            );
            // Persist the starting state on the next flush.
            inner.dirty.insert(p);
        }
        debug!(
            partitions = partitions.len(),
            "checkpoint state initialized"
        );
        Ok(())
    }

    /// Replaces a partition's committed checkpoint.
    ///
    /// A non-monotonic update (`new.seqno < current.seqno`) is silently
    /// ignored: batches may complete out of order within a partition, and
    /// an older completion must never roll the checkpoint back.
    pub fn set(&self, partition: u16, checkpoint: Checkpoint) {
        let mut inner = self.lock();
        let state = inner.partitions.entry(partition).or_default();
        if checkpoint.seqno < state.committed.seqno {
            debug!(
                partition,
                stale = checkpoint.seqno,
                current = state.committed.seqno,
                "ignoring non-monotonic checkpoint update"
            );
            return;
        }
        state.observed = state.observed.max(checkpoint.seqno);
        state.committed = checkpoint;
        inner.dirty.insert(partition);
    }

    /// Records that everything up to `seqno` has been durably applied,
    /// building the checkpoint from the latest snapshot marker.
    ///
    /// If the recorded marker does not enclose `seqno` (the stream has
    /// moved on while the batch was in flight), the degenerate snapshot
    /// `(seqno, seqno)` is used instead; resuming from it is always safe.
    pub fn commit(&self, partition: u16, seqno: u64) {
        let (start, end) = {
            let inner = self.lock();
            match inner.partitions.get(&partition).and_then(|s| s.snapshot) {
                Some((start, end)) if start <= seqno && seqno <= end => (start, end),
                _ => (seqno, seqno),
            }
        };
        self.set(
            partition,
            Checkpoint::new(self.bucket_uuid.clone(), seqno, start, end),
        );
    }

    /// Records the last seqno seen on a partition's stream.
    pub fn record_observed(&self, partition: u16, seqno: u64) {
        let mut inner = self.lock();
        let state = inner.partitions.entry(partition).or_default();
        state.observed = state.observed.max(seqno);
    }

    /// Records a snapshot marker for a partition, in stream order.
    pub fn record_snapshot(&self, partition: u16, start: u64, end: u64) {
        let mut inner = self.lock();
        let state = inner.partitions.entry(partition).or_default();
        state.snapshot = Some((start, end));
    }

    /// Flushes dirty checkpoints to the durable store.
    ///
    /// Concurrent callers are serialized; partitions that fail to persist
    /// stay dirty and are retried on the next flush (at-least-once delivery
    /// of the latest state).
    ///
    /// # Errors
    ///
    /// Returns an error when the store rejects the whole batch; everything
    /// in the batch is re-marked dirty first.
    pub async fn save(&self) -> Result<(), CheckpointError> {
        let _guard = self.save_lock.lock().await;

        let to_save: HashMap<u16, Checkpoint> = {
            let mut inner = self.lock();
            let dirty: Vec<u16> = inner.dirty.drain().collect();
            dirty
                .into_iter()
                .filter_map(|p| {
                    inner
                        .partitions
                        .get(&p)
                        .map(|state| (p, state.committed.clone()))
                })
                .collect()
        };
        if to_save.is_empty() {
            return Ok(());
        }

        match self.store.save(&to_save).await {
            Ok(report) => {
                if report.is_complete() {
                    debug!(saved = to_save.len(), "checkpoints persisted");
                } else {
                    warn!(
                        failed = ?report.failed,
                        "some checkpoints failed to persist; they will be retried"
                    );
                    let mut inner = self.lock();
                    for p in report.failed {
                        if to_save.contains_key(&p) {
                            inner.dirty.insert(p);
                        }
                    }
                }
                Ok(())
            }
            Err(e) => {
                let mut inner = self.lock();
                for p in to_save.keys() {
                    inner.dirty.insert(*p);
                }
                Err(e)
            }
        }
    }

    /// Immutable view of every tracked partition, ordered by partition id.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<u16, PartitionProgress> {
        let inner = self.lock();
        inner
            .partitions
            .iter()
            .map(|(p, state)| {
                (
                    *p,
                    PartitionProgress {
                        committed: state.committed.clone(),
                        observed_seqno: state.observed,
                    },
                )
            })
            .collect()
    }
}

impl std::fmt::Debug for CheckpointService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("CheckpointService")
            .field("bucket_uuid", &self.bucket_uuid)
            .field("partitions", &inner.partitions.len())
            .field("dirty", &inner.dirty.len())
            .finish()
    }
}
