//! Source replication client contract.
//!
//! The source database exposes one monotonic event stream per partition.
//! A [`DcpClient`] owns the connection, and pushes events to an
//! [`EventListener`] in per-partition stream order. Listener calls are
//! async and the client must await them: when the downstream queue is
//! full, the listener blocks, the client stops delivering, and no further
//! flow-control credit reaches the source. That makes the worker queue
//! the ultimate gate on memory growth.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use sluice_core::checkpoint::Checkpoint;
use sluice_core::event::ReplicationEvent;

use crate::error::ConnectorError;

/// Resume position for one partition's stream, seeded from a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOffset {
    /// Dataset instance the position belongs to.
    pub vbuuid: String,
    /// Resume after this seqno.
    pub seqno: u64,
    /// First seqno of the enclosing snapshot.
    pub snapshot_start_seqno: u64,
    /// Last seqno of the enclosing snapshot.
    pub snapshot_end_seqno: u64,
}

impl From<&Checkpoint> for StreamOffset {
    fn from(cp: &Checkpoint) -> Self {
        Self {
            vbuuid: cp.vbuuid.clone(),
            seqno: cp.seqno,
            snapshot_start_seqno: cp.snapshot_start_seqno,
            snapshot_end_seqno: cp.snapshot_end_seqno,
        }
    }
}

/// Receives replication events and stream-level failures.
#[async_trait]
pub trait EventListener: Send + Sync {
    /// Delivers one event. Called in per-partition stream order; the
    /// client must not deliver the next event for a partition until this
    /// call returns.
    async fn on_event(&self, event: ReplicationEvent);

    /// Reports an unrecoverable stream failure (rollback storm, dataset
    /// uuid change, stream closed unexpectedly).
    async fn on_failure(&self, error: ConnectorError);
}

/// A client for the source database's partitioned replication streams.
///
/// Lifecycle: `connect` → `num_partitions`/`current_seqnos` →
/// `init_stream` per owned partition → `start_streaming` → `disconnect`.
#[async_trait]
pub trait DcpClient: Send + Sync {
    /// Establishes the connection and discovers the topology.
    async fn connect(&mut self) -> Result<(), ConnectorError>;

    /// Number of partitions in the source dataset. Fixed for the lifetime
    /// of the dataset; a change is fatal. Requires `connect`.
    fn num_partitions(&self) -> Result<u16, ConnectorError>;

    /// Identifier of the dataset instance, or an empty string when the
    /// client cannot supply one (which disables uuid-mismatch detection).
    fn bucket_uuid(&self) -> String;

    /// Highest current seqno per partition.
    async fn current_seqnos(
        &self,
        partitions: &[u16],
        timeout: Duration,
    ) -> Result<HashMap<u16, u64>, ConnectorError>;

    /// Seeds the resume position for one partition. Partitions without a
    /// seeded offset stream from the beginning. Must precede
    /// `start_streaming`.
    fn init_stream(&mut self, partition: u16, offset: StreamOffset);

    /// Opens streams for the given partitions and begins delivering
    /// events to `listener`. Streams run until `disconnect`.
    async fn start_streaming(
        &mut self,
        partitions: Vec<u16>,
        listener: Arc<dyn EventListener>,
    ) -> Result<(), ConnectorError>;

    /// Stops all streams and releases the connection.
    async fn disconnect(&mut self) -> Result<(), ConnectorError>;
}
