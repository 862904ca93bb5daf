//! The replication pipeline: raw stream events in, index requests out.
//!
//! [`DcpPipeline`] owns the replication client and enforces the
//! connect/seed/stream ordering. [`PipelineListener`] is the event-side
//! glue: it transforms each event through the request factory and submits
//! the result to the worker group, awaiting queue capacity. Because the
//! listener is awaited by the client per partition, a full queue stalls
//! the stream instead of buffering without bound.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use sluice_core::checkpoint::service::CheckpointService;
use sluice_core::event::ReplicationEvent;
use sluice_core::fatal::PanicButton;
use sluice_core::redact::redact_user;
use sluice_core::request::{FactoryOutcome, RequestFactory};

use crate::elastic::worker::WorkerHandle;
use crate::error::ConnectorError;

use super::client::{DcpClient, EventListener, StreamOffset};

/// Owns the replication client and its lifecycle.
pub struct DcpPipeline {
    client: Box<dyn DcpClient>,
    panic_button: Arc<PanicButton>,
    connect_timeout: Duration,
}

impl DcpPipeline {
    /// Creates a pipeline over the given client.
    #[must_use]
    pub fn new(
        client: Box<dyn DcpClient>,
        panic_button: Arc<PanicButton>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            client,
            panic_button,
            connect_timeout,
        }
    }

    /// Connects within the configured timeout and returns the partition
    /// count. Failure to connect in time presses the panic button.
    ///
    /// # Errors
    ///
    /// Returns the connection error, or `ConnectorError::Timeout`.
    pub async fn connect(&mut self) -> Result<u16, ConnectorError> {
        match tokio::time::timeout(self.connect_timeout, self.client.connect()).await {
            Ok(Ok(())) => {
                let partitions = self.client.num_partitions()?;
                info!(partitions, "replication stream connected");
                Ok(partitions)
            }
            Ok(Err(e)) => {
                self.panic_button
                    .press(format!("failed to establish replication connection: {e}"));
                Err(e)
            }
            Err(_) => {
                self.panic_button.press(format!(
                    "failed to establish replication connection within {:?}",
                    self.connect_timeout
                ));
                Err(ConnectorError::Timeout(
                    self.connect_timeout,
                    "replication connect".into(),
                ))
            }
        }
    }

    /// Dataset instance uuid reported by the client.
    #[must_use]
    pub fn bucket_uuid(&self) -> String {
        self.client.bucket_uuid()
    }

    /// Highest current seqno per partition.
    ///
    /// # Errors
    ///
    /// Propagates the client's failure.
    pub async fn current_seqnos(
        &self,
        partitions: &[u16],
        timeout: Duration,
    ) -> Result<HashMap<u16, u64>, ConnectorError> {
        self.client.current_seqnos(partitions, timeout).await
    }

    /// Seeds each partition's stream from the checkpoint service.
    /// Partitions the service does not know stream from the beginning.
    pub fn init_session_state(&mut self, checkpoints: &CheckpointService, partitions: &[u16]) {
        let progress = checkpoints.snapshot();
        for partition in partitions {
            let offset = progress
                .get(partition)
                .map(|p| StreamOffset::from(&p.committed))
                .unwrap_or_default();
            debug!(
                partition,
                resume_after = offset.seqno,
                "seeding stream state"
            );
            self.client.init_stream(*partition, offset);
        }
    }

    /// Opens the streams and begins delivering events.
    ///
    /// # Errors
    ///
    /// Propagates the client's failure; the caller treats it as fatal.
    pub async fn start_streaming(
        &mut self,
        partitions: Vec<u16>,
        listener: Arc<dyn EventListener>,
    ) -> Result<(), ConnectorError> {
        info!(partitions = partitions.len(), "opening replication streams");
        self.client.start_streaming(partitions, listener).await
    }

    /// Stops the streams and releases the connection.
    ///
    /// # Errors
    ///
    /// Propagates the client's failure.
    pub async fn disconnect(&mut self) -> Result<(), ConnectorError> {
        info!("disconnecting replication client");
        self.client.disconnect().await
    }
}

impl std::fmt::Debug for DcpPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DcpPipeline")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

/// Transforms replication events and feeds the worker group.
pub struct PipelineListener {
    factory: RequestFactory,
    workers: WorkerHandle,
    checkpoints: Arc<CheckpointService>,
    panic_button: Arc<PanicButton>,
    log_document_lifecycle: bool,
}

impl PipelineListener {
    /// Creates the listener.
    #[must_use]
    pub fn new(
        factory: RequestFactory,
        workers: WorkerHandle,
        checkpoints: Arc<CheckpointService>,
        panic_button: Arc<PanicButton>,
        log_document_lifecycle: bool,
    ) -> Self {
        Self {
            factory,
            workers,
            checkpoints,
            panic_button,
            log_document_lifecycle,
        }
    }

    fn lifecycle(&self, key: &str, what: &str) {
        if self.log_document_lifecycle {
            info!(key = %redact_user(key), what, "document lifecycle");
        } else {
            debug!(key = %redact_user(key), what, "document lifecycle");
        }
    }
}

#[async_trait]
impl EventListener for PipelineListener {
    async fn on_event(&self, event: ReplicationEvent) {
        match &event {
            ReplicationEvent::SnapshotMarker {
                partition,
                start,
                end,
            } => {
                self.checkpoints.record_snapshot(*partition, *start, *end);
                return;
            }
            ReplicationEvent::Mutation {
                partition, seqno, ..
            }
            | ReplicationEvent::Deletion {
                partition, seqno, ..
            } => {
                self.checkpoints.record_observed(*partition, *seqno);
            }
        }

        let key = event.key().unwrap_or_default().to_string();
        match self.factory.make(&event) {
            FactoryOutcome::Request(request) => {
                self.lifecycle(&key, "submitted");
                if let Err(e) = self.workers.submit(request).await {
                    // Normal during shutdown: the source drains faster than
                    // it disconnects.
                    debug!(key = %redact_user(&key), error = %e, "dropping event");
                }
            }
            FactoryOutcome::Skip => {
                self.lifecycle(&key, "skipped by type rules");
            }
            FactoryOutcome::Reject { pointer, entry } => {
                self.lifecycle(&key, "rejected");
                if let Err(e) = self.workers.settle_rejected(pointer, entry).await {
                    debug!(key = %redact_user(&key), error = %e, "dropping rejected event");
                }
            }
        }
    }

    async fn on_failure(&self, error: ConnectorError) {
        warn!(error = %error, "replication stream failure");
        self.panic_button
            .press(format!("replication stream failed: {error}"));
    }
}

impl std::fmt::Debug for PipelineListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineListener")
            .field("log_document_lifecycle", &self.log_document_lifecycle)
            .finish_non_exhaustive()
    }
}
