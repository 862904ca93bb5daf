//! In-memory replication source.
//!
//! [`MemoryDcpClient`] implements the full [`DcpClient`] contract against
//! events held in memory: per-partition ordered delivery, resume-point
//! filtering, snapshot markers, dataset uuid reporting, and failure
//! injection. It backs the integration tests and the `source = "memory"`
//! development mode; a wire-protocol client plugs into the same trait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use sluice_core::event::ReplicationEvent;

use crate::error::ConnectorError;

use super::client::{DcpClient, EventListener, StreamOffset};

#[derive(Debug, Default)]
struct Shared {
    /// Events staged before streaming starts, in stream order.
    scripted: HashMap<u16, Vec<ReplicationEvent>>,
    /// Live channels to the per-partition delivery tasks.
    live: HashMap<u16, mpsc::UnboundedSender<ReplicationEvent>>,
    /// Highest seqno staged or pushed per partition.
    high_seqnos: HashMap<u16, u64>,
}

/// An in-memory [`DcpClient`].
pub struct MemoryDcpClient {
    num_partitions: u16,
    bucket_uuid: String,
    connected: bool,
    offsets: HashMap<u16, StreamOffset>,
    shared: Arc<Mutex<Shared>>,
    listener: Arc<Mutex<Option<Arc<dyn EventListener>>>>,
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryDcpClient {
    /// Creates a disconnected client over `num_partitions` partitions.
    #[must_use]
    pub fn new(num_partitions: u16) -> Self {
        Self {
            num_partitions,
            bucket_uuid: "memory".into(),
            connected: false,
            offsets: HashMap::new(),
            shared: Arc::new(Mutex::new(Shared::default())),
            listener: Arc::new(Mutex::new(None)),
            shutdown: None,
            tasks: Vec::new(),
        }
    }

    /// Overrides the reported dataset instance uuid.
    #[must_use]
    pub fn with_bucket_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.bucket_uuid = uuid.into();
        self
    }

    /// Stages or delivers one event.
    ///
    /// Before streaming starts the event is staged (and subject to
    /// resume-point filtering); once the partition is streaming it is
    /// delivered live, in push order.
    pub fn push(&self, event: ReplicationEvent) {
        let partition = event.partition();
        let mut shared = lock(&self.shared);
        if let Some(pointer) = event.pointer() {
            let high = shared.high_seqnos.entry(partition).or_default();
            *high = (*high).max(pointer.seqno);
        }
        let event = match shared.live.get(&partition) {
            Some(tx) => match tx.send(event) {
                Ok(()) => return,
                Err(rejected) => rejected.0,
            },
            None => event,
        };
        shared.scripted.entry(partition).or_default().push(event);
    }

    /// Reports a stream failure to the installed listener.
    ///
    /// Calls made before `start_streaming` are ignored.
    pub fn inject_failure(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if let Some(listener) = lock(&self.listener).clone() {
            tokio::spawn(async move {
                listener
                    .on_failure(ConnectorError::Protocol(reason))
                    .await;
            });
        }
    }

    fn require_connected(&self) -> Result<(), ConnectorError> {
        if self.connected {
            Ok(())
        } else {
            Err(ConnectorError::InvalidState {
                expected: "connected".into(),
                actual: "disconnected".into(),
            })
        }
    }

    /// Whether a staged document event is past the partition's resume
    /// point. Stale snapshot markers are dropped as well, so a resumed
    /// stream never records a marker it has already committed past.
    fn past_offset(event: &ReplicationEvent, offset: &StreamOffset) -> bool {
        match event {
            ReplicationEvent::SnapshotMarker { end, .. } => *end > offset.seqno,
            _ => event
                .pointer()
                .is_some_and(|pointer| pointer.seqno > offset.seqno),
        }
    }
}

#[async_trait]
impl DcpClient for MemoryDcpClient {
    async fn connect(&mut self) -> Result<(), ConnectorError> {
        self.connected = true;
        Ok(())
    }

    fn num_partitions(&self) -> Result<u16, ConnectorError> {
        self.require_connected()?;
        Ok(self.num_partitions)
    }

    fn bucket_uuid(&self) -> String {
        self.bucket_uuid.clone()
    }

    async fn current_seqnos(
        &self,
        partitions: &[u16],
        _timeout: Duration,
    ) -> Result<HashMap<u16, u64>, ConnectorError> {
        self.require_connected()?;
        let shared = lock(&self.shared);
        Ok(partitions
            .iter()
            .map(|p| (*p, shared.high_seqnos.get(p).copied().unwrap_or(0)))
            .collect())
    }

    fn init_stream(&mut self, partition: u16, offset: StreamOffset) {
        self.offsets.insert(partition, offset);
    }

    async fn start_streaming(
        &mut self,
        partitions: Vec<u16>,
        listener: Arc<dyn EventListener>,
    ) -> Result<(), ConnectorError> {
        self.require_connected()?;
        *lock(&self.listener) = Some(Arc::clone(&listener));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        for partition in partitions {
            let offset = self.offsets.get(&partition).cloned().unwrap_or_default();
            let (live_tx, mut live_rx) = mpsc::unbounded_channel();
            let initial: Vec<ReplicationEvent> = {
                let mut shared = lock(&self.shared);
                let staged = shared.scripted.remove(&partition).unwrap_or_default();
                shared.live.insert(partition, live_tx);
                staged
                    .into_iter()
                    .filter(|ev| Self::past_offset(ev, &offset))
                    .collect()
            };

            let listener = Arc::clone(&listener);
            let mut shutdown_rx = shutdown_rx.clone();
            self.tasks.push(tokio::spawn(async move {
                debug!(partition, resume_after = offset.seqno, "stream opened");
                for event in initial {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => return,
                        () = listener.on_event(event) => {}
                    }
                }
                loop {
                    let event = tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => return,
                        event = live_rx.recv() => match event {
                            Some(event) => event,
                            None => return,
                        },
                    };
                    // Delivery itself stays interruptible: a listener
                    // parked on back-pressure must not wedge disconnect.
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => return,
                        () = listener.on_event(event) => {}
                    }
                }
            }));
        }
        self.shutdown = Some(shutdown_tx);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ConnectorError> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        for task in self.tasks.drain(..) {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
        lock(&self.shared).live.clear();
        *lock(&self.listener) = None;
        self.connected = false;
        Ok(())
    }
}

impl std::fmt::Debug for MemoryDcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDcpClient")
            .field("num_partitions", &self.num_partitions)
            .field("bucket_uuid", &self.bucket_uuid)
            .field("connected", &self.connected)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::sync::Semaphore;

    use super::*;

    struct RecordingListener {
        events: Mutex<Vec<ReplicationEvent>>,
        failures: Mutex<Vec<String>>,
        gate: Option<Arc<Semaphore>>,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
                failures: Mutex::new(Vec::new()),
                gate: None,
            })
        }

        fn gated(gate: Arc<Semaphore>) -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
                failures: Mutex::new(Vec::new()),
                gate: Some(gate),
            })
        }

        fn seqnos(&self, partition: u16) -> Vec<u64> {
            lock(&self.events)
                .iter()
                .filter(|ev| ev.partition() == partition)
                .filter_map(ReplicationEvent::pointer)
                .map(|p| p.seqno)
                .collect()
        }
    }

    #[async_trait]
    impl EventListener for RecordingListener {
        async fn on_event(&self, event: ReplicationEvent) {
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            lock(&self.events).push(event);
        }

        async fn on_failure(&self, error: ConnectorError) {
            lock(&self.failures).push(error.to_string());
        }
    }

    fn mutation(partition: u16, seqno: u64) -> ReplicationEvent {
        ReplicationEvent::Mutation {
            key: format!("k{seqno}"),
            cas: seqno,
            rev_seqno: seqno,
            partition,
            seqno,
            body: Bytes::from_static(b"{}"),
            xattrs: None,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_delivers_in_partition_order() {
        let mut client = MemoryDcpClient::new(2);
        for seqno in 1..=5 {
            client.push(mutation(0, seqno));
            client.push(mutation(1, seqno));
        }
        client.connect().await.unwrap();
        let listener = RecordingListener::new();
        client
            .start_streaming(vec![0, 1], listener.clone())
            .await
            .unwrap();
        settle().await;
        assert_eq!(listener.seqnos(0), vec![1, 2, 3, 4, 5]);
        assert_eq!(listener.seqnos(1), vec![1, 2, 3, 4, 5]);
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_resume_point_filters_staged_events() {
        let mut client = MemoryDcpClient::new(1);
        client.push(ReplicationEvent::SnapshotMarker {
            partition: 0,
            start: 1,
            end: 4,
        });
        for seqno in 1..=9 {
            client.push(mutation(0, seqno));
        }
        client.connect().await.unwrap();
        client.init_stream(
            0,
            StreamOffset {
                vbuuid: "memory".into(),
                seqno: 5,
                snapshot_start_seqno: 5,
                snapshot_end_seqno: 5,
            },
        );
        let listener = RecordingListener::new();
        client
            .start_streaming(vec![0], listener.clone())
            .await
            .unwrap();
        settle().await;
        assert_eq!(listener.seqnos(0), vec![6, 7, 8, 9]);
        // The stale snapshot marker (end 4 <= resume point 5) was dropped.
        assert!(lock(&listener.events)
            .iter()
            .all(|ev| ev.pointer().is_some()));
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_live_push_after_start() {
        let mut client = MemoryDcpClient::new(1);
        client.connect().await.unwrap();
        let listener = RecordingListener::new();
        client
            .start_streaming(vec![0], listener.clone())
            .await
            .unwrap();
        client.push(mutation(0, 1));
        client.push(mutation(0, 2));
        settle().await;
        assert_eq!(listener.seqnos(0), vec![1, 2]);
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_listener_stalls_delivery() {
        let mut client = MemoryDcpClient::new(1);
        for seqno in 1..=3 {
            client.push(mutation(0, seqno));
        }
        client.connect().await.unwrap();
        let gate = Arc::new(Semaphore::new(1));
        let listener = RecordingListener::gated(Arc::clone(&gate));
        client
            .start_streaming(vec![0], listener.clone())
            .await
            .unwrap();
        settle().await;
        // Only the first event got through the gate.
        assert_eq!(listener.seqnos(0), vec![1]);
        gate.add_permits(2);
        settle().await;
        assert_eq!(listener.seqnos(0), vec![1, 2, 3]);
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_injection_reaches_listener() {
        let mut client = MemoryDcpClient::new(1);
        client.connect().await.unwrap();
        let listener = RecordingListener::new();
        client
            .start_streaming(vec![0], listener.clone())
            .await
            .unwrap();
        client.inject_failure("rollback storm");
        settle().await;
        assert_eq!(lock(&listener.failures).len(), 1);
        assert!(lock(&listener.failures)[0].contains("rollback storm"));
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_current_seqnos_tracks_high_watermark() {
        let mut client = MemoryDcpClient::new(2);
        client.push(mutation(0, 7));
        client.push(mutation(1, 3));
        client.connect().await.unwrap();
        let seqnos = client
            .current_seqnos(&[0, 1], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(seqnos[&0], 7);
        assert_eq!(seqnos[&1], 3);
    }

    #[tokio::test]
    async fn test_requires_connect() {
        let client = MemoryDcpClient::new(1);
        assert!(client.num_partitions().is_err());
    }
}
