//! End-to-end replication scenarios over the full supervisor, driven by
//! the in-memory source, a scripted Elasticsearch double, and an
//! in-memory metadata collection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;

use sluice_core::event::ReplicationEvent;
use sluice_core::fatal::{FatalError, PanicButton};
use sluice_core::metrics::WorkerMetrics;
use sluice_connectors::checkpoint_store::{KvCollection, MemoryKvCollection};
use sluice_connectors::dcp::{DcpClient, MemoryDcpClient};
use sluice_connectors::elastic::ops::{BulkError, BulkItemOutcome};
use sluice_connectors::elastic::reject_log::MemoryRejectSink;
use sluice_connectors::testing::{MockElasticsearchOps, ScriptedBulk};
use sluice_server::config::ConnectorConfig;
use sluice_server::k8s::{self, FileReplicaSource, ReplicaSource};
use sluice_server::supervisor::{self, Clients};

fn scenario_config() -> ConnectorConfig {
    ConnectorConfig::parse(
        r#"
        [group]
        name = "it"

        [couchbase]
        source = "memory"
        memory_partitions = 4

        [elasticsearch.bulk]
        worker_threads = 1
        flush_deadline_ms = 20
        retry_backoff_base_ms = 1
        retry_backoff_cap_ms = 5

        [[elasticsearch.type]]
        key_pattern = "*"
        index = "docs"

        [elasticsearch.doc_structure]
        document_content_at_top_level = true

        [metrics]
        http_port = -1
        log_interval_secs = 0
        "#,
    )
    .expect("scenario config must parse")
}

fn mutation(partition: u16, seqno: u64, key: &str, body: &str) -> ReplicationEvent {
    ReplicationEvent::Mutation {
        key: key.into(),
        cas: 1000 + seqno,
        rev_seqno: seqno,
        partition,
        seqno,
        body: Bytes::from(body.to_string()),
        xattrs: None,
    }
}

struct Rig {
    kv: Arc<MemoryKvCollection>,
    mock: Arc<MockElasticsearchOps>,
    metrics: Arc<WorkerMetrics>,
    panic_button: Arc<PanicButton>,
    shutdown: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<Result<(), FatalError>>,
}

impl Rig {
    fn launch(
        config: ConnectorConfig,
        source: MemoryDcpClient,
        mock: Arc<MockElasticsearchOps>,
        kv: Arc<MemoryKvCollection>,
    ) -> Self {
        let metrics = Arc::new(WorkerMetrics::new());
        let panic_button = Arc::new(PanicButton::new());
        let clients = Clients {
            dcp: Box::new(source) as Box<dyn DcpClient>,
            elasticsearch: Arc::clone(&mock) as Arc<dyn sluice_connectors::elastic::ops::ElasticsearchOps>,
            metadata: Arc::clone(&kv) as Arc<dyn KvCollection>,
            reject_sink: Box::new(MemoryRejectSink::new()),
            worker_metrics: Arc::clone(&metrics),
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = {
            let panic_button = Arc::clone(&panic_button);
            tokio::spawn(async move {
                supervisor::run(
                    &config,
                    clients,
                    panic_button,
                    Duration::ZERO,
                    async move {
                        let _ = shutdown_rx.await;
                    },
                )
                .await
            })
        };

        Self {
            kv,
            mock,
            metrics,
            panic_button,
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    async fn graceful(mut self) -> Result<(), FatalError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        tokio::time::timeout(Duration::from_secs(20), self.task)
            .await
            .expect("supervisor must stop")
            .expect("supervisor task must not panic")
    }

    async fn await_fatal(self) -> FatalError {
        tokio::time::timeout(Duration::from_secs(20), self.task)
            .await
            .expect("supervisor must stop")
            .expect("supervisor task must not panic")
            .expect_err("expected a fatal outcome")
    }
}

fn committed_seqno(kv: &MemoryKvCollection, partition: u16) -> Option<u64> {
    let raw = kv.get_raw(&format!("it::checkpoint::{partition}"))?;
    let doc: serde_json::Value = serde_json::from_slice(&raw).ok()?;
    doc["seqno"].as_u64()
}

fn indexed_docs(mock: &MockElasticsearchOps) -> usize {
    mock.calls().iter().map(Vec::len).sum()
}

async fn eventually(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time: {what}");
}

// Two revisions of one document arrive in order: the index must see them
// in two separate bulk calls and end at the newer value.
#[tokio::test]
async fn scenario_same_document_revisions_stay_ordered() {
    let source = MemoryDcpClient::new(4);
    source.push(ReplicationEvent::SnapshotMarker {
        partition: 0,
        start: 1,
        end: 2,
    });
    source.push(mutation(0, 1, "a", r#"{"x":1}"#));
    source.push(mutation(0, 2, "a", r#"{"x":2}"#));

    let rig = Rig::launch(
        scenario_config(),
        source,
        MockElasticsearchOps::shared(),
        Arc::new(MemoryKvCollection::new()),
    );

    {
        let mock = Arc::clone(&rig.mock);
        eventually(|| indexed_docs(&mock) == 2, "both revisions indexed").await;
    }
    let calls = rig.mock.calls();
    assert_eq!(calls.len(), 2, "same doc id must never share a bulk call");
    let last = &calls[1][0];
    match last {
        sluice_core::request::IndexRequest::Upsert { version, body, .. } => {
            assert_eq!(*version, 2);
            let doc: serde_json::Value = serde_json::from_slice(body).unwrap();
            assert_eq!(doc["x"], 2);
        }
        sluice_core::request::IndexRequest::Delete { .. } => panic!("expected upsert"),
    }

    let kv = Arc::clone(&rig.kv);
    rig.graceful().await.expect("graceful shutdown");
    assert_eq!(committed_seqno(&kv, 0), Some(2));
}

// Independent partitions settle independently and coalesce into at most
// two bulk calls.
#[tokio::test]
async fn scenario_parallel_partitions_commit_independently() {
    let source = MemoryDcpClient::new(4);
    source.push(mutation(1, 10, "b", r#"{"p":1}"#));
    source.push(mutation(2, 10, "c", r#"{"p":2}"#));

    let rig = Rig::launch(
        scenario_config(),
        source,
        MockElasticsearchOps::shared(),
        Arc::new(MemoryKvCollection::new()),
    );

    {
        let mock = Arc::clone(&rig.mock);
        eventually(|| indexed_docs(&mock) == 2, "both documents indexed").await;
    }
    assert!(rig.mock.call_count() <= 2);

    let kv = Arc::clone(&rig.kv);
    rig.graceful().await.expect("graceful shutdown");
    assert_eq!(committed_seqno(&kv, 1), Some(10));
    assert_eq!(committed_seqno(&kv, 2), Some(10));
}

// After a crash the stream resumes from the persisted checkpoint and only
// replays the uncommitted tail; versioned writes make the replay
// idempotent.
#[tokio::test]
async fn scenario_restart_resumes_from_checkpoint() {
    let kv = Arc::new(MemoryKvCollection::new());
    kv.put_raw(
        "it::checkpoint::3",
        serde_json::json!({
            "vbuuid": "memory",
            "seqno": 5,
            "snapshotStartSeqno": 5,
            "snapshotEndSeqno": 5,
        })
        .to_string()
        .into_bytes(),
    );

    let source = MemoryDcpClient::new(4);
    for seqno in 1..=9 {
        source.push(mutation(3, seqno, &format!("doc-{seqno}"), r#"{"y":1}"#));
    }

    let rig = Rig::launch(
        scenario_config(),
        source,
        MockElasticsearchOps::shared(),
        Arc::clone(&kv),
    );

    {
        let mock = Arc::clone(&rig.mock);
        eventually(|| indexed_docs(&mock) == 4, "only seqnos 6..=9 replay").await;
    }
    let replayed: Vec<String> = rig
        .mock
        .calls()
        .iter()
        .flatten()
        .map(|request| request.doc_id().to_string())
        .collect();
    assert!(replayed.iter().any(|id| id == "doc-6"));
    assert!(replayed.iter().any(|id| id == "doc-9"));
    assert!(replayed.iter().all(|id| id != "doc-5"));

    rig.graceful().await.expect("graceful shutdown");
    assert_eq!(committed_seqno(&kv, 3), Some(9));
}

// A network outage during bulk dispatch: the batch retries until the
// index recovers, and the checkpoint only advances after the success.
#[tokio::test]
async fn scenario_bulk_outage_retries_until_recovery() {
    let mock = MockElasticsearchOps::shared();
    for _ in 0..3 {
        mock.script(ScriptedBulk::Fail(BulkError::Transient(
            "connection reset".into(),
        )));
    }

    let source = MemoryDcpClient::new(4);
    source.push(mutation(0, 4, "a", r#"{"x":4}"#));

    let rig = Rig::launch(
        scenario_config(),
        source,
        Arc::clone(&mock),
        Arc::new(MemoryKvCollection::new()),
    );

    {
        let mock = Arc::clone(&rig.mock);
        eventually(|| mock.call_count() == 4, "three failures then success").await;
    }
    assert!(rig.metrics.snapshot().bulk_retries >= 3);
    assert!(rig.metrics.snapshot().bulk_attempts >= 4);

    let kv = Arc::clone(&rig.kv);
    rig.graceful().await.expect("graceful shutdown");
    assert_eq!(committed_seqno(&kv, 0), Some(4));
}

// The external replica count changes mid-run: the panic path latches the
// fatal error and deliberately skips the final checkpoint save.
#[tokio::test]
async fn scenario_replica_change_is_fatal_without_checkpoint_save() {
    let dir = tempfile::tempdir().unwrap();
    let replicas_file = dir.path().join("replicas");
    tokio::fs::write(&replicas_file, "3").await.unwrap();

    let source = MemoryDcpClient::new(4);
    source.push(mutation(0, 1, "a", r#"{"x":1}"#));

    let rig = Rig::launch(
        scenario_config(),
        source,
        MockElasticsearchOps::shared(),
        Arc::new(MemoryKvCollection::new()),
    );

    // Attach the watcher to the running connector's panic button, exactly
    // as main does when replica watching is enabled.
    let watcher_source = Arc::new(FileReplicaSource::new(&replicas_file));
    assert_eq!(watcher_source.replicas().await.unwrap(), 3);
    let (initial, watcher) = k8s::replicas_and_watch(
        watcher_source as Arc<dyn ReplicaSource>,
        Arc::clone(&rig.panic_button),
        Duration::from_millis(10),
    )
    .await
    .unwrap();
    assert_eq!(initial, 3);

    // Let the first event settle, then rescale.
    {
        let mock = Arc::clone(&rig.mock);
        eventually(|| indexed_docs(&mock) == 1, "first event indexed").await;
    }
    tokio::fs::write(&replicas_file, "4").await.unwrap();

    let kv = Arc::clone(&rig.kv);
    let fatal = rig.await_fatal().await;
    assert!(fatal.message().contains("3 to 4"));
    // No final save on the panic path: the committed seqno never reached
    // the metadata collection.
    assert_eq!(committed_seqno(&kv, 0), None);
    watcher.stop().await;
}

// A version conflict means the index already holds a newer revision; it
// settles as applied with no retry.
#[tokio::test]
async fn scenario_version_conflict_counts_as_applied() {
    let mock = MockElasticsearchOps::shared();
    mock.script(ScriptedBulk::PerDoc(HashMap::from([(
        "a".to_string(),
        BulkItemOutcome::VersionConflict,
    )])));

    let source = MemoryDcpClient::new(4);
    source.push(mutation(0, 7, "a", r#"{"x":7}"#));

    let rig = Rig::launch(
        scenario_config(),
        source,
        Arc::clone(&mock),
        Arc::new(MemoryKvCollection::new()),
    );

    {
        let metrics = Arc::clone(&rig.metrics);
        eventually(
            || metrics.snapshot().version_conflicts == 1,
            "conflict recorded",
        )
        .await;
    }
    assert_eq!(rig.mock.call_count(), 1, "conflicts are not retried");

    let kv = Arc::clone(&rig.kv);
    rig.graceful().await.expect("graceful shutdown");
    assert_eq!(committed_seqno(&kv, 0), Some(7));
}

// A worker that owns no partitions must refuse to run.
#[tokio::test]
async fn scenario_more_workers_than_partitions_is_fatal() {
    let mut config = scenario_config();
    config.set_membership(8, 8);
    // 4 partitions, member 8 of 8: partitions {p : p % 8 == 7} is empty.
    let rig = Rig::launch(
        config,
        MemoryDcpClient::new(4),
        MockElasticsearchOps::shared(),
        Arc::new(MemoryKvCollection::new()),
    );
    let fatal = rig.await_fatal().await;
    assert!(fatal.message().contains("more workers than"));
}
