//! Lifecycle composition: startup, steady state, shutdown.
//!
//! The supervisor wires membership, checkpoints, the request factory, the
//! worker group, and the replication pipeline together, then blocks on
//! whichever comes first: a termination signal (graceful shutdown with a
//! final checkpoint save) or the panic button (teardown that deliberately
//! skips the save, so a fault can never be checkpointed past). Teardown
//! runs in reverse construction order, and the worker group closes only
//! after the source stops feeding it events.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use sluice_core::checkpoint::service::CheckpointService;
use sluice_core::checkpoint::CheckpointStore;
use sluice_core::error::CheckpointError;
use sluice_core::fatal::{FatalError, PanicButton};
use sluice_core::metrics::WorkerMetrics;
use sluice_core::request::RequestFactory;
use sluice_connectors::checkpoint_store::{DocumentCheckpointStore, KvCollection};
use sluice_connectors::dcp::{DcpClient, DcpPipeline, PipelineListener};
use sluice_connectors::elastic::ops::{wait_for_elasticsearch, ElasticsearchOps, EsVersion};
use sluice_connectors::elastic::reject_log::{RejectLog, RejectSink};
use sluice_connectors::elastic::worker::WorkerGroup;

use crate::config::ConnectorConfig;
use crate::http::MetricsServer;
use crate::reporter::MetricsPublisher;

const CHECKPOINT_SAVE_INTERVAL: Duration = Duration::from_secs(10);
const ES_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// The I/O edges the supervisor composes. Constructed by `main` (or a
/// test harness) so the pipeline itself stays client-agnostic.
pub struct Clients {
    /// Source replication client.
    pub dcp: Box<dyn DcpClient>,
    /// Index operations.
    pub elasticsearch: Arc<dyn ElasticsearchOps>,
    /// Metadata collection holding checkpoint documents.
    pub metadata: Arc<dyn KvCollection>,
    /// Destination for reject-log entries.
    pub reject_sink: Box<dyn RejectSink>,
    /// Worker group metrics, shared with the metrics surface.
    pub worker_metrics: Arc<WorkerMetrics>,
}

/// Runs the connector until `shutdown` resolves (graceful) or the panic
/// button fires (fatal).
///
/// # Errors
///
/// Returns the fatal error on any non-graceful termination; the caller
/// maps it to a non-zero exit code.
#[allow(clippy::too_many_lines)]
pub async fn run<S>(
    config: &ConnectorConfig,
    clients: Clients,
    panic_button: Arc<PanicButton>,
    quiet_period: Duration,
    shutdown: S,
) -> Result<(), FatalError>
where
    S: Future<Output = ()> + Send,
{
    let membership = config
        .membership()
        .map_err(|e| FatalError::new(e.to_string()))?;
    info!(group = %config.group.name, %membership, "starting connector");

    // Index first: wait for it and gate on its version, so a misconfigured
    // index surfaces before we touch the source.
    let required = parse_version(&config.elasticsearch.min_version, "min_version")?;
    let tested_up_to =
        parse_version(&config.elasticsearch.max_tested_version, "max_tested_version")?;
    let version = wait_for_elasticsearch(
        clients.elasticsearch.as_ref(),
        required,
        tested_up_to,
        ES_POLL_INTERVAL,
    )
    .await
    .map_err(|e| FatalError::new(e.to_string()))?;
    info!(%version, "Elasticsearch ready");

    // Source connection and partition ownership.
    let mut pipeline = DcpPipeline::new(
        clients.dcp,
        Arc::clone(&panic_button),
        config.couchbase.dcp.connect_timeout(),
    );
    let num_partitions = match pipeline.connect().await {
        Ok(n) => n,
        Err(e) => {
            return Err(panic_button
                .fatal_error()
                .unwrap_or_else(|| FatalError::new(e.to_string())));
        }
    };
    let partitions = membership.partitions(num_partitions);
    if partitions.is_empty() {
        // Streaming an empty partition set would open streams for every
        // partition, so this must stop here.
        return Err(FatalError::new(
            "there are more workers than source partitions; this worker has no work to do",
        ));
    }
    info!(
        num_partitions,
        owned = partitions.len(),
        "partition ownership computed"
    );

    let bucket_uuid = pipeline.bucket_uuid();
    if bucket_uuid.is_empty() {
        warn!("source client reports no dataset uuid; checkpoint mismatch detection is disabled");
    }

    // Checkpoint state.
    let store = Arc::new(DocumentCheckpointStore::new(
        Arc::clone(&clients.metadata),
        config.group.name.clone(),
    ));
    let checkpoints = Arc::new(CheckpointService::new(
        bucket_uuid,
        store as Arc<dyn CheckpointStore>,
    ));
    {
        let pipeline_ref = &pipeline;
        let owned = partitions.clone();
        let seqnos_timeout = config.couchbase.dcp.current_seqnos_timeout();
        checkpoints
            .init(&partitions, move || async move {
                pipeline_ref
                    .current_seqnos(&owned, seqnos_timeout)
                    .await
                    .map_err(|e| CheckpointError::Unavailable(e.to_string()))
            })
            .await
            .map_err(|e| FatalError::new(format!("checkpoint init failed: {e}")))?;
    }

    // Transformation and the bulk workers.
    let factory = RequestFactory::new(
        config.elasticsearch.types.clone(),
        config.elasticsearch.doc_structure.clone(),
    );
    let (reject_log, reject_task) = RejectLog::spawn(clients.reject_sink);
    let group = WorkerGroup::spawn(
        Arc::clone(&clients.elasticsearch),
        Arc::clone(&checkpoints),
        reject_log,
        Arc::clone(&panic_button),
        Arc::clone(&clients.worker_metrics),
        &config.elasticsearch.bulk.worker_group_config(),
    );
    pipeline.init_session_state(&checkpoints, &partitions);
    group.start();

    // Quiet period after connecting, so configuration problems surface
    // without making the operator sit through the wait first.
    if !quiet_period.is_zero() {
        info!(
            period = %humantime::format_duration(quiet_period),
            "entering startup quiet period so peers can terminate after an unsafe rescale"
        );
        tokio::time::sleep(quiet_period).await;
        info!("startup quiet period complete");
    }

    // Periodic checkpoint flush.
    let (checkpoint_stop, mut checkpoint_stop_rx) = watch::channel(false);
    let checkpoint_task = {
        let checkpoints = Arc::clone(&checkpoints);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CHECKPOINT_SAVE_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = checkpoint_stop_rx.changed() => return,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = checkpoints.save().await {
                    warn!(error = %e, "periodic checkpoint save failed; will retry");
                }
            }
        })
    };

    // Open the streams.
    let listener = Arc::new(PipelineListener::new(
        factory,
        group.handle(),
        Arc::clone(&checkpoints),
        Arc::clone(&panic_button),
        config.logging.log_document_lifecycle,
    ));
    if let Err(e) = pipeline.start_streaming(partitions.clone(), listener).await {
        panic_button.press(format!("failed to open replication streams: {e}"));
    }

    // The metrics surface comes up last, so its liveness doubles as a
    // startup-complete probe.
    let publisher = Arc::new(MetricsPublisher::new(
        Arc::clone(&clients.worker_metrics),
        Arc::clone(&checkpoints),
    ));
    let (publisher_stop, publisher_task) = publisher.spawn(config.metrics.log_interval());
    let http_server = match config.metrics.http_port() {
        Some(port) => match MetricsServer::start(port, Arc::clone(&publisher)).await {
            Ok(server) => {
                info!(
                    "Prometheus metrics available at http://{}/metrics/prometheus",
                    server.addr()
                );
                info!(
                    "Dropwizard metrics available at http://{}/metrics/dropwizard?pretty",
                    server.addr()
                );
                Some(server)
            }
            Err(e) => {
                panic_button.press(format!("cannot start metrics HTTP server: {e}"));
                None
            }
        },
        None => {
            info!("metrics HTTP server is disabled; set metrics.http_port to enable it");
            None
        }
    };

    info!("connector startup complete");

    let fatal = tokio::select! {
        () = shutdown => None,
        fatal = panic_button.wait() => Some(fatal),
    };
    if fatal.is_none() {
        info!("graceful shutdown requested; saving checkpoints and cleaning up");
    }

    // Teardown, reverse construction order.
    let _ = checkpoint_stop.send(true);
    let _ = tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT, checkpoint_task).await;
    let _ = publisher_stop.send(true);
    let _ = tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT, publisher_task).await;
    if let Some(server) = http_server {
        server.stop().await;
    }
    if let Err(e) = pipeline.disconnect().await {
        warn!(error = %e, "source disconnect failed");
    }
    // Workers close after the source stops feeding them, or buffered
    // events would leak.
    match &fatal {
        None => group.close(DRAIN_TIMEOUT).await,
        Some(_) => group.shutdown().await,
    }
    drop(pipeline);
    let _ = tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT, reject_task).await;

    match fatal {
        None => {
            if let Err(e) = checkpoints.save().await {
                warn!(error = %e, "final checkpoint save failed");
            }
            info!("connector stopped cleanly");
            Ok(())
        }
        Some(fatal) => {
            error!(error = %fatal, "terminating due to fatal error; skipping final checkpoint save");
            Err(fatal)
        }
    }
}

fn parse_version(text: &str, field: &str) -> Result<EsVersion, FatalError> {
    EsVersion::parse(text)
        .ok_or_else(|| FatalError::new(format!("elasticsearch.{field} '{text}' is not a version")))
}

/// Resolves when the process receives a termination signal.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
