//! sluice — one-way replicator from a partitioned document-database
//! changefeed into Elasticsearch.
//!
//! Reads the connector config, resolves group membership (optionally from
//! the Kubernetes environment), builds the source and index clients, and
//! hands everything to the supervisor. Exit code 0 means a graceful
//! shutdown; anything else is a fatal error, printed to stderr.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::info;

use sluice_core::fatal::PanicButton;
use sluice_core::membership::MAX_CLUSTER_SIZE;
use sluice_core::metrics::WorkerMetrics;
use sluice_core::redact::set_redaction_level;
use sluice_connectors::checkpoint_store::{KvCollection, MemoryKvCollection};
use sluice_connectors::dcp::{DcpClient, MemoryDcpClient};
use sluice_connectors::elastic::client::{HttpElasticsearchClient, HttpElasticsearchConfig};
use sluice_connectors::elastic::reject_log::{FileRejectSink, LogRejectSink, RejectSink};

use sluice_server::config::ConnectorConfig;
use sluice_server::k8s::{self, FileReplicaSource, StatefulSetInfo};
use sluice_server::supervisor::{self, Clients};

const REPLICA_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Replicates a document-database changefeed into Elasticsearch.
#[derive(Debug, Parser)]
#[command(name = "sluice")]
#[command(about = "Replicates a document database changefeed into Elasticsearch")]
#[command(version)]
struct Args {
    /// Path to the connector config file (TOML).
    #[arg(long, short, env = "SLUICE_CONFIG")]
    config: PathBuf,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| v == "true")
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            // Give stdout a chance to quiet down so the error on stderr
            // isn't interleaved with it.
            tokio::time::sleep(Duration::from_millis(500)).await;
            eprintln!("fatal: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "sluice connector starting");

    let args = Args::parse();
    info!(config = %args.config.display(), "reading connector configuration");
    let mut config = ConnectorConfig::load(&args.config)?;
    config.apply_env_secrets();
    set_redaction_level(config.logging.redaction_level);

    let panic_button = Arc::new(PanicButton::new());

    let watch_replicas = env_flag("CBES_K8S_WATCH_REPLICAS");
    let member_from_hostname = watch_replicas || env_flag("CBES_K8S_STATEFUL_SET");

    if member_from_hostname {
        let pod = StatefulSetInfo::from_hostname()?;
        info!(
            member_number = pod.member_number(),
            "taking group member number from the Kubernetes pod hostname"
        );
        // Membership validation forbids tuples like "4 of 1". While the
        // real group size is still being resolved, temporarily claim the
        // largest sane size; it is dialed down before streaming starts.
        let cluster_size = if watch_replicas {
            MAX_CLUSTER_SIZE
        } else {
            config.group.static_membership.cluster_size
        };
        config.set_membership(pod.member_number(), cluster_size);
    }

    if let Ok(total) = std::env::var("CBES_TOTAL_MEMBERS") {
        let cluster_size = total
            .parse()
            .map_err(|_| anyhow!("CBES_TOTAL_MEMBERS must be an integer, got '{total}'"))?;
        config.set_membership(config.group.static_membership.member_number, cluster_size);
    }

    let mut quiet_period = config.startup_quiet_period();
    let mut watcher = None;
    if watch_replicas {
        let path = std::env::var("CBES_K8S_REPLICAS_FILE").map_err(|_| {
            anyhow!(
                "CBES_K8S_WATCH_REPLICAS=true requires CBES_K8S_REPLICAS_FILE to point at the \
                 projected replica count"
            )
        })?;
        info!(
            "activating Kubernetes integration; the connector takes its group size from the \
             replica count and restarts on any change"
        );
        let (replicas, handle) = k8s::replicas_and_watch(
            Arc::new(FileReplicaSource::new(path)),
            Arc::clone(&panic_button),
            REPLICA_POLL_INTERVAL,
        )
        .await?;
        config.set_membership(config.group.static_membership.member_number, replicas);
        quiet_period = k8s::startup_quiet_period(REPLICA_POLL_INTERVAL);
        watcher = Some(handle);
    }

    // Surface membership problems (including a group size over the
    // supported maximum) before building any clients.
    let membership = config.membership()?;
    info!(%membership, "group membership resolved");

    let clients = build_clients(&config).await?;
    let result = supervisor::run(
        &config,
        clients,
        Arc::clone(&panic_button),
        quiet_period,
        supervisor::shutdown_signal(),
    )
    .await;

    if let Some(watcher) = watcher {
        watcher.stop().await;
    }
    result.map_err(|e| anyhow!(e))
}

async fn build_clients(config: &ConnectorConfig) -> Result<Clients> {
    let ca_certificate_pem = match &config.elasticsearch.path_to_ca_certificate {
        Some(path) => Some(std::fs::read(path).with_context(|| {
            format!("cannot read Elasticsearch CA certificate {}", path.display())
        })?),
        None => None,
    };
    let elasticsearch = HttpElasticsearchClient::new(&HttpElasticsearchConfig {
        url: config.elasticsearch.url.clone(),
        username: config.elasticsearch.username.clone(),
        password: config.elasticsearch.password.clone(),
        ca_certificate_pem,
        request_timeout: Duration::from_secs(config.elasticsearch.request_timeout_secs),
    })?;

    let (dcp, metadata): (Box<dyn DcpClient>, Arc<dyn KvCollection>) =
        match config.couchbase.source.as_str() {
            "memory" => (
                Box::new(MemoryDcpClient::new(config.couchbase.memory_partitions)),
                Arc::new(MemoryKvCollection::new()),
            ),
            other => {
                return Err(anyhow!(
                    "unsupported source client '{other}'; this build ships the 'memory' \
                     development source"
                ));
            }
        };

    let reject_sink: Box<dyn RejectSink> = match &config.elasticsearch.reject_log {
        Some(path) => Box::new(FileRejectSink::open(path).await?),
        None => Box::new(LogRejectSink),
    };

    Ok(Clients {
        dcp,
        elasticsearch: Arc::new(elasticsearch),
        metadata,
        reject_sink,
        worker_metrics: Arc::new(WorkerMetrics::new()),
    })
}
