//! Metrics HTTP endpoints.
//!
//! Two read-only endpoints on the configured port:
//! `/metrics/prometheus` (text exposition) and
//! `/metrics/dropwizard?pretty` (JSON). The server is started only after
//! streaming begins, so its liveness doubles as a startup-complete probe.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::extract::{RawQuery, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::sync::watch;
use tracing::info;

use crate::reporter::MetricsPublisher;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the process-wide Prometheus recorder (idempotent) and returns
/// its render handle.
///
/// # Panics
///
/// Panics when the recorder cannot be installed; metrics are part of the
/// operational contract and the connector must not run blind.
pub fn init_recorder() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .unwrap_or_else(|e| panic!("failed to install prometheus recorder: {e}"))
        })
        .clone()
}

#[derive(Clone)]
struct AppState {
    prometheus: PrometheusHandle,
    publisher: Arc<MetricsPublisher>,
}

async fn prometheus_text(State(state): State<AppState>) -> impl IntoResponse {
    // Refresh gauges so scrapes see current values even between the
    // publisher's ticks.
    state.publisher.publish();
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus.render(),
    )
}

async fn dropwizard(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> impl IntoResponse {
    let doc = state.publisher.dropwizard_json();
    let pretty = query.is_some_and(|q| q.split('&').any(|part| part == "pretty"));
    let body = if pretty {
        serde_json::to_string_pretty(&doc).unwrap_or_default()
    } else {
        doc.to_string()
    };
    ([(CONTENT_TYPE, "application/json")], body)
}

/// Builds the metrics router.
#[must_use]
pub fn router(prometheus: PrometheusHandle, publisher: Arc<MetricsPublisher>) -> Router {
    Router::new()
        .route("/metrics/prometheus", get(prometheus_text))
        .route("/metrics/dropwizard", get(dropwizard))
        .with_state(AppState {
            prometheus,
            publisher,
        })
}

/// A running metrics server.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    stop: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl MetricsServer {
    /// Binds the given port (0 picks an ephemeral one) and serves the
    /// metrics router until stopped.
    ///
    /// # Errors
    ///
    /// Returns the bind error.
    pub async fn start(
        port: u16,
        publisher: Arc<MetricsPublisher>,
    ) -> Result<Self, std::io::Error> {
        let prometheus = init_recorder();
        let app = router(prometheus, publisher);
        let listener =
            tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
        let addr = listener.local_addr()?;

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = stop_rx.changed().await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::warn!(error = %e, "metrics server stopped with error");
            }
        });

        info!(%addr, "metrics HTTP server started");
        Ok(Self {
            addr,
            stop: stop_tx,
            task,
        })
    }

    /// The bound address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops the server.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
    }
}
