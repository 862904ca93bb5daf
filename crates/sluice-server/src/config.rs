//! Connector configuration.
//!
//! The config file is TOML. Everything is validated up front: a
//! configuration error is fatal at startup and can never surface
//! mid-run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use sluice_core::error::ConfigError;
use sluice_core::membership::Membership;
use sluice_core::redact::RedactionLevel;
use sluice_core::rules::{DocStructure, TypeRule};
use sluice_connectors::elastic::worker::WorkerGroupConfig;

/// Top-level connector configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    /// Replication group identity and membership.
    pub group: GroupConfig,
    /// Source database connection.
    #[serde(default)]
    pub couchbase: CouchbaseConfig,
    /// Index connection, bulk tuning, and type rules.
    #[serde(default)]
    pub elasticsearch: ElasticsearchConfig,
    /// Metrics exposition.
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Logging behavior.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Deprecated; use per-section `path_to_ca_certificate` instead.
    #[serde(default)]
    pub truststore: Option<TrustStoreConfig>,
}

/// Replication group identity.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    /// Group name; namespaces checkpoint documents.
    pub name: String,
    /// Static membership, unless overridden from the environment.
    #[serde(default)]
    pub static_membership: MembershipConfig,
    /// Delay between connecting and streaming, so peers with stale
    /// membership can terminate first.
    #[serde(default)]
    pub startup_quiet_period_secs: u64,
}

/// Static membership numbers.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// One-based member number.
    pub member_number: u16,
    /// Total number of members.
    pub cluster_size: u16,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            member_number: 1,
            cluster_size: 1,
        }
    }
}

/// Source database connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CouchbaseConfig {
    /// Seed node addresses.
    pub hosts: Vec<String>,
    /// Bucket to replicate.
    pub bucket: String,
    /// Bucket holding checkpoint documents; defaults to the source bucket.
    pub metadata_bucket: Option<String>,
    /// Collection holding checkpoint documents.
    pub metadata_collection: Option<String>,
    /// User name.
    pub username: Option<String>,
    /// Password; prefer the `CBES_COUCHBASE_PASSWORD` environment
    /// variable.
    pub password: Option<String>,
    /// PEM file with the CA certificate(s) to trust.
    pub path_to_ca_certificate: Option<PathBuf>,
    /// Source client implementation. `memory` is the in-process
    /// development source; wire clients register their own name.
    pub source: String,
    /// Number of partitions the `memory` source simulates.
    pub memory_partitions: u16,
    /// Replication stream tuning.
    pub dcp: DcpConfig,
}

impl Default for CouchbaseConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["127.0.0.1".into()],
            bucket: "default".into(),
            metadata_bucket: None,
            metadata_collection: None,
            username: None,
            password: None,
            path_to_ca_certificate: None,
            source: "memory".into(),
            memory_partitions: 64,
            dcp: DcpConfig::default(),
        }
    }
}

/// Replication stream tuning.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct DcpConfig {
    /// Budget for the initial stream connection; exceeding it is fatal.
    pub connect_timeout_secs: u64,
    /// Budget for reading current seqnos at startup.
    pub current_seqnos_timeout_secs: u64,
}

impl Default for DcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            current_seqnos_timeout_secs: 5,
        }
    }
}

impl DcpConfig {
    /// Connect timeout as a duration.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Current-seqnos timeout as a duration.
    #[must_use]
    pub fn current_seqnos_timeout(&self) -> Duration {
        Duration::from_secs(self.current_seqnos_timeout_secs)
    }
}

/// Index connection and indexing behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ElasticsearchConfig {
    /// Base URL.
    pub url: String,
    /// User name.
    pub username: Option<String>,
    /// Password; prefer the `CBES_ELASTICSEARCH_PASSWORD` environment
    /// variable.
    pub password: Option<String>,
    /// PEM file with the CA certificate(s) to trust.
    pub path_to_ca_certificate: Option<PathBuf>,
    /// Reject log file; entries go to the process log when unset.
    pub reject_log: Option<PathBuf>,
    /// Per-request timeout.
    pub request_timeout_secs: u64,
    /// Lowest supported server version; older is fatal at startup.
    pub min_version: String,
    /// Highest tested server version; newer logs a warning.
    pub max_tested_version: String,
    /// Bulk batching and retry tuning.
    pub bulk: BulkConfig,
    /// Type rules, first match wins.
    #[serde(rename = "type")]
    pub types: Vec<TypeRule>,
    /// Index document layout.
    pub doc_structure: DocStructure,
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:9200".into(),
            username: None,
            password: None,
            path_to_ca_certificate: None,
            reject_log: None,
            request_timeout_secs: 60,
            min_version: "7.14.0".into(),
            max_tested_version: "7.17.5".into(),
            bulk: BulkConfig::default(),
            types: Vec::new(),
            doc_structure: DocStructure::default(),
        }
    }
}

/// Bulk batching and retry tuning.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BulkConfig {
    /// Dispatch a batch at this many documents.
    pub max_docs: usize,
    /// Dispatch a batch at roughly this many bytes.
    pub max_bytes: usize,
    /// Dispatch a pending batch this long after its first document.
    pub flush_deadline_ms: u64,
    /// Pending events across the worker group; the back-pressure bound.
    pub queue_capacity: usize,
    /// Number of worker shards.
    pub worker_threads: usize,
    /// First retry backoff ceiling.
    pub retry_backoff_base_ms: u64,
    /// Largest retry backoff ceiling.
    pub retry_backoff_cap_ms: u64,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            max_docs: 500,
            max_bytes: 10 * 1024 * 1024,
            flush_deadline_ms: 500,
            queue_capacity: 16_384,
            worker_threads: 4,
            retry_backoff_base_ms: 1_000,
            retry_backoff_cap_ms: 60_000,
        }
    }
}

impl BulkConfig {
    /// Converts to the worker group's tunables.
    #[must_use]
    pub fn worker_group_config(&self) -> WorkerGroupConfig {
        WorkerGroupConfig {
            worker_threads: self.worker_threads,
            max_docs: self.max_docs,
            max_bytes: self.max_bytes,
            flush_deadline: Duration::from_millis(self.flush_deadline_ms),
            queue_capacity: self.queue_capacity,
            retry_backoff_base: Duration::from_millis(self.retry_backoff_base_ms),
            retry_backoff_cap: Duration::from_millis(self.retry_backoff_cap_ms),
        }
    }
}

/// Metrics exposition settings.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Port for the metrics HTTP endpoints; negative disables them.
    pub http_port: i32,
    /// Interval for the periodic metrics log report; 0 disables it.
    pub log_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            http_port: 31_415,
            log_interval_secs: 60,
        }
    }
}

impl MetricsConfig {
    /// Log-report interval, `None` when disabled.
    #[must_use]
    pub fn log_interval(&self) -> Option<Duration> {
        (self.log_interval_secs > 0).then(|| Duration::from_secs(self.log_interval_secs))
    }

    /// HTTP port, `None` when the endpoint is disabled.
    #[must_use]
    pub fn http_port(&self) -> Option<u16> {
        u16::try_from(self.http_port).ok()
    }
}

/// Logging behavior.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// How aggressively user data is redacted in logs.
    pub redaction_level: RedactionLevel,
    /// Log each document's journey through the pipeline.
    pub log_document_lifecycle: bool,
}

/// Deprecated truststore settings, accepted only to warn about them.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TrustStoreConfig {
    /// Truststore path (unused).
    pub path: Option<PathBuf>,
    /// Truststore password (unused).
    pub password: Option<String>,
}

impl ConnectorConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` on parse failure, or the specific
    /// validation error.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)
            .map_err(|e| ConfigError::Invalid(format!("cannot parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses, and validates a config file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` when the file cannot be read or
    /// parsed, or the specific validation error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::Invalid(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.group.name.is_empty() {
            return Err(ConfigError::Invalid("group.name must not be empty".into()));
        }
        self.membership()?;
        for rule in &self.elasticsearch.types {
            rule.validate()?;
        }
        if self.elasticsearch.types.is_empty() {
            warn!("no type rules configured; every replication event will be dropped");
        }
        if self.truststore.is_some() {
            warn!(
                "the [truststore] config section is DEPRECATED and will be removed in a future \
                 release; set `path_to_ca_certificate` in the [couchbase] and/or [elasticsearch] \
                 sections instead (PEM format)"
            );
        }
        if self.elasticsearch.bulk.max_docs == 0 || self.elasticsearch.bulk.max_bytes == 0 {
            return Err(ConfigError::Invalid(
                "elasticsearch.bulk.max_docs and max_bytes must be positive".into(),
            ));
        }
        if self.elasticsearch.bulk.worker_threads == 0 {
            return Err(ConfigError::Invalid(
                "elasticsearch.bulk.worker_threads must be positive".into(),
            ));
        }
        if self.metrics.http_port > i32::from(u16::MAX) {
            return Err(ConfigError::Invalid(format!(
                "metrics.http_port {} is out of range",
                self.metrics.http_port
            )));
        }
        Ok(())
    }

    /// Validated membership from the static config.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Membership` when out of range.
    pub fn membership(&self) -> Result<Membership, ConfigError> {
        Membership::of(
            self.group.static_membership.member_number,
            self.group.static_membership.cluster_size,
        )
    }

    /// Replaces the static membership (Kubernetes reconciliation).
    pub fn set_membership(&mut self, member_number: u16, cluster_size: u16) {
        self.group.static_membership = MembershipConfig {
            member_number,
            cluster_size,
        };
    }

    /// Quiet period from the static config.
    #[must_use]
    pub fn startup_quiet_period(&self) -> Duration {
        Duration::from_secs(self.group.startup_quiet_period_secs)
    }

    /// Applies secret overrides from the environment
    /// (`CBES_COUCHBASE_PASSWORD`, `CBES_ELASTICSEARCH_PASSWORD`).
    pub fn apply_env_secrets(&mut self) {
        if let Ok(password) = std::env::var("CBES_COUCHBASE_PASSWORD") {
            self.couchbase.password = Some(password);
        }
        if let Ok(password) = std::env::var("CBES_ELASTICSEARCH_PASSWORD") {
            self.elasticsearch.password = Some(password);
        }
    }
}
