//! Elasticsearch operations contract.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use sluice_core::request::IndexRequest;

use crate::error::ConnectorError;

/// Elasticsearch server version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EsVersion {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Patch version.
    pub patch: u32,
}

impl EsVersion {
    /// Creates a version.
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parses `"major.minor.patch"`, tolerating a pre-release suffix.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let numeric = s.split(['-', '+']).next()?;
        let mut parts = numeric.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().unwrap_or("0").parse().ok()?;
        let patch = parts.next().unwrap_or("0").parse().ok()?;
        Some(Self::new(major, minor, patch))
    }
}

impl fmt::Display for EsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Outcome for one item of a bulk call, index-aligned with the submitted
/// batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkItemOutcome {
    /// Applied: created, updated, or deleted — including deletion of a
    /// document the index never held.
    Success,
    /// The index already holds an equal-or-newer version. Counts as
    /// applied for checkpoint purposes.
    VersionConflict,
    /// Permanent per-item failure. Logged to the reject log and settled
    /// as applied.
    Rejected {
        /// HTTP status of the item.
        status: u16,
        /// Failure description from the index.
        reason: String,
    },
    /// Transient failure; the item joins the next retry attempt.
    Retry {
        /// HTTP status of the item.
        status: u16,
        /// Failure description from the index.
        reason: String,
    },
}

/// A whole-call bulk failure.
#[derive(Debug, Error)]
pub enum BulkError {
    /// The call is worth retrying as a unit (connection error, overload).
    #[error("transient bulk failure: {0}")]
    Transient(String),

    /// The call can never succeed (authentication, malformed response);
    /// latches the connector's fatal slot.
    #[error("fatal bulk failure: {0}")]
    Fatal(String),
}

/// Bulk operations against the index.
#[async_trait]
pub trait ElasticsearchOps: Send + Sync {
    /// Probes the server version.
    async fn version(&self) -> Result<EsVersion, ConnectorError>;

    /// Executes one bulk call. The returned outcomes are index-aligned
    /// with `requests`.
    async fn bulk(&self, requests: &[IndexRequest]) -> Result<Vec<BulkItemOutcome>, BulkError>;
}

/// Waits for the index to come online, then gates on its version.
///
/// Unreachable servers are retried indefinitely at `poll_interval` (the
/// operator sees a warning per attempt). A version below `required` is
/// fatal; a version above `tested_up_to` logs a warning but continues.
///
/// # Errors
///
/// Returns `ConnectorError::Index` when the server version is below the
/// required minimum.
pub async fn wait_for_elasticsearch(
    ops: &dyn ElasticsearchOps,
    required: EsVersion,
    tested_up_to: EsVersion,
    poll_interval: Duration,
) -> Result<EsVersion, ConnectorError> {
    let version = loop {
        match ops.version().await {
            Ok(version) => break version,
            Err(e) => {
                warn!(error = %e, "Elasticsearch not reachable yet; retrying");
                tokio::time::sleep(poll_interval).await;
            }
        }
    };

    if version < required {
        return Err(ConnectorError::Index(format!(
            "Elasticsearch version {version} is not supported; need at least {required}"
        )));
    }
    if version > tested_up_to {
        warn!(
            %version,
            %tested_up_to,
            "Elasticsearch is newer than the most recent tested version; continuing anyway"
        );
    }
    info!(%version, "Elasticsearch version check passed");
    Ok(version)
}
