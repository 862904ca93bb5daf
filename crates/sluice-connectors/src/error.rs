//! Connector error types.

use std::time::Duration;

use thiserror::Error;

use sluice_core::error::CheckpointError;

/// Errors from source and sink connectors.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Failed to establish a connection.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// An operation did not complete within its deadline.
    #[error("timed out after {0:?}: {1}")]
    Timeout(Duration, String),

    /// Operation invoked in the wrong lifecycle state.
    #[error("invalid state: expected {expected}, was {actual}")]
    InvalidState {
        /// State the operation requires.
        expected: String,
        /// State the connector was actually in.
        actual: String,
    },

    /// The replication protocol was violated or a stream failed
    /// unexpectedly.
    #[error("replication protocol failure: {0}")]
    Protocol(String),

    /// The index rejected the connector outright (bad credentials,
    /// unsupported version, malformed response).
    #[error("index error: {0}")]
    Index(String),

    /// Checkpoint storage failure.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// Configuration problem detected at runtime.
    #[error("configuration error: {0}")]
    Configuration(String),
}
