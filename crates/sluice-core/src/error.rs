//! Error types shared across the replicator core.

use thiserror::Error;

/// Errors raised while validating connector configuration.
///
/// Configuration errors are always fatal at startup and never occur during
/// a run: everything here is checked before streaming begins.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The group membership tuple is outside the supported range.
    #[error("invalid group membership: {0}")]
    Membership(String),

    /// A type rule is malformed.
    #[error("invalid type rule: {0}")]
    TypeRule(String),

    /// Some other configuration value failed validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised by checkpoint storage.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The backing store could not be reached at all.
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),

    /// A read or write against the backing store failed.
    #[error("checkpoint store error: {0}")]
    Store(String),
}
