//! # Sluice Core
//!
//! Domain model for the sluice change-data-capture replicator: group
//! membership, replication events, checkpoints, and the declarative rules
//! that turn source mutations into index requests.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Per-partition replication progress: types, durable store contract, and
/// the in-memory checkpoint service.
pub mod checkpoint;

/// Error types shared across the replicator.
pub mod error;

/// Replication stream events.
pub mod event;

/// The panic button: first-fatal-error latch for the whole process.
pub mod fatal;

/// Group membership and deterministic partition ownership.
pub mod membership;

/// Metric names and lock-free component metrics.
pub mod metrics;

/// Log redaction of user data.
pub mod redact;

/// Translation of replication events into index requests.
pub mod request;

/// Declarative type rules (which documents go to which index, and how).
pub mod rules;
