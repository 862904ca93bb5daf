//! # Sluice Connectors
//!
//! I/O edges of the replicator: the DCP-style source client and pipeline,
//! the Elasticsearch bulk sink, and durable checkpoint storage in the
//! source database.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Checkpoint documents stored in the source database's metadata
/// collection.
pub mod checkpoint_store;

/// Source-side replication client, in-memory implementation, and the
/// event pipeline.
pub mod dcp;

/// Elasticsearch sink: bulk operations, the HTTP client, the worker
/// group, and the reject log.
pub mod elastic;

/// Connector error types.
pub mod error;

/// Shared test doubles.
pub mod testing;
