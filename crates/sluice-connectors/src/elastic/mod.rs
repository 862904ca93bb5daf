//! Elasticsearch sink: the operations contract, the HTTP client, retry
//! backoff, the reject log, and the bulk worker group.

pub mod backoff;
pub mod client;
pub mod ops;
pub mod reject_log;
pub mod worker;

pub use client::{HttpElasticsearchClient, HttpElasticsearchConfig};
pub use ops::{wait_for_elasticsearch, BulkError, BulkItemOutcome, ElasticsearchOps, EsVersion};
pub use reject_log::{FileRejectSink, LogRejectSink, MemoryRejectSink, RejectLog, RejectSink};
pub use worker::{WorkerGroup, WorkerGroupConfig, WorkerHandle, WorkerState};
