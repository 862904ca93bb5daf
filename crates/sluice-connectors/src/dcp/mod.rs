//! Source-side replication: the client contract, an in-memory
//! implementation, and the pipeline that turns raw stream events into
//! index requests.

pub mod client;
pub mod memory;
pub mod pipeline;

pub use client::{DcpClient, EventListener, StreamOffset};
pub use memory::MemoryDcpClient;
pub use pipeline::{DcpPipeline, PipelineListener};
