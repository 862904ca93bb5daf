//! The reject log: an append-only, machine-readable record of documents
//! the index permanently refused.
//!
//! Writes happen in a background task fed by a bounded channel, so the
//! bulk workers never block on reject-log I/O. If the channel fills, the
//! overflow entries are dropped with a warning; the reject log is a
//! diagnostic aid, not a durability mechanism.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::warn;

use sluice_core::request::RejectEntry;

use crate::error::ConnectorError;

const CHANNEL_CAPACITY: usize = 4096;

/// Destination for reject-log entries.
#[async_trait]
pub trait RejectSink: Send {
    /// Appends one entry.
    async fn write(&mut self, entry: RejectEntry) -> Result<(), ConnectorError>;

    /// Flushes buffered entries.
    async fn flush(&mut self) -> Result<(), ConnectorError>;
}

/// Appends entries to a file, one JSON object per line.
pub struct FileRejectSink {
    file: tokio::fs::File,
}

impl FileRejectSink {
    /// Opens (or creates) the log file in append mode.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::Configuration` when the file cannot be
    /// opened.
    pub async fn open(path: &std::path::Path) -> Result<Self, ConnectorError> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| {
                ConnectorError::Configuration(format!(
                    "cannot open reject log {}: {e}",
                    path.display()
                ))
            })?;
        Ok(Self { file })
    }
}

#[async_trait]
impl RejectSink for FileRejectSink {
    async fn write(&mut self, entry: RejectEntry) -> Result<(), ConnectorError> {
        let mut line = serde_json::to_vec(&entry)
            .map_err(|e| ConnectorError::Configuration(format!("unencodable reject entry: {e}")))?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .await
            .map_err(|e| ConnectorError::Configuration(format!("reject log write failed: {e}")))
    }

    async fn flush(&mut self) -> Result<(), ConnectorError> {
        self.file
            .flush()
            .await
            .map_err(|e| ConnectorError::Configuration(format!("reject log flush failed: {e}")))
    }
}

/// Emits entries to the process log instead of a file. Used when no
/// reject-log path is configured.
#[derive(Debug, Default)]
pub struct LogRejectSink;

#[async_trait]
impl RejectSink for LogRejectSink {
    async fn write(&mut self, entry: RejectEntry) -> Result<(), ConnectorError> {
        warn!(
            doc_id = %entry.doc_id,
            index = entry.index.as_deref().unwrap_or(""),
            reason = %entry.reason,
            "document rejected"
        );
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), ConnectorError> {
        Ok(())
    }
}

/// Collects entries in memory, for tests.
#[derive(Debug, Default)]
pub struct MemoryRejectSink {
    entries: Arc<Mutex<Vec<RejectEntry>>>,
}

impl MemoryRejectSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle to the collected entries.
    #[must_use]
    pub fn entries(&self) -> Arc<Mutex<Vec<RejectEntry>>> {
        Arc::clone(&self.entries)
    }
}

#[async_trait]
impl RejectSink for MemoryRejectSink {
    async fn write(&mut self, entry: RejectEntry) -> Result<(), ConnectorError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), ConnectorError> {
        Ok(())
    }
}

/// Hot-path handle to the reject log. Cheap to clone; never blocks.
#[derive(Clone)]
pub struct RejectLog {
    tx: mpsc::Sender<RejectEntry>,
    dropped: Arc<AtomicU64>,
}

impl RejectLog {
    /// Spawns the writer task over the given sink and returns the handle.
    /// The task drains the channel, writes each entry, and flushes when
    /// every handle has been dropped.
    #[must_use]
    pub fn spawn(mut sink: Box<dyn RejectSink>) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<RejectEntry>(CHANNEL_CAPACITY);
        let task = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                if let Err(e) = sink.write(entry).await {
                    warn!(error = %e, "failed to write reject log entry");
                }
            }
            if let Err(e) = sink.flush().await {
                warn!(error = %e, "failed to flush reject log");
            }
        });
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            task,
        )
    }

    /// Enqueues one entry without blocking. Overflow is counted and
    /// warned about, never propagated.
    pub fn log(&self, entry: RejectEntry) {
        if self.tx.try_send(entry).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(dropped, "reject log channel full; dropping entry");
        }
    }

    /// Entries dropped because the channel was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for RejectLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RejectLog")
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}
