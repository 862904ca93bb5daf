//! Per-partition replication progress.
//!
//! A [`Checkpoint`] records how far a partition's stream has been durably
//! applied to the index. Checkpoints are kept in memory by the
//! [`service::CheckpointService`] and persisted through a
//! [`CheckpointStore`] into the source database itself, which is what lets
//! a restarted worker resume without gaps.

pub mod service;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CheckpointError;

/// Durable record of replication progress for one partition.
///
/// `seqno` is the last sequence number durably applied to the index;
/// the snapshot bounds record the enclosing snapshot marker so the stream
/// can be resumed mid-snapshot without a rollback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Identifier of the source dataset instance the seqno belongs to.
    /// Empty when the source client cannot supply one, which disables
    /// mismatch detection for the partition.
    #[serde(default)]
    pub vbuuid: String,
    /// Last sequence number durably applied to the index.
    pub seqno: u64,
    /// First seqno of the enclosing snapshot.
    pub snapshot_start_seqno: u64,
    /// Last seqno of the enclosing snapshot.
    pub snapshot_end_seqno: u64,
}

impl Checkpoint {
    /// Creates a checkpoint.
    #[must_use]
    pub fn new(
        vbuuid: impl Into<String>,
        seqno: u64,
        snapshot_start_seqno: u64,
        snapshot_end_seqno: u64,
    ) -> Self {
        Self {
            vbuuid: vbuuid.into(),
            seqno,
            snapshot_start_seqno,
            snapshot_end_seqno,
        }
    }
}

/// Wire form of a checkpoint document.
///
/// Fields written by other tools ride along in `extra` and are preserved
/// when the document is rewritten.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointDocument {
    /// The checkpoint payload.
    #[serde(flatten)]
    pub checkpoint: Checkpoint,
    /// Unrecognized fields, preserved verbatim on rewrite.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Outcome of a best-effort batch save.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
    /// Partitions whose checkpoint failed to persist. The caller decides
    /// whether and when to retry them.
    pub failed: Vec<u16>,
}

impl SaveReport {
    /// Whether every requested partition persisted.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Durable storage for per-partition checkpoints.
///
/// There is no cross-partition transactionality: each partition's
/// checkpoint is its own independent record, and writes must be idempotent
/// under replay.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Reads the checkpoint for each of the given partitions. Partitions
    /// without a stored record are absent from the result, which means
    /// "start from the beginning of the stream".
    async fn load(&self, partitions: &[u16]) -> Result<HashMap<u16, Checkpoint>, CheckpointError>;

    /// Best-effort batch upsert. Partial failures are reported per
    /// partition rather than failing the whole call.
    async fn save(
        &self,
        checkpoints: &HashMap<u16, Checkpoint>,
    ) -> Result<SaveReport, CheckpointError>;

    /// Deletes the stored checkpoints for the given partitions.
    async fn clear(&self, partitions: &[u16]) -> Result<(), CheckpointError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_body_layout() {
        let cp = Checkpoint::new("ab12", 42, 40, 50);
        let json = serde_json::to_value(&cp).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "vbuuid": "ab12",
                "seqno": 42,
                "snapshotStartSeqno": 40,
                "snapshotEndSeqno": 50,
            })
        );
    }

    #[test]
    fn test_document_preserves_extra_fields() {
        let raw = serde_json::json!({
            "vbuuid": "ab12",
            "seqno": 7,
            "snapshotStartSeqno": 7,
            "snapshotEndSeqno": 7,
            "operator": "added by hand",
        });
        let doc: CheckpointDocument = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(doc.checkpoint.seqno, 7);
        assert_eq!(
            doc.extra.get("operator"),
            Some(&serde_json::Value::String("added by hand".into()))
        );
        let rewritten = serde_json::to_value(&doc).unwrap();
        assert_eq!(rewritten, raw);
    }

    #[test]
    fn test_missing_vbuuid_defaults_to_empty() {
        let raw = serde_json::json!({
            "seqno": 1,
            "snapshotStartSeqno": 0,
            "snapshotEndSeqno": 1,
        });
        let cp: Checkpoint = serde_json::from_value(raw).unwrap();
        assert!(cp.vbuuid.is_empty());
    }
}
