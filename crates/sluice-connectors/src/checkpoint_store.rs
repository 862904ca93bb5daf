//! Checkpoint documents stored in the source database.
//!
//! Each partition's checkpoint is one JSON document in the metadata
//! collection, keyed `<group>::checkpoint::<partition>`. Fields the
//! connector does not recognize are preserved on rewrite, so operators and
//! tooling can annotate checkpoint documents safely.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::warn;

use sluice_core::checkpoint::{Checkpoint, CheckpointDocument, CheckpointStore, SaveReport};
use sluice_core::error::CheckpointError;

use crate::error::ConnectorError;

/// Minimal KV document access to the metadata collection of the source
/// database.
#[async_trait]
pub trait KvCollection: Send + Sync {
    /// Reads a document, `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ConnectorError>;

    /// Creates or replaces a document.
    async fn upsert(&self, key: &str, body: Vec<u8>) -> Result<(), ConnectorError>;

    /// Deletes a document; deleting an absent document is not an error.
    async fn remove(&self, key: &str) -> Result<(), ConnectorError>;
}

/// In-memory [`KvCollection`] for tests and the development source.
#[derive(Debug, Default)]
pub struct MemoryKvCollection {
    docs: Mutex<HashMap<String, Vec<u8>>>,
    failing_keys: Mutex<HashSet<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryKvCollection {
    /// Creates an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes upserts of `key` fail until [`MemoryKvCollection::heal`].
    pub fn fail_upserts_of(&self, key: &str) {
        lock(&self.failing_keys).insert(key.to_string());
    }

    /// Clears injected failures.
    pub fn heal(&self) {
        lock(&self.failing_keys).clear();
    }

    /// Raw document body, for assertions.
    #[must_use]
    pub fn get_raw(&self, key: &str) -> Option<Vec<u8>> {
        lock(&self.docs).get(key).cloned()
    }

    /// Stores a raw document body, for seeding tests.
    pub fn put_raw(&self, key: &str, body: Vec<u8>) {
        lock(&self.docs).insert(key.to_string(), body);
    }

    /// Number of stored documents.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.docs).len()
    }

    /// Whether the collection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.docs).is_empty()
    }
}

#[async_trait]
impl KvCollection for MemoryKvCollection {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ConnectorError> {
        Ok(lock(&self.docs).get(key).cloned())
    }

    async fn upsert(&self, key: &str, body: Vec<u8>) -> Result<(), ConnectorError> {
        if lock(&self.failing_keys).contains(key) {
            return Err(ConnectorError::ConnectionFailed(format!(
                "injected upsert failure for {key}"
            )));
        }
        lock(&self.docs).insert(key.to_string(), body);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), ConnectorError> {
        lock(&self.docs).remove(key);
        Ok(())
    }
}

/// [`CheckpointStore`] over one checkpoint document per partition.
pub struct DocumentCheckpointStore {
    collection: Arc<dyn KvCollection>,
    group: String,
}

impl DocumentCheckpointStore {
    /// Creates a store writing under the given group name.
    #[must_use]
    pub fn new(collection: Arc<dyn KvCollection>, group: impl Into<String>) -> Self {
        Self {
            collection,
            group: group.into(),
        }
    }

    fn key(&self, partition: u16) -> String {
        format!("{}::checkpoint::{partition}", self.group)
    }

    async fn load_document(&self, partition: u16) -> Option<CheckpointDocument> {
        let key = self.key(partition);
        match self.collection.get(&key).await {
            Ok(Some(body)) => match serde_json::from_slice::<CheckpointDocument>(&body) {
                Ok(doc) => Some(doc),
                Err(e) => {
                    // A checkpoint we cannot read is a checkpoint we do not
                    // have; streaming from the beginning is always safe.
                    warn!(key, error = %e, "malformed checkpoint document; ignoring");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "checkpoint read failed; treating as absent");
                None
            }
        }
    }

    async fn save_one(&self, partition: u16, checkpoint: &Checkpoint) -> Result<(), ConnectorError> {
        let existing = self.load_document(partition).await;
        let doc = CheckpointDocument {
            checkpoint: checkpoint.clone(),
            extra: existing.map(|d| d.extra).unwrap_or_default(),
        };
        let body = serde_json::to_vec(&doc).map_err(|e| {
            ConnectorError::Configuration(format!("unencodable checkpoint document: {e}"))
        })?;
        self.collection.upsert(&self.key(partition), body).await
    }
}

#[async_trait]
impl CheckpointStore for DocumentCheckpointStore {
    async fn load(&self, partitions: &[u16]) -> Result<HashMap<u16, Checkpoint>, CheckpointError> {
        let reads = partitions.iter().map(|p| async move {
            self.load_document(*p).await.map(|doc| (*p, doc.checkpoint))
        });
        Ok(join_all(reads).await.into_iter().flatten().collect())
    }

    async fn save(
        &self,
        checkpoints: &HashMap<u16, Checkpoint>,
    ) -> Result<SaveReport, CheckpointError> {
        let writes = checkpoints.iter().map(|(partition, checkpoint)| async move {
            (*partition, self.save_one(*partition, checkpoint).await)
        });
        let mut report = SaveReport::default();
        for (partition, result) in join_all(writes).await {
            if let Err(e) = result {
                warn!(partition, error = %e, "checkpoint write failed");
                report.failed.push(partition);
            }
        }
        report.failed.sort_unstable();
        Ok(report)
    }

    async fn clear(&self, partitions: &[u16]) -> Result<(), CheckpointError> {
        let removals = partitions
            .iter()
            .map(|p| async move { self.collection.remove(&self.key(*p)).await });
        for result in join_all(removals).await {
            result.map_err(|e| CheckpointError::Store(e.to_string()))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DocumentCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentCheckpointStore")
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (Arc<MemoryKvCollection>, DocumentCheckpointStore) {
        let kv = Arc::new(MemoryKvCollection::new());
        let store = DocumentCheckpointStore::new(Arc::clone(&kv) as Arc<dyn KvCollection>, "example-group");
        (kv, store)
    }

    #[tokio::test]
    async fn test_key_scheme() {
        let (kv, store) = store();
        store
            .save(&HashMap::from([(7u16, Checkpoint::new("u", 3, 3, 3))]))
            .await
            .unwrap();
        assert!(kv.get_raw("example-group::checkpoint::7").is_some());
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let (_kv, store) = store();
        let checkpoints = HashMap::from([
            (0u16, Checkpoint::new("u", 5, 4, 9)),
            (3u16, Checkpoint::new("u", 12, 12, 12)),
        ]);
        let report = store.save(&checkpoints).await.unwrap();
        assert!(report.is_complete());

        let loaded = store.load(&[0, 1, 2, 3]).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[&0], checkpoints[&0]);
        assert_eq!(loaded[&3], checkpoints[&3]);
    }

    #[tokio::test]
    async fn test_absent_partitions_are_absent() {
        let (_kv, store) = store();
        assert!(store.load(&[0, 1]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_extra_fields_survive_rewrite() {
        let (kv, store) = store();
        kv.put_raw(
            "example-group::checkpoint::0",
            serde_json::json!({
                "vbuuid": "u",
                "seqno": 1,
                "snapshotStartSeqno": 1,
                "snapshotEndSeqno": 1,
                "note": "operator annotation",
            })
            .to_string()
            .into_bytes(),
        );

        store
            .save(&HashMap::from([(0u16, Checkpoint::new("u", 2, 2, 2))]))
            .await
            .unwrap();

        let raw = kv.get_raw("example-group::checkpoint::0").unwrap();
        let body: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(body["seqno"], 2);
        assert_eq!(body["note"], "operator annotation");
    }

    #[tokio::test]
    async fn test_partial_failure_reports_partitions() {
        let (kv, store) = store();
        kv.fail_upserts_of("example-group::checkpoint::1");
        let checkpoints = HashMap::from([
            (0u16, Checkpoint::new("u", 5, 5, 5)),
            (1u16, Checkpoint::new("u", 6, 6, 6)),
        ]);
        let report = store.save(&checkpoints).await.unwrap();
        assert_eq!(report.failed, vec![1]);
        assert!(kv.get_raw("example-group::checkpoint::0").is_some());
    }

    #[tokio::test]
    async fn test_clear_removes_documents() {
        let (kv, store) = store();
        store
            .save(&HashMap::from([(0u16, Checkpoint::new("u", 5, 5, 5))]))
            .await
            .unwrap();
        store.clear(&[0]).await.unwrap();
        assert!(kv.is_empty());
        // Clearing what is already gone is fine.
        store.clear(&[0, 9]).await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_document_treated_as_absent() {
        let (kv, store) = store();
        kv.put_raw("example-group::checkpoint::0", b"not json".to_vec());
        assert!(store.load(&[0]).await.unwrap().is_empty());
    }
}
