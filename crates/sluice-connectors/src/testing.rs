//! Shared test doubles.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use sluice_core::request::IndexRequest;

use crate::elastic::ops::{BulkError, BulkItemOutcome, ElasticsearchOps, EsVersion};
use crate::error::ConnectorError;

/// Scripted behavior for one bulk call of [`MockElasticsearchOps`].
#[derive(Debug)]
pub enum ScriptedBulk {
    /// Every item succeeds.
    Success,
    /// The whole call fails.
    Fail(BulkError),
    /// Outcomes keyed by doc id; unlisted documents succeed.
    PerDoc(HashMap<String, BulkItemOutcome>),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A scriptable, recording [`ElasticsearchOps`] double.
///
/// Bulk calls record their batches, then consume the next scripted
/// behavior (defaulting to all-success once the script is exhausted).
/// [`MockElasticsearchOps::hold`] parks every bulk call on a gate until
/// [`MockElasticsearchOps::release`], which tests use to observe
/// back-pressure and in-flight state.
pub struct MockElasticsearchOps {
    version: EsVersion,
    calls: Mutex<Vec<Vec<IndexRequest>>>,
    script: Mutex<VecDeque<ScriptedBulk>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl Default for MockElasticsearchOps {
    fn default() -> Self {
        Self {
            version: EsVersion::new(7, 17, 5),
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            gate: Mutex::new(None),
        }
    }
}

impl MockElasticsearchOps {
    /// Creates a mock reporting version 7.17.5.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a shared mock.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Creates a shared mock reporting the given version.
    #[must_use]
    pub fn with_version(version: EsVersion) -> Arc<Self> {
        Arc::new(Self {
            version,
            ..Self::default()
        })
    }

    /// Appends one scripted bulk behavior.
    pub fn script(&self, behavior: ScriptedBulk) {
        lock(&self.script).push_back(behavior);
    }

    /// Parks subsequent bulk calls until [`MockElasticsearchOps::release`].
    pub fn hold(&self) {
        *lock(&self.gate) = Some(Arc::new(Semaphore::new(0)));
    }

    /// Releases every held and future bulk call.
    pub fn release(&self) {
        if let Some(gate) = lock(&self.gate).take() {
            gate.add_permits(Semaphore::MAX_PERMITS);
        }
    }

    /// Recorded batches, in dispatch order.
    #[must_use]
    pub fn calls(&self) -> Vec<Vec<IndexRequest>> {
        lock(&self.calls).clone()
    }

    /// Number of bulk calls dispatched so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

#[async_trait]
impl ElasticsearchOps for MockElasticsearchOps {
    async fn version(&self) -> Result<EsVersion, ConnectorError> {
        Ok(self.version)
    }

    async fn bulk(&self, requests: &[IndexRequest]) -> Result<Vec<BulkItemOutcome>, BulkError> {
        // Record before parking on the gate so tests can observe the call
        // while it is in flight.
        lock(&self.calls).push(requests.to_vec());
        let gate = lock(&self.gate).clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        let behavior = lock(&self.script)
            .pop_front()
            .unwrap_or(ScriptedBulk::Success);
        match behavior {
            ScriptedBulk::Success => Ok(vec![BulkItemOutcome::Success; requests.len()]),
            ScriptedBulk::Fail(error) => Err(error),
            ScriptedBulk::PerDoc(outcomes) => Ok(requests
                .iter()
                .map(|r| {
                    outcomes
                        .get(r.doc_id())
                        .cloned()
                        .unwrap_or(BulkItemOutcome::Success)
                })
                .collect()),
        }
    }
}

impl std::fmt::Debug for MockElasticsearchOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockElasticsearchOps")
            .field("version", &self.version)
            .field("calls", &self.call_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use sluice_core::event::EventPointer;

    use super::*;

    fn upsert(doc_id: &str) -> IndexRequest {
        IndexRequest::Upsert {
            index: "docs".into(),
            doc_id: doc_id.into(),
            version: 1,
            routing: None,
            pipeline: None,
            body: Bytes::from_static(b"{}"),
            pointer: EventPointer::new(0, 1),
        }
    }

    #[tokio::test]
    async fn test_defaults_to_success() {
        let mock = MockElasticsearchOps::new();
        let outcomes = mock.bulk(&[upsert("a")]).await.unwrap();
        assert_eq!(outcomes, vec![BulkItemOutcome::Success]);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_script_consumed_in_order() {
        let mock = MockElasticsearchOps::new();
        mock.script(ScriptedBulk::Fail(BulkError::Transient("down".into())));
        assert!(mock.bulk(&[upsert("a")]).await.is_err());
        assert!(mock.bulk(&[upsert("a")]).await.is_ok());
    }

    #[tokio::test]
    async fn test_per_doc_outcomes() {
        let mock = MockElasticsearchOps::new();
        mock.script(ScriptedBulk::PerDoc(HashMap::from([(
            "b".to_string(),
            BulkItemOutcome::VersionConflict,
        )])));
        let outcomes = mock.bulk(&[upsert("a"), upsert("b")]).await.unwrap();
        assert_eq!(outcomes[0], BulkItemOutcome::Success);
        assert_eq!(outcomes[1], BulkItemOutcome::VersionConflict);
    }
}
