//! Translation of replication events into index requests.
//!
//! The factory applies the configured type rules to each mutation or
//! deletion and produces at most one [`IndexRequest`]. Events that match no
//! rule, an `ignore` rule, or an `ignore_deletes` rule are dropped.
//! Malformed payloads become [`FactoryOutcome::Reject`]: the event is
//! settled (so checkpointing treats it as applied) and a reject-log entry
//! describes why, but the pipeline itself never faults on bad data.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::event::{EventPointer, ReplicationEvent};
use crate::rules::{first_match, DocStructure, TypeRule};

/// A single operation destined for the index's bulk API.
///
/// `version` carries the source revision seqno; the index applies
/// last-writer-wins on it, which is what makes re-application after a
/// restart idempotent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexRequest {
    /// Create or replace a document.
    Upsert {
        /// Target index.
        index: String,
        /// Index document id.
        doc_id: String,
        /// External version (source revision seqno).
        version: u64,
        /// Routing value, if the rule sets one.
        routing: Option<String>,
        /// Ingest pipeline, if the rule sets one.
        pipeline: Option<String>,
        /// Pre-serialized JSON body.
        body: Bytes,
        /// Originating stream position, for checkpoint accounting.
        pointer: EventPointer,
    },

    /// Remove a document.
    Delete {
        /// Target index.
        index: String,
        /// Index document id.
        doc_id: String,
        /// External version (source revision seqno).
        version: u64,
        /// Routing value, if the rule sets one.
        routing: Option<String>,
        /// Originating stream position, for checkpoint accounting.
        pointer: EventPointer,
    },
}

impl IndexRequest {
    /// Originating stream position.
    #[must_use]
    pub fn pointer(&self) -> EventPointer {
        match self {
            Self::Upsert { pointer, .. } | Self::Delete { pointer, .. } => *pointer,
        }
    }

    /// Index document id.
    #[must_use]
    pub fn doc_id(&self) -> &str {
        match self {
            Self::Upsert { doc_id, .. } | Self::Delete { doc_id, .. } => doc_id,
        }
    }

    /// Target index.
    #[must_use]
    pub fn index(&self) -> &str {
        match self {
            Self::Upsert { index, .. } | Self::Delete { index, .. } => index,
        }
    }

    /// Rough wire size, used for batch byte accounting.
    #[must_use]
    pub fn estimated_bytes(&self) -> usize {
        const ACTION_OVERHEAD: usize = 96;
        match self {
            Self::Upsert { doc_id, body, .. } => ACTION_OVERHEAD + doc_id.len() + body.len(),
            Self::Delete { doc_id, .. } => ACTION_OVERHEAD + doc_id.len(),
        }
    }
}

/// One entry in the machine-readable reject log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectEntry {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Index document id the event would have produced.
    pub doc_id: String,
    /// Target index, when a rule matched before the failure.
    pub index: Option<String>,
    /// Why the document was rejected.
    pub reason: String,
}

impl RejectEntry {
    /// Creates an entry stamped with the current time.
    #[allow(clippy::cast_possible_truncation)] // epoch millis fit in u64
    #[must_use]
    pub fn new(doc_id: impl Into<String>, index: Option<String>, reason: impl Into<String>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            timestamp_ms,
            doc_id: doc_id.into(),
            index,
            reason: reason.into(),
        }
    }
}

/// Result of mapping one replication event.
#[derive(Debug)]
pub enum FactoryOutcome {
    /// The event produced an index operation.
    Request(IndexRequest),
    /// No rule claimed the event, or a rule dropped it; nothing to do.
    Skip,
    /// The event is permanently unusable. It must still be settled through
    /// the worker group so checkpoint accounting treats it as applied.
    Reject {
        /// Stream position to settle.
        pointer: EventPointer,
        /// Reject-log entry describing the failure.
        entry: RejectEntry,
    },
}

/// Maps replication events to index requests per the configured rules.
#[derive(Debug, Clone)]
pub struct RequestFactory {
    rules: Vec<TypeRule>,
    structure: DocStructure,
}

impl RequestFactory {
    /// Creates a factory over validated rules.
    #[must_use]
    pub fn new(rules: Vec<TypeRule>, structure: DocStructure) -> Self {
        Self { rules, structure }
    }

    /// Maps one event. Snapshot markers always skip; they are bookkeeping,
    /// not documents.
    #[must_use]
    pub fn make(&self, event: &ReplicationEvent) -> FactoryOutcome {
        match event {
            ReplicationEvent::SnapshotMarker { .. } => FactoryOutcome::Skip,
            ReplicationEvent::Mutation {
                key,
                cas,
                rev_seqno,
                partition,
                seqno,
                body,
                ..
            } => {
                let Some(rule) = first_match(&self.rules, key) else {
                    return FactoryOutcome::Skip;
                };
                if rule.ignore {
                    return FactoryOutcome::Skip;
                }
                let pointer = EventPointer::new(*partition, *seqno);
                let index = rule.index.clone().unwrap_or_default();
                let doc_id = rule.doc_id(key);

                let source = match parse_object(body) {
                    Ok(source) => source,
                    Err(reason) => {
                        return FactoryOutcome::Reject {
                            pointer,
                            entry: RejectEntry::new(doc_id, Some(index), reason),
                        };
                    }
                };
                let content = project(source, rule);
                let doc = self.assemble(content, rule, *cas, *rev_seqno, pointer);

                FactoryOutcome::Request(IndexRequest::Upsert {
                    index,
                    doc_id,
                    version: *rev_seqno,
                    routing: rule.routing.clone(),
                    pipeline: rule.pipeline.clone(),
                    body: Bytes::from(serde_json::to_vec(&Value::Object(doc)).unwrap_or_default()),
                    pointer,
                })
            }
            ReplicationEvent::Deletion {
                key,
                rev_seqno,
                partition,
                seqno,
                ..
            } => {
                let Some(rule) = first_match(&self.rules, key) else {
                    return FactoryOutcome::Skip;
                };
                if rule.ignore || rule.ignore_deletes {
                    return FactoryOutcome::Skip;
                }
                FactoryOutcome::Request(IndexRequest::Delete {
                    index: rule.index.clone().unwrap_or_default(),
                    doc_id: rule.doc_id(key),
                    version: *rev_seqno,
                    routing: rule.routing.clone(),
                    pointer: EventPointer::new(*partition, *seqno),
                })
            }
        }
    }

    fn assemble(
        &self,
        content: Map<String, Value>,
        rule: &TypeRule,
        cas: u64,
        rev_seqno: u64,
        pointer: EventPointer,
    ) -> Map<String, Value> {
        let mut doc = if self.structure.document_content_at_top_level {
            content
        } else {
            let mut wrapper = Map::new();
            wrapper.insert("doc".into(), Value::Object(content));
            wrapper
        };
        if let Some(meta_field) = &self.structure.metadata_field_name {
            let mut meta = Map::new();
            meta.insert("type".into(), Value::String(rule.type_label().to_string()));
            meta.insert("cas".into(), Value::from(cas));
            meta.insert("rev".into(), Value::from(rev_seqno));
            meta.insert("partition".into(), Value::from(pointer.partition));
            meta.insert("seqno".into(), Value::from(pointer.seqno));
            doc.insert(meta_field.clone(), Value::Object(meta));
        }
        doc
    }
}

fn parse_object(body: &Bytes) -> Result<Map<String, Value>, String> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!(
            "document root must be a JSON object, found {}",
            value_kind(&other)
        )),
        Err(e) => Err(format!("document body is not valid JSON: {e}")),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Applies the rule's field whitelist and renames to the source object.
fn project(source: Map<String, Value>, rule: &TypeRule) -> Map<String, Value> {
    let mut out = Map::new();
    for (field, value) in source {
        if let Some(whitelist) = &rule.fields {
            if !whitelist.contains(&field) {
                continue;
            }
        }
        let name = rule.rename.get(&field).cloned().unwrap_or(field);
        out.insert(name, value);
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn mutation(key: &str, seqno: u64, body: &str) -> ReplicationEvent {
        ReplicationEvent::Mutation {
            key: key.into(),
            cas: 1000 + seqno,
            rev_seqno: seqno,
            partition: 0,
            seqno,
            body: Bytes::from(body.to_string()),
            xattrs: None,
        }
    }

    fn deletion(key: &str, seqno: u64) -> ReplicationEvent {
        ReplicationEvent::Deletion {
            key: key.into(),
            cas: 1000 + seqno,
            rev_seqno: seqno,
            partition: 0,
            seqno,
        }
    }

    fn catch_all() -> TypeRule {
        TypeRule {
            key_pattern: "*".into(),
            index: Some("docs".into()),
            ..TypeRule::default()
        }
    }

    fn top_level_factory(rules: Vec<TypeRule>) -> RequestFactory {
        RequestFactory::new(
            rules,
            DocStructure {
                document_content_at_top_level: true,
                metadata_field_name: None,
            },
        )
    }

    fn body_json(request: &IndexRequest) -> Value {
        match request {
            IndexRequest::Upsert { body, .. } => serde_json::from_slice(body).unwrap(),
            IndexRequest::Delete { .. } => panic!("expected upsert"),
        }
    }

    #[test]
    fn test_mutation_becomes_upsert() {
        let factory = top_level_factory(vec![catch_all()]);
        let outcome = factory.make(&mutation("a", 2, r#"{"x":2}"#));
        let FactoryOutcome::Request(req) = outcome else {
            panic!("expected request");
        };
        assert_eq!(req.index(), "docs");
        assert_eq!(req.doc_id(), "a");
        assert_eq!(req.pointer(), EventPointer::new(0, 2));
        assert_eq!(body_json(&req), serde_json::json!({"x": 2}));
        match req {
            IndexRequest::Upsert { version, .. } => assert_eq!(version, 2),
            IndexRequest::Delete { .. } => panic!("expected upsert"),
        }
    }

    #[test]
    fn test_deletion_becomes_delete() {
        let factory = top_level_factory(vec![catch_all()]);
        let FactoryOutcome::Request(req) = factory.make(&deletion("a", 5)) else {
            panic!("expected request");
        };
        assert!(matches!(req, IndexRequest::Delete { .. }));
        assert_eq!(req.doc_id(), "a");
    }

    #[test]
    fn test_unmatched_key_is_skipped() {
        let factory = top_level_factory(vec![TypeRule {
            key_pattern: "airline_*".into(),
            index: Some("airlines".into()),
            ..TypeRule::default()
        }]);
        assert!(matches!(
            factory.make(&mutation("hotel_3", 1, "{}")),
            FactoryOutcome::Skip
        ));
    }

    #[test]
    fn test_ignore_rule_drops_everything() {
        let factory = top_level_factory(vec![TypeRule {
            key_pattern: "_sync::*".into(),
            ignore: true,
            ..TypeRule::default()
        }]);
        assert!(matches!(
            factory.make(&mutation("_sync::seq", 1, "{}")),
            FactoryOutcome::Skip
        ));
        assert!(matches!(
            factory.make(&deletion("_sync::seq", 2)),
            FactoryOutcome::Skip
        ));
    }

    #[test]
    fn test_ignore_deletes_keeps_mutations() {
        let factory = top_level_factory(vec![TypeRule {
            key_pattern: "*".into(),
            index: Some("docs".into()),
            ignore_deletes: true,
            ..TypeRule::default()
        }]);
        assert!(matches!(
            factory.make(&mutation("a", 1, "{}")),
            FactoryOutcome::Request(_)
        ));
        assert!(matches!(factory.make(&deletion("a", 2)), FactoryOutcome::Skip));
    }

    #[test]
    fn test_malformed_json_is_rejected_with_pointer() {
        let factory = top_level_factory(vec![catch_all()]);
        let outcome = factory.make(&mutation("a", 9, "{not json"));
        let FactoryOutcome::Reject { pointer, entry } = outcome else {
            panic!("expected reject");
        };
        assert_eq!(pointer, EventPointer::new(0, 9));
        assert_eq!(entry.doc_id, "a");
        assert_eq!(entry.index.as_deref(), Some("docs"));
        assert!(entry.reason.contains("not valid JSON"));
    }

    #[test]
    fn test_non_object_root_is_rejected() {
        let factory = top_level_factory(vec![catch_all()]);
        let FactoryOutcome::Reject { entry, .. } = factory.make(&mutation("a", 1, "[1,2]")) else {
            panic!("expected reject");
        };
        assert!(entry.reason.contains("array"));
    }

    #[test]
    fn test_whitelist_and_rename_projection() {
        let factory = top_level_factory(vec![TypeRule {
            key_pattern: "*".into(),
            index: Some("docs".into()),
            fields: Some(vec!["name".into(), "city".into()]),
            rename: HashMap::from([("city".to_string(), "location".to_string())]),
            ..TypeRule::default()
        }]);
        let FactoryOutcome::Request(req) =
            factory.make(&mutation("a", 1, r#"{"name":"n","city":"c","secret":1}"#))
        else {
            panic!("expected request");
        };
        assert_eq!(
            body_json(&req),
            serde_json::json!({"name": "n", "location": "c"})
        );
    }

    #[test]
    fn test_default_structure_wraps_and_injects_metadata() {
        let factory = RequestFactory::new(
            vec![TypeRule {
                key_pattern: "*".into(),
                type_name: Some("thing".into()),
                index: Some("docs".into()),
                ..TypeRule::default()
            }],
            DocStructure::default(),
        );
        let FactoryOutcome::Request(req) = factory.make(&mutation("a", 3, r#"{"x":1}"#)) else {
            panic!("expected request");
        };
        let body = body_json(&req);
        assert_eq!(body["doc"], serde_json::json!({"x": 1}));
        assert_eq!(body["meta"]["type"], "thing");
        assert_eq!(body["meta"]["rev"], 3);
        assert_eq!(body["meta"]["cas"], 1003);
        assert_eq!(body["meta"]["seqno"], 3);
    }

    #[test]
    fn test_snapshot_marker_skips() {
        let factory = top_level_factory(vec![catch_all()]);
        assert!(matches!(
            factory.make(&ReplicationEvent::SnapshotMarker {
                partition: 0,
                start: 1,
                end: 2
            }),
            FactoryOutcome::Skip
        ));
    }

    #[test]
    fn test_estimated_bytes_tracks_body() {
        let factory = top_level_factory(vec![catch_all()]);
        let FactoryOutcome::Request(small) = factory.make(&mutation("a", 1, r#"{"x":1}"#)) else {
            panic!()
        };
        let big_body = format!(r#"{{"x":"{}"}}"#, "y".repeat(4096));
        let FactoryOutcome::Request(big) = factory.make(&mutation("a", 2, &big_body)) else {
            panic!()
        };
        assert!(big.estimated_bytes() > small.estimated_bytes() + 4000);
    }
}
