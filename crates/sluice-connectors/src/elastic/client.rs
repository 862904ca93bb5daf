//! HTTP implementation of [`ElasticsearchOps`] over the `_bulk` API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use sluice_core::request::IndexRequest;

use crate::error::ConnectorError;

use super::ops::{BulkError, BulkItemOutcome, ElasticsearchOps, EsVersion};

/// Connection settings for the HTTP client.
#[derive(Debug, Clone)]
pub struct HttpElasticsearchConfig {
    /// Base URL, e.g. `http://127.0.0.1:9200`.
    pub url: String,
    /// Basic-auth user name.
    pub username: Option<String>,
    /// Basic-auth password.
    pub password: Option<String>,
    /// PEM-encoded CA certificate(s) to trust, when the server uses a
    /// private authority.
    pub ca_certificate_pem: Option<Vec<u8>>,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for HttpElasticsearchConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:9200".into(),
            username: None,
            password: None,
            ca_certificate_pem: None,
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// [`ElasticsearchOps`] over HTTP.
pub struct HttpElasticsearchClient {
    http: reqwest::Client,
    base: reqwest::Url,
    username: Option<String>,
    password: Option<String>,
}

impl HttpElasticsearchClient {
    /// Builds a client from the given settings.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::Configuration` when the URL or CA
    /// certificate is unusable.
    pub fn new(config: &HttpElasticsearchConfig) -> Result<Self, ConnectorError> {
        let base = reqwest::Url::parse(&config.url).map_err(|e| {
            ConnectorError::Configuration(format!("invalid Elasticsearch URL {}: {e}", config.url))
        })?;
        let mut builder = reqwest::Client::builder().timeout(config.request_timeout);
        if let Some(pem) = &config.ca_certificate_pem {
            let cert = reqwest::Certificate::from_pem(pem).map_err(|e| {
                ConnectorError::Configuration(format!("invalid CA certificate: {e}"))
            })?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| ConnectorError::Configuration(format!("HTTP client build failed: {e}")))?;
        Ok(Self {
            http,
            base,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_deref()),
            None => request,
        }
    }

    fn bulk_url(&self) -> Result<reqwest::Url, BulkError> {
        self.base
            .join("_bulk")
            .map_err(|e| BulkError::Fatal(format!("cannot build bulk URL: {e}")))
    }
}

/// Renders a batch as newline-delimited JSON for the `_bulk` endpoint.
///
/// Upserts use external versioning so replays and version conflicts
/// resolve last-writer-wins on the source revision seqno.
#[must_use]
pub fn encode_bulk(requests: &[IndexRequest]) -> Vec<u8> {
    let mut body = Vec::new();
    for request in requests {
        let mut action = Map::new();
        action.insert("_index".into(), Value::from(request.index()));
        action.insert("_id".into(), Value::from(request.doc_id()));
        action.insert("version_type".into(), Value::from("external"));
        match request {
            IndexRequest::Upsert {
                version,
                routing,
                pipeline,
                ..
            } => {
                action.insert("version".into(), Value::from(*version));
                if let Some(routing) = routing {
                    action.insert("routing".into(), Value::from(routing.clone()));
                }
                if let Some(pipeline) = pipeline {
                    action.insert("pipeline".into(), Value::from(pipeline.clone()));
                }
                let line = Value::Object(Map::from_iter([(
                    "index".to_string(),
                    Value::Object(action),
                )]));
                body.extend_from_slice(line.to_string().as_bytes());
                body.push(b'\n');
                if let IndexRequest::Upsert { body: doc, .. } = request {
                    body.extend_from_slice(doc);
                    body.push(b'\n');
                }
            }
            IndexRequest::Delete {
                version, routing, ..
            } => {
                action.insert("version".into(), Value::from(*version));
                if let Some(routing) = routing {
                    action.insert("routing".into(), Value::from(routing.clone()));
                }
                let line = Value::Object(Map::from_iter([(
                    "delete".to_string(),
                    Value::Object(action),
                )]));
                body.extend_from_slice(line.to_string().as_bytes());
                body.push(b'\n');
            }
        }
    }
    body
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    items: Vec<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct BulkItemBody {
    status: u16,
    #[serde(default)]
    error: Option<BulkItemError>,
}

#[derive(Debug, Default, Deserialize)]
struct BulkItemError {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    reason: String,
}

/// Classifies the per-item outcomes of a bulk response body.
///
/// # Errors
///
/// Returns `BulkError::Fatal` when the response does not line up with the
/// submitted batch — that is a contract violation, not a retry case.
pub fn classify_bulk_response(
    requests: &[IndexRequest],
    response: &[u8],
) -> Result<Vec<BulkItemOutcome>, BulkError> {
    let parsed: BulkResponse = serde_json::from_slice(response)
        .map_err(|e| BulkError::Fatal(format!("unparseable bulk response: {e}")))?;
    if parsed.items.len() != requests.len() {
        return Err(BulkError::Fatal(format!(
            "bulk response has {} items for {} requests",
            parsed.items.len(),
            requests.len()
        )));
    }

    let mut outcomes = Vec::with_capacity(requests.len());
    for (request, item) in requests.iter().zip(parsed.items) {
        let Some((op, body)) = item.into_iter().next() else {
            return Err(BulkError::Fatal("empty bulk response item".into()));
        };
        let body: BulkItemBody = serde_json::from_value(body)
            .map_err(|e| BulkError::Fatal(format!("malformed bulk response item: {e}")))?;
        let error = body.error.unwrap_or_default();
        let reason = if error.reason.is_empty() {
            error.kind.clone()
        } else {
            format!("{}: {}", error.kind, error.reason)
        };
        outcomes.push(classify_item(request, &op, body.status, reason));
    }
    Ok(outcomes)
}

fn classify_item(
    request: &IndexRequest,
    op: &str,
    status: u16,
    reason: String,
) -> BulkItemOutcome {
    let is_delete = matches!(request, IndexRequest::Delete { .. }) || op == "delete";
    match status {
        200 | 201 => BulkItemOutcome::Success,
        // Deleting a document the index never held is success, not a fault.
        404 if is_delete => BulkItemOutcome::Success,
        409 => BulkItemOutcome::VersionConflict,
        429 => BulkItemOutcome::Retry { status, reason },
        s if s >= 500 => BulkItemOutcome::Retry { status, reason },
        _ => BulkItemOutcome::Rejected { status, reason },
    }
}

#[async_trait]
impl ElasticsearchOps for HttpElasticsearchClient {
    async fn version(&self) -> Result<EsVersion, ConnectorError> {
        let response = self
            .authed(self.http.get(self.base.clone()))
            .send()
            .await
            .map_err(|e| ConnectorError::ConnectionFailed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ConnectorError::Index(format!(
                "version probe returned HTTP {status}"
            )));
        }
        let info: Value = response
            .json()
            .await
            .map_err(|e| ConnectorError::Index(format!("unparseable version response: {e}")))?;
        info["version"]["number"]
            .as_str()
            .and_then(EsVersion::parse)
            .ok_or_else(|| ConnectorError::Index("missing version.number".into()))
    }

    async fn bulk(&self, requests: &[IndexRequest]) -> Result<Vec<BulkItemOutcome>, BulkError> {
        let body = encode_bulk(requests);
        debug!(
            requests = requests.len(),
            bytes = body.len(),
            "dispatching bulk request"
        );
        let response = self
            .authed(self.http.post(self.bulk_url()?))
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| BulkError::Transient(format!("bulk transport failure: {e}")))?;

        let status = response.status();
        match status {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(BulkError::Fatal(format!(
                    "bulk request rejected with HTTP {status}; check credentials"
                )));
            }
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(BulkError::Transient("index overloaded (HTTP 429)".into()));
            }
            s if s.is_server_error() => {
                return Err(BulkError::Transient(format!("bulk failed with HTTP {s}")));
            }
            s => {
                return Err(BulkError::Fatal(format!("bulk failed with HTTP {s}")));
            }
        }

        let payload = response
            .bytes()
            .await
            .map_err(|e| BulkError::Transient(format!("bulk response read failed: {e}")))?;
        classify_bulk_response(requests, &payload)
    }
}

impl std::fmt::Debug for HttpElasticsearchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpElasticsearchClient")
            .field("base", &self.base.as_str())
            .field("authenticated", &self.username.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use sluice_core::event::EventPointer;

    use super::*;

    fn upsert(doc_id: &str, version: u64) -> IndexRequest {
        IndexRequest::Upsert {
            index: "docs".into(),
            doc_id: doc_id.into(),
            version,
            routing: None,
            pipeline: None,
            body: Bytes::from_static(br#"{"x":1}"#),
            pointer: EventPointer::new(0, version),
        }
    }

    fn delete(doc_id: &str, version: u64) -> IndexRequest {
        IndexRequest::Delete {
            index: "docs".into(),
            doc_id: doc_id.into(),
            version,
            routing: Some("r1".into()),
            pointer: EventPointer::new(0, version),
        }
    }

    #[test]
    fn test_encode_upsert_and_delete() {
        let body = encode_bulk(&[upsert("a", 7), delete("b", 8)]);
        let text = String::from_utf8(body).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);

        let action: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(action["index"]["_index"], "docs");
        assert_eq!(action["index"]["_id"], "a");
        assert_eq!(action["index"]["version"], 7);
        assert_eq!(action["index"]["version_type"], "external");
        assert_eq!(lines[1], r#"{"x":1}"#);

        let action: Value = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(action["delete"]["_id"], "b");
        assert_eq!(action["delete"]["routing"], "r1");
    }

    #[test]
    fn test_encode_includes_pipeline_and_routing() {
        let request = IndexRequest::Upsert {
            index: "docs".into(),
            doc_id: "a".into(),
            version: 1,
            routing: Some("shard-1".into()),
            pipeline: Some("clean".into()),
            body: Bytes::from_static(b"{}"),
            pointer: EventPointer::new(0, 1),
        };
        let text = String::from_utf8(encode_bulk(&[request])).unwrap();
        let action: Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(action["index"]["routing"], "shard-1");
        assert_eq!(action["index"]["pipeline"], "clean");
    }

    fn respond(items: Value) -> Vec<u8> {
        serde_json::json!({ "took": 3, "errors": true, "items": items })
            .to_string()
            .into_bytes()
    }

    #[test]
    fn test_classify_success_conflict_reject_retry() {
        let requests = vec![upsert("a", 1), upsert("b", 2), upsert("c", 3), upsert("d", 4)];
        let response = respond(serde_json::json!([
            {"index": {"_id": "a", "status": 201}},
            {"index": {"_id": "b", "status": 409,
                       "error": {"type": "version_conflict_engine_exception", "reason": "current version is higher"}}},
            {"index": {"_id": "c", "status": 400,
                       "error": {"type": "mapper_parsing_exception", "reason": "failed to parse"}}},
            {"index": {"_id": "d", "status": 503,
                       "error": {"type": "unavailable_shards_exception", "reason": "primary not active"}}},
        ]));
        let outcomes = classify_bulk_response(&requests, &response).unwrap();
        assert_eq!(outcomes[0], BulkItemOutcome::Success);
        assert_eq!(outcomes[1], BulkItemOutcome::VersionConflict);
        assert!(matches!(
            &outcomes[2],
            BulkItemOutcome::Rejected { status: 400, reason } if reason.contains("mapper_parsing_exception")
        ));
        assert!(matches!(&outcomes[3], BulkItemOutcome::Retry { status: 503, .. }));
    }

    #[test]
    fn test_classify_delete_of_missing_document_is_success() {
        let requests = vec![delete("ghost", 5)];
        let response = respond(serde_json::json!([
            {"delete": {"_id": "ghost", "status": 404, "result": "not_found"}},
        ]));
        let outcomes = classify_bulk_response(&requests, &response).unwrap();
        assert_eq!(outcomes[0], BulkItemOutcome::Success);
    }

    #[test]
    fn test_classify_429_is_retryable() {
        let requests = vec![upsert("a", 1)];
        let response = respond(serde_json::json!([
            {"index": {"_id": "a", "status": 429,
                       "error": {"type": "es_rejected_execution_exception", "reason": "queue full"}}},
        ]));
        let outcomes = classify_bulk_response(&requests, &response).unwrap();
        assert!(matches!(&outcomes[0], BulkItemOutcome::Retry { status: 429, .. }));
    }

    #[test]
    fn test_item_count_mismatch_is_fatal() {
        let requests = vec![upsert("a", 1), upsert("b", 2)];
        let response = respond(serde_json::json!([
            {"index": {"_id": "a", "status": 201}},
        ]));
        assert!(matches!(
            classify_bulk_response(&requests, &response),
            Err(BulkError::Fatal(_))
        ));
    }

    #[test]
    fn test_unparseable_response_is_fatal() {
        assert!(matches!(
            classify_bulk_response(&[upsert("a", 1)], b"<html>oops</html>"),
            Err(BulkError::Fatal(_))
        ));
    }

    #[test]
    fn test_client_rejects_bad_url() {
        let config = HttpElasticsearchConfig {
            url: "not a url".into(),
            ..HttpElasticsearchConfig::default()
        };
        assert!(HttpElasticsearchClient::new(&config).is_err());
    }
}
