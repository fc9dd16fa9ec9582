//! Remote collaborator clients for cardbox: stream transport, status table,
//! text detection, object copies, search index, graph store, and cache,
//! behind async traits with shared retry plumbing.

pub mod graph;
pub mod memory;
pub mod sigv4;

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use cardbox_core::{ObjectRef, ProcessingStatus};
use chrono::Utc;
use reqwest::StatusCode;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

use crate::sigv4::{sign, uri_encode, uri_encode_path, AwsCredentials, SigningRequest};

pub const CRATE_NAME: &str = "cardbox-storage";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

const AMZ_JSON_1_0: &str = "application/x-amz-json-1.0";
const AMZ_JSON_1_1: &str = "application/x-amz-json-1.1";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("http transport: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{service} returned {status}: {message}")]
    Api {
        service: &'static str,
        status: u16,
        message: String,
    },
    #[error("{failed} records failed in stream put")]
    PartialFailure { failed: usize },
    #[error("gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        source: Box<StoreError>,
    },
    #[error("decoding response: {0}")]
    Decode(String),
    #[error("cache transport: {0}")]
    Redis(#[from] redis::RedisError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_store_error(err: &StoreError) -> RetryDisposition {
    match err {
        StoreError::Http(inner) => classify_reqwest_error(inner),
        StoreError::Api { status, .. } => StatusCode::from_u16(*status)
            .map(classify_status)
            .unwrap_or(RetryDisposition::NonRetryable),
        StoreError::PartialFailure { .. } => RetryDisposition::Retryable,
        StoreError::Redis(_) => RetryDisposition::Retryable,
        StoreError::RetriesExhausted { .. } | StoreError::Decode(_) => {
            RetryDisposition::NonRetryable
        }
    }
}

/// Fixed-interval retry budget. Unlike backoff schedules, every wait is the
/// same length; publishes and edge upserts both use a small fixed budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Budget for stream publishes: 3 attempts, 2s apart.
    pub fn publish_default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }

    /// Budget for graph edge upserts: 3 attempts, 10ms apart.
    pub fn edge_default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(10),
        }
    }
}

/// A payload ready for the stream transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub data: Vec<u8>,
    pub partition_key: String,
}

/// Transport-reported outcome of a put; `failed` counts records the service
/// did not accept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutRecordsOutcome {
    pub failed: usize,
}

/// Hit list and total from a search query.
#[derive(Debug, Clone, Default)]
pub struct SearchResults {
    pub total: u64,
    pub hits: Vec<Value>,
}

/// Copies objects within the image store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn copy(&self, src: &ObjectRef, dest: &ObjectRef) -> Result<(), StoreError>;
}

/// OCR service returning detected text lines in reading order.
#[async_trait]
pub trait TextDetector: Send + Sync {
    async fn detect_lines(&self, object: &ObjectRef) -> Result<Vec<String>, StoreError>;
}

/// Batched record publisher.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn put_records(
        &self,
        stream: &str,
        records: &[StreamRecord],
    ) -> Result<PutRecordsOutcome, StoreError>;
}

/// Upserts the per-image processing status row. The row is keyed by the
/// image id and stamped with the write time inside the call, so retried
/// writes carry a fresh timestamp.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn update(&self, object: &ObjectRef, status: ProcessingStatus) -> Result<(), StoreError>;
}

/// Full-text index over card documents.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Index every `(doc_id, document)` pair in one refreshed bulk request.
    async fn bulk_upsert(&self, index: &str, docs: &[(String, Value)]) -> Result<(), StoreError>;
    async fn search(
        &self,
        index: &str,
        query: &Value,
        limit: usize,
    ) -> Result<SearchResults, StoreError>;
}

/// Property-graph operations over person vertices and their edges.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn vertex_exists(&self, id: &str) -> Result<bool, StoreError>;
    /// Create the vertex when absent, then set every property in
    /// `properties`, overwriting existing values.
    async fn upsert_vertex(
        &self,
        label: &str,
        id: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<(), StoreError>;
    /// Id of a `person` vertex whose `_name` property equals `name_lower`.
    async fn find_person_by_name(&self, name_lower: &str) -> Result<Option<String>, StoreError>;
    /// Neighbor ids over `edge_label` in both directions, one entry per
    /// edge; callers that need per-path counts rely on the duplicates.
    async fn neighbors(&self, id: &str, edge_label: &str) -> Result<Vec<String>, StoreError>;
    async fn vertex_properties(&self, id: &str) -> Result<BTreeMap<String, String>, StoreError>;
    /// Whether a directed `from -> to` edge with `edge_label` exists.
    async fn edge_exists(&self, from: &str, to: &str, edge_label: &str)
        -> Result<bool, StoreError>;
    async fn add_edge(
        &self,
        from: &str,
        to: &str,
        edge_label: &str,
        weight: f64,
    ) -> Result<(), StoreError>;
    async fn update_edge_weight(
        &self,
        from: &str,
        to: &str,
        edge_label: &str,
        weight: f64,
    ) -> Result<(), StoreError>;
    /// Drop up to `limit` edges; returns how many remain.
    async fn drop_edges(&self, limit: usize) -> Result<u64, StoreError>;
    /// Drop up to `limit` vertices; returns how many remain.
    async fn drop_vertices(&self, limit: usize) -> Result<u64, StoreError>;
}

/// Read-through cache with set-if-absent semantics.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    /// Store `value` under `key` unless the key already holds one. Returns
    /// whether the write happened.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;
}

/// Publish `records` to `stream`, retrying the whole list on transient
/// failure. A transport response reporting failed records counts as a
/// failure and retries everything; exhausting the budget is terminal.
pub async fn publish_with_retry(
    transport: &dyn StreamTransport,
    stream: &str,
    records: &[StreamRecord],
    policy: RetryPolicy,
) -> Result<(), StoreError> {
    let mut last_error: Option<StoreError> = None;

    for attempt in 0..policy.max_attempts {
        let err = match transport.put_records(stream, records).await {
            Ok(outcome) if outcome.failed == 0 => return Ok(()),
            Ok(outcome) => StoreError::PartialFailure {
                failed: outcome.failed,
            },
            Err(err) => err,
        };

        if classify_store_error(&err) == RetryDisposition::NonRetryable {
            return Err(err);
        }

        warn!(stream, attempt, error = %err, "stream put failed");
        last_error = Some(err);
        if attempt + 1 < policy.max_attempts {
            tokio::time::sleep(policy.delay).await;
        }
    }

    Err(StoreError::RetriesExhausted {
        attempts: policy.max_attempts,
        source: Box::new(last_error.expect("retry loop always captures an error")),
    })
}

fn strip_scheme(endpoint: &str) -> String {
    endpoint
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_string()
}

fn scheme_for(endpoint_url: Option<&str>) -> &'static str {
    match endpoint_url {
        Some(endpoint) if endpoint.starts_with("http://") => "http",
        _ => "https",
    }
}

/// Shared signed-JSON transport for the AWS-style APIs (Kinesis, DynamoDB,
/// Textract). A custom endpoint keeps every service pointed at a local
/// compatible stack.
#[derive(Debug, Clone)]
pub struct AwsApi {
    client: reqwest::Client,
    region: String,
    credentials: AwsCredentials,
    endpoint_url: Option<String>,
}

impl AwsApi {
    pub fn new(region: impl Into<String>, credentials: AwsCredentials) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("building aws api client")?;
        Ok(Self {
            client,
            region: region.into(),
            credentials,
            endpoint_url: None,
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint_url = Some(endpoint.into());
        self
    }

    fn host_for(&self, service: &str) -> String {
        match &self.endpoint_url {
            Some(endpoint) => strip_scheme(endpoint),
            None => format!("{}.{}.amazonaws.com", service, self.region),
        }
    }

    pub async fn post_json(
        &self,
        service: &'static str,
        target: &str,
        content_type: &'static str,
        body: &Value,
    ) -> Result<Value, StoreError> {
        let host = self.host_for(service);
        let payload = body.to_string();
        let extra_headers = vec![
            ("content-type".to_string(), content_type.to_string()),
            ("x-amz-target".to_string(), target.to_string()),
        ];
        let request = SigningRequest {
            method: "POST",
            host: &host,
            uri: "/",
            query: "",
            extra_headers: &extra_headers,
            payload: payload.as_bytes(),
        };
        let signed = sign(&self.credentials, &self.region, service, &request, Utc::now());

        let url = format!("{}://{}/", scheme_for(self.endpoint_url.as_deref()), host);
        let mut builder = self.client.post(&url);
        for (name, value) in &signed {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.body(payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Api {
                service,
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }
}

/// Kinesis-compatible stream transport (`PutRecords`).
#[derive(Debug, Clone)]
pub struct KinesisStream {
    api: AwsApi,
}

impl KinesisStream {
    pub fn new(api: AwsApi) -> Self {
        Self { api }
    }
}

#[async_trait]
impl StreamTransport for KinesisStream {
    async fn put_records(
        &self,
        stream: &str,
        records: &[StreamRecord],
    ) -> Result<PutRecordsOutcome, StoreError> {
        let encoded: Vec<Value> = records
            .iter()
            .map(|record| {
                json!({
                    "Data": base64::engine::general_purpose::STANDARD.encode(&record.data),
                    "PartitionKey": record.partition_key,
                })
            })
            .collect();
        let body = json!({"StreamName": stream, "Records": encoded});

        let response = self
            .api
            .post_json("kinesis", "Kinesis_20131202.PutRecords", AMZ_JSON_1_1, &body)
            .await?;

        let failed = response
            .get("FailedRecordCount")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        Ok(PutRecordsOutcome { failed })
    }
}

/// Textract-compatible OCR client (`DetectDocumentText`).
#[derive(Debug, Clone)]
pub struct TextractDetector {
    api: AwsApi,
}

impl TextractDetector {
    pub fn new(api: AwsApi) -> Self {
        Self { api }
    }
}

#[async_trait]
impl TextDetector for TextractDetector {
    async fn detect_lines(&self, object: &ObjectRef) -> Result<Vec<String>, StoreError> {
        let body = json!({
            "Document": {
                "S3Object": {"Bucket": object.bucket, "Name": object.key}
            }
        });

        let response = self
            .api
            .post_json(
                "textract",
                "Textract.DetectDocumentText",
                AMZ_JSON_1_1,
                &body,
            )
            .await?;

        let lines = response
            .get("Blocks")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|block| {
                        block.get("BlockType").and_then(Value::as_str) == Some("LINE")
                    })
                    .filter_map(|block| block.get("Text").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(lines)
    }
}

/// DynamoDB-compatible status table client (`UpdateItem`).
#[derive(Debug, Clone)]
pub struct DynamoStatusStore {
    api: AwsApi,
    table: String,
}

impl DynamoStatusStore {
    pub fn new(api: AwsApi, table: impl Into<String>) -> Self {
        Self {
            api,
            table: table.into(),
        }
    }
}

#[async_trait]
impl StatusStore for DynamoStatusStore {
    async fn update(&self, object: &ObjectRef, status: ProcessingStatus) -> Result<(), StoreError> {
        let body = json!({
            "TableName": self.table,
            "Key": {"image_id": {"S": object.image_id()}},
            "UpdateExpression":
                "SET s3_bucket = :s3_bucket, s3_key = :s3_key, mts = :mts, #status = :status",
            "ExpressionAttributeNames": {"#status": "status"},
            "ExpressionAttributeValues": {
                ":s3_bucket": {"S": object.bucket},
                ":s3_key": {"S": object.key},
                ":mts": {"N": cardbox_core::status_timestamp(Utc::now())},
                ":status": {"S": status.as_str()},
            },
        });

        self.api
            .post_json("dynamodb", "DynamoDB_20120810.UpdateItem", AMZ_JSON_1_0, &body)
            .await?;
        Ok(())
    }
}

/// S3-compatible object store client (`CopyObject` via PUT with
/// `x-amz-copy-source`). Uses virtual-hosted addressing against AWS and
/// path-style addressing against custom endpoints.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: reqwest::Client,
    region: String,
    credentials: AwsCredentials,
    endpoint_url: Option<String>,
}

impl S3ObjectStore {
    pub fn new(region: impl Into<String>, credentials: AwsCredentials) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("building object store client")?;
        Ok(Self {
            client,
            region: region.into(),
            credentials,
            endpoint_url: None,
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint_url = Some(endpoint.into());
        self
    }

    fn host_and_uri(&self, object: &ObjectRef) -> (String, String) {
        let key_path = uri_encode_path(&object.key);
        match &self.endpoint_url {
            Some(endpoint) => (
                strip_scheme(endpoint),
                format!("/{}/{}", uri_encode(&object.bucket), key_path),
            ),
            None => (
                format!("{}.s3.{}.amazonaws.com", object.bucket, self.region),
                format!("/{}", key_path),
            ),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn copy(&self, src: &ObjectRef, dest: &ObjectRef) -> Result<(), StoreError> {
        let (host, uri) = self.host_and_uri(dest);
        let copy_source = format!(
            "/{}/{}",
            uri_encode(&src.bucket),
            uri_encode_path(&src.key)
        );
        let extra_headers = vec![("x-amz-copy-source".to_string(), copy_source)];
        let request = SigningRequest {
            method: "PUT",
            host: &host,
            uri: &uri,
            query: "",
            extra_headers: &extra_headers,
            payload: b"",
        };
        let signed = sign(&self.credentials, &self.region, "s3", &request, Utc::now());

        let url = format!(
            "{}://{}{}",
            scheme_for(self.endpoint_url.as_deref()),
            host,
            uri
        );
        let mut builder = self.client.put(&url);
        for (name, value) in &signed {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Api {
                service: "s3",
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}

/// NDJSON body for a bulk index request: alternating action and document
/// lines with a trailing newline.
fn bulk_body(index: &str, docs: &[(String, Value)]) -> String {
    let mut body = String::new();
    for (doc_id, doc) in docs {
        let action = json!({"index": {"_index": index, "_id": doc_id}});
        body.push_str(&action.to_string());
        body.push('\n');
        body.push_str(&doc.to_string());
        body.push('\n');
    }
    body
}

/// Search engine client over the plain HTTP JSON API (`_bulk`, `_search`).
#[derive(Debug, Clone)]
pub struct HttpSearchIndex {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSearchIndex {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("building search client")?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl SearchIndex for HttpSearchIndex {
    async fn bulk_upsert(&self, index: &str, docs: &[(String, Value)]) -> Result<(), StoreError> {
        if docs.is_empty() {
            return Ok(());
        }

        let url = format!("{}/{}/_bulk?refresh=true", self.base_url, index);
        let response = self
            .client
            .post(&url)
            .header("content-type", "application/x-ndjson")
            .body(bulk_body(index, docs))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Api {
                service: "search",
                status: status.as_u16(),
                message,
            });
        }

        let reply: Value = response.json().await?;
        if reply.get("errors").and_then(Value::as_bool).unwrap_or(false) {
            return Err(StoreError::Api {
                service: "search",
                status: status.as_u16(),
                message: "bulk reported item failures".to_string(),
            });
        }
        Ok(())
    }

    async fn search(
        &self,
        index: &str,
        query: &Value,
        limit: usize,
    ) -> Result<SearchResults, StoreError> {
        let url = format!("{}/{}/_search?size={}", self.base_url, index, limit);
        let response = self.client.post(&url).json(query).send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Api {
                service: "search",
                status: status.as_u16(),
                message,
            });
        }

        let reply: Value = response.json().await?;
        let total = reply
            .pointer("/hits/total/value")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let hits = reply
            .pointer("/hits/hits")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(SearchResults { total, hits })
    }
}

/// Redis-backed cache (`GET` / `SET NX EX`).
#[derive(Debug, Clone)]
pub struct RedisCache {
    client: redis::Client,
}

impl RedisCache {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("opening redis client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }
}
