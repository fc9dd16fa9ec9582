//! The four batch pipelines behind the card box: intake, extract, index,
//! and graph. Each consumes one event batch, processes records
//! independently, and reports read/write/invalid/error counters.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use cardbox_core::{
    basename, card_timestamp, owner_from_key, short_hash, CardEnvelope, ObjectEventBatch,
    ObjectEventRecord, ObjectRef, PersonRecord, ProcessingStatus, SearchCard, StreamEventBatch,
    StreamEventRecord, KNOWS_EDGE, PERSON_LABEL,
};
use cardbox_extract::{ExtractError, FieldExtractor};
use cardbox_storage::{
    classify_store_error, publish_with_retry, GraphStore, ObjectStore, RetryDisposition,
    RetryPolicy, SearchIndex, StatusStore, StoreError, StreamRecord, StreamTransport, TextDetector,
};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cardbox-pipeline";

/// Stream, table, index, and prefix names shared by the pipelines.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub img_stream: String,
    pub text_stream: String,
    pub status_table: String,
    pub search_index: String,
    pub album_prefix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            img_stream: "cardbox-img".to_string(),
            text_stream: "cardbox-text".to_string(),
            status_table: "cardbox-image-status".to_string(),
            search_index: "cardbox_bizcard".to_string(),
            album_prefix: "bizcard-by-user".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            img_stream: std::env::var("CARDBOX_IMG_STREAM").unwrap_or(defaults.img_stream),
            text_stream: std::env::var("CARDBOX_TEXT_STREAM").unwrap_or(defaults.text_stream),
            status_table: std::env::var("CARDBOX_STATUS_TABLE").unwrap_or(defaults.status_table),
            search_index: std::env::var("CARDBOX_SEARCH_INDEX").unwrap_or(defaults.search_index),
            album_prefix: std::env::var("CARDBOX_ALBUM_PREFIX").unwrap_or(defaults.album_prefix),
        }
    }
}

/// Per-batch outcome counters. `reads` covers every record in the batch;
/// each record then lands in exactly one of `writes`, `invalid`, or
/// `errors`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineCounters {
    pub reads: usize,
    pub writes: usize,
    pub invalid: usize,
    pub errors: usize,
}

impl PipelineCounters {
    fn absorb_failure(&mut self, record: &str, failure: RecordFailure) {
        if failure.is_invalid() {
            warn!(record, error = %failure, "skipping invalid record");
            self.invalid += 1;
        } else {
            warn!(record, error = %failure, "record failed");
            self.errors += 1;
        }
    }
}

impl fmt::Display for PipelineCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reads={}, writes={}, invalid={}, errors={}",
            self.reads, self.writes, self.invalid, self.errors
        )
    }
}

/// Why a single record did not land.
#[derive(Debug, Error)]
pub enum RecordFailure {
    #[error("decoding record data: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("parsing record json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing required keys: {0:?}")]
    MissingKeys(Vec<&'static str>),
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
}

impl RecordFailure {
    /// Records that fail the envelope key check are invalid input; every
    /// other failure is a processing error.
    pub fn is_invalid(&self) -> bool {
        matches!(self, RecordFailure::MissingKeys(_))
    }
}

fn decode_payload<T: DeserializeOwned>(record: &StreamEventRecord) -> Result<T, RecordFailure> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(&record.data)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn stream_record(payload: Vec<u8>, identity: &str) -> StreamRecord {
    StreamRecord {
        data: payload,
        partition_key: format!("part-{}", short_hash(identity)),
    }
}

/// Publishes object-created notifications onto the image stream and marks
/// each image `START`.
pub struct IntakePipeline {
    transport: Arc<dyn StreamTransport>,
    status: Arc<dyn StatusStore>,
    config: PipelineConfig,
}

impl IntakePipeline {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        status: Arc<dyn StatusStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            transport,
            status,
            config,
        }
    }

    pub async fn run(&self, batch: &ObjectEventBatch) -> PipelineCounters {
        let run_id = Uuid::new_v4();
        let span = info_span!("intake_run", %run_id);
        let _guard = span.enter();

        let mut counters = PipelineCounters::default();
        for record in &batch.records {
            counters.reads += 1;
            match self.process(record).await {
                Ok(()) => counters.writes += 1,
                Err(err) => counters.absorb_failure(&record.key, err),
            }
        }
        info!(%counters, "intake batch finished");
        counters
    }

    async fn process(&self, record: &ObjectEventRecord) -> Result<(), RecordFailure> {
        let object = record.object_ref();
        let payload = serde_json::to_vec(&object)?;
        let records = vec![stream_record(payload, &object.key)];
        publish_with_retry(
            self.transport.as_ref(),
            &self.config.img_stream,
            &records,
            RetryPolicy::publish_default(),
        )
        .await?;
        self.status.update(&object, ProcessingStatus::Start).await?;
        Ok(())
    }
}

/// Runs text detection on each image, extracts card fields, publishes the
/// envelope to the text stream, copies the image into the owner's album,
/// and marks the album copy `END`.
pub struct ExtractPipeline {
    detector: Arc<dyn TextDetector>,
    objects: Arc<dyn ObjectStore>,
    transport: Arc<dyn StreamTransport>,
    status: Arc<dyn StatusStore>,
    extractor: FieldExtractor,
    config: PipelineConfig,
}

impl ExtractPipeline {
    pub fn new(
        detector: Arc<dyn TextDetector>,
        objects: Arc<dyn ObjectStore>,
        transport: Arc<dyn StreamTransport>,
        status: Arc<dyn StatusStore>,
        extractor: FieldExtractor,
        config: PipelineConfig,
    ) -> Self {
        Self {
            detector,
            objects,
            transport,
            status,
            extractor,
            config,
        }
    }

    pub async fn run(&self, batch: &StreamEventBatch) -> PipelineCounters {
        let run_id = Uuid::new_v4();
        let span = info_span!("extract_run", %run_id);
        let _guard = span.enter();

        let mut counters = PipelineCounters::default();
        for record in &batch.records {
            counters.reads += 1;
            match self.process(record).await {
                Ok(()) => counters.writes += 1,
                Err(err) => counters.absorb_failure(&record.sequence_number, err),
            }
        }
        info!(%counters, "extract batch finished");
        counters
    }

    async fn process(&self, record: &StreamEventRecord) -> Result<(), RecordFailure> {
        let object: ObjectRef = decode_payload(record)?;
        self.status
            .update(&object, ProcessingStatus::Process)
            .await?;

        let lines = self.detector.detect_lines(&object).await?;
        let mut fields = self.extractor.extract(&lines)?;
        fields.created_at = Some(card_timestamp(Utc::now()));

        let owner = owner_from_key(&object.key).to_string();
        let envelope = CardEnvelope {
            s3_bucket: Some(object.bucket.clone()),
            s3_key: Some(object.key.clone()),
            owner: Some(owner.clone()),
            data: Some(fields),
        };
        let payload = serde_json::to_vec(&envelope)?;
        let records = vec![stream_record(payload, object.image_id())];
        publish_with_retry(
            self.transport.as_ref(),
            &self.config.text_stream,
            &records,
            RetryPolicy::publish_default(),
        )
        .await?;

        let album_copy = ObjectRef::new(
            &object.bucket,
            format!(
                "{}/{}/{}",
                self.config.album_prefix,
                owner,
                object.image_id()
            ),
        );
        self.objects.copy(&object, &album_copy).await?;
        self.status
            .update(&album_copy, ProcessingStatus::End)
            .await?;
        Ok(())
    }
}

/// Buffers one search document per valid card record and lands the whole
/// batch in a single refreshed bulk write.
pub struct IndexPipeline {
    search: Arc<dyn SearchIndex>,
    config: PipelineConfig,
}

impl IndexPipeline {
    pub fn new(search: Arc<dyn SearchIndex>, config: PipelineConfig) -> Self {
        Self { search, config }
    }

    pub async fn run(&self, batch: &StreamEventBatch) -> PipelineCounters {
        let run_id = Uuid::new_v4();
        let span = info_span!("index_run", %run_id);
        let _guard = span.enter();

        let mut counters = PipelineCounters::default();
        let mut docs: Vec<(String, Value)> = Vec::new();
        for record in &batch.records {
            counters.reads += 1;
            match prepare_search_doc(record) {
                Ok(doc) => {
                    docs.push(doc);
                    counters.writes += 1;
                }
                Err(err) => counters.absorb_failure(&record.sequence_number, err),
            }
        }

        // Counters cover per-record preparation; the bulk write below is
        // reported on its own.
        info!(%counters, "index batch finished");
        if !docs.is_empty() {
            if let Err(err) = self
                .search
                .bulk_upsert(&self.config.search_index, &docs)
                .await
            {
                warn!(error = %err, "bulk index write failed");
            }
        }
        counters
    }
}

fn prepare_search_doc(record: &StreamEventRecord) -> Result<(String, Value), RecordFailure> {
    let envelope: CardEnvelope = decode_payload(record)?;
    let missing = envelope.missing_keys();
    if !missing.is_empty() {
        return Err(RecordFailure::MissingKeys(missing));
    }

    let card = envelope.data.ok_or(RecordFailure::MissingField("data"))?;
    let owner = envelope.owner.ok_or(RecordFailure::MissingField("owner"))?;
    let s3_key = envelope.s3_key.ok_or(RecordFailure::MissingField("s3_key"))?;
    let image_id = basename(&s3_key).to_string();

    let content_id = short_hash(&format!(
        "{}:{}:{}",
        lower_or_empty(&card.name),
        lower_or_empty(&card.email),
        lower_or_empty(&card.phone_number),
    ));
    let doc_id = short_hash(&image_id);
    let doc = SearchCard {
        card,
        doc_id: doc_id.clone(),
        image_id,
        owner,
        is_alive: 1,
        content_id,
    };
    Ok((doc_id, serde_json::to_value(&doc)?))
}

fn lower_or_empty(field: &Option<String>) -> String {
    field.as_deref().unwrap_or_default().to_lowercase()
}

/// Upserts one person vertex per card and links the card's owner to that
/// person with a `knows` edge.
pub struct GraphPipeline {
    graph: Arc<dyn GraphStore>,
}

impl GraphPipeline {
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self { graph }
    }

    pub async fn run(&self, batch: &StreamEventBatch) -> PipelineCounters {
        let run_id = Uuid::new_v4();
        let span = info_span!("graph_run", %run_id);
        let _guard = span.enter();

        let mut counters = PipelineCounters::default();
        for record in &batch.records {
            counters.reads += 1;
            match self.process(record).await {
                Ok(()) => counters.writes += 1,
                Err(err) => counters.absorb_failure(&record.sequence_number, err),
            }
        }
        info!(%counters, "graph batch finished");
        counters
    }

    async fn process(&self, record: &StreamEventRecord) -> Result<(), RecordFailure> {
        let envelope: CardEnvelope = decode_payload(record)?;
        let missing = envelope.missing_keys();
        if !missing.is_empty() {
            return Err(RecordFailure::MissingKeys(missing));
        }

        let card = envelope.data.ok_or(RecordFailure::MissingField("data"))?;
        let owner = envelope.owner.ok_or(RecordFailure::MissingField("owner"))?;
        let email = card.email.ok_or(RecordFailure::MissingField("email"))?;
        let name = card.name.ok_or(RecordFailure::MissingField("name"))?;
        let phone_number = card
            .phone_number
            .ok_or(RecordFailure::MissingField("phone_number"))?;
        let company = card.company.ok_or(RecordFailure::MissingField("company"))?;
        let job_title = card
            .job_title
            .ok_or(RecordFailure::MissingField("job_title"))?;

        let person = PersonRecord {
            id: short_hash(email_local_part(&email)),
            name,
            email,
            phone_number,
            company,
            job_title,
        };
        self.graph
            .upsert_vertex(PERSON_LABEL, &person.id, &person.property_map())
            .await?;

        let owner_id = short_hash(&owner);
        if owner_id == person.id {
            return Ok(());
        }
        if !self.graph.vertex_exists(&owner_id).await? {
            debug!(owner = %owner, "owner has no vertex yet, skipping edge");
            return Ok(());
        }
        self.link_with_retry(&owner_id, &person.id).await?;
        Ok(())
    }

    /// Create or refresh the owner edge, retrying transient graph errors
    /// before giving up on the record.
    async fn link_with_retry(&self, from: &str, to: &str) -> Result<(), StoreError> {
        let policy = RetryPolicy::edge_default();
        let mut last_error: Option<StoreError> = None;

        for attempt in 0..policy.max_attempts {
            let err = match self.link(from, to).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            if classify_store_error(&err) == RetryDisposition::NonRetryable {
                return Err(err);
            }
            warn!(attempt, error = %err, "owner edge upsert failed");
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

    async fn link(&self, from: &str, to: &str) -> Result<(), StoreError> {
        if self.graph.edge_exists(from, to, KNOWS_EDGE).await? {
            self.graph
                .update_edge_weight(from, to, KNOWS_EDGE, 1.0)
                .await
        } else {
            self.graph.add_edge(from, to, KNOWS_EDGE, 1.0).await
        }
    }
}

fn email_local_part(email: &str) -> &str {
    email.split('@').next().unwrap_or(email)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardbox_storage::memory::{
        MemoryGraph, MemoryObjectStore, MemorySearchIndex, MemoryStatusStore, MemoryStream,
        MemoryTextDetector,
    };
    use serde_json::json;

    fn encoded_record(payload: &Value) -> StreamEventRecord {
        StreamEventRecord {
            data: base64::engine::general_purpose::STANDARD.encode(payload.to_string()),
            ..Default::default()
        }
    }

    fn garbled_record() -> StreamEventRecord {
        StreamEventRecord {
            data: base64::engine::general_purpose::STANDARD.encode("{not json"),
            ..Default::default()
        }
    }

    fn envelope_record(owner: &str, key: &str, name: &str, email: &str) -> StreamEventRecord {
        encoded_record(&json!({
            "s3_bucket": "cards",
            "s3_key": key,
            "owner": owner,
            "data": {
                "company": "Amazon Web Services",
                "name": name,
                "job_title": "Solutions Architect",
                "email": email,
                "phone_number": "+82 10-1234-5678",
            }
        }))
    }

    fn card_lines() -> Vec<String> {
        [
            "Amazon Web Services",
            "Edy Kim",
            "Solutions Architect",
            "edy@amazon.com",
            "+82 10-1234-5678",
        ]
        .map(str::to_string)
        .to_vec()
    }

    struct ExtractRig {
        detector: Arc<MemoryTextDetector>,
        objects: Arc<MemoryObjectStore>,
        stream: Arc<MemoryStream>,
        status: Arc<MemoryStatusStore>,
        pipeline: ExtractPipeline,
    }

    fn extract_rig() -> ExtractRig {
        let detector = Arc::new(MemoryTextDetector::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let stream = Arc::new(MemoryStream::new());
        let status = Arc::new(MemoryStatusStore::new());
        let pipeline = ExtractPipeline::new(
            detector.clone(),
            objects.clone(),
            stream.clone(),
            status.clone(),
            FieldExtractor::new(),
            PipelineConfig::default(),
        );
        ExtractRig {
            detector,
            objects,
            stream,
            status,
            pipeline,
        }
    }

    #[test]
    fn config_defaults_cover_every_name() {
        let config = PipelineConfig::default();
        assert_eq!(config.img_stream, "cardbox-img");
        assert_eq!(config.text_stream, "cardbox-text");
        assert_eq!(config.status_table, "cardbox-image-status");
        assert_eq!(config.search_index, "cardbox_bizcard");
        assert_eq!(config.album_prefix, "bizcard-by-user");
    }

    #[test]
    fn counters_render_as_a_summary_line() {
        let counters = PipelineCounters {
            reads: 5,
            writes: 4,
            invalid: 0,
            errors: 1,
        };
        assert_eq!(counters.to_string(), "reads=5, writes=4, invalid=0, errors=1");
    }

    #[tokio::test]
    async fn intake_publishes_then_marks_start() {
        let stream = Arc::new(MemoryStream::new());
        let status = Arc::new(MemoryStatusStore::new());
        let pipeline =
            IntakePipeline::new(stream.clone(), status.clone(), PipelineConfig::default());
        let batch = ObjectEventBatch {
            records: vec![ObjectEventRecord {
                bucket: "cards".to_string(),
                key: "incoming/edy_0301.jpg".to_string(),
            }],
        };

        let counters = pipeline.run(&batch).await;
        assert_eq!(
            counters,
            PipelineCounters {
                reads: 1,
                writes: 1,
                invalid: 0,
                errors: 0
            }
        );

        let published = stream.published();
        assert_eq!(published[0].0, "cardbox-img");
        let record = &published[0].1[0];
        assert_eq!(
            record.partition_key,
            format!("part-{}", short_hash("incoming/edy_0301.jpg"))
        );
        let object: ObjectRef = serde_json::from_slice(&record.data).unwrap();
        assert_eq!(object.key, "incoming/edy_0301.jpg");

        let updates = status.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1, ProcessingStatus::Start);
        assert_eq!(updates[0].0.key, "incoming/edy_0301.jpg");
    }

    #[tokio::test]
    async fn intake_counts_status_failures_after_a_successful_publish() {
        let stream = Arc::new(MemoryStream::new());
        let status = Arc::new(MemoryStatusStore::new());
        status.fail_next(true);
        let pipeline =
            IntakePipeline::new(stream.clone(), status.clone(), PipelineConfig::default());
        let batch = ObjectEventBatch {
            records: vec![ObjectEventRecord {
                bucket: "cards".to_string(),
                key: "incoming/edy_0301.jpg".to_string(),
            }],
        };

        let counters = pipeline.run(&batch).await;
        assert_eq!(
            counters,
            PipelineCounters {
                reads: 1,
                writes: 0,
                invalid: 0,
                errors: 1
            }
        );
        assert_eq!(stream.published().len(), 1);
    }

    #[tokio::test]
    async fn extract_counts_a_garbled_record_as_an_error() {
        let rig = extract_rig();
        let mut records = Vec::new();
        for i in 0..5 {
            let key = format!("incoming/edy_{i}.jpg");
            rig.detector.insert(key.clone(), card_lines());
            records.push(encoded_record(
                &json!({"s3_bucket": "cards", "s3_key": key}),
            ));
        }
        records[2] = garbled_record();

        let counters = rig.pipeline.run(&StreamEventBatch { records }).await;

        assert_eq!(
            counters,
            PipelineCounters {
                reads: 5,
                writes: 4,
                invalid: 0,
                errors: 1
            }
        );
        assert_eq!(rig.stream.published().len(), 4);
        assert_eq!(rig.objects.copies().len(), 4);
    }

    #[tokio::test]
    async fn extract_publishes_envelopes_and_album_copies() {
        let rig = extract_rig();
        rig.detector.insert("incoming/edy_0301.jpg", card_lines());
        let batch = StreamEventBatch {
            records: vec![encoded_record(&json!({
                "s3_bucket": "cards",
                "s3_key": "incoming/edy_0301.jpg",
            }))],
        };

        let counters = rig.pipeline.run(&batch).await;
        assert_eq!(counters.writes, 1);

        let published = rig.stream.published();
        assert_eq!(published[0].0, "cardbox-text");
        let record = &published[0].1[0];
        assert_eq!(
            record.partition_key,
            format!("part-{}", short_hash("edy_0301.jpg"))
        );
        let envelope: CardEnvelope = serde_json::from_slice(&record.data).unwrap();
        assert_eq!(envelope.owner.as_deref(), Some("edy"));
        let fields = envelope.data.unwrap();
        assert_eq!(fields.email.as_deref(), Some("edy@amazon.com"));
        assert!(fields.created_at.is_some());

        let copies = rig.objects.copies();
        assert_eq!(copies[0].0.key, "incoming/edy_0301.jpg");
        assert_eq!(copies[0].1.key, "bizcard-by-user/edy/edy_0301.jpg");

        let updates = rig.status.updates();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].1, ProcessingStatus::Process);
        assert_eq!(updates[0].0.key, "incoming/edy_0301.jpg");
        assert_eq!(updates[1].1, ProcessingStatus::End);
        assert_eq!(updates[1].0.key, "bizcard-by-user/edy/edy_0301.jpg");
    }

    #[tokio::test]
    async fn extract_rejects_cards_with_too_few_lines() {
        let rig = extract_rig();
        rig.detector.insert(
            "incoming/edy_1.jpg",
            vec!["Amazon".to_string(), "Edy".to_string()],
        );
        let batch = StreamEventBatch {
            records: vec![encoded_record(&json!({
                "s3_bucket": "cards",
                "s3_key": "incoming/edy_1.jpg",
            }))],
        };

        let counters = rig.pipeline.run(&batch).await;
        assert_eq!(counters.errors, 1);
        assert_eq!(counters.writes, 0);

        let updates = rig.status.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1, ProcessingStatus::Process);
        assert!(rig.stream.published().is_empty());
        assert!(rig.objects.copies().is_empty());
    }

    #[tokio::test]
    async fn index_buffers_documents_into_one_bulk_write() {
        let search = Arc::new(MemorySearchIndex::new());
        let pipeline = IndexPipeline::new(search.clone(), PipelineConfig::default());
        let batch = StreamEventBatch {
            records: vec![
                envelope_record("edy", "incoming/edy_0301.jpg", "Edy Kim", "edy@amazon.com"),
                envelope_record("edy", "incoming/edy_0302.jpg", "Crong Lee", "crong@pororo.kr"),
                encoded_record(&json!({
                    "s3_bucket": "cards",
                    "s3_key": "incoming/x.jpg",
                    "owner": "edy",
                    "data": {},
                })),
            ],
        };

        let counters = pipeline.run(&batch).await;
        assert_eq!(
            counters,
            PipelineCounters {
                reads: 3,
                writes: 2,
                invalid: 1,
                errors: 0
            }
        );

        let bulks = search.bulks();
        assert_eq!(bulks.len(), 1);
        let (index, docs) = &bulks[0];
        assert_eq!(index, "cardbox_bizcard");
        assert_eq!(docs.len(), 2);

        let (doc_id, doc) = &docs[0];
        assert_eq!(doc_id, &short_hash("edy_0301.jpg"));
        assert_eq!(doc["doc_id"], json!(short_hash("edy_0301.jpg")));
        assert_eq!(doc["image_id"], json!("edy_0301.jpg"));
        assert_eq!(doc["owner"], json!("edy"));
        assert_eq!(doc["is_alive"], json!(1));
        assert_eq!(doc["name"], json!("Edy Kim"));
        assert_eq!(
            doc["content_id"],
            json!(short_hash("edy kim:edy@amazon.com:+82 10-1234-5678"))
        );
    }

    #[tokio::test]
    async fn index_reports_counters_even_when_the_bulk_write_fails() {
        let search = Arc::new(MemorySearchIndex::new());
        search.fail_next_bulk(true);
        let pipeline = IndexPipeline::new(search.clone(), PipelineConfig::default());
        let batch = StreamEventBatch {
            records: vec![envelope_record(
                "edy",
                "incoming/edy_0301.jpg",
                "Edy Kim",
                "edy@amazon.com",
            )],
        };

        let counters = pipeline.run(&batch).await;
        assert_eq!(
            counters,
            PipelineCounters {
                reads: 1,
                writes: 1,
                invalid: 0,
                errors: 0
            }
        );
        assert!(search.bulks().is_empty());
    }

    #[tokio::test]
    async fn index_counts_a_garbled_record_as_an_error() {
        let search = Arc::new(MemorySearchIndex::new());
        let pipeline = IndexPipeline::new(search.clone(), PipelineConfig::default());
        let mut records: Vec<StreamEventRecord> = (0..5)
            .map(|i| {
                envelope_record(
                    "edy",
                    &format!("incoming/edy_{i}.jpg"),
                    "Crong Lee",
                    "crong@pororo.kr",
                )
            })
            .collect();
        records[2] = garbled_record();

        let counters = pipeline.run(&StreamEventBatch { records }).await;

        assert_eq!(
            counters,
            PipelineCounters {
                reads: 5,
                writes: 4,
                invalid: 0,
                errors: 1
            }
        );
        let bulks = search.bulks();
        assert_eq!(bulks.len(), 1);
        assert_eq!(bulks[0].1.len(), 4);
    }

    #[tokio::test]
    async fn index_skips_the_bulk_write_when_nothing_survives() {
        let search = Arc::new(MemorySearchIndex::new());
        let pipeline = IndexPipeline::new(search.clone(), PipelineConfig::default());
        let batch = StreamEventBatch {
            records: vec![garbled_record()],
        };

        let counters = pipeline.run(&batch).await;
        assert_eq!(counters.errors, 1);
        assert!(search.bulks().is_empty());
    }

    #[tokio::test]
    async fn graph_links_owners_to_the_people_on_their_cards() {
        let graph = Arc::new(MemoryGraph::new());
        let pipeline = GraphPipeline::new(graph.clone());

        let counters = pipeline
            .run(&StreamEventBatch {
                records: vec![
                    envelope_record("edy", "incoming/edy_self.jpg", "Edy Kim", "edy@amazon.com"),
                    envelope_record("edy", "incoming/edy_0301.jpg", "Crong Lee", "crong@pororo.kr"),
                    envelope_record(
                        "stranger",
                        "incoming/stranger_1.jpg",
                        "Rody Park",
                        "rody@pororo.kr",
                    ),
                ],
            })
            .await;

        assert_eq!(
            counters,
            PipelineCounters {
                reads: 3,
                writes: 3,
                invalid: 0,
                errors: 0
            }
        );
        assert_eq!(graph.vertex_count(), 3);

        let edges = graph.edges();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].from, short_hash("edy"));
        assert_eq!(edges[0].to, short_hash("crong"));
        assert_eq!(edges[0].label, "knows");
        assert_eq!(edges[0].weight, 1.0);
    }

    #[tokio::test]
    async fn graph_refreshes_existing_edges_without_duplicating_them() {
        let graph = Arc::new(MemoryGraph::new());
        let pipeline = GraphPipeline::new(graph.clone());
        let own = envelope_record("edy", "incoming/edy_self.jpg", "Edy Kim", "edy@amazon.com");
        let card = envelope_record("edy", "incoming/edy_0301.jpg", "Crong Lee", "crong@pororo.kr");

        pipeline
            .run(&StreamEventBatch {
                records: vec![own, card.clone()],
            })
            .await;
        let counters = pipeline
            .run(&StreamEventBatch {
                records: vec![card],
            })
            .await;

        assert_eq!(counters.writes, 1);
        let edges = graph.edges();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].weight, 1.0);
    }

    #[tokio::test]
    async fn graph_retries_transient_edge_failures() {
        let graph = Arc::new(MemoryGraph::new());
        let pipeline = GraphPipeline::new(graph.clone());
        pipeline
            .run(&StreamEventBatch {
                records: vec![envelope_record(
                    "edy",
                    "incoming/edy_self.jpg",
                    "Edy Kim",
                    "edy@amazon.com",
                )],
            })
            .await;

        graph.fail_edge_ops(2);
        let counters = pipeline
            .run(&StreamEventBatch {
                records: vec![envelope_record(
                    "edy",
                    "incoming/edy_0301.jpg",
                    "Crong Lee",
                    "crong@pororo.kr",
                )],
            })
            .await;

        assert_eq!(
            counters,
            PipelineCounters {
                reads: 1,
                writes: 1,
                invalid: 0,
                errors: 0
            }
        );
        assert_eq!(graph.edges().len(), 1);
    }

    #[tokio::test]
    async fn graph_counts_a_record_as_failed_when_edge_retries_run_out() {
        let graph = Arc::new(MemoryGraph::new());
        let pipeline = GraphPipeline::new(graph.clone());
        pipeline
            .run(&StreamEventBatch {
                records: vec![envelope_record(
                    "edy",
                    "incoming/edy_self.jpg",
                    "Edy Kim",
                    "edy@amazon.com",
                )],
            })
            .await;

        graph.fail_edge_ops(10);
        let counters = pipeline
            .run(&StreamEventBatch {
                records: vec![envelope_record(
                    "edy",
                    "incoming/edy_0301.jpg",
                    "Crong Lee",
                    "crong@pororo.kr",
                )],
            })
            .await;

        assert_eq!(
            counters,
            PipelineCounters {
                reads: 1,
                writes: 0,
                invalid: 0,
                errors: 1
            }
        );
        assert!(graph.edges().is_empty());
    }

    #[tokio::test]
    async fn graph_requires_an_email_to_derive_the_person_id() {
        let graph = Arc::new(MemoryGraph::new());
        let pipeline = GraphPipeline::new(graph.clone());
        let record = encoded_record(&json!({
            "s3_bucket": "cards",
            "s3_key": "incoming/edy_1.jpg",
            "owner": "edy",
            "data": {"name": "Nameless Person"},
        }));

        let counters = pipeline
            .run(&StreamEventBatch {
                records: vec![record],
            })
            .await;
        assert_eq!(
            counters,
            PipelineCounters {
                reads: 1,
                writes: 0,
                invalid: 0,
                errors: 1
            }
        );
        assert_eq!(graph.vertex_count(), 0);
    }

    #[tokio::test]
    async fn graph_rejects_cards_missing_contact_fields() {
        let graph = Arc::new(MemoryGraph::new());
        let pipeline = GraphPipeline::new(graph.clone());
        // A card whose scan found no phone line parses fine upstream; the
        // graph stage still refuses it rather than storing blank properties.
        let record = encoded_record(&json!({
            "s3_bucket": "cards",
            "s3_key": "incoming/edy_1.jpg",
            "owner": "edy",
            "data": {"name": "Crong Lee", "email": "crong@pororo.kr"},
        }));

        let counters = pipeline
            .run(&StreamEventBatch {
                records: vec![record],
            })
            .await;
        assert_eq!(
            counters,
            PipelineCounters {
                reads: 1,
                writes: 0,
                invalid: 0,
                errors: 1
            }
        );
        assert_eq!(graph.vertex_count(), 0);
    }
}
