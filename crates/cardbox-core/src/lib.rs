//! Core domain model for cardbox: card fields, event batch shapes,
//! processing status, and identity derivation helpers.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "cardbox-core";

/// Location of an object in the card image store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    #[serde(rename = "s3_bucket")]
    pub bucket: String,
    #[serde(rename = "s3_key")]
    pub key: String,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Final path segment of the key; the image id under which status rows
    /// and search documents are addressed.
    pub fn image_id(&self) -> &str {
        basename(&self.key)
    }
}

/// Final path segment of an object key.
pub fn basename(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Owner account encoded in the upload filename (`{owner}_{rest}` under any
/// prefix).
pub fn owner_from_key(key: &str) -> &str {
    let name = basename(key);
    name.split('_').next().unwrap_or(name)
}

/// First 8 hex chars of the sha256 of `input`; the compact id form used for
/// documents, vertices, cache keys, and stream partition keys.
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..4])
}

/// Status-table modification timestamp, numeric `%Y%m%d%H%M%S` in UTC.
pub fn status_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M%S").to_string()
}

/// Card creation timestamp, `%Y-%m-%dT%H:%M:%SZ` in UTC.
pub fn card_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Lifecycle states recorded in the status table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessingStatus {
    Start,
    Process,
    End,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Start => "START",
            ProcessingStatus::Process => "PROCESS",
            ProcessingStatus::End => "END",
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields extracted from a card image, as carried in the `data` object on
/// the text stream. All fields are optional on the wire; extraction always
/// fills the three positional fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl CardFields {
    /// True when no field carries a value; envelope validation treats an
    /// all-empty `data` object the same as an absent one.
    pub fn is_empty(&self) -> bool {
        self.company.is_none()
            && self.name.is_none()
            && self.job_title.is_none()
            && self.email.is_none()
            && self.phone_number.is_none()
            && self.addr.is_none()
            && self.created_at.is_none()
    }
}

/// Record published to the text stream after extraction and consumed by the
/// indexing and graph pipelines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<CardFields>,
}

impl CardEnvelope {
    /// Required keys that are missing or empty. Downstream pipelines count a
    /// record with any missing key as invalid rather than failing it.
    pub fn missing_keys(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.data.as_ref().map_or(true, CardFields::is_empty) {
            missing.push("data");
        }
        if self.owner.as_deref().map_or(true, str::is_empty) {
            missing.push("owner");
        }
        if self.s3_key.as_deref().map_or(true, str::is_empty) {
            missing.push("s3_key");
        }
        missing
    }
}

/// Document indexed into the search engine: card fields plus derived ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchCard {
    #[serde(flatten)]
    pub card: CardFields,
    pub doc_id: String,
    pub image_id: String,
    pub owner: String,
    pub is_alive: u8,
    pub content_id: String,
}

/// Vertex label for people in the graph.
pub const PERSON_LABEL: &str = "person";

/// Edge label linking a card's owner to the person on the card.
pub const KNOWS_EDGE: &str = "knows";

/// A person vertex upserted into the graph, one per card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonRecord {
    pub id: String,
    pub name: String,
    pub email: String,
    pub phone_number: String,
    pub company: String,
    pub job_title: String,
}

impl PersonRecord {
    /// Graph property map, including the lowercased `_name` lookup key.
    pub fn property_map(&self) -> BTreeMap<String, String> {
        let mut props = BTreeMap::new();
        props.insert("id".to_string(), self.id.clone());
        props.insert("name".to_string(), self.name.clone());
        props.insert("email".to_string(), self.email.clone());
        props.insert("phone_number".to_string(), self.phone_number.clone());
        props.insert("company".to_string(), self.company.clone());
        props.insert("job_title".to_string(), self.job_title.clone());
        props.insert("_name".to_string(), self.name.to_lowercase());
        props
    }
}

/// One record of a stream-fed batch; `data` is the base64-encoded payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEventRecord {
    pub data: String,
    #[serde(default)]
    pub partition_key: String,
    #[serde(default)]
    pub sequence_number: String,
}

/// Ordered batch handed to the stream-fed pipelines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEventBatch {
    pub records: Vec<StreamEventRecord>,
}

/// One object-created notification from the image store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEventRecord {
    pub bucket: String,
    pub key: String,
}

impl ObjectEventRecord {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(&self.bucket, &self.key)
    }
}

/// Ordered batch of object-created notifications for the intake pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEventBatch {
    pub records: Vec<ObjectEventRecord>,
}
