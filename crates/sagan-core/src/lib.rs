//! Core domain model, validation and error taxonomy for Sagan.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod tag_query;

pub const CRATE_NAME: &str = "sagan-core";

pub const EMAIL: &str = "email";
pub const FIRST_NAME: &str = "first_name";
pub const LAST_NAME: &str = "last_name";
pub const PHONE_NUMBER: &str = "phone_number";
pub const ADDRESS_LINE_1: &str = "address_line_1";
pub const ADDRESS_LINE_2: &str = "address_line_2";
pub const CITY: &str = "city";
pub const STATE_PROVINCE_REGION: &str = "state_province_region";
pub const POSTAL_CODE: &str = "postal_code";
pub const COUNTRY: &str = "country";
pub const CREATED_AT: &str = "created_at";
pub const UPDATED_AT: &str = "updated_at";
pub const TAGS: &str = "tags";
pub const TAGS_ARRAY: &str = "tags_array";

const CUSTOM_FIELDS: &str = "custom_fields";

static EMAIL_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email regex compiles"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    UpstreamError,
    ExportStartFailed,
    ExportTimeout,
    DownloadFailed,
    DecompressFailed,
    ParseError,
    ConfigurationError,
    TransportError,
    CacheError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::UpstreamError => "upstream_error",
            Self::ExportStartFailed => "export_start_failed",
            Self::ExportTimeout => "export_timeout",
            Self::DownloadFailed => "download_failed",
            Self::DecompressFailed => "decompress_failed",
            Self::ParseError => "parse_error",
            Self::ConfigurationError => "configuration_error",
            Self::TransportError => "transport_error",
            Self::CacheError => "cache_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every failure a Sagan operation can report to its caller.
#[derive(Debug, Error)]
pub enum SaganError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("upstream platform returned status {status_code}: {raw_body}")]
    Upstream { status_code: u16, raw_body: String },
    #[error("export could not be started: {0}")]
    ExportStartFailed(String),
    #[error(
        "export not ready after {attempts} status checks (last status: {})",
        .last_status.as_deref().unwrap_or("unknown")
    )]
    ExportTimeout {
        attempts: u32,
        last_status: Option<String>,
    },
    #[error("download failed: {message}")]
    DownloadFailed {
        status_code: Option<u16>,
        message: String,
    },
    #[error("decompressing export payload failed: {0}")]
    DecompressFailed(#[source] std::io::Error),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("cache error: {0}")]
    Cache(String),
}

impl SaganError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::ValidationError,
            Self::Upstream { .. } => ErrorKind::UpstreamError,
            Self::ExportStartFailed(_) => ErrorKind::ExportStartFailed,
            Self::ExportTimeout { .. } => ErrorKind::ExportTimeout,
            Self::DownloadFailed { .. } => ErrorKind::DownloadFailed,
            Self::DecompressFailed(_) => ErrorKind::DecompressFailed,
            Self::Parse(_) => ErrorKind::ParseError,
            Self::Configuration(_) => ErrorKind::ConfigurationError,
            Self::Transport(_) => ErrorKind::TransportError,
            Self::Cache(_) => ErrorKind::CacheError,
        }
    }

    /// HTTP status the JSON surface answers with for this failure.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Upstream { status_code, .. } if (400..=599).contains(status_code) => *status_code,
            Self::Upstream { .. } => 502,
            Self::ExportTimeout { .. } => 408,
            Self::DownloadFailed {
                status_code: Some(code),
                ..
            } if (400..=599).contains(code) => *code,
            Self::DownloadFailed { .. } | Self::Transport(_) => 502,
            Self::ExportStartFailed(_)
            | Self::DecompressFailed(_)
            | Self::Parse(_)
            | Self::Configuration(_)
            | Self::Cache(_) => 500,
        }
    }
}

pub type SaganResult<T> = Result<T, SaganError>;

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_SHAPE.is_match(email)
}

/// Shape check only; full RFC 5322 validation is left to the platform.
pub fn validate_email(email: &str) -> SaganResult<&str> {
    let trimmed = email.trim();
    if trimmed.is_empty() {
        return Err(SaganError::validation("email is required"));
    }
    if !is_valid_email(trimmed) {
        return Err(SaganError::validation(format!(
            "invalid email format: {trimmed}"
        )));
    }
    Ok(trimmed)
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    List(Vec<String>),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::Text(_) => None,
            Self::List(items) => Some(items),
        }
    }

    pub fn display(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::List(items) => items.join(", "),
        }
    }

    fn from_json(value: JsonValue) -> Option<Self> {
        match value {
            JsonValue::Null => None,
            JsonValue::String(text) => Some(Self::Text(text)),
            JsonValue::Array(items) => Some(Self::List(
                items
                    .into_iter()
                    .filter_map(|item| match item {
                        JsonValue::Null => None,
                        JsonValue::String(text) => Some(text),
                        other => Some(other.to_string()),
                    })
                    .collect(),
            )),
            other @ (JsonValue::Bool(_) | JsonValue::Number(_) | JsonValue::Object(_)) => {
                Some(Self::Text(other.to_string()))
            }
        }
    }
}

/// One contact as field name -> value. `email` is the natural upsert key but a
/// record without one is still a valid (read-only) listing row.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContactRecord {
    fields: BTreeMap<String, FieldValue>,
}

impl ContactRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a record from one exported JSON object. Nested `custom_fields`
    /// are flattened next to the reserved fields without overwriting them.
    pub fn from_json_object(object: serde_json::Map<String, JsonValue>) -> Self {
        let mut record = Self::new();
        let mut custom = None;
        for (key, value) in object {
            if key == CUSTOM_FIELDS {
                if let JsonValue::Object(inner) = value {
                    custom = Some(inner);
                    continue;
                }
            }
            if let Some(value) = FieldValue::from_json(value) {
                record.fields.insert(key, value);
            }
        }
        for (key, value) in custom.into_iter().flatten() {
            if record.fields.contains_key(&key) {
                continue;
            }
            if let Some(value) = FieldValue::from_json(value) {
                record.fields.insert(key, value);
            }
        }
        record
    }

    pub fn insert(&mut self, key: impl Into<String>, value: FieldValue) {
        self.fields.insert(key.into(), value);
    }

    pub fn insert_text(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.insert(key, FieldValue::Text(value.into()));
    }

    pub fn insert_list(&mut self, key: impl Into<String>, values: Vec<String>) {
        self.insert(key, FieldValue::List(values));
    }

    pub fn remove(&mut self, key: &str) -> Option<FieldValue> {
        self.fields.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(FieldValue::as_text)
    }

    pub fn email(&self) -> Option<&str> {
        self.text(EMAIL).map(str::trim).filter(|e| !e.is_empty())
    }

    pub fn has_email(&self) -> bool {
        self.email().is_some()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Tag list for display: the parsed `tags_array` when present, otherwise
    /// the `tags` field read as a list or as comma-separated text.
    pub fn tag_list(&self) -> Vec<String> {
        if let Some(list) = self.get(TAGS_ARRAY).and_then(FieldValue::as_list) {
            return list.to_vec();
        }
        match self.get(TAGS) {
            Some(FieldValue::List(items)) => items.clone(),
            Some(FieldValue::Text(text)) => split_comma_tags(text),
            None => Vec::new(),
        }
    }

    /// Replaces the tag text and the derived list together.
    pub fn set_tags_text(&mut self, tags: &str) {
        self.insert_text(TAGS, tags);
        self.insert_list(TAGS_ARRAY, split_comma_tags(tags));
    }

    fn matches_term(&self, needle: &str) -> bool {
        [EMAIL, FIRST_NAME, LAST_NAME]
            .iter()
            .filter_map(|key| self.text(key))
            .any(|value| value.to_lowercase().contains(needle))
            || self
                .tag_list()
                .iter()
                .any(|tag| tag.to_lowercase().contains(needle))
    }
}

pub fn split_comma_tags(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Case-insensitive substring search over email, names and tags.
pub fn search_contacts<'a>(records: &'a [ContactRecord], term: &str) -> Vec<&'a ContactRecord> {
    let needle = term.trim().to_lowercase();
    if needle.is_empty() {
        return records.iter().collect();
    }
    records
        .iter()
        .filter(|record| record.matches_term(&needle))
        .collect()
}

/// Distinct tag vocabulary across records, sorted.
pub fn collect_tags(records: &[ContactRecord]) -> Vec<String> {
    records
        .iter()
        .flat_map(ContactRecord::tag_list)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ExportStatus {
    Pending,
    Ready,
    Failed,
    Other(String),
}

impl ExportStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Other(raw) => raw,
        }
    }
}

impl From<String> for ExportStatus {
    fn from(raw: String) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "pending" => Self::Pending,
            "ready" => Self::Ready,
            "failed" | "failure" => Self::Failed,
            _ => Self::Other(raw),
        }
    }
}

impl From<ExportStatus> for String {
    fn from(status: ExportStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for ExportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Platform-side bulk export request, as reported by the export status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportJob {
    pub id: String,
    pub status: ExportStatus,
    #[serde(default, deserialize_with = "null_as_default")]
    pub urls: Vec<String>,
}

impl ExportJob {
    pub fn is_ready(&self) -> bool {
        self.status == ExportStatus::Ready && !self.urls.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobErrorSummary {
    pub errored_count: u64,
    pub requested_count: u64,
    pub error_details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Normalized view of an asynchronous contact import (upsert) job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: String,
    pub status: String,
    pub requested_count: u64,
    pub created_count: u64,
    pub updated_count: u64,
    pub errored_count: u64,
    pub errors_url: Option<String>,
    pub error_info: Option<JobErrorSummary>,
    pub raw: JsonValue,
}

/// Locally tracked submission job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingJob {
    pub job_id: String,
    pub emails: Vec<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error_info: Option<JobErrorSummary>,
}

impl PendingJob {
    pub fn new(job_id: impl Into<String>, emails: Vec<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            emails,
            name: None,
            created_at,
            status: None,
            error_info: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: String,
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub query_dsl: String,
    /// Best-effort reverse parse of `query_dsl`; never sent back to the platform.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub contacts_count: u64,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default, alias = "sample_updated_at")]
    pub refreshed_at: Option<String>,
}

impl Segment {
    pub fn with_decoded_tags(mut self) -> Self {
        self.tags = tag_query::decode(&self.query_dsl).into_iter().collect();
        self
    }

    pub fn summary(&self) -> SegmentSummary {
        SegmentSummary {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSummary {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomFieldDefinition {
    pub id: String,
    pub name: String,
    pub field_type: String,
    pub key: String,
}

impl CustomFieldDefinition {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        field_type: impl Into<String>,
    ) -> Self {
        let id = id.into();
        let key = format!("cf_{id}");
        Self {
            id,
            name: name.into(),
            field_type: field_type.into(),
            key,
        }
    }
}

/// Contact submission as entered by staff; field names are Sagan's, not the platform's.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactInput {
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address_line1: Option<String>,
    #[serde(default)]
    pub address_line2: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ContactInput {
    pub fn display_name(&self) -> Option<String> {
        let name = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        (!name.is_empty()).then_some(name)
    }

    /// Tags in the scalar text form the platform stores.
    pub fn tags_text(&self) -> String {
        self.tags
            .iter()
            .map(|tag| tag.trim())
            .filter(|tag| !tag.is_empty())
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagUpdate {
    pub email: String,
    pub tags: String,
}

impl TagUpdate {
    /// Validates an untyped batch in full before anything is sent; one bad
    /// entry rejects the whole batch.
    pub fn validate_batch(raw: &[JsonValue]) -> SaganResult<Vec<TagUpdate>> {
        if raw.is_empty() {
            return Err(SaganError::validation("no updates provided"));
        }
        raw.iter()
            .enumerate()
            .map(|(index, entry)| {
                let email = entry
                    .get(EMAIL)
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| {
                        SaganError::validation(format!("update {index}: email must be a string"))
                    })?;
                let email = validate_email(email).map_err(|_| {
                    SaganError::validation(format!("update {index}: invalid email format"))
                })?;
                let tags = entry.get(TAGS).and_then(JsonValue::as_str).ok_or_else(|| {
                    SaganError::validation(format!(
                        "update {index}: tags must be a comma-separated string"
                    ))
                })?;
                Ok(TagUpdate {
                    email: email.to_string(),
                    tags: tags.to_string(),
                })
            })
            .collect()
    }
}
