//! Request/response mapping between Sagan and the marketing-contacts platform.

use std::path::PathBuf;
use std::time::Duration;

use sagan_core::{
    tag_query, validate_email, ContactInput, CustomFieldDefinition, JobErrorSummary, JobStatus,
    SaganError, SaganResult, Segment, SegmentSummary, TagUpdate, ADDRESS_LINE_1, ADDRESS_LINE_2,
    CITY, COUNTRY, EMAIL, FIRST_NAME, LAST_NAME, PHONE_NUMBER, POSTAL_CODE,
    STATE_PROVINCE_REGION,
};
use sagan_export::{ExportPipeline, ExportReport, ParsedExport, PollPolicy, ReadyExport};
use sagan_storage::{HttpClientConfig, UpstreamClient, DEFAULT_API_BASE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use tracing::{info, warn};

pub mod directory;

pub use directory::{ContactDirectory, ContactListing};

pub const CRATE_NAME: &str = "sagan-gateway";

const CONTACTS_PATH: &str = "/v3/marketing/contacts";
const SEARCH_EMAILS_PATH: &str = "/v3/marketing/contacts/search/emails";
const IMPORTS_PATH: &str = "/v3/marketing/contacts/imports";
const FIELD_DEFINITIONS_PATH: &str = "/v3/marketing/field_definitions";
const SEGMENTS_PATH: &str = "/v3/marketing/segments/2.0";

const JOB_ERROR_DETAILS: &str = "There were errors processing this contact. \
    Check the errors_url in the full response for details.";
const JOB_FAILED_MESSAGE: &str = "The contact submission failed. \
    This could be due to invalid field formats or missing required data.";
const JOB_PENDING_MESSAGE: &str =
    "There were some errors with the submission, but it might still be processing.";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub tags_field: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub cache_dir: PathBuf,
    pub poll_attempts: u32,
    pub poll_interval_ms: u64,
    pub web_port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_API_BASE.to_string(),
            tags_field: "tags".to_string(),
            http_timeout_secs: 20,
            user_agent: "sagan/0.1".to_string(),
            cache_dir: PathBuf::from("./.sagan-cache"),
            poll_attempts: 10,
            poll_interval_ms: 1000,
            web_port: 8000,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: std::env::var("SENDGRID_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            api_base: std::env::var("SENDGRID_API_BASE").unwrap_or(defaults.api_base),
            tags_field: std::env::var("SENDGRID_TAGS_FIELD")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.tags_field),
            http_timeout_secs: env_parse("SAGAN_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: std::env::var("SAGAN_USER_AGENT").unwrap_or(defaults.user_agent),
            cache_dir: std::env::var("SAGAN_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            poll_attempts: env_parse("SAGAN_EXPORT_POLL_ATTEMPTS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.poll_attempts),
            poll_interval_ms: env_parse("SAGAN_EXPORT_POLL_INTERVAL_MS")
                .unwrap_or(defaults.poll_interval_ms),
            web_port: env_parse("SAGAN_WEB_PORT").unwrap_or(defaults.web_port),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            base_url: self.api_base.clone(),
            api_key: self.api_key.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            max_attempts: self.poll_attempts,
            interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmailLookup {
    pub exists: bool,
    pub contact: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedTagUpdates {
    pub job_id: String,
    pub updates: Vec<TagUpdate>,
}

#[derive(Debug, Deserialize)]
struct RawFieldDefinition {
    id: String,
    name: String,
    #[serde(default)]
    field_type: String,
}

/// Every operation validates its input before the first network call and
/// surfaces non-2xx answers as [`SaganError::Upstream`] without retrying.
#[derive(Debug, Clone)]
pub struct Gateway {
    upstream: UpstreamClient,
    tags_field: String,
    poll: PollPolicy,
}

impl Gateway {
    pub fn new(config: &GatewayConfig) -> SaganResult<Self> {
        let upstream = UpstreamClient::new(config.http_client_config())?;
        Ok(Self::from_parts(
            upstream,
            config.tags_field.clone(),
            config.poll_policy(),
        ))
    }

    pub fn from_parts(upstream: UpstreamClient, tags_field: String, poll: PollPolicy) -> Self {
        Self {
            upstream,
            tags_field,
            poll,
        }
    }

    pub fn upstream(&self) -> &UpstreamClient {
        &self.upstream
    }

    pub fn tags_field(&self) -> &str {
        &self.tags_field
    }

    /// Creates or updates one contact and returns the platform's import job id.
    /// Blank optional fields are left out so they never clear stored values.
    pub async fn upsert_contact(&self, input: &ContactInput) -> SaganResult<String> {
        let email = validate_email(&input.email)?;

        let mut contact = Map::new();
        contact.insert(EMAIL.into(), json!(email));
        for (key, value) in [
            (FIRST_NAME, &input.first_name),
            (LAST_NAME, &input.last_name),
            (PHONE_NUMBER, &input.phone),
            (ADDRESS_LINE_1, &input.address_line1),
            (ADDRESS_LINE_2, &input.address_line2),
            (CITY, &input.city),
            (STATE_PROVINCE_REGION, &input.state),
            (POSTAL_CODE, &input.postal_code),
            (COUNTRY, &input.country),
        ] {
            if let Some(value) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                contact.insert(key.into(), json!(value));
            }
        }
        let tags = input.tags_text();
        if !tags.is_empty() {
            contact.insert("custom_fields".into(), self.tags_payload(&tags));
        }

        info!(email, "submitting contact");
        self.put_contacts(vec![JsonValue::Object(contact)]).await
    }

    /// Assigns the same tag text to every listed contact in one batch.
    pub async fn set_tags(&self, emails: &[String], tags: &str) -> SaganResult<String> {
        if emails.is_empty() {
            return Err(SaganError::validation("no emails provided"));
        }
        let updates = emails
            .iter()
            .map(|email| {
                Ok(TagUpdate {
                    email: validate_email(email)?.to_string(),
                    tags: tags.to_string(),
                })
            })
            .collect::<SaganResult<Vec<_>>>()?;
        self.submit_tag_updates(&updates).await
    }

    /// Validates the whole untyped batch, then sends it as a single upsert.
    pub async fn bulk_update_tags(&self, raw: &[JsonValue]) -> SaganResult<SubmittedTagUpdates> {
        let updates = TagUpdate::validate_batch(raw)?;
        let job_id = self.submit_tag_updates(&updates).await?;
        Ok(SubmittedTagUpdates { job_id, updates })
    }

    pub async fn submit_tag_updates(&self, updates: &[TagUpdate]) -> SaganResult<String> {
        if updates.is_empty() {
            return Err(SaganError::validation("no updates provided"));
        }
        let contacts = updates
            .iter()
            .map(|update| {
                json!({
                    "email": update.email,
                    "custom_fields": self.tags_payload(&update.tags),
                })
            })
            .collect::<Vec<_>>();
        info!(count = updates.len(), "submitting tag updates");
        self.put_contacts(contacts).await
    }

    fn tags_payload(&self, tags: &str) -> JsonValue {
        let mut fields = Map::new();
        fields.insert(self.tags_field.clone(), json!(tags));
        JsonValue::Object(fields)
    }

    async fn put_contacts(&self, contacts: Vec<JsonValue>) -> SaganResult<String> {
        let response = self
            .upstream
            .put_json(CONTACTS_PATH, &json!({ "contacts": contacts }))
            .await?;
        response
            .str_field("job_id")
            .map(ToString::to_string)
            .ok_or_else(|| SaganError::Parse("upsert response carried no job_id".into()))
    }

    /// Exact lookup by email. A platform 404 means the address is unknown.
    pub async fn check_email_exists(&self, email: &str) -> SaganResult<EmailLookup> {
        let email = validate_email(email)?;
        let response = match self
            .upstream
            .post_json(SEARCH_EMAILS_PATH, &json!({ "emails": [email] }))
            .await
        {
            Ok(response) => response,
            Err(SaganError::Upstream {
                status_code: 404, ..
            }) => {
                return Ok(EmailLookup {
                    exists: false,
                    contact: None,
                })
            }
            Err(err) => return Err(err),
        };
        let contact = matched_contact(&response.body, email);
        Ok(EmailLookup {
            exists: contact.is_some(),
            contact,
        })
    }

    pub async fn get_job_status(&self, job_id: &str) -> SaganResult<JobStatus> {
        let job_id = path_id("job_id", job_id)?;
        let response = self
            .upstream
            .get_json(&format!("{IMPORTS_PATH}/{job_id}"))
            .await?;
        Ok(job_status_from(job_id, response.body))
    }

    pub async fn list_segments(&self) -> SaganResult<Vec<Segment>> {
        let response = self.upstream.get_json(SEGMENTS_PATH).await?;
        let results = response
            .body
            .get("results")
            .cloned()
            .unwrap_or_else(|| JsonValue::Array(Vec::new()));
        let segments: Vec<Segment> = serde_json::from_value(results)
            .map_err(|e| SaganError::Parse(format!("segment list payload: {e}")))?;
        Ok(segments.into_iter().map(Segment::with_decoded_tags).collect())
    }

    pub async fn get_segment(&self, segment_id: &str) -> SaganResult<Segment> {
        let segment_id = path_id("segment id", segment_id)?;
        let response = self
            .upstream
            .get_json(&format!("{SEGMENTS_PATH}/{segment_id}"))
            .await?;
        let segment: Segment = serde_json::from_value(response.body)
            .map_err(|e| SaganError::Parse(format!("segment payload: {e}")))?;
        Ok(segment.with_decoded_tags())
    }

    pub async fn create_segment(&self, name: &str, tags: &[String]) -> SaganResult<SegmentSummary> {
        let body = segment_body(name, tags)?;
        let response = self.upstream.post_json(SEGMENTS_PATH, &body).await?;
        let id = response
            .str_field("id")
            .ok_or_else(|| SaganError::Parse("segment create response carried no id".into()))?;
        info!(segment_id = id, "segment created");
        Ok(SegmentSummary {
            id: id.to_string(),
            name: name.trim().to_string(),
        })
    }

    pub async fn update_segment(
        &self,
        segment_id: &str,
        name: &str,
        tags: &[String],
    ) -> SaganResult<SegmentSummary> {
        let segment_id = path_id("segment id", segment_id)?;
        let body = segment_body(name, tags)?;
        self.upstream
            .patch_json(&format!("{SEGMENTS_PATH}/{segment_id}"), &body)
            .await?;
        Ok(SegmentSummary {
            id: segment_id.to_string(),
            name: name.trim().to_string(),
        })
    }

    pub async fn delete_segment(&self, segment_id: &str) -> SaganResult<()> {
        let segment_id = path_id("segment id", segment_id)?;
        self.upstream
            .delete(&format!("{SEGMENTS_PATH}/{segment_id}"))
            .await?;
        Ok(())
    }

    /// Asks the platform to re-evaluate a segment; returns its job id if any.
    pub async fn refresh_segment(
        &self,
        segment_id: &str,
        user_time_zone: Option<&str>,
    ) -> SaganResult<Option<String>> {
        let segment_id = path_id("segment id", segment_id)?;
        let time_zone = user_time_zone
            .map(str::trim)
            .filter(|tz| !tz.is_empty())
            .unwrap_or("UTC");
        let response = self
            .upstream
            .post_json(
                &format!("{SEGMENTS_PATH}/refresh/{segment_id}"),
                &json!({ "user_time_zone": time_zone }),
            )
            .await?;
        Ok(response.str_field("job_id").map(ToString::to_string))
    }

    pub async fn list_custom_fields(&self) -> SaganResult<Vec<CustomFieldDefinition>> {
        let response = self.upstream.get_json(FIELD_DEFINITIONS_PATH).await?;
        let raw = response
            .body
            .get("custom_fields")
            .cloned()
            .unwrap_or_else(|| JsonValue::Array(Vec::new()));
        let fields: Vec<RawFieldDefinition> = serde_json::from_value(raw)
            .map_err(|e| SaganError::Parse(format!("field definitions payload: {e}")))?;
        Ok(fields
            .into_iter()
            .map(|f| CustomFieldDefinition::new(f.id, f.name, f.field_type))
            .collect())
    }

    fn export_pipeline(&self) -> ExportPipeline<UpstreamClient> {
        ExportPipeline::new(self.upstream.clone()).with_policy(self.poll)
    }

    /// Starts an export and waits for its result URLs.
    pub async fn get_all_contacts(&self) -> SaganResult<ReadyExport> {
        self.export_pipeline().start_and_wait().await
    }

    pub async fn download_contacts(&self, url: &str) -> SaganResult<ParsedExport> {
        if url.trim().is_empty() {
            return Err(SaganError::validation("url is required"));
        }
        self.export_pipeline().download_and_parse(url.trim()).await
    }

    pub async fn fetch_all_contacts(&self) -> SaganResult<ExportReport> {
        self.export_pipeline().run().await
    }
}

fn path_id<'a>(what: &str, id: &'a str) -> SaganResult<&'a str> {
    let id = id.trim();
    if id.is_empty() {
        return Err(SaganError::validation(format!("{what} is required")));
    }
    if id.contains(['/', '?', '#']) {
        return Err(SaganError::validation(format!("invalid {what}: {id}")));
    }
    Ok(id)
}

fn segment_body(name: &str, tags: &[String]) -> SaganResult<JsonValue> {
    let name = name.trim();
    if name.is_empty() {
        return Err(SaganError::validation("segment name is required"));
    }
    let query_dsl = tag_query::encode(tags)?;
    Ok(json!({ "name": name, "query_dsl": query_dsl }))
}

/// Accepts both the keyed-by-email and the list-shaped lookup answers.
fn matched_contact(body: &JsonValue, email: &str) -> Option<JsonValue> {
    match body.get("result")? {
        JsonValue::Object(by_email) => by_email
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(email))
            .and_then(|(_, entry)| entry.get("contact"))
            .cloned(),
        JsonValue::Array(matches) => matches.iter().find_map(|m| m.get("contact")).cloned(),
        _ => None,
    }
}

fn job_status_from(job_id: &str, body: JsonValue) -> JobStatus {
    let status = body
        .get("status")
        .and_then(JsonValue::as_str)
        .unwrap_or("unknown")
        .to_string();
    let results = body.get("results");
    let count = |key: &str| {
        results
            .and_then(|r| r.get(key))
            .and_then(JsonValue::as_u64)
            .unwrap_or(0)
    };
    let errored_count = count("errored_count");
    let requested_count = count("requested_count");

    let error_info = (errored_count > 0).then(|| JobErrorSummary {
        errored_count,
        requested_count,
        error_details: JOB_ERROR_DETAILS.to_string(),
        error_message: match status.as_str() {
            "failed" => Some(JOB_FAILED_MESSAGE.to_string()),
            "pending" => Some(JOB_PENDING_MESSAGE.to_string()),
            _ => None,
        },
    });
    if error_info.is_some() {
        warn!(job_id, errored_count, requested_count, "import job reported errors");
    }

    JobStatus {
        job_id: job_id.to_string(),
        requested_count,
        created_count: count("created_count"),
        updated_count: count("updated_count"),
        errored_count,
        errors_url: results
            .and_then(|r| r.get("errors_url"))
            .and_then(JsonValue::as_str)
            .map(ToString::to_string),
        error_info,
        status,
        raw: body,
    }
}
