//! JSON request/response surface for Sagan over axum.
//!
//! Every handler answers `{"success": true, ...}` or
//! `{"success": false, "error": "...", "kind": "..."}` with the status code
//! mapped from the error kind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use sagan_core::{search_contacts, validate_email, ContactInput, SaganError, SaganResult};
use sagan_gateway::{ContactDirectory, Gateway, GatewayConfig};
use sagan_storage::{FileCache, LocalCache};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "sagan-web";

pub struct AppState {
    pub directory: ContactDirectory,
    refreshing: AtomicBool,
}

impl AppState {
    pub fn new(directory: ContactDirectory) -> Self {
        Self {
            directory,
            refreshing: AtomicBool::new(false),
        }
    }

    fn begin_refresh(self: &Arc<Self>) -> Option<RefreshGuard> {
        if self.refreshing.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(RefreshGuard(Arc::clone(self)))
    }

    /// At most one background refresh runs at a time.
    fn spawn_background_refresh(self: &Arc<Self>) {
        let Some(guard) = self.begin_refresh() else {
            return;
        };
        tokio::spawn(async move {
            match guard.0.directory.refresh().await {
                Ok(listing) => {
                    info!(count = listing.contacts.len(), "background contact refresh done")
                }
                Err(err) => warn!(error = %err, "background contact refresh failed"),
            }
        });
    }
}

/// Clears the in-flight refresh flag when dropped, including on panic.
struct RefreshGuard(Arc<AppState>);

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.0.refreshing.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct ApiError(SaganError);

impl From<SaganError> for ApiError {
    fn from(err: SaganError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(kind = %self.0.kind(), error = %self.0, "request failed");
        } else {
            warn!(kind = %self.0.kind(), error = %self.0, "request rejected");
        }
        (
            status,
            Json(json!({
                "success": false,
                "error": self.0.to_string(),
                "kind": self.0.kind(),
            })),
        )
            .into_response()
    }
}

type ApiResult = Result<Json<JsonValue>, ApiError>;
type Payload = Result<Json<JsonValue>, JsonRejection>;

fn json_body(payload: Payload) -> Result<JsonValue, ApiError> {
    payload.map(|Json(value)| value).map_err(|rejection| {
        SaganError::validation(format!("invalid request body: {}", rejection.body_text())).into()
    })
}

fn typed_body<T: DeserializeOwned>(payload: Payload) -> Result<T, ApiError> {
    serde_json::from_value(json_body(payload)?)
        .map_err(|e| SaganError::validation(format!("invalid request body: {e}")).into())
}

fn string_list(value: Option<&JsonValue>, what: &str) -> SaganResult<Vec<String>> {
    let items = value
        .and_then(JsonValue::as_array)
        .filter(|items| !items.is_empty())
        .ok_or_else(|| SaganError::validation(format!("no {what} provided")))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(ToString::to_string)
                .ok_or_else(|| SaganError::validation(format!("{what} must be strings")))
        })
        .collect()
}

#[derive(Debug, Deserialize, Default)]
struct ContactsQuery {
    search: Option<String>,
    refresh: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct StatusQuery {
    job_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SegmentForm {
    #[serde(default)]
    name: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ColumnsForm {
    columns: Vec<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/contacts", post(create_contact).get(list_contacts))
        .route("/api/contacts/check-email", post(check_email))
        .route("/api/contacts/update-tags", post(update_tags))
        .route("/api/contacts/bulk-update-tags", post(bulk_update_tags))
        .route("/api/contacts/status", get(job_status))
        .route("/api/contacts/custom-fields", get(custom_fields))
        .route("/api/contacts/get-all", get(get_all_contacts))
        .route("/api/contacts/download", post(download_contacts))
        .route("/api/contacts/tags", get(tag_vocabulary))
        .route("/api/jobs", get(list_jobs).delete(clear_jobs))
        .route(
            "/api/preferences/columns",
            get(visible_columns).put(set_visible_columns),
        )
        .route("/api/segments", get(list_segments).post(create_segment))
        .route(
            "/api/segments/{id}",
            get(get_segment).put(update_segment).delete(delete_segment),
        )
        .route("/api/segments/{id}/refresh", post(refresh_segment))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub fn state_from_config(config: &GatewayConfig) -> anyhow::Result<AppState> {
    let gateway = Gateway::new(config).context("building upstream gateway")?;
    let cache = LocalCache::new(Arc::new(FileCache::new(config.cache_dir.clone())));
    Ok(AppState::new(ContactDirectory::new(gateway, cache)))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "sagan web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env();
    if config.api_key.is_none() {
        warn!("SENDGRID_API_KEY is not set; upstream calls will fail");
    }
    serve(state_from_config(&config)?, config.web_port).await
}

async fn create_contact(State(state): State<Arc<AppState>>, payload: Payload) -> ApiResult {
    let input: ContactInput = typed_body(payload)?;
    let job = state.directory.submit_contact(&input).await?;
    Ok(Json(json!({"success": true, "jobId": job.job_id, "job": job})))
}

async fn list_contacts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ContactsQuery>,
) -> ApiResult {
    let listing = state
        .directory
        .contacts(query.refresh.unwrap_or(false))
        .await?;
    if listing.refresh_recommended() {
        state.spawn_background_refresh();
    }
    let contacts = search_contacts(&listing.contacts, query.search.as_deref().unwrap_or(""));
    Ok(Json(json!({
        "success": true,
        "contacts": contacts,
        "total": listing.contacts.len(),
        "fetchedAt": listing.fetched_at,
        "freshness": listing.freshness,
        "fromCache": listing.from_cache,
        "refreshRecommended": listing.refresh_recommended(),
        "skipped": listing.skipped,
    })))
}

/// Duplicate detection is advisory: a failed lookup answers `exists: false`.
async fn check_email(State(state): State<Arc<AppState>>, payload: Payload) -> ApiResult {
    let body = json_body(payload)?;
    let email = body
        .get("email")
        .and_then(JsonValue::as_str)
        .unwrap_or_default();
    let email = validate_email(email)?;
    match state.directory.gateway().check_email_exists(email).await {
        Ok(lookup) => Ok(Json(json!({
            "success": true,
            "exists": lookup.exists,
            "contact": lookup.contact,
        }))),
        Err(err) => {
            warn!(error = %err, "email lookup failed; treating as not found");
            Ok(Json(json!({
                "success": true,
                "exists": false,
                "contact": null,
                "degraded": true,
                "warning": err.to_string(),
            })))
        }
    }
}

async fn update_tags(State(state): State<Arc<AppState>>, payload: Payload) -> ApiResult {
    let body = json_body(payload)?;
    let emails = string_list(body.get("emails"), "emails")?;
    let tags = body
        .get("tags")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| SaganError::validation("tags must be a comma-separated string"))?;
    let job = state.directory.set_tags(&emails, tags).await?;
    Ok(Json(json!({"success": true, "jobId": job.job_id})))
}

async fn bulk_update_tags(State(state): State<Arc<AppState>>, payload: Payload) -> ApiResult {
    let body = json_body(payload)?;
    let updates = body
        .get("updates")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| SaganError::validation("no updates provided"))?;
    let job = state.directory.bulk_update_tags(updates).await?;
    Ok(Json(json!({
        "success": true,
        "jobId": job.job_id,
        "count": job.emails.len(),
    })))
}

async fn job_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> ApiResult {
    let job_id = query
        .job_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| SaganError::validation("job_id parameter is required"))?;
    let status = state.directory.refresh_job_status(&job_id).await?;
    Ok(Json(json!({
        "success": true,
        "status": status.raw,
        "errorInfo": status.error_info,
        "job": status,
    })))
}

async fn custom_fields(State(state): State<Arc<AppState>>) -> ApiResult {
    let fields = state.directory.gateway().list_custom_fields().await?;
    Ok(Json(json!({"success": true, "custom_fields": fields})))
}

async fn get_all_contacts(State(state): State<Arc<AppState>>) -> ApiResult {
    let ready = state.directory.gateway().get_all_contacts().await?;
    Ok(Json(json!({
        "success": true,
        "urls": ready.urls,
        "exportId": ready.export_id,
        "attempts": ready.attempts,
    })))
}

async fn download_contacts(State(state): State<Arc<AppState>>, payload: Payload) -> ApiResult {
    let body = json_body(payload)?;
    let url = body
        .get("url")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| SaganError::validation("url is required"))?;
    let parsed = state.directory.gateway().download_contacts(url).await?;
    Ok(Json(json!({
        "success": true,
        "data": {"contacts": parsed.records},
        "format": parsed.format,
        "skipped": parsed.skipped,
        "missingEmail": parsed.missing_email_count(),
    })))
}

async fn tag_vocabulary(State(state): State<Arc<AppState>>) -> ApiResult {
    let tags = state.directory.tag_vocabulary().await?;
    Ok(Json(json!({"success": true, "tags": tags})))
}

async fn list_jobs(State(state): State<Arc<AppState>>) -> ApiResult {
    let jobs = state.directory.pending_jobs().await?;
    Ok(Json(json!({"success": true, "jobs": jobs})))
}

async fn clear_jobs(State(state): State<Arc<AppState>>) -> ApiResult {
    state.directory.clear_pending_jobs().await?;
    Ok(Json(json!({"success": true})))
}

async fn visible_columns(State(state): State<Arc<AppState>>) -> ApiResult {
    let columns = state.directory.cache().visible_columns().await?;
    Ok(Json(json!({"success": true, "columns": columns})))
}

async fn set_visible_columns(State(state): State<Arc<AppState>>, payload: Payload) -> ApiResult {
    let form: ColumnsForm = typed_body(payload)?;
    let columns = state
        .directory
        .cache()
        .set_visible_columns(form.columns)
        .await?;
    Ok(Json(json!({"success": true, "columns": columns})))
}

async fn list_segments(State(state): State<Arc<AppState>>) -> ApiResult {
    let segments = state.directory.list_segments().await?;
    Ok(Json(json!({"success": true, "segments": segments})))
}

async fn create_segment(
    State(state): State<Arc<AppState>>,
    payload: Payload,
) -> Result<(StatusCode, Json<JsonValue>), ApiError> {
    let form: SegmentForm = typed_body(payload)?;
    let created = state.directory.create_segment(&form.name, &form.tags).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"success": true, "id": created.id, "segment": created})),
    ))
}

async fn get_segment(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult {
    let segment = state.directory.get_segment(&id).await?;
    Ok(Json(json!({"success": true, "segment": segment})))
}

async fn update_segment(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    payload: Payload,
) -> ApiResult {
    let form: SegmentForm = typed_body(payload)?;
    let updated = state
        .directory
        .update_segment(&id, &form.name, &form.tags)
        .await?;
    Ok(Json(json!({"success": true, "segment": updated})))
}

async fn delete_segment(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult {
    state.directory.delete_segment(&id).await?;
    Ok(Json(json!({"success": true})))
}

async fn refresh_segment(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    payload: Payload,
) -> ApiResult {
    // The body is optional here.
    let time_zone = payload.ok().and_then(|Json(body)| {
        body.get("user_time_zone")
            .and_then(JsonValue::as_str)
            .map(ToString::to_string)
    });
    let job_id = state
        .directory
        .gateway()
        .refresh_segment(&id, time_zone.as_deref())
        .await?;
    Ok(Json(json!({"success": true, "job_id": job_id})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::Utc;
    use http_body_util::BodyExt;
    use sagan_core::ContactRecord;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn state(server: &MockServer) -> (AppState, LocalCache) {
        let config = GatewayConfig {
            api_key: Some("sg-key".into()),
            api_base: server.uri(),
            poll_interval_ms: 0,
            ..Default::default()
        };
        let cache = LocalCache::in_memory();
        let directory = ContactDirectory::new(Gateway::new(&config).unwrap(), cache.clone());
        (AppState::new(directory), cache)
    }

    async fn call(
        app: Router,
        method: &str,
        uri: &str,
        body: Option<JsonValue>,
    ) -> (StatusCode, JsonValue) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(JsonValue::Null))
    }

    async fn request_count(server: &MockServer) -> usize {
        server.received_requests().await.unwrap_or_default().len()
    }

    #[tokio::test]
    async fn invalid_email_is_rejected_before_upstream() {
        let server = MockServer::start().await;
        let (state, _) = state(&server);
        let (status, body) = call(
            app(state),
            "POST",
            "/api/contacts",
            Some(json!({"email": "not-an-email", "firstName": "Ada"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["kind"], "validation_error");
        assert_eq!(request_count(&server).await, 0);
    }

    #[tokio::test]
    async fn accepted_contact_returns_job_id() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v3/marketing/contacts"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({"job_id": "abc123"})))
            .mount(&server)
            .await;
        let (state, cache) = state(&server);
        let (status, body) = call(
            app(state),
            "POST",
            "/api/contacts",
            Some(json!({"email": "ada@example.com", "tags": ["meetup"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["jobId"], "abc123");
        assert_eq!(cache.pending_jobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upstream_rejection_keeps_its_status() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"errors": [{"message": "bad"}]})),
            )
            .mount(&server)
            .await;
        let (state, _) = state(&server);
        let (status, body) = call(
            app(state),
            "POST",
            "/api/contacts",
            Some(json!({"email": "ada@example.com"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("400"));
        assert_eq!(body["kind"], "upstream_error");
    }

    #[tokio::test]
    async fn bulk_update_rejects_non_string_tags() {
        let server = MockServer::start().await;
        let (state, _) = state(&server);
        let app = app(state);
        let (status, _) = call(
            app.clone(),
            "POST",
            "/api/contacts/bulk-update-tags",
            Some(json!({"updates": [
                {"email": "ada@example.com", "tags": "vip"},
                {"email": "bob@example.com", "tags": 3}
            ]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            app,
            "POST",
            "/api/contacts/bulk-update-tags",
            Some(json!({"updates": "nope"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("no updates"));
        assert_eq!(request_count(&server).await, 0);
    }

    #[tokio::test]
    async fn malformed_json_gets_the_error_envelope() {
        let server = MockServer::start().await;
        let (state, _) = state(&server);
        let request = Request::builder()
            .method("POST")
            .uri("/api/contacts/update-tags")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let resp = app(state).oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: JsonValue = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn failed_email_lookup_degrades_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/marketing/contacts/search/emails"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let (state, _) = state(&server);
        let (status, body) = call(
            app(state),
            "POST",
            "/api/contacts/check-email",
            Some(json!({"email": "ada@example.com"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["exists"], false);
        assert_eq!(body["degraded"], true);
    }

    #[tokio::test]
    async fn cached_contacts_are_listed_and_searched() {
        let server = MockServer::start().await;
        let (state, cache) = state(&server);
        let mut ada = ContactRecord::new();
        ada.insert_text("email", "ada@example.com");
        ada.set_tags_text("meetup");
        let mut bob = ContactRecord::new();
        bob.insert_text("email", "bob@example.com");
        cache.store_contacts(vec![ada, bob], Utc::now()).await.unwrap();

        let app = app(state);
        let (status, body) = call(app.clone(), "GET", "/api/contacts?search=meet", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);
        assert_eq!(body["contacts"].as_array().unwrap().len(), 1);
        assert_eq!(body["freshness"], "fresh");

        let (_, body) = call(app, "GET", "/api/contacts/tags", None).await;
        assert_eq!(body["tags"], json!(["meetup"]));
        assert_eq!(request_count(&server).await, 0);
    }

    #[tokio::test]
    async fn segment_without_tags_is_rejected() {
        let server = MockServer::start().await;
        let (state, _) = state(&server);
        let (status, body) = call(
            app(state),
            "POST",
            "/api/segments",
            Some(json!({"name": "Nobody", "tags": []})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("at least one tag"));
    }

    #[tokio::test]
    async fn segment_create_answers_201() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/marketing/segments/2.0"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "s1"})))
            .mount(&server)
            .await;
        let (state, cache) = state(&server);
        let (status, body) = call(
            app(state),
            "POST",
            "/api/segments",
            Some(json!({"name": "VIPs", "tags": ["vip"]})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["id"], "s1");
        assert_eq!(cache.segment_index().await.unwrap()[0].name, "VIPs");
    }

    #[tokio::test]
    async fn job_status_requires_job_id() {
        let server = MockServer::start().await;
        let (state, _) = state(&server);
        let (status, _) = call(app(state), "GET", "/api/contacts/status", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn email_column_stays_visible() {
        let server = MockServer::start().await;
        let (state, _) = state(&server);
        let app = app(state);
        let (status, body) = call(
            app.clone(),
            "PUT",
            "/api/preferences/columns",
            Some(json!({"columns": ["city"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["columns"], json!(["city", "email"]));

        let (_, body) = call(app, "GET", "/api/preferences/columns", None).await;
        assert_eq!(body["columns"], json!(["city", "email"]));
    }

    #[tokio::test]
    async fn missing_credential_is_a_server_error() {
        let server = MockServer::start().await;
        let config = GatewayConfig {
            api_key: None,
            api_base: server.uri(),
            ..Default::default()
        };
        let directory =
            ContactDirectory::new(Gateway::new(&config).unwrap(), LocalCache::in_memory());
        let (status, body) = call(
            app(AppState::new(directory)),
            "GET",
            "/api/contacts/custom-fields",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["kind"], "configuration_error");
        assert_eq!(request_count(&server).await, 0);
    }

    #[tokio::test]
    async fn refresh_flag_clears_when_the_task_panics() {
        let server = MockServer::start().await;
        let state = Arc::new(state(&server).0);
        let guard = state.begin_refresh().unwrap();
        assert!(state.begin_refresh().is_none());

        let handle = tokio::spawn(async move {
            let _guard = guard;
            panic!("refresh blew up");
        });
        assert!(handle.await.is_err());
        assert!(state.begin_refresh().is_some());
    }
}
