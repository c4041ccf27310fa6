//! Upstream HTTP access and the local cache for Sagan.

use std::time::Duration;

use reqwest::{Method, StatusCode, Url};
use sagan_core::{SaganError, SaganResult};
use serde_json::Value as JsonValue;
use tracing::{debug, info_span, warn, Instrument};

pub mod cache;

pub use cache::{
    CacheStore, CachedContacts, FileCache, Freshness, FreshnessPolicy, LocalCache, MemoryCache,
};

pub const CRATE_NAME: &str = "sagan-storage";

pub const DEFAULT_API_BASE: &str = "https://api.sendgrid.com";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE.to_string(),
            api_key: None,
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub body: JsonValue,
}

impl UpstreamResponse {
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(JsonValue::as_str)
    }
}

/// Bearer-authenticated JSON client for the marketing-contacts platform.
///
/// Non-2xx answers come back as [`SaganError::Upstream`] with the raw body and
/// are never retried here.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl UpstreamClient {
    pub fn new(config: HttpClientConfig) -> SaganResult<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder
            .build()
            .map_err(|e| SaganError::Configuration(format!("building http client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.filter(|key| !key.trim().is_empty()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fails before any request is built when no credential is configured.
    pub fn bearer_token(&self) -> SaganResult<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| SaganError::Configuration("SENDGRID_API_KEY is not configured".into()))
    }

    pub async fn get_json(&self, path: &str) -> SaganResult<UpstreamResponse> {
        self.send_json(Method::GET, path, None).await
    }

    pub async fn post_json(&self, path: &str, body: &JsonValue) -> SaganResult<UpstreamResponse> {
        self.send_json(Method::POST, path, Some(body)).await
    }

    pub async fn put_json(&self, path: &str, body: &JsonValue) -> SaganResult<UpstreamResponse> {
        self.send_json(Method::PUT, path, Some(body)).await
    }

    pub async fn patch_json(&self, path: &str, body: &JsonValue) -> SaganResult<UpstreamResponse> {
        self.send_json(Method::PATCH, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> SaganResult<UpstreamResponse> {
        self.send_json(Method::DELETE, path, None).await
    }

    pub async fn send_json(
        &self,
        method: Method,
        path: &str,
        body: Option<&JsonValue>,
    ) -> SaganResult<UpstreamResponse> {
        let token = self.bearer_token()?;
        let url = format!("{}{}", self.base_url, path);
        let span = info_span!("upstream_call", %method, path);

        async move {
            let mut request = self.client.request(method, &url).bearer_auth(token);
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request
                .send()
                .await
                .map_err(|e| SaganError::Transport(e.to_string()))?;
            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| SaganError::Transport(e.to_string()))?;

            if !status.is_success() {
                warn!(status = status.as_u16(), body = %text, "upstream call failed");
                return Err(SaganError::Upstream {
                    status_code: status.as_u16(),
                    raw_body: text,
                });
            }

            debug!(status = status.as_u16(), "upstream call succeeded");
            let body = if text.trim().is_empty() {
                JsonValue::Null
            } else {
                serde_json::from_str(&text).map_err(|e| {
                    SaganError::Parse(format!("upstream returned a non-JSON body: {e}"))
                })?
            };
            Ok(UpstreamResponse { status, body })
        }
        .instrument(span)
        .await
    }

    /// Fetches an export result file. Result URLs are pre-signed, so no
    /// credential is attached.
    pub async fn download(&self, url: &str) -> SaganResult<Vec<u8>> {
        let parsed = Url::parse(url)
            .map_err(|e| SaganError::validation(format!("invalid download url {url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(SaganError::validation(format!(
                "download url must be http(s): {url}"
            )));
        }

        let span = info_span!("export_download", host = parsed.host_str().unwrap_or_default());
        async move {
            let response = self.client.get(parsed).send().await.map_err(|e| {
                SaganError::DownloadFailed {
                    status_code: None,
                    message: e.to_string(),
                }
            })?;
            let status = response.status();
            if !status.is_success() {
                return Err(SaganError::DownloadFailed {
                    status_code: Some(status.as_u16()),
                    message: format!("download returned status {status}"),
                });
            }
            let bytes = response.bytes().await.map_err(|e| SaganError::DownloadFailed {
                status_code: Some(status.as_u16()),
                message: e.to_string(),
            })?;
            debug!(bytes = bytes.len(), "export payload downloaded");
            Ok(bytes.to_vec())
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sagan_core::ErrorKind;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base_url: &str, api_key: Option<&str>) -> UpstreamClient {
        UpstreamClient::new(HttpClientConfig {
            base_url: base_url.to_string(),
            api_key: api_key.map(ToString::to_string),
            timeout: Duration::from_secs(5),
            user_agent: Some("sagan-test".into()),
        })
        .expect("client")
    }

    #[tokio::test]
    async fn missing_credential_fails_before_network() {
        let server = MockServer::start().await;
        let upstream = client(&server.uri(), Some("  "));
        let err = upstream.get_json("/v3/marketing/segments/2.0").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bearer_token_is_attached_and_json_parsed() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v3/marketing/contacts"))
            .and(header("authorization", "Bearer sg-key"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({"job_id": "abc123"})))
            .mount(&server)
            .await;

        let upstream = client(&server.uri(), Some("sg-key"));
        let resp = upstream
            .put_json("/v3/marketing/contacts", &json!({"contacts": []}))
            .await
            .expect("upsert");
        assert_eq!(resp.status, StatusCode::ACCEPTED);
        assert_eq!(resp.str_field("job_id"), Some("abc123"));
    }

    #[tokio::test]
    async fn non_success_carries_status_and_raw_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(403)
                    .set_body_string("{\"errors\":[{\"message\":\"denied\"}]}"),
            )
            .mount(&server)
            .await;

        let err = client(&server.uri(), Some("k"))
            .get_json("/v3/marketing/field_definitions")
            .await
            .unwrap_err();
        match err {
            SaganError::Upstream {
                status_code,
                raw_body,
            } => {
                assert_eq!(status_code, 403);
                assert!(raw_body.contains("denied"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_success_body_is_null() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        let resp = client(&server.uri(), Some("k"))
            .delete("/v3/marketing/segments/2.0/s1")
            .await
            .unwrap();
        assert!(resp.body.is_null());
    }

    #[tokio::test]
    async fn download_reports_status_code() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/exports/missing.json.gz"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let err = client(&server.uri(), None)
            .download(&format!("{}/exports/missing.json.gz", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SaganError::DownloadFailed {
                status_code: Some(404),
                ..
            }
        ));
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn download_rejects_non_http_urls() {
        let err = client("http://localhost", None)
            .download("file:///etc/passwd")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }
}
