//! Bulk contact export: start, poll, download, decompress, parse.

use std::time::Duration;

use async_trait::async_trait;
use sagan_core::{ExportJob, ExportStatus, SaganError, SaganResult};
use sagan_storage::UpstreamClient;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod parse;

pub use parse::{parse_payload, ExportFormat, ParsedExport, SkippedRow};

pub const CRATE_NAME: &str = "sagan-export";

pub const EXPORTS_PATH: &str = "/v3/marketing/contacts/exports";

/// The three platform calls the pipeline needs.
#[async_trait]
pub trait ExportSource: Send + Sync {
    /// Returns the platform's export job id.
    async fn start_export(&self) -> SaganResult<String>;
    async fn export_status(&self, export_id: &str) -> SaganResult<ExportJob>;
    async fn download(&self, url: &str) -> SaganResult<Vec<u8>>;
}

#[async_trait]
impl ExportSource for UpstreamClient {
    async fn start_export(&self) -> SaganResult<String> {
        let response = self
            .post_json(EXPORTS_PATH, &json!({ "field_selections": ["*"] }))
            .await
            .map_err(|err| match err {
                SaganError::Upstream {
                    status_code,
                    raw_body,
                } => SaganError::ExportStartFailed(format!(
                    "platform returned status {status_code}: {raw_body}"
                )),
                other => other,
            })?;
        response
            .str_field("id")
            .filter(|id| !id.trim().is_empty())
            .map(ToString::to_string)
            .ok_or_else(|| SaganError::ExportStartFailed("no export id returned".into()))
    }

    async fn export_status(&self, export_id: &str) -> SaganResult<ExportJob> {
        let response = self.get_json(&format!("{EXPORTS_PATH}/{export_id}")).await?;
        serde_json::from_value(response.body)
            .map_err(|e| SaganError::Parse(format!("export status payload: {e}")))
    }

    async fn download(&self, url: &str) -> SaganResult<Vec<u8>> {
        UpstreamClient::download(self, url).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Ready { urls: Vec<String>, attempts: u32 },
    TimedOut {
        last_status: Option<ExportStatus>,
        attempts: u32,
    },
}

impl PollOutcome {
    pub fn into_urls(self) -> SaganResult<Vec<String>> {
        match self {
            Self::Ready { urls, .. } => Ok(urls),
            Self::TimedOut {
                last_status,
                attempts,
            } => Err(SaganError::ExportTimeout {
                attempts,
                last_status: last_status.map(String::from),
            }),
        }
    }
}

/// Waits `policy.interval` before each status check, for at most
/// `policy.max_attempts` checks. A failed check uses up an attempt; a
/// `failed` export ends the wait at once.
pub async fn poll_export<S>(
    source: &S,
    export_id: &str,
    policy: &PollPolicy,
) -> SaganResult<PollOutcome>
where
    S: ExportSource + ?Sized,
{
    let mut last_status = None;
    for attempt in 1..=policy.max_attempts {
        tokio::time::sleep(policy.interval).await;
        match source.export_status(export_id).await {
            Ok(job) => {
                debug!(attempt, status = %job.status, urls = job.urls.len(), "export status");
                if job.is_ready() {
                    return Ok(PollOutcome::Ready {
                        urls: job.urls,
                        attempts: attempt,
                    });
                }
                if job.status == ExportStatus::Failed {
                    return Err(SaganError::ExportStartFailed(format!(
                        "export {export_id} reported status failed"
                    )));
                }
                last_status = Some(job.status);
            }
            Err(err @ SaganError::Configuration(_)) => return Err(err),
            Err(err) => warn!(attempt, error = %err, "export status check failed"),
        }
    }
    Ok(PollOutcome::TimedOut {
        last_status,
        attempts: policy.max_attempts,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyExport {
    pub export_id: String,
    pub urls: Vec<String>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportReport {
    pub run_id: Uuid,
    pub export_id: String,
    pub source_url: String,
    pub attempts: u32,
    pub parsed: ParsedExport,
}

pub struct ExportPipeline<S> {
    source: S,
    policy: PollPolicy,
}

impl<S: ExportSource> ExportPipeline<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            policy: PollPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Requesting + Polling.
    pub async fn start_and_wait(&self) -> SaganResult<ReadyExport> {
        let export_id = self.source.start_export().await?;
        info!(%export_id, "export started");
        let outcome = poll_export(&self.source, &export_id, &self.policy).await?;
        let attempts = match &outcome {
            PollOutcome::Ready { attempts, .. } | PollOutcome::TimedOut { attempts, .. } => {
                *attempts
            }
        };
        let urls = outcome.into_urls()?;
        Ok(ReadyExport {
            export_id,
            urls,
            attempts,
        })
    }

    /// Downloading + Decompressing + Parsing for one result URL.
    pub async fn download_and_parse(&self, url: &str) -> SaganResult<ParsedExport> {
        let bytes = self.source.download(url).await?;
        let parsed = parse_payload(&bytes, Some(url))?;
        if !parsed.skipped.is_empty() {
            warn!(
                skipped = parsed.skipped_count(),
                "export rows skipped as malformed"
            );
        }
        Ok(parsed)
    }

    pub async fn run(&self) -> SaganResult<ExportReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("export_pipeline", %run_id);
        async move {
            let ready = self.start_and_wait().await?;
            let source_url = ready.urls.first().cloned().ok_or_else(|| {
                SaganError::ExportStartFailed("export reported ready without urls".into())
            })?;
            let parsed = self.download_and_parse(&source_url).await?;
            info!(
                export_id = %ready.export_id,
                format = ?parsed.format,
                records = parsed.records.len(),
                skipped = parsed.skipped_count(),
                missing_email = parsed.missing_email_count(),
                "export parsed"
            );
            Ok(ExportReport {
                run_id,
                export_id: ready.export_id,
                source_url,
                attempts: ready.attempts,
                parsed,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sagan_core::ErrorKind;
    use sagan_storage::HttpClientConfig;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct ScriptedSource {
        statuses: Mutex<VecDeque<SaganResult<ExportJob>>>,
        checks: AtomicU32,
        payload: Vec<u8>,
    }

    impl ScriptedSource {
        fn new(statuses: Vec<SaganResult<ExportJob>>, payload: &[u8]) -> Self {
            Self {
                statuses: Mutex::new(statuses.into()),
                checks: AtomicU32::new(0),
                payload: payload.to_vec(),
            }
        }
    }

    #[async_trait]
    impl ExportSource for ScriptedSource {
        async fn start_export(&self) -> SaganResult<String> {
            Ok("export-1".into())
        }

        async fn export_status(&self, export_id: &str) -> SaganResult<ExportJob> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.statuses.lock().await.pop_front().unwrap_or_else(|| {
                Ok(job(export_id, ExportStatus::Pending, &[]))
            })
        }

        async fn download(&self, _url: &str) -> SaganResult<Vec<u8>> {
            Ok(self.payload.clone())
        }
    }

    fn job(id: &str, status: ExportStatus, urls: &[&str]) -> ExportJob {
        ExportJob {
            id: id.to_string(),
            status,
            urls: urls.iter().map(|u| u.to_string()).collect(),
        }
    }

    fn fast() -> PollPolicy {
        PollPolicy {
            max_attempts: 10,
            interval: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn ready_on_tenth_check_succeeds() {
        let mut statuses = (0..9)
            .map(|_| Ok(job("export-1", ExportStatus::Pending, &[])))
            .collect::<Vec<_>>();
        statuses.push(Ok(job("export-1", ExportStatus::Ready, &["https://dl/e.json.gz"])));
        let source = ScriptedSource::new(statuses, b"{\"email\":\"a@example.com\"}\n");

        let pipeline = ExportPipeline::new(source).with_policy(fast());
        let report = pipeline.run().await.expect("pipeline");
        assert_eq!(report.attempts, 10);
        assert_eq!(report.source_url, "https://dl/e.json.gz");
        assert_eq!(report.parsed.records.len(), 1);
    }

    #[tokio::test]
    async fn never_ready_times_out_with_last_status() {
        let source = ScriptedSource::new(vec![], b"");
        let outcome = poll_export(&source, "export-1", &fast()).await.unwrap();
        assert_eq!(
            outcome,
            PollOutcome::TimedOut {
                last_status: Some(ExportStatus::Pending),
                attempts: 10
            }
        );
        assert_eq!(source.checks.load(Ordering::SeqCst), 10);

        let err = ExportPipeline::new(ScriptedSource::new(vec![], b""))
            .with_policy(fast())
            .run()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExportTimeout);
        assert!(err.to_string().contains("pending"));
    }

    #[tokio::test]
    async fn ready_without_urls_keeps_polling() {
        let source = ScriptedSource::new(
            vec![
                Ok(job("export-1", ExportStatus::Ready, &[])),
                Ok(job("export-1", ExportStatus::Ready, &["https://dl/1"])),
            ],
            b"",
        );
        let outcome = poll_export(&source, "export-1", &fast()).await.unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Ready {
                urls: vec!["https://dl/1".into()],
                attempts: 2
            }
        );
    }

    #[tokio::test]
    async fn failed_status_checks_consume_attempts() {
        let source = ScriptedSource::new(
            vec![
                Err(SaganError::Upstream {
                    status_code: 500,
                    raw_body: String::new(),
                }),
                Ok(job("export-1", ExportStatus::Ready, &["https://dl/1"])),
            ],
            b"",
        );
        let outcome = poll_export(&source, "export-1", &fast()).await.unwrap();
        assert!(matches!(outcome, PollOutcome::Ready { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn failed_export_stops_polling() {
        let source = ScriptedSource::new(vec![Ok(job("export-1", ExportStatus::Failed, &[]))], b"");
        let err = poll_export(&source, "export-1", &fast()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExportStartFailed);
        assert_eq!(source.checks.load(Ordering::SeqCst), 1);
    }

    fn upstream(server: &MockServer) -> UpstreamClient {
        UpstreamClient::new(HttpClientConfig {
            base_url: server.uri(),
            api_key: Some("sg-key".into()),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn upstream_client_drives_the_whole_pipeline() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let server = MockServer::start().await;
        let download_url = format!("{}/files/contacts.json.gz", server.uri());
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(b"{\"email\":\"a@example.com\",\"tags\":[\"vip\"]}\nbroken\n")
            .unwrap();
        let gz = encoder.finish().unwrap();

        Mock::given(method("POST"))
            .and(path(EXPORTS_PATH))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({"id": "exp-9"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{EXPORTS_PATH}/exp-9")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "exp-9",
                "status": "ready",
                "urls": [download_url],
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/contacts.json.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(gz))
            .mount(&server)
            .await;

        let report = ExportPipeline::new(upstream(&server))
            .with_policy(fast())
            .run()
            .await
            .expect("pipeline");
        assert_eq!(report.export_id, "exp-9");
        assert_eq!(report.parsed.records.len(), 1);
        assert_eq!(report.parsed.skipped_count(), 1);
        assert_eq!(report.parsed.records[0].tag_list(), vec!["vip"]);
    }

    #[tokio::test]
    async fn export_start_without_id_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(EXPORTS_PATH))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({})))
            .mount(&server)
            .await;
        let err = upstream(&server).start_export().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExportStartFailed);
    }

    #[tokio::test]
    async fn export_start_rejection_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(EXPORTS_PATH))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;
        let err = upstream(&server).start_export().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExportStartFailed);
        assert!(err.to_string().contains("429"));
    }

    #[tokio::test]
    async fn download_failure_surfaces_upstream_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        let pipeline = ExportPipeline::new(upstream(&server));
        let err = pipeline
            .download_and_parse(&format!("{}/files/x.json.gz", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SaganError::DownloadFailed {
                status_code: Some(403),
                ..
            }
        ));
    }
}
