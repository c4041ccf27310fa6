//! Whole-document local cache.
//!
//! Documents are read and overwritten wholesale; two writers racing on the
//! same key means last write wins.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sagan_core::{
    ContactRecord, JobErrorSummary, PendingJob, SaganError, SaganResult, SegmentSummary,
    TagUpdate, EMAIL,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

pub mod keys {
    pub const CONTACTS: &str = "sagan_contacts";
    pub const PENDING_JOBS: &str = "sagan_pending_jobs";
    pub const SEGMENTS: &str = "sagan_segments";
    pub const VISIBLE_COLUMNS: &str = "sagan_visible_columns";
}

pub const PENDING_JOBS_CAP: usize = 20;

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn read(&self, key: &str) -> SaganResult<Option<JsonValue>>;
    async fn write(&self, key: &str, document: &JsonValue) -> SaganResult<()>;
    async fn clear(&self, key: &str) -> SaganResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    documents: Mutex<HashMap<String, JsonValue>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn read(&self, key: &str) -> SaganResult<Option<JsonValue>> {
        Ok(self.documents.lock().await.get(key).cloned())
    }

    async fn write(&self, key: &str, document: &JsonValue) -> SaganResult<()> {
        self.documents
            .lock()
            .await
            .insert(key.to_string(), document.clone());
        Ok(())
    }

    async fn clear(&self, key: &str) -> SaganResult<()> {
        self.documents.lock().await.remove(key);
        Ok(())
    }
}

/// One JSON file per key under `root`, replaced via temp-file rename so a
/// reader never observes a half-written document.
#[derive(Debug, Clone)]
pub struct FileCache {
    root: PathBuf,
}

impl FileCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, key: &str) -> SaganResult<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(SaganError::Cache(format!("invalid cache key {key:?}")));
        }
        Ok(self.root.join(format!("{key}.json")))
    }
}

fn cache_err(action: &str, path: &Path, err: impl std::fmt::Display) -> SaganError {
    SaganError::Cache(format!("{action} {}: {err}", path.display()))
}

#[async_trait]
impl CacheStore for FileCache {
    async fn read(&self, key: &str) -> SaganResult<Option<JsonValue>> {
        let path = self.document_path(key)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(cache_err("reading", &path, err)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| cache_err("parsing", &path, e))
    }

    async fn write(&self, key: &str, document: &JsonValue) -> SaganResult<()> {
        let path = self.document_path(key)?;
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| cache_err("creating cache directory", &self.root, e))?;

        let bytes = serde_json::to_vec(document).map_err(|e| cache_err("serializing", &path, e))?;
        let temp_path = self.root.join(format!(".{key}.{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| cache_err("opening temp cache file", &temp_path, e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| cache_err("writing temp cache file", &temp_path, e))?;
        file.flush()
            .await
            .map_err(|e| cache_err("flushing temp cache file", &temp_path, e))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(cache_err("replacing", &path, err));
        }
        Ok(())
    }

    async fn clear(&self, key: &str) -> SaganResult<()> {
        let path = self.document_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(cache_err("removing", &path, err)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    Fresh,
    /// Usable, but a refresh should be started.
    Stale,
    Expired,
}

#[derive(Debug, Clone, Copy)]
pub struct FreshnessPolicy {
    pub stale_after: Duration,
    pub max_age: Duration,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(10 * 60),
            max_age: Duration::from_secs(60 * 60),
        }
    }
}

impl FreshnessPolicy {
    pub fn assess(&self, fetched_at: DateTime<Utc>, now: DateTime<Utc>) -> Freshness {
        // A timestamp from the future (clock skew) counts as just fetched.
        let age = (now - fetched_at).to_std().unwrap_or_default();
        if age >= self.max_age {
            Freshness::Expired
        } else if age > self.stale_after {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedContacts {
    pub fetched_at: DateTime<Utc>,
    pub contacts: Vec<ContactRecord>,
}

/// Typed access to the documented cache keys.
#[derive(Clone)]
pub struct LocalCache {
    store: Arc<dyn CacheStore>,
}

impl LocalCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCache::new()))
    }

    async fn read_doc<T: DeserializeOwned>(&self, key: &str) -> SaganResult<Option<T>> {
        let Some(value) = self.store.read(key).await? else {
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(doc) => Ok(Some(doc)),
            Err(err) => {
                warn!(key, error = %err, "discarding unreadable cache document");
                Ok(None)
            }
        }
    }

    async fn write_doc<T: Serialize>(&self, key: &str, doc: &T) -> SaganResult<()> {
        let value = serde_json::to_value(doc)
            .map_err(|e| SaganError::Cache(format!("serializing {key}: {e}")))?;
        self.store.write(key, &value).await
    }

    pub async fn cached_contacts(&self) -> SaganResult<Option<CachedContacts>> {
        self.read_doc(keys::CONTACTS).await
    }

    pub async fn store_contacts(
        &self,
        contacts: Vec<ContactRecord>,
        fetched_at: DateTime<Utc>,
    ) -> SaganResult<CachedContacts> {
        let doc = CachedContacts {
            fetched_at,
            contacts,
        };
        self.write_doc(keys::CONTACTS, &doc).await?;
        Ok(doc)
    }

    pub async fn clear_contacts(&self) -> SaganResult<()> {
        self.store.clear(keys::CONTACTS).await
    }

    /// Mirrors submitted tag changes into the cached listing. Returns how many
    /// cached records changed.
    pub async fn apply_tag_updates(&self, updates: &[TagUpdate]) -> SaganResult<usize> {
        let Some(mut doc) = self.cached_contacts().await? else {
            return Ok(0);
        };
        let mut changed = 0;
        for record in &mut doc.contacts {
            let Some(email) = record.email().map(str::to_ascii_lowercase) else {
                continue;
            };
            if let Some(update) = updates
                .iter()
                .rev()
                .find(|u| u.email.eq_ignore_ascii_case(&email))
            {
                record.set_tags_text(&update.tags);
                changed += 1;
            }
        }
        if changed > 0 {
            self.write_doc(keys::CONTACTS, &doc).await?;
        }
        Ok(changed)
    }

    pub async fn pending_jobs(&self) -> SaganResult<Vec<PendingJob>> {
        Ok(self.read_doc(keys::PENDING_JOBS).await?.unwrap_or_default())
    }

    /// Newest first, keeping at most [`PENDING_JOBS_CAP`] entries.
    pub async fn add_pending_job(&self, job: PendingJob) -> SaganResult<Vec<PendingJob>> {
        let mut jobs = self.pending_jobs().await?;
        jobs.retain(|existing| existing.job_id != job.job_id);
        jobs.insert(0, job);
        jobs.truncate(PENDING_JOBS_CAP);
        self.write_doc(keys::PENDING_JOBS, &jobs).await?;
        Ok(jobs)
    }

    pub async fn update_pending_job(
        &self,
        job_id: &str,
        status: &str,
        error_info: Option<JobErrorSummary>,
    ) -> SaganResult<Vec<PendingJob>> {
        let mut jobs = self.pending_jobs().await?;
        let mut touched = false;
        for job in jobs.iter_mut().filter(|job| job.job_id == job_id) {
            job.status = Some(status.to_string());
            job.error_info = error_info.clone();
            touched = true;
        }
        if touched {
            self.write_doc(keys::PENDING_JOBS, &jobs).await?;
        }
        Ok(jobs)
    }

    pub async fn clear_pending_jobs(&self) -> SaganResult<()> {
        self.store.clear(keys::PENDING_JOBS).await
    }

    pub async fn segment_index(&self) -> SaganResult<Vec<SegmentSummary>> {
        Ok(self.read_doc(keys::SEGMENTS).await?.unwrap_or_default())
    }

    pub async fn replace_segment_index(&self, segments: &[SegmentSummary]) -> SaganResult<()> {
        self.write_doc(keys::SEGMENTS, &segments).await
    }

    pub async fn upsert_segment_summary(&self, segment: SegmentSummary) -> SaganResult<()> {
        let mut segments = self.segment_index().await?;
        match segments.iter_mut().find(|s| s.id == segment.id) {
            Some(existing) => *existing = segment,
            None => segments.push(segment),
        }
        self.write_doc(keys::SEGMENTS, &segments).await
    }

    pub async fn remove_segment_summary(&self, segment_id: &str) -> SaganResult<()> {
        let mut segments = self.segment_index().await?;
        segments.retain(|s| s.id != segment_id);
        self.write_doc(keys::SEGMENTS, &segments).await
    }

    pub async fn visible_columns(&self) -> SaganResult<Option<BTreeSet<String>>> {
        self.read_doc(keys::VISIBLE_COLUMNS).await
    }

    /// `email` is the row identifier and is always kept visible.
    pub async fn set_visible_columns<I, S>(&self, columns: I) -> SaganResult<BTreeSet<String>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut columns = columns
            .into_iter()
            .map(Into::into)
            .filter(|c: &String| !c.trim().is_empty())
            .collect::<BTreeSet<String>>();
        columns.insert(EMAIL.to_string());
        self.write_doc(keys::VISIBLE_COLUMNS, &columns).await?;
        Ok(columns)
    }
}
