//! Read-through contact cache and local job/segment bookkeeping on top of
//! [`Gateway`].

use chrono::{DateTime, Utc};
use sagan_core::{
    collect_tags, search_contacts, ContactInput, ContactRecord, JobStatus, PendingJob,
    SaganResult, Segment, SegmentSummary, TagUpdate,
};
use sagan_storage::{Freshness, FreshnessPolicy, LocalCache};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::Gateway;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactListing {
    pub contacts: Vec<ContactRecord>,
    pub fetched_at: DateTime<Utc>,
    pub freshness: Freshness,
    pub from_cache: bool,
    /// Rows dropped as malformed by the export that produced this listing.
    pub skipped: usize,
}

impl ContactListing {
    pub fn refresh_recommended(&self) -> bool {
        self.freshness == Freshness::Stale
    }
}

#[derive(Clone)]
pub struct ContactDirectory {
    gateway: Gateway,
    cache: LocalCache,
    freshness: FreshnessPolicy,
}

impl ContactDirectory {
    pub fn new(gateway: Gateway, cache: LocalCache) -> Self {
        Self {
            gateway,
            cache,
            freshness: FreshnessPolicy::default(),
        }
    }

    pub fn with_freshness(mut self, freshness: FreshnessPolicy) -> Self {
        self.freshness = freshness;
        self
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    /// Serves the cached listing unless it has expired (or a refresh is
    /// forced). A stale listing is still served; callers decide whether to
    /// refresh in the background. An unreadable cache falls through to a
    /// refresh.
    pub async fn contacts(&self, force_refresh: bool) -> SaganResult<ContactListing> {
        if !force_refresh {
            let cached = match self.cache.cached_contacts().await {
                Ok(cached) => cached,
                Err(err) => {
                    warn!(error = %err, "contact cache unreadable, refreshing");
                    None
                }
            };
            if let Some(cached) = cached {
                let freshness = self.freshness.assess(cached.fetched_at, Utc::now());
                if freshness != Freshness::Expired {
                    debug!(?freshness, count = cached.contacts.len(), "serving cached contacts");
                    return Ok(ContactListing {
                        contacts: cached.contacts,
                        fetched_at: cached.fetched_at,
                        freshness,
                        from_cache: true,
                        skipped: 0,
                    });
                }
            }
        }
        self.refresh().await
    }

    /// Runs a full export and overwrites the cached listing with it. The
    /// listing is returned even when it cannot be cached.
    pub async fn refresh(&self) -> SaganResult<ContactListing> {
        let report = self.gateway.fetch_all_contacts().await?;
        let skipped = report.parsed.skipped_count();
        let fetched_at = Utc::now();
        let contacts = report.parsed.records;
        if let Err(err) = self.cache.store_contacts(contacts.clone(), fetched_at).await {
            warn!(error = %err, "refreshed contacts not cached");
        }
        info!(count = contacts.len(), skipped, "contact cache refreshed");
        Ok(ContactListing {
            contacts,
            fetched_at,
            freshness: Freshness::Fresh,
            from_cache: false,
            skipped,
        })
    }

    pub async fn search(&self, term: &str) -> SaganResult<Vec<ContactRecord>> {
        let listing = self.contacts(false).await?;
        Ok(search_contacts(&listing.contacts, term)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Known tags across the cached listing, for composing segments.
    pub async fn tag_vocabulary(&self) -> SaganResult<Vec<String>> {
        let listing = self.contacts(false).await?;
        Ok(collect_tags(&listing.contacts))
    }

    pub async fn submit_contact(&self, input: &ContactInput) -> SaganResult<PendingJob> {
        let job_id = self.gateway.upsert_contact(input).await?;
        let mut job = PendingJob::new(job_id, vec![input.email.trim().to_string()], Utc::now());
        job.name = input.display_name();
        self.track(job.clone()).await;
        Ok(job)
    }

    pub async fn set_tags(&self, emails: &[String], tags: &str) -> SaganResult<PendingJob> {
        let job_id = self.gateway.set_tags(emails, tags).await?;
        let updates = emails
            .iter()
            .map(|email| TagUpdate {
                email: email.trim().to_string(),
                tags: tags.to_string(),
            })
            .collect::<Vec<_>>();
        self.mirror_tags(&updates).await;
        let emails = updates.into_iter().map(|u| u.email).collect();
        let job = PendingJob::new(job_id, emails, Utc::now());
        self.track(job.clone()).await;
        Ok(job)
    }

    pub async fn bulk_update_tags(&self, raw: &[JsonValue]) -> SaganResult<PendingJob> {
        let submitted = self.gateway.bulk_update_tags(raw).await?;
        self.mirror_tags(&submitted.updates).await;
        let emails = submitted.updates.into_iter().map(|u| u.email).collect();
        let job = PendingJob::new(submitted.job_id, emails, Utc::now());
        self.track(job.clone()).await;
        Ok(job)
    }

    /// Fetches the platform status and records it on the tracked job.
    pub async fn refresh_job_status(&self, job_id: &str) -> SaganResult<JobStatus> {
        let status = self.gateway.get_job_status(job_id).await?;
        if let Err(err) = self
            .cache
            .update_pending_job(&status.job_id, &status.status, status.error_info.clone())
            .await
        {
            warn!(job_id = %status.job_id, error = %err, "pending job status not recorded");
        }
        Ok(status)
    }

    pub async fn pending_jobs(&self) -> SaganResult<Vec<PendingJob>> {
        self.cache.pending_jobs().await
    }

    pub async fn clear_pending_jobs(&self) -> SaganResult<()> {
        self.cache.clear_pending_jobs().await
    }

    pub async fn list_segments(&self) -> SaganResult<Vec<Segment>> {
        let segments = self.gateway.list_segments().await?;
        let index = segments.iter().map(Segment::summary).collect::<Vec<_>>();
        if let Err(err) = self.cache.replace_segment_index(&index).await {
            warn!(error = %err, "segment index not cached");
        }
        Ok(segments)
    }

    pub async fn get_segment(&self, segment_id: &str) -> SaganResult<Segment> {
        self.gateway.get_segment(segment_id).await
    }

    pub async fn create_segment(&self, name: &str, tags: &[String]) -> SaganResult<SegmentSummary> {
        let created = self.gateway.create_segment(name, tags).await?;
        if let Err(err) = self.cache.upsert_segment_summary(created.clone()).await {
            warn!(error = %err, "segment index not updated");
        }
        Ok(created)
    }

    pub async fn update_segment(
        &self,
        segment_id: &str,
        name: &str,
        tags: &[String],
    ) -> SaganResult<SegmentSummary> {
        let updated = self.gateway.update_segment(segment_id, name, tags).await?;
        if let Err(err) = self.cache.upsert_segment_summary(updated.clone()).await {
            warn!(error = %err, "segment index not updated");
        }
        Ok(updated)
    }

    pub async fn delete_segment(&self, segment_id: &str) -> SaganResult<()> {
        self.gateway.delete_segment(segment_id).await?;
        if let Err(err) = self.cache.remove_segment_summary(segment_id.trim()).await {
            warn!(error = %err, "segment index not updated");
        }
        Ok(())
    }

    // The platform already accepted the submission; local bookkeeping failures
    // are logged rather than reported as a failed submission.
    async fn track(&self, job: PendingJob) {
        let job_id = job.job_id.clone();
        if let Err(err) = self.cache.add_pending_job(job).await {
            warn!(%job_id, error = %err, "pending job not recorded");
        }
    }

    async fn mirror_tags(&self, updates: &[TagUpdate]) {
        match self.cache.apply_tag_updates(updates).await {
            Ok(changed) => debug!(changed, "cached contacts retagged"),
            Err(err) => warn!(error = %err, "cached contacts not retagged"),
        }
    }
}
