use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::jobs::model::{
    Event, FailureRecord, Item, ItemCounts, ItemStatus, Job, JobStatus, JobType, NewEvent,
    NewFailure, NewItem, NewJob, NewTemplate, Template,
};
use crate::jobs::progress::JobProgress;

#[derive(Debug, Clone)]
pub struct JobFilter {
    pub tenant_id: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: i64,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            tenant_id: None,
            status: None,
            limit: 100,
        }
    }
}

/// Persistence for jobs, items, failure records, events and templates.
///
/// Every state transition is a compare-and-swap on the current status; methods
/// returning `bool` report whether the transition applied. A `false` means
/// another writer got there first and the caller must not assume its update
/// landed.
#[async_trait]
pub trait ItemStore: Send + Sync {
    // ----------------------------
    // Jobs
    // ----------------------------

    /// Inserts the job and all of its items in one transaction.
    async fn create_job(&self, job: NewJob, items: Vec<NewItem>) -> anyhow::Result<Job>;

    async fn get_job(&self, job_id: Uuid) -> anyhow::Result<Option<Job>>;

    async fn list_jobs(&self, filter: &JobFilter) -> anyhow::Result<Vec<Job>>;

    /// Pending jobs plus running jobs whose lease expired, highest priority first.
    async fn runnable_jobs(&self, now: DateTime<Utc>, limit: i64) -> anyhow::Result<Vec<Uuid>>;

    /// pending -> running, or takes over a running job with an expired lease.
    async fn lease_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease_until: DateTime<Utc>,
    ) -> anyhow::Result<Option<Job>>;

    async fn renew_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease_until: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// CAS from any status in `from` to `to`. Moving into a terminal status stamps
    /// `finished_at`; moving out of one clears it.
    async fn set_job_status(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
    ) -> anyhow::Result<bool>;

    /// running -> terminal for the lease holder. Refused while any item is still
    /// pending, processing or waiting for a retry.
    async fn finish_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        status: JobStatus,
        progress: &JobProgress,
    ) -> anyhow::Result<bool>;

    async fn save_progress(&self, job_id: Uuid, progress: &JobProgress) -> anyhow::Result<()>;

    /// Deletes the job with its items, failure records and events.
    async fn delete_job(&self, job_id: Uuid) -> anyhow::Result<bool>;

    // ----------------------------
    // Items
    // ----------------------------

    /// processing -> pending for items orphaned by a dead scheduler.
    async fn requeue_stale_items(&self, job_id: Uuid) -> anyhow::Result<u64>;

    /// Claims up to `limit` eligible items in manifest order: pending ones, and
    /// retried ones whose backoff elapsed by `now`. Claimed items are processing
    /// with their attempt counter already incremented.
    async fn claim_items(
        &self,
        job_id: Uuid,
        limit: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Item>>;

    async fn complete_item(&self, item_id: Uuid, result: &Value) -> anyhow::Result<bool>;

    /// processing -> pending for an item that was claimed but never handed to
    /// its processor. The claim's attempt is given back.
    async fn release_item(&self, item_id: Uuid) -> anyhow::Result<bool>;

    async fn skip_item(&self, item_id: Uuid, reason: &str) -> anyhow::Result<bool>;

    /// Appends the failure record and moves the item to `next_status`
    /// (`Retried` or `Failed`) atomically.
    async fn fail_item(
        &self,
        item_id: Uuid,
        failure: &NewFailure,
        next_status: ItemStatus,
    ) -> anyhow::Result<bool>;

    async fn count_items(&self, job_id: Uuid) -> anyhow::Result<ItemCounts>;

    /// Earliest backoff deadline among retried items.
    async fn next_retry_at(&self, job_id: Uuid) -> anyhow::Result<Option<DateTime<Utc>>>;

    async fn list_items(
        &self,
        job_id: Uuid,
        status: Option<ItemStatus>,
    ) -> anyhow::Result<Vec<Item>>;

    async fn list_failures(&self, job_id: Uuid) -> anyhow::Result<Vec<FailureRecord>>;

    /// failed -> pending for retriable items with attempts left. Attempt counters
    /// are kept; the job's aggregates are re-derived from item rows.
    ///
    /// Does nothing while the job is running or cancelled: a lease holder owns
    /// the aggregates of a running job.
    async fn reset_failed_items(&self, job_id: Uuid) -> anyhow::Result<u64>;

    // ----------------------------
    // Events
    // ----------------------------

    async fn append_event(&self, event: NewEvent) -> anyhow::Result<Event>;

    async fn list_events(&self, job_id: Uuid) -> anyhow::Result<Vec<Event>>;

    // ----------------------------
    // Templates
    // ----------------------------

    async fn insert_template(&self, template: NewTemplate) -> anyhow::Result<Template>;

    async fn get_template(&self, template_id: Uuid) -> anyhow::Result<Option<Template>>;

    async fn list_templates(&self, job_type: Option<JobType>) -> anyhow::Result<Vec<Template>>;

    /// Bumps the usage counter and last-used timestamp.
    async fn touch_template(&self, template_id: Uuid) -> anyhow::Result<()>;
}
