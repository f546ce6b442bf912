use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::jobs::model::{
    Event, FailureRecord, Item, ItemCounts, ItemStatus, Job, JobStatus, JobType, NewEvent,
    NewFailure, NewItem, NewJob, NewTemplate, Template,
};
use crate::jobs::progress::{progress_percent, JobProgress};
use crate::jobs::store::{ItemStore, JobFilter};

/// Process-local [`ItemStore`]. One mutex guards all tables, so every method is
/// a single atomic transaction.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    jobs: HashMap<Uuid, Job>,
    items: HashMap<Uuid, Item>,
    // item ids per job, in manifest order
    job_items: HashMap<Uuid, Vec<Uuid>>,
    idempotency_keys: HashSet<String>,
    failures: Vec<FailureRecord>,
    events: Vec<Event>,
    templates: HashMap<Uuid, Template>,
}

impl Tables {
    fn items_of(&self, job_id: Uuid) -> impl Iterator<Item = &Item> + '_ {
        self.job_items
            .get(&job_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.items.get(id))
    }

    fn counts(&self, job_id: Uuid) -> ItemCounts {
        let mut counts = ItemCounts::default();
        for item in self.items_of(job_id) {
            counts.add(item.status);
        }
        counts
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_progress(job: &mut Job, progress: &JobProgress, now: DateTime<Utc>) {
    job.processed_items = progress.processed_items;
    job.succeeded_items = progress.succeeded_items;
    job.failed_items = progress.failed_items;
    job.skipped_items = progress.skipped_items;
    job.progress_percent = progress.progress_percent;
    job.throughput_items_per_sec = progress.throughput_items_per_sec;
    job.estimated_completion_at = progress.estimated_completion_at;
    if progress.last_error.is_some() {
        job.last_error = progress.last_error.clone();
    }
    if progress.checkpoint_seq.is_some() {
        job.checkpoint_seq = progress.checkpoint_seq;
    }
    job.updated_at = now;
}

#[async_trait]
impl ItemStore for MemoryStore {
    async fn create_job(&self, new: NewJob, items: Vec<NewItem>) -> anyhow::Result<Job> {
        let mut t = self.inner.lock();

        if t.jobs.contains_key(&new.id) {
            anyhow::bail!("job {} already exists", new.id);
        }
        let mut batch_keys = HashSet::with_capacity(items.len());
        for item in &items {
            if t.idempotency_keys.contains(&item.idempotency_key)
                || !batch_keys.insert(item.idempotency_key.as_str())
            {
                anyhow::bail!(
                    "duplicate idempotency key for external id {:?}",
                    item.external_id
                );
            }
        }

        let now = Utc::now();
        let job = Job {
            id: new.id,
            tenant_id: new.tenant_id,
            job_type: new.job_type,
            config: new.config,
            priority: new.priority,
            status: JobStatus::Pending,
            max_attempts: new.max_attempts,
            manifest_format: new.manifest_format,
            manifest_records: new.manifest_records,
            truncated_records: new.truncated_records,
            template_id: new.template_id,
            total_items: items.len() as i32,
            processed_items: 0,
            succeeded_items: 0,
            failed_items: 0,
            skipped_items: 0,
            progress_percent: 0.0,
            throughput_items_per_sec: 0.0,
            estimated_completion_at: None,
            last_error: None,
            checkpoint_seq: None,
            worker_id: None,
            lease_expires_at: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        };

        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            ids.push(item.id);
            t.idempotency_keys.insert(item.idempotency_key.clone());
            t.items.insert(
                item.id,
                Item {
                    id: item.id,
                    job_id: job.id,
                    seq: item.seq,
                    external_id: item.external_id,
                    payload: item.payload,
                    status: ItemStatus::Pending,
                    attempts: 0,
                    max_attempts: job.max_attempts,
                    idempotency_key: item.idempotency_key,
                    result: None,
                    last_error_code: None,
                    last_error_category: None,
                    last_error_message: None,
                    retriable: false,
                    next_attempt_at: None,
                    created_at: now,
                    updated_at: now,
                },
            );
        }
        ids.sort_by_key(|id| t.items.get(id).map(|i| i.seq));
        t.job_items.insert(job.id, ids);
        t.jobs.insert(job.id, job.clone());

        Ok(job)
    }

    async fn get_job(&self, job_id: Uuid) -> anyhow::Result<Option<Job>> {
        Ok(self.inner.lock().jobs.get(&job_id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> anyhow::Result<Vec<Job>> {
        let t = self.inner.lock();
        let mut jobs: Vec<Job> = t
            .jobs
            .values()
            .filter(|j| filter.tenant_id.as_deref().map_or(true, |tid| j.tenant_id == tid))
            .filter(|j| filter.status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        jobs.truncate(filter.limit.clamp(1, 500) as usize);
        Ok(jobs)
    }

    async fn runnable_jobs(&self, now: DateTime<Utc>, limit: i64) -> anyhow::Result<Vec<Uuid>> {
        let t = self.inner.lock();
        let mut runnable: Vec<&Job> = t
            .jobs
            .values()
            .filter(|j| match j.status {
                JobStatus::Pending => true,
                JobStatus::Running => j.lease_expires_at.map_or(true, |exp| exp < now),
                _ => false,
            })
            .collect();
        runnable.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(runnable
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|j| j.id)
            .collect())
    }

    async fn lease_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease_until: DateTime<Utc>,
    ) -> anyhow::Result<Option<Job>> {
        let mut t = self.inner.lock();
        let now = Utc::now();
        let Some(job) = t.jobs.get_mut(&job_id) else {
            return Ok(None);
        };

        let leasable = match job.status {
            JobStatus::Pending => true,
            JobStatus::Running => job.lease_expires_at.map_or(true, |exp| exp < now),
            _ => false,
        };
        if !leasable {
            return Ok(None);
        }

        job.status = JobStatus::Running;
        job.worker_id = Some(worker_id.to_string());
        job.lease_expires_at = Some(lease_until);
        job.started_at.get_or_insert(now);
        job.finished_at = None;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn renew_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease_until: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut t = self.inner.lock();
        match t.jobs.get_mut(&job_id) {
            Some(job)
                if job.status == JobStatus::Running
                    && job.worker_id.as_deref() == Some(worker_id) =>
            {
                job.lease_expires_at = Some(lease_until);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_job_status(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
    ) -> anyhow::Result<bool> {
        let mut t = self.inner.lock();
        let Some(job) = t.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if !from.contains(&job.status) {
            return Ok(false);
        }
        let now = Utc::now();
        job.status = to;
        job.lease_expires_at = None;
        job.finished_at = if to.is_terminal() { Some(now) } else { None };
        job.updated_at = now;
        Ok(true)
    }

    async fn finish_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        status: JobStatus,
        progress: &JobProgress,
    ) -> anyhow::Result<bool> {
        let mut t = self.inner.lock();
        if t.counts(job_id).outstanding() > 0 {
            return Ok(false);
        }
        let Some(job) = t.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Running || job.worker_id.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        let now = Utc::now();
        apply_progress(job, progress, now);
        job.status = status;
        job.lease_expires_at = None;
        job.finished_at = Some(now);
        Ok(true)
    }

    async fn save_progress(&self, job_id: Uuid, progress: &JobProgress) -> anyhow::Result<()> {
        let mut t = self.inner.lock();
        if let Some(job) = t.jobs.get_mut(&job_id) {
            apply_progress(job, progress, Utc::now());
        }
        Ok(())
    }

    async fn delete_job(&self, job_id: Uuid) -> anyhow::Result<bool> {
        let mut t = self.inner.lock();
        if t.jobs.remove(&job_id).is_none() {
            return Ok(false);
        }
        let item_ids = t.job_items.remove(&job_id).unwrap_or_default();
        for item_id in item_ids {
            if let Some(item) = t.items.remove(&item_id) {
                t.idempotency_keys.remove(&item.idempotency_key);
            }
        }
        t.failures.retain(|f| f.job_id != job_id);
        t.events.retain(|e| e.job_id != job_id);
        Ok(true)
    }

    async fn requeue_stale_items(&self, job_id: Uuid) -> anyhow::Result<u64> {
        let mut t = self.inner.lock();
        let ids = t.job_items.get(&job_id).cloned().unwrap_or_default();
        let now = Utc::now();
        let mut n = 0;
        for id in ids {
            if let Some(item) = t.items.get_mut(&id) {
                if item.status == ItemStatus::Processing {
                    item.status = ItemStatus::Pending;
                    item.updated_at = now;
                    n += 1;
                }
            }
        }
        Ok(n)
    }

    async fn claim_items(
        &self,
        job_id: Uuid,
        limit: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Item>> {
        let mut t = self.inner.lock();
        let ids = t.job_items.get(&job_id).cloned().unwrap_or_default();
        let mut claimed = Vec::new();

        for id in ids {
            if claimed.len() as i64 >= limit {
                break;
            }
            let Some(item) = t.items.get_mut(&id) else {
                continue;
            };
            let eligible = match item.status {
                ItemStatus::Pending => true,
                ItemStatus::Retried => item.next_attempt_at.map_or(true, |at| at <= now),
                _ => false,
            };
            if !eligible {
                continue;
            }
            item.status = ItemStatus::Processing;
            item.attempts += 1;
            item.next_attempt_at = None;
            item.updated_at = Utc::now();
            claimed.push(item.clone());
        }

        Ok(claimed)
    }

    async fn complete_item(&self, item_id: Uuid, result: &Value) -> anyhow::Result<bool> {
        let mut t = self.inner.lock();
        match t.items.get_mut(&item_id) {
            Some(item) if item.status == ItemStatus::Processing => {
                item.status = ItemStatus::Succeeded;
                item.result = Some(result.clone());
                item.retriable = false;
                item.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_item(&self, item_id: Uuid) -> anyhow::Result<bool> {
        let mut t = self.inner.lock();
        match t.items.get_mut(&item_id) {
            Some(item) if item.status == ItemStatus::Processing => {
                item.status = ItemStatus::Pending;
                item.attempts = (item.attempts - 1).max(0);
                item.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn skip_item(&self, item_id: Uuid, reason: &str) -> anyhow::Result<bool> {
        let mut t = self.inner.lock();
        match t.items.get_mut(&item_id) {
            Some(item) if item.status == ItemStatus::Processing => {
                item.status = ItemStatus::Skipped;
                item.last_error_message = Some(reason.to_string());
                item.retriable = false;
                item.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_item(
        &self,
        item_id: Uuid,
        failure: &NewFailure,
        next_status: ItemStatus,
    ) -> anyhow::Result<bool> {
        let mut t = self.inner.lock();
        let now = Utc::now();
        let job_id = match t.items.get_mut(&item_id) {
            Some(item) if item.status == ItemStatus::Processing => {
                item.status = next_status;
                item.last_error_code = Some(failure.error_code.clone());
                item.last_error_category = Some(failure.category);
                item.last_error_message = Some(failure.message.clone());
                item.retriable = failure.retriable;
                item.next_attempt_at = failure.next_retry_at;
                item.updated_at = now;
                item.job_id
            }
            _ => return Ok(false),
        };

        t.failures.push(FailureRecord {
            id: Uuid::new_v4(),
            job_id,
            item_id,
            attempt_number: failure.attempt_number,
            error_code: failure.error_code.clone(),
            message: failure.message.clone(),
            category: failure.category,
            severity: failure.severity,
            retriable: failure.retriable,
            next_retry_at: failure.next_retry_at,
            created_at: now,
        });
        Ok(true)
    }

    async fn count_items(&self, job_id: Uuid) -> anyhow::Result<ItemCounts> {
        Ok(self.inner.lock().counts(job_id))
    }

    async fn next_retry_at(&self, job_id: Uuid) -> anyhow::Result<Option<DateTime<Utc>>> {
        let t = self.inner.lock();
        Ok(t.items_of(job_id)
            .filter(|i| i.status == ItemStatus::Retried)
            .filter_map(|i| i.next_attempt_at)
            .min())
    }

    async fn list_items(
        &self,
        job_id: Uuid,
        status: Option<ItemStatus>,
    ) -> anyhow::Result<Vec<Item>> {
        let t = self.inner.lock();
        Ok(t.items_of(job_id)
            .filter(|i| status.map_or(true, |s| i.status == s))
            .cloned()
            .collect())
    }

    async fn list_failures(&self, job_id: Uuid) -> anyhow::Result<Vec<FailureRecord>> {
        let t = self.inner.lock();
        Ok(t.failures
            .iter()
            .filter(|f| f.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn reset_failed_items(&self, job_id: Uuid) -> anyhow::Result<u64> {
        let mut t = self.inner.lock();
        match t.jobs.get(&job_id).map(|j| j.status) {
            None | Some(JobStatus::Running) | Some(JobStatus::Cancelled) => return Ok(0),
            Some(_) => {}
        }
        let ids = t.job_items.get(&job_id).cloned().unwrap_or_default();
        let now = Utc::now();
        let mut n = 0;
        for id in ids {
            if let Some(item) = t.items.get_mut(&id) {
                if item.status == ItemStatus::Failed
                    && item.retriable
                    && item.attempts < item.max_attempts
                {
                    item.status = ItemStatus::Pending;
                    item.next_attempt_at = None;
                    item.updated_at = now;
                    n += 1;
                }
            }
        }
        if n > 0 {
            let counts = t.counts(job_id);
            if let Some(job) = t.jobs.get_mut(&job_id) {
                job.succeeded_items = counts.succeeded;
                job.failed_items = counts.failed;
                job.skipped_items = counts.skipped;
                job.processed_items = counts.processed();
                job.progress_percent = progress_percent(counts.processed(), job.total_items);
                job.updated_at = now;
            }
        }
        Ok(n)
    }

    async fn append_event(&self, event: NewEvent) -> anyhow::Result<Event> {
        let mut t = self.inner.lock();
        if !t.jobs.contains_key(&event.job_id) {
            anyhow::bail!("job {} not found", event.job_id);
        }
        let event = Event {
            id: Uuid::new_v4(),
            job_id: event.job_id,
            event_type: event.event_type,
            payload: event.payload,
            actor: event.actor,
            created_at: Utc::now(),
        };
        t.events.push(event.clone());
        Ok(event)
    }

    async fn list_events(&self, job_id: Uuid) -> anyhow::Result<Vec<Event>> {
        let t = self.inner.lock();
        Ok(t.events
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn insert_template(&self, template: NewTemplate) -> anyhow::Result<Template> {
        let template = Template {
            id: Uuid::new_v4(),
            name: template.name,
            job_type: template.job_type,
            config: template.config,
            usage_count: 0,
            last_used_at: None,
            created_at: Utc::now(),
        };
        self.inner
            .lock()
            .templates
            .insert(template.id, template.clone());
        Ok(template)
    }

    async fn get_template(&self, template_id: Uuid) -> anyhow::Result<Option<Template>> {
        Ok(self.inner.lock().templates.get(&template_id).cloned())
    }

    async fn list_templates(&self, job_type: Option<JobType>) -> anyhow::Result<Vec<Template>> {
        let t = self.inner.lock();
        let mut out: Vec<Template> = t
            .templates
            .values()
            .filter(|tpl| job_type.map_or(true, |jt| tpl.job_type == jt))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn touch_template(&self, template_id: Uuid) -> anyhow::Result<()> {
        let mut t = self.inner.lock();
        if let Some(tpl) = t.templates.get_mut(&template_id) {
            tpl.usage_count += 1;
            tpl.last_used_at = Some(Utc::now());
        }
        Ok(())
    }
}
