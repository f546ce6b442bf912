use std::sync::Arc;

use serde_json::{json, Value};
use tracing::instrument;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult, ValidationError};
use crate::jobs::dispatcher::JobQueue;
use crate::jobs::events::EventLog;
use crate::jobs::manifest::{self, BlobSource, ManifestFormat, ManifestSource, DEFAULT_MAX_ITEMS};
use crate::jobs::model::{
    idempotency_key, Event, EventType, FailureRecord, Item, ItemStatus, Job, JobStatus, JobType,
    NewItem, NewJob, NewTemplate, Template,
};
use crate::jobs::registry::ProcessorRegistry;
use crate::jobs::store::{ItemStore, JobFilter};
use crate::jobs::timeline::{build_report, JobReport};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub max_manifest_items: usize,
    /// Per-item attempt cap for jobs that don't set one.
    pub default_max_attempts: i32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_manifest_items: DEFAULT_MAX_ITEMS,
            default_max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub tenant_id: String,
    pub job_type: JobType,
    pub config: Value,
    pub manifest_format: ManifestFormat,
    pub manifest: ManifestSource,
    pub priority: i32,
    pub max_attempts: Option<i32>,
    pub template_id: Option<Uuid>,
}

impl CreateJobRequest {
    pub fn new(
        tenant_id: impl Into<String>,
        job_type: JobType,
        manifest_format: ManifestFormat,
        manifest: ManifestSource,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            job_type,
            config: Value::Null,
            manifest_format,
            manifest,
            priority: 0,
            max_attempts: None,
            template_id: None,
        }
    }

    pub fn config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn template(mut self, template_id: Uuid) -> Self {
        self.template_id = Some(template_id);
        self
    }
}

/// Entry point for the surrounding application.
///
/// Job creation is all-or-nothing: any validation, fetch or parse error is
/// returned before a single record is written.
#[derive(Clone)]
pub struct JobManager {
    store: Arc<dyn ItemStore>,
    registry: Arc<ProcessorRegistry>,
    events: EventLog,
    blobs: Arc<dyn BlobSource>,
    queue: Option<JobQueue>,
    config: ManagerConfig,
}

impl JobManager {
    pub fn new(
        store: Arc<dyn ItemStore>,
        registry: Arc<ProcessorRegistry>,
        events: EventLog,
        blobs: Arc<dyn BlobSource>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            events,
            blobs,
            queue: None,
            config,
        }
    }

    /// Jobs created or reopened by this manager are pushed onto `queue`.
    pub fn with_queue(mut self, queue: JobQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    fn enqueue(&self, job_id: Uuid) {
        if let Some(queue) = &self.queue {
            if !queue.enqueue(job_id) {
                tracing::debug!(job_id = %job_id, "no dispatcher listening; job left for polling");
            }
        }
    }

    #[instrument(
        skip(self, req),
        fields(tenant_id = %req.tenant_id, job_type = %req.job_type),
        err
    )]
    pub async fn create_job(&self, req: CreateJobRequest) -> EngineResult<Job> {
        if !self.registry.contains(req.job_type) {
            return Err(ValidationError::UnknownJobType(req.job_type.as_str().to_string()).into());
        }

        let max_attempts = req.max_attempts.unwrap_or(self.config.default_max_attempts);
        if max_attempts < 1 {
            return Err(ValidationError::InvalidMaxAttempts(max_attempts).into());
        }

        let config = match req.template_id {
            Some(template_id) => {
                let template = self
                    .store
                    .get_template(template_id)
                    .await?
                    .ok_or(ValidationError::TemplateNotFound(template_id))?;
                if template.job_type != req.job_type {
                    return Err(ValidationError::TemplateTypeMismatch {
                        template_id,
                        template_type: template.job_type.as_str().to_string(),
                        requested: req.job_type.as_str().to_string(),
                    }
                    .into());
                }
                merge_config(&template.config, &req.config)
            }
            None => req.config.clone(),
        };
        let config = self.registry.validate_config(req.job_type, &config)?;

        let raw = match &req.manifest {
            ManifestSource::Inline(bytes) => bytes.clone(),
            ManifestSource::Reference(reference) => {
                self.blobs
                    .fetch(reference)
                    .await
                    .map_err(|source| EngineError::ManifestFetch {
                        reference: reference.clone(),
                        source,
                    })?
            }
        };

        let parsed = manifest::parse(req.manifest_format, &raw, self.config.max_manifest_items)?;

        let job_id = Uuid::new_v4();
        let items: Vec<NewItem> = parsed
            .items
            .into_iter()
            .enumerate()
            .map(|(seq, d)| NewItem {
                id: Uuid::new_v4(),
                seq: seq as i32,
                idempotency_key: idempotency_key(job_id, &d.external_id),
                external_id: d.external_id,
                payload: d.payload,
            })
            .collect();

        let job = self
            .store
            .create_job(
                NewJob {
                    id: job_id,
                    tenant_id: req.tenant_id.clone(),
                    job_type: req.job_type,
                    config,
                    priority: req.priority,
                    max_attempts,
                    manifest_format: req.manifest_format,
                    manifest_records: parsed.total_records as i32,
                    truncated_records: parsed.truncated as i32,
                    template_id: req.template_id,
                },
                items,
            )
            .await?;

        if let Some(template_id) = req.template_id {
            self.store.touch_template(template_id).await?;
        }

        let mut payload = json!({
            "tenant_id": job.tenant_id,
            "job_type": job.job_type,
            "priority": job.priority,
            "max_attempts": job.max_attempts,
            "total_items": job.total_items,
            "manifest_format": job.manifest_format,
            "manifest_records": job.manifest_records,
            "truncated_records": job.truncated_records,
            "template_id": job.template_id,
        });
        if parsed.truncated > 0 {
            payload["warnings"] = json!([format!(
                "manifest truncated: kept {} of {} records (cap {})",
                job.total_items, parsed.total_records, self.config.max_manifest_items
            )]);
        }
        self.events
            .append(job.id, EventType::Created, payload, None)
            .await?;

        tracing::info!(
            job_id = %job.id,
            total_items = job.total_items,
            truncated = job.truncated_records,
            "job created"
        );

        self.enqueue(job.id);
        Ok(job)
    }

    pub async fn get_job(&self, job_id: Uuid) -> EngineResult<Job> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or(EngineError::NotFound(job_id))
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> EngineResult<Vec<Job>> {
        Ok(self.store.list_jobs(filter).await?)
    }

    #[instrument(skip(self), err)]
    pub async fn cancel_job(&self, job_id: Uuid) -> EngineResult<Job> {
        let job = self.get_job(job_id).await?;
        let cancellable = [JobStatus::Pending, JobStatus::Running];
        if !cancellable.contains(&job.status) {
            return Err(EngineError::InvalidState {
                job_id,
                status: job.status,
                operation: "cancel",
            });
        }

        if !self
            .store
            .set_job_status(job_id, &cancellable, JobStatus::Cancelled)
            .await?
        {
            // lost a race with the scheduler finishing the job
            let current = self.get_job(job_id).await?;
            return Err(EngineError::InvalidState {
                job_id,
                status: current.status,
                operation: "cancel",
            });
        }

        self.events
            .append(
                job_id,
                EventType::Cancelled,
                json!({
                    "previous_status": job.status,
                    "processed_items": job.processed_items,
                    "total_items": job.total_items,
                }),
                None,
            )
            .await?;
        tracing::info!(job_id = %job_id, previous = %job.status, "job cancelled");

        self.get_job(job_id).await
    }

    /// Resets retriable failed items with attempts left back to pending and
    /// reopens a FAILED or PARTIAL job. Returns the number of items reset.
    /// Refused for CANCELLED jobs and for RUNNING ones, whose lease holder owns
    /// the item states until it finishes.
    #[instrument(skip(self), err)]
    pub async fn retry_failed(&self, job_id: Uuid) -> EngineResult<u64> {
        let job = self.get_job(job_id).await?;
        if matches!(job.status, JobStatus::Cancelled | JobStatus::Running) {
            return Err(EngineError::InvalidState {
                job_id,
                status: job.status,
                operation: "retry failed items of",
            });
        }

        let reset = self.store.reset_failed_items(job_id).await?;
        if reset == 0 {
            return Ok(0);
        }

        let reopenable = [JobStatus::Failed, JobStatus::Partial];
        let reopened = reopenable.contains(&job.status)
            && self
                .store
                .set_job_status(job_id, &reopenable, JobStatus::Pending)
                .await?;

        self.events
            .append(
                job_id,
                EventType::RetryRequested,
                json!({
                    "reset_items": reset,
                    "previous_status": job.status,
                    "reopened": reopened,
                }),
                None,
            )
            .await?;
        tracing::info!(job_id = %job_id, reset, reopened, "failed items reset for retry");

        if reopened || job.status == JobStatus::Pending {
            self.enqueue(job_id);
        }
        Ok(reset)
    }

    /// Deletes the job with its items, failure records and events. Refused while running.
    #[instrument(skip(self), err)]
    pub async fn delete_job(&self, job_id: Uuid) -> EngineResult<()> {
        let job = self.get_job(job_id).await?;
        if job.status == JobStatus::Running {
            return Err(EngineError::InvalidState {
                job_id,
                status: job.status,
                operation: "delete",
            });
        }
        if !self.store.delete_job(job_id).await? {
            return Err(EngineError::NotFound(job_id));
        }
        tracing::info!(job_id = %job_id, "job deleted");
        Ok(())
    }

    pub async fn list_items(&self, job_id: Uuid, status: Option<ItemStatus>) -> EngineResult<Vec<Item>> {
        self.get_job(job_id).await?;
        Ok(self.store.list_items(job_id, status).await?)
    }

    pub async fn list_failures(&self, job_id: Uuid) -> EngineResult<Vec<FailureRecord>> {
        self.get_job(job_id).await?;
        Ok(self.store.list_failures(job_id).await?)
    }

    pub async fn list_events(&self, job_id: Uuid) -> EngineResult<Vec<Event>> {
        self.get_job(job_id).await?;
        Ok(self.events.list(job_id).await?)
    }

    pub async fn job_report(&self, job_id: Uuid) -> EngineResult<JobReport> {
        build_report(self.store.as_ref(), job_id)
            .await?
            .ok_or(EngineError::NotFound(job_id))
    }

    // ----------------------------
    // Templates
    // ----------------------------

    pub async fn create_template(
        &self,
        name: impl Into<String>,
        job_type: JobType,
        config: Value,
    ) -> EngineResult<Template> {
        let config = self.registry.validate_config(job_type, &config)?;
        let template = self
            .store
            .insert_template(NewTemplate {
                name: name.into(),
                job_type,
                config,
            })
            .await?;
        tracing::info!(template_id = %template.id, job_type = %job_type, "template created");
        Ok(template)
    }

    pub async fn list_templates(&self, job_type: Option<JobType>) -> EngineResult<Vec<Template>> {
        Ok(self.store.list_templates(job_type).await?)
    }
}

/// Request keys override template keys, one level deep.
fn merge_config(template: &Value, request: &Value) -> Value {
    match (template, request) {
        (Value::Object(base), Value::Object(overrides)) => {
            let mut merged = base.clone();
            for (k, v) in overrides {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        (_, Value::Null) => template.clone(),
        _ => request.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_config_prefers_request_keys() {
        let merged = merge_config(
            &json!({ "threshold": 0.8, "lists": ["ofac"] }),
            &json!({ "threshold": 0.9 }),
        );
        assert_eq!(merged, json!({ "threshold": 0.9, "lists": ["ofac"] }));
    }

    #[test]
    fn merge_config_without_request_config_uses_template() {
        let merged = merge_config(&json!({ "strict": true }), &Value::Null);
        assert_eq!(merged, json!({ "strict": true }));
    }
}
