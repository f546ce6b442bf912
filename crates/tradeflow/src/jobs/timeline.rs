use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::ErrorCategory;
use crate::jobs::error_codes;
use crate::jobs::model::{EventType, ItemStatus, JobStatus, JobType, Severity};
use crate::jobs::store::ItemStore;

/// Operator view of a job: counters, the itemized failure list and one ordered
/// narrative of lifecycle events and failed attempts.
#[derive(Debug, Serialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub tenant_id: String,
    pub job_type: JobType,
    pub status: JobStatus,

    pub total_items: i32,
    pub processed_items: i32,
    pub succeeded_items: i32,
    pub failed_items: i32,
    pub skipped_items: i32,
    pub progress_percent: f64,
    pub throughput_items_per_sec: f64,
    pub truncated_records: i32,
    pub last_error: Option<String>,

    /// Failure records per error code, across all attempts.
    pub failures_by_code: BTreeMap<String, usize>,
    pub failed: Vec<FailedItem>,
    pub story: Vec<ReportEntry>,
}

#[derive(Debug, Serialize)]
pub struct FailedItem {
    pub item_id: Uuid,
    pub external_id: String,
    pub seq: i32,
    pub attempts: i32,
    pub max_attempts: i32,
    pub error_code: Option<String>,
    pub error_category: Option<ErrorCategory>,
    pub error_message: Option<String>,
    pub retriable: bool,
    pub suggested_action: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind")]
pub enum ReportEntry {
    Event {
        at: DateTime<Utc>,
        id: Uuid,
        event_type: EventType,
        actor: Option<String>,
        payload: serde_json::Value,
    },
    Failure {
        at: DateTime<Utc>,
        id: Uuid,
        item_id: Uuid,
        external_id: Option<String>,
        attempt_number: i32,
        error_code: String,
        message: String,
        category: ErrorCategory,
        severity: Severity,
        retriable: bool,
        next_retry_at: Option<DateTime<Utc>>,
        suggested_action: String,
    },
}

impl ReportEntry {
    fn sort_key(&self) -> (DateTime<Utc>, i32, i32) {
        match self {
            ReportEntry::Event { at, .. } => (*at, 0, 0),
            ReportEntry::Failure {
                at, attempt_number, ..
            } => (*at, 1, *attempt_number),
        }
    }
}

pub async fn build_report(store: &dyn ItemStore, job_id: Uuid) -> anyhow::Result<Option<JobReport>> {
    let job = match store.get_job(job_id).await? {
        Some(j) => j,
        None => return Ok(None),
    };

    let failed_items = store.list_items(job_id, Some(ItemStatus::Failed)).await?;
    let failure_rows = store.list_failures(job_id).await?;
    let events = store.list_events(job_id).await?;

    let external_ids: HashMap<Uuid, String> = store
        .list_items(job_id, None)
        .await?
        .into_iter()
        .map(|i| (i.id, i.external_id))
        .collect();

    let mut failures_by_code: BTreeMap<String, usize> = BTreeMap::new();
    for f in &failure_rows {
        *failures_by_code.entry(f.error_code.clone()).or_default() += 1;
    }

    let failed: Vec<FailedItem> = failed_items
        .into_iter()
        .map(|i| FailedItem {
            suggested_action: i
                .last_error_code
                .as_deref()
                .map(|code| error_codes::suggested_action(code).to_string()),
            item_id: i.id,
            external_id: i.external_id,
            seq: i.seq,
            attempts: i.attempts,
            max_attempts: i.max_attempts,
            error_code: i.last_error_code,
            error_category: i.last_error_category,
            error_message: i.last_error_message,
            retriable: i.retriable,
        })
        .collect();

    let mut story: Vec<ReportEntry> = Vec::with_capacity(events.len() + failure_rows.len());

    for e in events {
        story.push(ReportEntry::Event {
            at: e.created_at,
            id: e.id,
            event_type: e.event_type,
            actor: e.actor,
            payload: e.payload,
        });
    }

    for f in failure_rows {
        story.push(ReportEntry::Failure {
            at: f.created_at,
            id: f.id,
            item_id: f.item_id,
            external_id: external_ids.get(&f.item_id).cloned(),
            attempt_number: f.attempt_number,
            suggested_action: error_codes::suggested_action(&f.error_code).to_string(),
            error_code: f.error_code,
            message: f.message,
            category: f.category,
            severity: f.severity,
            retriable: f.retriable,
            next_retry_at: f.next_retry_at,
        });
    }

    // stable sort: equal keys keep store order
    story.sort_by_key(ReportEntry::sort_key);

    Ok(Some(JobReport {
        job_id: job.id,
        tenant_id: job.tenant_id,
        job_type: job.job_type,
        status: job.status,
        total_items: job.total_items,
        processed_items: job.processed_items,
        succeeded_items: job.succeeded_items,
        failed_items: job.failed_items,
        skipped_items: job.skipped_items,
        progress_percent: job.progress_percent,
        throughput_items_per_sec: job.throughput_items_per_sec,
        truncated_records: job.truncated_records,
        last_error: job.last_error,
        failures_by_code,
        failed,
        story,
    }))
}
