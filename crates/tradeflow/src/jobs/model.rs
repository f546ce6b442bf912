use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::ErrorCategory;
use crate::jobs::manifest::ManifestFormat;

/// Business category of a job. Each category is served by exactly one
/// registered processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    DocumentValidation,
    SanctionsScreening,
    HsClassification,
    CertificateVerification,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        JobType::DocumentValidation,
        JobType::SanctionsScreening,
        JobType::HsClassification,
        JobType::CertificateVerification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::DocumentValidation => "document_validation",
            JobType::SanctionsScreening => "sanctions_screening",
            JobType::HsClassification => "hs_classification",
            JobType::CertificateVerification => "certificate_verification",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s.trim())
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Partial,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Partial => "partial",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            "partial" => Some(JobStatus::Partial),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Partial | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
    Skipped,
    /// Failed with a retriable error; eligible again once `next_attempt_at` passes.
    Retried,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Processing => "processing",
            ItemStatus::Succeeded => "succeeded",
            ItemStatus::Failed => "failed",
            ItemStatus::Skipped => "skipped",
            ItemStatus::Retried => "retried",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ItemStatus::Pending),
            "processing" => Some(ItemStatus::Processing),
            "succeeded" => Some(ItemStatus::Succeeded),
            "failed" => Some(ItemStatus::Failed),
            "skipped" => Some(ItemStatus::Skipped),
            "retried" => Some(ItemStatus::Retried),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Succeeded | ItemStatus::Failed | ItemStatus::Skipped
        )
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// Scheduled retries are warnings; permanent failures escalate by category.
    pub fn for_failure(category: ErrorCategory, will_retry: bool) -> Self {
        if will_retry {
            return Severity::Warning;
        }
        match category {
            ErrorCategory::Validation | ErrorCategory::Processing => Severity::Error,
            ErrorCategory::System | ErrorCategory::Network => Severity::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "warning" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub tenant_id: String,
    pub job_type: JobType,
    pub config: Value,
    pub priority: i32,
    pub status: JobStatus,
    pub max_attempts: i32,

    pub manifest_format: ManifestFormat,
    pub manifest_records: i32,
    pub truncated_records: i32,
    pub template_id: Option<Uuid>,

    pub total_items: i32,
    pub processed_items: i32,
    pub succeeded_items: i32,
    pub failed_items: i32,
    pub skipped_items: i32,
    pub progress_percent: f64,
    pub throughput_items_per_sec: f64,
    pub estimated_completion_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub checkpoint_seq: Option<i32>,

    pub worker_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Uuid,
    pub tenant_id: String,
    pub job_type: JobType,
    pub config: Value,
    pub priority: i32,
    pub max_attempts: i32,
    pub manifest_format: ManifestFormat,
    pub manifest_records: i32,
    pub truncated_records: i32,
    pub template_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Item {
    pub id: Uuid,
    pub job_id: Uuid,
    /// Position in the manifest; dispatch order.
    pub seq: i32,
    pub external_id: String,
    pub payload: Value,
    pub status: ItemStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub idempotency_key: String,
    pub result: Option<Value>,
    pub last_error_code: Option<String>,
    pub last_error_category: Option<ErrorCategory>,
    pub last_error_message: Option<String>,
    pub retriable: bool,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewItem {
    pub id: Uuid,
    pub seq: i32,
    pub external_id: String,
    pub payload: Value,
    pub idempotency_key: String,
}

/// One failed attempt of an item. Never updated after insert.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    pub item_id: Uuid,
    pub attempt_number: i32,
    pub error_code: String,
    pub message: String,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub retriable: bool,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewFailure {
    pub attempt_number: i32,
    pub error_code: String,
    pub message: String,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub retriable: bool,
    pub next_retry_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Started,
    Progress,
    ItemCompleted,
    ItemFailed,
    RetryRequested,
    Completed,
    Failed,
    Cancelled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "created",
            EventType::Started => "started",
            EventType::Progress => "progress",
            EventType::ItemCompleted => "item_completed",
            EventType::ItemFailed => "item_failed",
            EventType::RetryRequested => "retry_requested",
            EventType::Completed => "completed",
            EventType::Failed => "failed",
            EventType::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(EventType::Created),
            "started" => Some(EventType::Started),
            "progress" => Some(EventType::Progress),
            "item_completed" => Some(EventType::ItemCompleted),
            "item_failed" => Some(EventType::ItemFailed),
            "retry_requested" => Some(EventType::RetryRequested),
            "completed" => Some(EventType::Completed),
            "failed" => Some(EventType::Failed),
            "cancelled" => Some(EventType::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: Uuid,
    pub job_id: Uuid,
    pub event_type: EventType,
    pub payload: Value,
    pub actor: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub job_id: Uuid,
    pub event_type: EventType,
    pub payload: Value,
    pub actor: Option<String>,
}

/// Reusable configuration preset for one job type.
#[derive(Debug, Clone, Serialize)]
pub struct Template {
    pub id: Uuid,
    pub name: String,
    pub job_type: JobType,
    pub config: Value,
    pub usage_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTemplate {
    pub name: String,
    pub job_type: JobType,
    pub config: Value,
}

/// Item tallies for one job, straight from the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ItemCounts {
    pub pending: i32,
    pub processing: i32,
    pub retried: i32,
    pub succeeded: i32,
    pub failed: i32,
    pub skipped: i32,
}

impl ItemCounts {
    pub fn processed(&self) -> i32 {
        self.succeeded + self.failed + self.skipped
    }

    /// Items that still need a scheduler: not yet terminal.
    pub fn outstanding(&self) -> i32 {
        self.pending + self.processing + self.retried
    }

    pub fn total(&self) -> i32 {
        self.processed() + self.outstanding()
    }

    pub fn add(&mut self, status: ItemStatus) {
        match status {
            ItemStatus::Pending => self.pending += 1,
            ItemStatus::Processing => self.processing += 1,
            ItemStatus::Retried => self.retried += 1,
            ItemStatus::Succeeded => self.succeeded += 1,
            ItemStatus::Failed => self.failed += 1,
            ItemStatus::Skipped => self.skipped += 1,
        }
    }
}

/// Stable across every attempt of the same item: sha256 over job id and
/// external identifier.
pub fn idempotency_key(job_id: Uuid, external_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job_id.as_bytes());
    hasher.update(b":");
    hasher.update(external_id.as_bytes());
    hex::encode(hasher.finalize())
}
