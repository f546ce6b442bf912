use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::jobs::error_codes::ErrorCode;
use crate::jobs::model::JobStatus;

/// Result type returned by the [`JobManager`](crate::jobs::JobManager) facade.
pub type EngineResult<T> = Result<T, EngineError>;

/// A manifest could not be decoded into item descriptors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("unsupported manifest format: {0}")]
    UnsupportedFormat(String),

    #[error("manifest is malformed: {0}")]
    Malformed(String),

    #[error("manifest contains no records")]
    Empty,

    #[error("record {index}: {reason}")]
    InvalidRecord { index: usize, reason: String },

    #[error("record {index}: missing external identifier")]
    MissingIdentifier { index: usize },

    #[error("record {index}: duplicate external identifier {external_id:?}")]
    DuplicateIdentifier { index: usize, external_id: String },
}

/// Job-fatal input problems. Surfaced synchronously, never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("no processor registered for job type {0:?}")]
    UnknownJobType(String),

    #[error("invalid configuration for {job_type}: {reason}")]
    InvalidConfig { job_type: String, reason: String },

    #[error("template {0} not found")]
    TemplateNotFound(Uuid),

    #[error("template {template_id} is bound to {template_type}, not {requested}")]
    TemplateTypeMismatch {
        template_id: Uuid,
        template_type: String,
        requested: String,
    },

    #[error("max_attempts must be at least 1, got {0}")]
    InvalidMaxAttempts(i32),

    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("job {job_id} is {status}; cannot {operation}")]
    InvalidState {
        job_id: Uuid,
        status: JobStatus,
        operation: &'static str,
    },

    #[error("failed to fetch manifest {reference:?}: {source}")]
    ManifestFetch {
        reference: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl From<ManifestError> for EngineError {
    fn from(err: ManifestError) -> Self {
        EngineError::Validation(ValidationError::Manifest(err))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Processing,
    System,
    Network,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Processing => "processing",
            ErrorCategory::System => "system",
            ErrorCategory::Network => "network",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "validation" => Some(ErrorCategory::Validation),
            "processing" => Some(ErrorCategory::Processing),
            "system" => Some(ErrorCategory::System),
            "network" => Some(ErrorCategory::Network),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure raised by a processor for a single item.
///
/// Item errors are always recovered by the scheduler: classified, recorded as a
/// failure record and either rescheduled or made permanent. They never abort a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code} ({category}): {message}")]
pub struct ItemError {
    pub code: String,
    pub message: String,
    pub category: ErrorCategory,
    /// Only meaningful for processing errors: the processor asks for a retry.
    pub transient: bool,
}

impl ItemError {
    pub fn new(
        code: impl Into<String>,
        category: ErrorCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            category,
            transient: false,
        }
    }

    /// Builds an error from a known code, inferring the category from it.
    pub fn from_code(code: &str, message: impl Into<String>) -> Self {
        let parsed = ErrorCode::from_str(code);
        Self::new(code.trim().to_uppercase(), parsed.category(), message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed.as_str(), ErrorCategory::Validation, message)
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProcessingRejected.as_str(), ErrorCategory::Processing, message)
    }

    pub fn system(code: &str, message: impl Into<String>) -> Self {
        Self::new(code, ErrorCategory::System, message)
    }

    pub fn network(code: &str, message: impl Into<String>) -> Self {
        Self::new(code, ErrorCategory::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::network(ErrorCode::Timeout.as_str(), message)
    }

    /// Marks a processing rejection as worth another attempt.
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }
}
