// crates/tradeflow/src/jobs/error_codes.rs
use crate::error::ErrorCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Timeout,
    DependencyDown,
    RateLimit,
    DbDeadlock,
    Serialization,
    Panic,
    BadPayload,
    ValidationFailed,
    ProcessingRejected,
    IdempotencyMismatch,
    Unknown,
}

impl ErrorCode {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "TIMEOUT" => Self::Timeout,
            "DEPENDENCY_DOWN" => Self::DependencyDown,
            "RATE_LIMIT" => Self::RateLimit,
            "DB_DEADLOCK" => Self::DbDeadlock,
            "SERIALIZATION" => Self::Serialization,
            "PANIC" => Self::Panic,
            "BAD_PAYLOAD" => Self::BadPayload,
            "VALIDATION_FAILED" => Self::ValidationFailed,
            "PROCESSING_REJECTED" => Self::ProcessingRejected,
            "IDEMPOTENCY_MISMATCH" => Self::IdempotencyMismatch,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::DependencyDown => "DEPENDENCY_DOWN",
            Self::RateLimit => "RATE_LIMIT",
            Self::DbDeadlock => "DB_DEADLOCK",
            Self::Serialization => "SERIALIZATION",
            Self::Panic => "PANIC",
            Self::BadPayload => "BAD_PAYLOAD",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::ProcessingRejected => "PROCESSING_REJECTED",
            Self::IdempotencyMismatch => "IDEMPOTENCY_MISMATCH",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Category a bare code falls into when the processor did not say.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Timeout | Self::DependencyDown | Self::RateLimit => ErrorCategory::Network,
            Self::DbDeadlock | Self::Serialization | Self::Panic | Self::Unknown => {
                ErrorCategory::System
            }
            Self::BadPayload | Self::ValidationFailed => ErrorCategory::Validation,
            Self::ProcessingRejected => ErrorCategory::Processing,
            // a key mismatch means the item record is corrupt; retrying cannot fix it
            Self::IdempotencyMismatch => ErrorCategory::Validation,
        }
    }
}

pub fn suggested_action(code: &str) -> &'static str {
    match ErrorCode::from_str(code) {
        ErrorCode::Timeout => {
            "Increase processor timeout OR reduce document size. Check downstream latency."
        }
        ErrorCode::DependencyDown => {
            "Retry later. Check dependency health, circuit-break, alerting, fallback path."
        }
        ErrorCode::RateLimit => {
            "Back off. Lower job concurrency or batch size, respect upstream Retry-After."
        }
        ErrorCode::DbDeadlock => {
            "Retry is OK. Reduce lock contention: consistent row ordering, smaller transactions."
        }
        ErrorCode::Serialization => {
            "Retry is OK. Reduce concurrent writes to the same records."
        }
        ErrorCode::Panic => {
            "Investigate crash. Capture panic info; if deterministic, reject the item as invalid instead."
        }
        ErrorCode::BadPayload | ErrorCode::ValidationFailed => {
            "Non-retryable. Fix the manifest record and submit it in a new job."
        }
        ErrorCode::ProcessingRejected => {
            "Business rule rejected the document. Review the message; resubmit once corrected."
        }
        ErrorCode::IdempotencyMismatch => {
            "Item record was altered after ingestion. Recreate the job from its manifest."
        }
        ErrorCode::Unknown => {
            "Inspect error message + logs. Decide if retryable; add a code mapping once understood."
        }
    }
}
