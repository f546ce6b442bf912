use chrono::{DateTime, Duration, Utc};

use crate::error::{ErrorCategory, ItemError};

/// Exponential backoff shared by every retriable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_seconds: i64,
    pub max_seconds: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_seconds: 60,
            max_seconds: 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAt(DateTime<Utc>),
    Exhausted,
    NonRetriable,
}

impl RetryPolicy {
    pub fn new(base_seconds: i64, max_seconds: i64) -> Self {
        Self {
            base_seconds: base_seconds.max(0),
            max_seconds: max_seconds.max(0),
        }
    }

    /// Network, timeout and transient system errors are retriable; validation and
    /// malformed-input errors never are. Processing errors only when the processor
    /// flagged them transient.
    pub fn is_retriable(&self, err: &ItemError) -> bool {
        match err.category {
            ErrorCategory::Network | ErrorCategory::System => true,
            ErrorCategory::Validation => false,
            ErrorCategory::Processing => err.transient,
        }
    }

    /// `base * 2^(attempt-1)`, capped at `max_seconds`.
    pub fn backoff_seconds(&self, attempt: i32) -> i64 {
        let attempt = attempt.max(1) as u32;

        // exponent = attempt - 1
        let exp = attempt.saturating_sub(1);

        // shifting past 62 bits would overflow; the cap takes over long before that
        let pow2 = if exp >= 62 { i64::MAX } else { 1_i64 << exp };

        self.base_seconds.saturating_mul(pow2).min(self.max_seconds)
    }

    /// What happens to an item that just failed its `attempt`-th try.
    pub fn decide(
        &self,
        err: &ItemError,
        attempt: i32,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if !self.is_retriable(err) {
            return RetryDecision::NonRetriable;
        }
        if attempt >= max_attempts {
            return RetryDecision::Exhausted;
        }
        RetryDecision::RetryAt(now + Duration::seconds(self.backoff_seconds(attempt)))
    }
}
