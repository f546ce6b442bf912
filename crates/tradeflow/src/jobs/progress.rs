use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::jobs::model::ItemCounts;

/// Aggregate snapshot written back to the job record after each batch.
///
/// Only the scheduler that holds the job lease writes this.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobProgress {
    pub processed_items: i32,
    pub succeeded_items: i32,
    pub failed_items: i32,
    pub skipped_items: i32,
    pub progress_percent: f64,
    pub throughput_items_per_sec: f64,
    pub estimated_completion_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub checkpoint_seq: Option<i32>,
}

/// Wall-clock bookkeeping for one scheduler run of a job.
#[derive(Debug, Clone)]
pub struct RunClock {
    started_at: DateTime<Utc>,
    processed_at_start: i32,
    succeeded_at_start: i32,
}

impl RunClock {
    /// `processed_at_start` and `succeeded_at_start` are the job's tallies when
    /// this run began, so a resumed job only credits its own run's work.
    pub fn start(now: DateTime<Utc>, processed_at_start: i32, succeeded_at_start: i32) -> Self {
        Self {
            started_at: now,
            processed_at_start,
            succeeded_at_start,
        }
    }

    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> f64 {
        let ms = (now - self.started_at).num_milliseconds().max(0);
        ms as f64 / 1000.0
    }

    pub fn snapshot(
        &self,
        counts: &ItemCounts,
        total_items: i32,
        now: DateTime<Utc>,
        last_error: Option<String>,
        checkpoint_seq: Option<i32>,
    ) -> JobProgress {
        let elapsed = self.elapsed_secs(now);
        let processed = counts.processed();
        let processed_this_run = (processed - self.processed_at_start).max(0);
        let succeeded_this_run = (counts.succeeded - self.succeeded_at_start).max(0);

        JobProgress {
            processed_items: processed,
            succeeded_items: counts.succeeded,
            failed_items: counts.failed,
            skipped_items: counts.skipped,
            progress_percent: progress_percent(processed, total_items),
            throughput_items_per_sec: throughput(succeeded_this_run, elapsed),
            estimated_completion_at: estimate_completion(
                now,
                elapsed,
                processed_this_run,
                (total_items - processed).max(0),
            ),
            last_error,
            checkpoint_seq,
        }
    }
}

pub fn progress_percent(processed: i32, total: i32) -> f64 {
    if total <= 0 {
        return 100.0;
    }
    let pct = processed as f64 * 100.0 / total as f64;
    (pct * 100.0).round() / 100.0
}

/// Succeeded items per second of wall-clock run time.
pub fn throughput(succeeded: i32, elapsed_secs: f64) -> f64 {
    if elapsed_secs <= 0.0 {
        return 0.0;
    }
    succeeded as f64 / elapsed_secs
}

/// Linear extrapolation from the rate observed so far in this run.
pub fn estimate_completion(
    now: DateTime<Utc>,
    elapsed_secs: f64,
    processed_this_run: i32,
    remaining: i32,
) -> Option<DateTime<Utc>> {
    if remaining == 0 {
        return Some(now);
    }
    if processed_this_run <= 0 || elapsed_secs <= 0.0 {
        return None;
    }
    let rate = processed_this_run as f64 / elapsed_secs;
    let eta_ms = (remaining as f64 / rate * 1000.0).round() as i64;
    Some(now + Duration::milliseconds(eta_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resumed_run_only_credits_its_own_successes() {
        let t0 = Utc::now();
        let clock = RunClock::start(t0, 50, 40);
        let counts = ItemCounts {
            succeeded: 60,
            failed: 10,
            pending: 30,
            ..Default::default()
        };

        let snap = clock.snapshot(&counts, 100, t0 + Duration::seconds(10), None, None);
        assert_eq!(snap.processed_items, 70);
        assert_eq!(snap.progress_percent, 70.0);
        assert!((snap.throughput_items_per_sec - 2.0).abs() < 1e-9);
        // 20 processed in 10s, 30 left
        assert_eq!(
            snap.estimated_completion_at,
            Some(t0 + Duration::seconds(10) + Duration::seconds(15))
        );
    }

    #[test]
    fn no_eta_before_any_progress() {
        let t0 = Utc::now();
        let clock = RunClock::start(t0, 0, 0);
        let counts = ItemCounts {
            pending: 5,
            ..Default::default()
        };
        let snap = clock.snapshot(&counts, 5, t0 + Duration::seconds(1), None, None);
        assert_eq!(snap.throughput_items_per_sec, 0.0);
        assert_eq!(snap.estimated_completion_at, None);
        assert_eq!(progress_percent(0, 0), 100.0);
    }
}
