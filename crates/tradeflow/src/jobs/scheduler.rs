// crates/tradeflow/src/jobs/scheduler.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::instrument;
use uuid::Uuid;

use crate::error::ItemError;
use crate::jobs::error_codes::ErrorCode;
use crate::jobs::events::EventLog;
use crate::jobs::model::{
    idempotency_key, EventType, Item, ItemCounts, ItemStatus, Job, JobStatus, NewFailure, Severity,
};
use crate::jobs::progress::{JobProgress, RunClock};
use crate::jobs::registry::{BoundProcessor, ItemContext, ItemOutcome, ProcessorRegistry};
use crate::jobs::retry::{RetryDecision, RetryPolicy};
use crate::jobs::store::ItemStore;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub worker_id: String,
    /// Items claimed per round.
    pub batch_size: usize,
    /// Items of one job in flight at once.
    pub concurrency: usize,
    pub lease_seconds: i64,
    /// Upper bound on any idle wait, e.g. while retried items back off.
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-1".to_string(),
            batch_size: 10,
            concurrency: 10,
            lease_seconds: 30,
            poll_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

/// How a call to [`BatchScheduler::run_job`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The job reached a terminal status on this run.
    Finished(JobStatus),
    /// The job was cancelled; in-flight items were recorded before returning.
    Cancelled,
    /// Someone else holds the lease, or the job is not runnable.
    NotLeased,
    /// The lease moved to another worker (or the job vanished) mid-run.
    LeaseLost,
}

/// SUCCEEDED with no failures, FAILED with failures and no successes, PARTIAL otherwise.
pub fn final_status(counts: &ItemCounts) -> JobStatus {
    if counts.failed == 0 {
        JobStatus::Succeeded
    } else if counts.succeeded == 0 {
        JobStatus::Failed
    } else {
        JobStatus::Partial
    }
}

enum Observed {
    Owned,
    Cancelled,
    Lost,
}

struct ItemRun {
    item: Item,
    /// `None` when the item was withheld because the job got cancelled while it
    /// waited for a slot.
    result: Option<Result<ItemOutcome, ItemError>>,
    duration_ms: u64,
}

struct RunState {
    clock: RunClock,
    last_error: Option<String>,
    checkpoint_seq: Option<i32>,
}

/// Drives one job's items to completion.
///
/// The scheduler holding the job lease is the only writer of the job's
/// aggregates. Item transitions go through store CAS calls, so a stale
/// scheduler can never overwrite an outcome recorded by a newer one.
#[derive(Clone)]
pub struct BatchScheduler {
    store: Arc<dyn ItemStore>,
    registry: Arc<ProcessorRegistry>,
    events: EventLog,
    config: SchedulerConfig,
}

impl BatchScheduler {
    pub fn new(
        store: Arc<dyn ItemStore>,
        registry: Arc<ProcessorRegistry>,
        events: EventLog,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            events,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    fn lease_until(&self) -> chrono::DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(self.config.lease_seconds.max(1))
    }

    fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs((self.config.lease_seconds / 3).max(1) as u64)
    }

    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn run_job(&self, job_id: Uuid) -> anyhow::Result<RunOutcome> {
        let Some(job) = self
            .store
            .lease_job(job_id, self.worker_id(), self.lease_until())
            .await?
        else {
            tracing::debug!(job_id = %job_id, "job not leasable");
            return Ok(RunOutcome::NotLeased);
        };

        let requeued = self.store.requeue_stale_items(job_id).await?;
        if requeued > 0 {
            tracing::info!(job_id = %job_id, requeued, "requeued items orphaned by a previous run");
        }

        let bound = match self.registry.bind(job.job_type, &job.config) {
            Ok(bound) => bound,
            Err(err) => return self.abort(&job, err.to_string()).await,
        };

        let counts = self.store.count_items(job_id).await?;
        let mut run = RunState {
            clock: RunClock::start(Utc::now(), counts.processed(), counts.succeeded),
            last_error: None,
            checkpoint_seq: job.checkpoint_seq,
        };

        self.events
            .append(
                job_id,
                EventType::Started,
                json!({
                    "worker_id": self.worker_id(),
                    "total_items": job.total_items,
                    "processed_items": counts.processed(),
                    "requeued_items": requeued,
                    "resumed": counts.processed() > 0 || requeued > 0,
                }),
                Some(self.worker_id()),
            )
            .await?;
        tracing::info!(
            job_id = %job_id,
            job_type = %job.job_type,
            total_items = job.total_items,
            already_processed = counts.processed(),
            "job started"
        );

        loop {
            match self.observe(job_id).await? {
                Observed::Owned => {}
                Observed::Cancelled => return self.stop_cancelled(&job, &run).await,
                Observed::Lost => {
                    tracing::warn!(job_id = %job_id, "job lease lost; stopping");
                    return Ok(RunOutcome::LeaseLost);
                }
            }

            let batch = self
                .store
                .claim_items(job_id, self.config.batch_size.max(1) as i64, Utc::now())
                .await?;

            if batch.is_empty() {
                let counts = self.store.count_items(job_id).await?;
                if counts.outstanding() == 0 {
                    if let Some(outcome) = self.finish(&job, &run, &counts).await? {
                        return Ok(outcome);
                    }
                    // refused: status or items changed under us, re-observe
                    continue;
                }
                self.wait_for_eligible(job_id).await?;
                continue;
            }

            self.dispatch_batch(&job, &bound, batch, &mut run).await?;
            self.report_progress(&job, &run).await?;
        }
    }

    async fn observe(&self, job_id: Uuid) -> anyhow::Result<Observed> {
        let Some(job) = self.store.get_job(job_id).await? else {
            return Ok(Observed::Lost);
        };
        match job.status {
            JobStatus::Cancelled => Ok(Observed::Cancelled),
            JobStatus::Running if job.worker_id.as_deref() == Some(self.worker_id()) => {
                if self
                    .store
                    .renew_lease(job_id, self.worker_id(), self.lease_until())
                    .await?
                {
                    Ok(Observed::Owned)
                } else {
                    Ok(Observed::Lost)
                }
            }
            _ => Ok(Observed::Lost),
        }
    }

    async fn is_cancelled(&self, job_id: Uuid) -> anyhow::Result<bool> {
        Ok(self
            .store
            .get_job(job_id)
            .await?
            .is_some_and(|j| j.status == JobStatus::Cancelled))
    }

    async fn dispatch_batch(
        &self,
        job: &Job,
        bound: &BoundProcessor,
        batch: Vec<Item>,
        run: &mut RunState,
    ) -> anyhow::Result<()> {
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();

        // spawned in manifest order; the semaphore is FIFO so dispatch order holds
        for item in batch {
            tracing::debug!(
                job_id = %job.id,
                item_id = %item.id,
                seq = item.seq,
                attempt = item.attempts,
                "dispatching item"
            );
            let bound = bound.clone();
            let permits = permits.clone();
            let cancelled = cancelled.clone();
            let store = self.store.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                if job_cancelled(store.as_ref(), item.job_id, &cancelled).await {
                    return ItemRun {
                        item,
                        result: None,
                        duration_ms: 0,
                    };
                }
                let started = Instant::now();
                let result = execute_item(&bound, &item).await;
                ItemRun {
                    duration_ms: started.elapsed().as_millis() as u64,
                    item,
                    result: Some(result),
                }
            });
        }

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval());
        heartbeat.tick().await;

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(joined) => self.record(job, joined?, run).await?,
                    None => break,
                },
                _ = heartbeat.tick() => {
                    let renewed = self
                        .store
                        .renew_lease(job.id, self.worker_id(), self.lease_until())
                        .await?;
                    if !renewed {
                        tracing::warn!(job_id = %job.id, "lease renewal refused mid-batch");
                    }
                }
            }
        }

        Ok(())
    }

    async fn record(&self, job: &Job, done: ItemRun, run: &mut RunState) -> anyhow::Result<()> {
        let ItemRun {
            item,
            result,
            duration_ms,
        } = done;

        let Some(result) = result else {
            if self.store.release_item(item.id).await? {
                tracing::debug!(
                    job_id = %job.id,
                    item_id = %item.id,
                    seq = item.seq,
                    "job cancelled; item returned to pending undispatched"
                );
            }
            return Ok(());
        };
        run.checkpoint_seq = Some(run.checkpoint_seq.map_or(item.seq, |c| c.max(item.seq)));

        match result {
            Ok(ItemOutcome::Completed(output)) => {
                if !self.store.complete_item(item.id, &output).await? {
                    tracing::warn!(item_id = %item.id, "item changed concurrently; completion dropped");
                    return Ok(());
                }
                tracing::debug!(job_id = %job.id, item_id = %item.id, duration_ms, "item succeeded");
                self.events
                    .append(
                        job.id,
                        EventType::ItemCompleted,
                        json!({
                            "item_id": item.id,
                            "external_id": item.external_id,
                            "seq": item.seq,
                            "attempt": item.attempts,
                            "outcome": "succeeded",
                            "duration_ms": duration_ms,
                        }),
                        Some(self.worker_id()),
                    )
                    .await?;
            }
            Ok(ItemOutcome::Skipped(reason)) => {
                if !self.store.skip_item(item.id, &reason).await? {
                    tracing::warn!(item_id = %item.id, "item changed concurrently; skip dropped");
                    return Ok(());
                }
                tracing::debug!(job_id = %job.id, item_id = %item.id, reason = %reason, "item skipped");
                self.events
                    .append(
                        job.id,
                        EventType::ItemCompleted,
                        json!({
                            "item_id": item.id,
                            "external_id": item.external_id,
                            "seq": item.seq,
                            "attempt": item.attempts,
                            "outcome": "skipped",
                            "reason": reason,
                            "duration_ms": duration_ms,
                        }),
                        Some(self.worker_id()),
                    )
                    .await?;
            }
            Err(err) => self.record_failure(job, &item, err, duration_ms, run).await?,
        }

        Ok(())
    }

    async fn record_failure(
        &self,
        job: &Job,
        item: &Item,
        err: ItemError,
        duration_ms: u64,
        run: &mut RunState,
    ) -> anyhow::Result<()> {
        let decision = self
            .config
            .retry
            .decide(&err, item.attempts, item.max_attempts, Utc::now());

        let (next_status, retriable, next_retry_at) = match decision {
            RetryDecision::RetryAt(at) => {
                // a cancelled job dispatches nothing more; park it for retry_failed
                if self.is_cancelled(job.id).await? {
                    (ItemStatus::Failed, true, None)
                } else {
                    (ItemStatus::Retried, true, Some(at))
                }
            }
            RetryDecision::Exhausted => (ItemStatus::Failed, true, None),
            RetryDecision::NonRetriable => (ItemStatus::Failed, false, None),
        };
        let will_retry = next_status == ItemStatus::Retried;

        let failure = NewFailure {
            attempt_number: item.attempts,
            error_code: err.code.clone(),
            message: err.message.clone(),
            category: err.category,
            severity: Severity::for_failure(err.category, will_retry),
            retriable,
            next_retry_at,
        };

        if !self.store.fail_item(item.id, &failure, next_status).await? {
            tracing::warn!(item_id = %item.id, "item changed concurrently; failure dropped");
            return Ok(());
        }
        run.last_error = Some(format!("{}: {}", err.code, err.message));

        if will_retry {
            tracing::info!(
                job_id = %job.id,
                item_id = %item.id,
                attempt = item.attempts,
                max_attempts = item.max_attempts,
                code = %err.code,
                next_retry_at = ?next_retry_at,
                "item failed; retry scheduled"
            );
        } else {
            tracing::warn!(
                job_id = %job.id,
                item_id = %item.id,
                attempt = item.attempts,
                code = %err.code,
                category = %err.category,
                "item failed permanently"
            );
        }

        self.events
            .append(
                job.id,
                EventType::ItemFailed,
                json!({
                    "item_id": item.id,
                    "external_id": item.external_id,
                    "seq": item.seq,
                    "attempt": item.attempts,
                    "error_code": err.code,
                    "category": err.category,
                    "message": err.message,
                    "retriable": retriable,
                    "will_retry": will_retry,
                    "next_retry_at": next_retry_at,
                    "duration_ms": duration_ms,
                }),
                Some(self.worker_id()),
            )
            .await?;

        Ok(())
    }

    async fn snapshot(&self, job: &Job, run: &RunState) -> anyhow::Result<(ItemCounts, JobProgress)> {
        let counts = self.store.count_items(job.id).await?;
        let progress = run.clock.snapshot(
            &counts,
            job.total_items,
            Utc::now(),
            run.last_error.clone(),
            run.checkpoint_seq,
        );
        Ok((counts, progress))
    }

    async fn report_progress(&self, job: &Job, run: &RunState) -> anyhow::Result<()> {
        let (_, progress) = self.snapshot(job, run).await?;
        self.store.save_progress(job.id, &progress).await?;

        tracing::debug!(
            job_id = %job.id,
            processed = progress.processed_items,
            total = job.total_items,
            percent = progress.progress_percent,
            "batch recorded"
        );

        self.events
            .append(
                job.id,
                EventType::Progress,
                progress_payload(&progress, job.total_items),
                Some(self.worker_id()),
            )
            .await?;
        Ok(())
    }

    async fn wait_for_eligible(&self, job_id: Uuid) -> anyhow::Result<()> {
        let poll = self.config.poll_interval;
        let wait = match self.store.next_retry_at(job_id).await? {
            Some(at) => (at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(poll),
            None => poll,
        };
        tracing::debug!(job_id = %job_id, wait_ms = wait.as_millis() as u64, "waiting for eligible items");
        tokio::time::sleep(wait.max(Duration::from_millis(5))).await;
        Ok(())
    }

    async fn finish(
        &self,
        job: &Job,
        run: &RunState,
        counts: &ItemCounts,
    ) -> anyhow::Result<Option<RunOutcome>> {
        let status = final_status(counts);
        let now = Utc::now();
        let progress = run.clock.snapshot(
            counts,
            job.total_items,
            now,
            run.last_error.clone(),
            run.checkpoint_seq,
        );

        if !self
            .store
            .finish_job(job.id, self.worker_id(), status, &progress)
            .await?
        {
            return Ok(None);
        }

        let event_type = if status == JobStatus::Failed {
            EventType::Failed
        } else {
            EventType::Completed
        };
        let mut payload = progress_payload(&progress, job.total_items);
        payload["status"] = json!(status);
        payload["duration_secs"] = json!(run.clock.elapsed_secs(now));
        payload["last_error"] = json!(progress.last_error.clone().or(job.last_error.clone()));

        self.events
            .append(job.id, event_type, payload, Some(self.worker_id()))
            .await?;

        tracing::info!(
            job_id = %job.id,
            status = %status,
            succeeded = counts.succeeded,
            failed = counts.failed,
            skipped = counts.skipped,
            throughput = progress.throughput_items_per_sec,
            "job finished"
        );

        Ok(Some(RunOutcome::Finished(status)))
    }

    async fn stop_cancelled(&self, job: &Job, run: &RunState) -> anyhow::Result<RunOutcome> {
        let (counts, progress) = self.snapshot(job, run).await?;
        self.store.save_progress(job.id, &progress).await?;
        tracing::info!(
            job_id = %job.id,
            processed = counts.processed(),
            left_pending = counts.outstanding(),
            "job cancelled; dispatch stopped"
        );
        Ok(RunOutcome::Cancelled)
    }

    /// The job can't run at all (its processor or config is gone).
    async fn abort(&self, job: &Job, reason: String) -> anyhow::Result<RunOutcome> {
        let message = format!("{}: {}", ErrorCode::ValidationFailed.as_str(), reason);
        let run = RunState {
            clock: RunClock::start(Utc::now(), 0, 0),
            last_error: Some(message.clone()),
            checkpoint_seq: job.checkpoint_seq,
        };
        let (_, progress) = self.snapshot(job, &run).await?;
        self.store.save_progress(job.id, &progress).await?;

        if !self
            .store
            .set_job_status(job.id, &[JobStatus::Running], JobStatus::Failed)
            .await?
        {
            return Ok(RunOutcome::LeaseLost);
        }

        tracing::error!(job_id = %job.id, reason = %reason, "job aborted before dispatch");
        self.events
            .append(
                job.id,
                EventType::Failed,
                json!({ "status": JobStatus::Failed, "last_error": message }),
                Some(self.worker_id()),
            )
            .await?;
        Ok(RunOutcome::Finished(JobStatus::Failed))
    }
}

/// Checked by every item task right before it reaches the processor. The
/// first task that sees the cancellation flips `seen` for the rest of the batch.
async fn job_cancelled(store: &dyn ItemStore, job_id: Uuid, seen: &AtomicBool) -> bool {
    if seen.load(Ordering::Acquire) {
        return true;
    }
    match store.get_job(job_id).await {
        Ok(Some(job)) if job.status == JobStatus::Cancelled => {
            seen.store(true, Ordering::Release);
            true
        }
        Ok(_) => false,
        Err(err) => {
            tracing::warn!(job_id = %job_id, error = %err, "cancellation check failed; dispatching");
            false
        }
    }
}

async fn execute_item(bound: &BoundProcessor, item: &Item) -> Result<ItemOutcome, ItemError> {
    let expected = idempotency_key(item.job_id, &item.external_id);
    if item.idempotency_key != expected {
        return Err(ItemError::from_code(
            ErrorCode::IdempotencyMismatch.as_str(),
            format!(
                "stored idempotency key {} does not match the key derived for {:?}",
                item.idempotency_key, item.external_id
            ),
        ));
    }

    let ctx = ItemContext {
        job_id: item.job_id,
        item_id: item.id,
        external_id: item.external_id.clone(),
        idempotency_key: item.idempotency_key.clone(),
        attempt: item.attempts,
    };
    bound.run(&ctx, &item.payload).await
}

fn progress_payload(progress: &JobProgress, total_items: i32) -> serde_json::Value {
    json!({
        "total_items": total_items,
        "processed_items": progress.processed_items,
        "succeeded_items": progress.succeeded_items,
        "failed_items": progress.failed_items,
        "skipped_items": progress.skipped_items,
        "progress_percent": progress.progress_percent,
        "throughput_items_per_sec": progress.throughput_items_per_sec,
        "estimated_completion_at": progress.estimated_completion_at,
        "checkpoint_seq": progress.checkpoint_seq,
    })
}
