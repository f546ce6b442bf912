use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::jobs::scheduler::{BatchScheduler, RunOutcome};
use crate::jobs::store::ItemStore;

/// Sending half of the work queue. Held by the [`JobManager`](crate::jobs::JobManager).
#[derive(Clone, Debug)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Uuid>,
}

pub struct JobQueueReceiver {
    rx: mpsc::UnboundedReceiver<Uuid>,
}

impl JobQueue {
    pub fn new() -> (JobQueue, JobQueueReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (JobQueue { tx }, JobQueueReceiver { rx })
    }

    /// Returns false when no dispatcher is listening; the job is still picked up
    /// later by any dispatcher polling the store.
    pub fn enqueue(&self, job_id: Uuid) -> bool {
        self.tx.send(job_id).is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_concurrent_jobs: usize,
    /// How often the store is polled for runnable jobs the queue did not deliver.
    pub poll_interval: Duration,
    /// How long shutdown waits for running jobs before aborting them.
    pub shutdown_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            poll_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Runs schedulers for many jobs at once, each job at most once per dispatcher.
pub struct JobDispatcher {
    scheduler: BatchScheduler,
    store: Arc<dyn ItemStore>,
    config: DispatcherConfig,
}

impl JobDispatcher {
    pub fn new(scheduler: BatchScheduler, store: Arc<dyn ItemStore>, config: DispatcherConfig) -> Self {
        Self {
            scheduler,
            store,
            config,
        }
    }

    pub async fn run<F>(self, mut queue: JobQueueReceiver, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let max_jobs = self.config.max_concurrent_jobs.max(1);
        let mut running: JoinSet<(Uuid, anyhow::Result<RunOutcome>)> = JoinSet::new();
        let mut active: HashSet<Uuid> = HashSet::new();
        let mut backlog: VecDeque<Uuid> = VecDeque::new();
        let mut queue_open = true;

        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tokio::pin!(shutdown);

        tracing::info!(
            worker_id = %self.scheduler.config().worker_id,
            max_concurrent_jobs = max_jobs,
            "dispatcher started"
        );

        loop {
            while running.len() < max_jobs {
                let Some(job_id) = backlog.pop_front() else {
                    break;
                };
                if !active.insert(job_id) {
                    continue;
                }
                let scheduler = self.scheduler.clone();
                running.spawn(async move {
                    let result = AssertUnwindSafe(scheduler.run_job(job_id))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| Err(anyhow::anyhow!("scheduler panicked")));
                    (job_id, result)
                });
            }

            tokio::select! {
                _ = &mut shutdown => break,

                received = queue.rx.recv(), if queue_open => match received {
                    Some(job_id) => {
                        if !active.contains(&job_id) && !backlog.contains(&job_id) {
                            backlog.push_back(job_id);
                        }
                    }
                    None => queue_open = false,
                },

                _ = poll.tick() => {
                    let free = max_jobs.saturating_sub(running.len());
                    if free > 0 && backlog.is_empty() {
                        match self.store.runnable_jobs(Utc::now(), (free * 2) as i64).await {
                            Ok(ids) => {
                                for job_id in ids {
                                    if !active.contains(&job_id) && !backlog.contains(&job_id) {
                                        backlog.push_back(job_id);
                                    }
                                }
                            }
                            Err(err) => tracing::warn!(error = %err, "runnable job poll failed"),
                        }
                    }
                },

                Some(joined) = running.join_next(), if !running.is_empty() => {
                    on_job_done(&mut active, joined);
                }
            }
        }

        tracing::info!(running = running.len(), "dispatcher shutting down");

        let drain = async {
            while let Some(joined) = running.join_next().await {
                on_job_done(&mut active, joined);
            }
        };
        if tokio::time::timeout(self.config.shutdown_grace, drain).await.is_err() {
            tracing::warn!(
                "shutdown grace elapsed; aborting running jobs (their leases will expire)"
            );
            running.shutdown().await;
        }

        Ok(())
    }
}

fn on_job_done(
    active: &mut HashSet<Uuid>,
    joined: Result<(Uuid, anyhow::Result<RunOutcome>), tokio::task::JoinError>,
) {
    let (job_id, result) = match joined {
        Ok(done) => done,
        Err(err) => {
            // only reachable through abort on shutdown
            tracing::warn!(error = %err, "scheduler task ended abnormally");
            return;
        }
    };
    active.remove(&job_id);

    match result {
        Ok(RunOutcome::Finished(status)) => {
            tracing::info!(job_id = %job_id, status = %status, "job run finished")
        }
        Ok(RunOutcome::Cancelled) => tracing::info!(job_id = %job_id, "job run stopped: cancelled"),
        Ok(RunOutcome::NotLeased) => tracing::debug!(job_id = %job_id, "job not leased"),
        Ok(RunOutcome::LeaseLost) => tracing::warn!(job_id = %job_id, "job run stopped: lease lost"),
        Err(err) => tracing::error!(job_id = %job_id, error = ?err, "job run failed"),
    }
}
