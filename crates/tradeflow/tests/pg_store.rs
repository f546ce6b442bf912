mod common;

use std::sync::Arc;

use chrono::Utc;
use common::*;
use serde_json::json;
use serial_test::serial;
use tradeflow::jobs::model::NewFailure;
use tradeflow::jobs::{
    ItemStatus, ItemStore, JobStatus, JobType, ManagerConfig, PgStore, RunOutcome, Severity,
};
use tradeflow::{ErrorCategory, ItemError};

fn pg_harness(pool: sqlx::PgPool, registry: tradeflow::jobs::ProcessorRegistry) -> Harness {
    let store: Arc<dyn ItemStore> = Arc::new(PgStore::new(pool));
    harness_on(store, registry, StaticBlobs::default(), ManagerConfig::default())
}

#[tokio::test]
#[serial]
async fn job_runs_to_partial_on_postgres() {
    let Some(pool) = setup_db().await else { return };
    let h = pg_harness(
        pool,
        registry_with(FailFor {
            job_type: JobType::DocumentValidation,
            external_ids: vec!["BL-2".into()],
            error: ItemError::validation("consignee missing"),
        }),
    );

    let job = h.submit(JobType::DocumentValidation, &ids("BL", 5)).await;
    let outcome = h.scheduler(fast_config()).run_job(job.id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished(JobStatus::Partial));

    let job = h.job(job.id).await;
    assert_eq!(job.succeeded_items, 4);
    assert_eq!(job.failed_items, 1);
    assert_eq!(job.progress_percent, 100.0);
    assert!(job.finished_at.is_some());
    assert_aggregates_consistent(&h, job.id).await;

    let failures = h.manager.list_failures(job.id).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].category, ErrorCategory::Validation);
    assert_eq!(failures[0].severity, Severity::Error);

    let events = h.manager.list_events(job.id).await.unwrap();
    assert!(events.windows(2).all(|w| w[0].created_at <= w[1].created_at));
}

#[tokio::test]
#[serial]
async fn concurrent_claims_never_overlap() {
    let Some(pool) = setup_db().await else { return };
    let h = pg_harness(pool.clone(), registry_with(Succeed(JobType::HsClassification)));
    let job = h.submit(JobType::HsClassification, &ids("INV", 20)).await;

    let a = PgStore::new(pool.clone());
    let b = PgStore::new(pool);
    let now = Utc::now();
    let (left, right) = tokio::join!(
        a.claim_items(job.id, 10, now),
        b.claim_items(job.id, 10, now)
    );
    let mut claimed: Vec<_> = left
        .unwrap()
        .into_iter()
        .chain(right.unwrap())
        .map(|i| i.id)
        .collect();
    let n = claimed.len();
    claimed.sort();
    claimed.dedup();
    assert_eq!(claimed.len(), n);
    assert_eq!(n, 20);

    let counts = h.store.count_items(job.id).await.unwrap();
    assert_eq!(counts.processing, 20);
}

#[tokio::test]
#[serial]
async fn claim_follows_manifest_order_and_respects_backoff() {
    let Some(pool) = setup_db().await else { return };
    let h = pg_harness(pool, registry_with(Succeed(JobType::DocumentValidation)));
    let job = h.submit(JobType::DocumentValidation, &ids("BL", 4)).await;

    let first = h.store.claim_items(job.id, 2, Utc::now()).await.unwrap();
    let seqs: Vec<i32> = first.iter().map(|i| i.seq).collect();
    assert_eq!(seqs, vec![0, 1]);
    assert!(first.iter().all(|i| i.attempts == 1));

    let later = Utc::now() + chrono::Duration::seconds(120);
    let failure = NewFailure {
        attempt_number: 1,
        error_code: "TIMEOUT".into(),
        message: "slow registry".into(),
        category: ErrorCategory::Network,
        severity: Severity::Warning,
        retriable: true,
        next_retry_at: Some(later),
    };
    assert!(h
        .store
        .fail_item(first[0].id, &failure, ItemStatus::Retried)
        .await
        .unwrap());
    // second write for the same attempt is refused
    assert!(!h
        .store
        .fail_item(first[0].id, &failure, ItemStatus::Retried)
        .await
        .unwrap());

    let next = h.store.claim_items(job.id, 10, Utc::now()).await.unwrap();
    let seqs: Vec<i32> = next.iter().map(|i| i.seq).collect();
    assert_eq!(seqs, vec![2, 3]);

    let due = h
        .store
        .claim_items(job.id, 10, later + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, first[0].id);
    assert_eq!(due[0].attempts, 2);
    assert_eq!(h.store.next_retry_at(job.id).await.unwrap(), None);
}

#[tokio::test]
#[serial]
async fn reset_failed_items_rederives_aggregates() {
    let Some(pool) = setup_db().await else { return };
    let h = pg_harness(pool, registry_with(Succeed(JobType::DocumentValidation)));
    let job = h.submit(JobType::DocumentValidation, &ids("BL", 3)).await;

    let lease_until = Utc::now() + chrono::Duration::seconds(30);
    h.store.lease_job(job.id, "w", lease_until).await.unwrap();
    let claimed = h.store.claim_items(job.id, 10, Utc::now()).await.unwrap();
    for item in &claimed {
        if item.seq == 0 {
            let failure = NewFailure {
                attempt_number: item.attempts,
                error_code: "DEPENDENCY_DOWN".into(),
                message: "offline".into(),
                category: ErrorCategory::Network,
                severity: Severity::Critical,
                retriable: true,
                next_retry_at: None,
            };
            h.store
                .fail_item(item.id, &failure, ItemStatus::Failed)
                .await
                .unwrap();
        } else {
            h.store.complete_item(item.id, &json!({})).await.unwrap();
        }
    }

    let counts = h.store.count_items(job.id).await.unwrap();
    let progress = tradeflow::jobs::progress::RunClock::start(Utc::now(), 0, 0).snapshot(
        &counts,
        3,
        Utc::now(),
        Some("DEPENDENCY_DOWN: offline".into()),
        Some(2),
    );
    assert!(h
        .store
        .finish_job(job.id, "w", JobStatus::Partial, &progress)
        .await
        .unwrap());

    assert_eq!(h.manager.retry_failed(job.id).await.unwrap(), 1);
    let job = h.job(job.id).await;
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.failed_items, 0);
    assert_eq!(job.processed_items, 2);
    assert_aggregates_consistent(&h, job.id).await;

    let outcome = h.scheduler(fast_config()).run_job(job.id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished(JobStatus::Succeeded));
}

#[tokio::test]
#[serial]
async fn delete_removes_every_record() {
    let Some(pool) = setup_db().await else { return };
    let h = pg_harness(pool.clone(), registry_with(Succeed(JobType::DocumentValidation)));
    let job = h.submit(JobType::DocumentValidation, &ids("BL", 3)).await;
    h.scheduler(fast_config()).run_job(job.id).await.unwrap();

    h.manager.delete_job(job.id).await.unwrap();

    for table in ["batch_items", "item_failures", "job_events"] {
        let (n,): (i64,) =
            sqlx::query_as(&format!("SELECT COUNT(*) FROM {table} WHERE job_id = $1"))
                .bind(job.id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(n, 0, "{table} not cleaned up");
    }
    assert!(h.store.get_job(job.id).await.unwrap().is_none());
}

#[tokio::test]
#[serial]
async fn templates_round_trip_through_postgres() {
    let Some(pool) = setup_db().await else { return };
    let h = pg_harness(pool, registry_with(Threshold));

    let template = h
        .manager
        .create_template("ofac", JobType::SanctionsScreening, json!({ "threshold": 0.8 }))
        .await
        .unwrap();
    h.store.touch_template(template.id).await.unwrap();

    let fetched = h.store.get_template(template.id).await.unwrap().unwrap();
    assert_eq!(fetched.usage_count, 1);
    assert_eq!(fetched.config, json!({ "threshold": 0.8, "lists": [] }));
    assert_eq!(
        h.store
            .list_templates(Some(JobType::HsClassification))
            .await
            .unwrap()
            .len(),
        0
    );
}

#[tokio::test]
#[serial]
async fn released_items_return_their_attempt_and_leased_jobs_refuse_reset() {
    let Some(pool) = setup_db().await else { return };
    let h = pg_harness(pool, registry_with(Succeed(JobType::DocumentValidation)));
    let job = h.submit(JobType::DocumentValidation, &ids("BL", 2)).await;

    let lease_until = Utc::now() + chrono::Duration::seconds(30);
    h.store.lease_job(job.id, "w", lease_until).await.unwrap();
    let claimed = h.store.claim_items(job.id, 2, Utc::now()).await.unwrap();
    assert!(claimed.iter().all(|i| i.attempts == 1));

    assert!(h.store.release_item(claimed[0].id).await.unwrap());
    // only a processing item can be released
    assert!(!h.store.release_item(claimed[0].id).await.unwrap());

    let failure = NewFailure {
        attempt_number: claimed[1].attempts,
        error_code: "DEPENDENCY_DOWN".into(),
        message: "offline".into(),
        category: ErrorCategory::Network,
        severity: Severity::Critical,
        retriable: true,
        next_retry_at: None,
    };
    h.store
        .fail_item(claimed[1].id, &failure, ItemStatus::Failed)
        .await
        .unwrap();
    assert_eq!(h.store.reset_failed_items(job.id).await.unwrap(), 0);

    let items = h.manager.list_items(job.id, None).await.unwrap();
    let released = items.iter().find(|i| i.id == claimed[0].id).unwrap();
    assert_eq!(released.status, ItemStatus::Pending);
    assert_eq!(released.attempts, 0);
    let failed = items.iter().find(|i| i.id == claimed[1].id).unwrap();
    assert_eq!(failed.status, ItemStatus::Failed);
}
