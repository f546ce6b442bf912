// crates/tradeflow/src/jobs/repo.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ErrorCategory;
use crate::jobs::manifest::ManifestFormat;
use crate::jobs::model::{
    Event, EventType, FailureRecord, Item, ItemCounts, ItemStatus, Job, JobStatus, JobType,
    NewEvent, NewFailure, NewItem, NewJob, NewTemplate, Severity, Template,
};
use crate::jobs::progress::JobProgress;
use crate::jobs::store::{ItemStore, JobFilter};

/// [`ItemStore`] backed by PostgreSQL.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ----------------------------
// Row types
// ----------------------------

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    tenant_id: String,
    job_type: String,
    config: Value,
    priority: i32,
    status: String,
    max_attempts: i32,
    manifest_format: String,
    manifest_records: i32,
    truncated_records: i32,
    template_id: Option<Uuid>,
    total_items: i32,
    processed_items: i32,
    succeeded_items: i32,
    failed_items: i32,
    skipped_items: i32,
    progress_percent: f64,
    throughput_items_per_sec: f64,
    estimated_completion_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    checkpoint_seq: Option<i32>,
    worker_id: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = anyhow::Error;

    fn try_from(r: JobRow) -> anyhow::Result<Self> {
        Ok(Job {
            id: r.id,
            tenant_id: r.tenant_id,
            job_type: parse_job_type(&r.job_type)?,
            config: r.config,
            priority: r.priority,
            status: JobStatus::parse(&r.status)
                .ok_or_else(|| anyhow::anyhow!("unknown job status {:?}", r.status))?,
            max_attempts: r.max_attempts,
            manifest_format: ManifestFormat::parse(&r.manifest_format)?,
            manifest_records: r.manifest_records,
            truncated_records: r.truncated_records,
            template_id: r.template_id,
            total_items: r.total_items,
            processed_items: r.processed_items,
            succeeded_items: r.succeeded_items,
            failed_items: r.failed_items,
            skipped_items: r.skipped_items,
            progress_percent: r.progress_percent,
            throughput_items_per_sec: r.throughput_items_per_sec,
            estimated_completion_at: r.estimated_completion_at,
            last_error: r.last_error,
            checkpoint_seq: r.checkpoint_seq,
            worker_id: r.worker_id,
            lease_expires_at: r.lease_expires_at,
            created_at: r.created_at,
            started_at: r.started_at,
            finished_at: r.finished_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ItemRow {
    id: Uuid,
    job_id: Uuid,
    seq: i32,
    external_id: String,
    payload: Value,
    status: String,
    attempts: i32,
    max_attempts: i32,
    idempotency_key: String,
    result: Option<Value>,
    last_error_code: Option<String>,
    last_error_category: Option<String>,
    last_error_message: Option<String>,
    retriable: bool,
    next_attempt_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ItemRow> for Item {
    type Error = anyhow::Error;

    fn try_from(r: ItemRow) -> anyhow::Result<Self> {
        Ok(Item {
            id: r.id,
            job_id: r.job_id,
            seq: r.seq,
            external_id: r.external_id,
            payload: r.payload,
            status: ItemStatus::parse(&r.status)
                .ok_or_else(|| anyhow::anyhow!("unknown item status {:?}", r.status))?,
            attempts: r.attempts,
            max_attempts: r.max_attempts,
            idempotency_key: r.idempotency_key,
            result: r.result,
            last_error_code: r.last_error_code,
            last_error_category: r.last_error_category.as_deref().and_then(ErrorCategory::parse),
            last_error_message: r.last_error_message,
            retriable: r.retriable,
            next_attempt_at: r.next_attempt_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct FailureRow {
    id: Uuid,
    job_id: Uuid,
    item_id: Uuid,
    attempt_number: i32,
    error_code: String,
    message: String,
    category: String,
    severity: String,
    retriable: bool,
    next_retry_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<FailureRow> for FailureRecord {
    type Error = anyhow::Error;

    fn try_from(r: FailureRow) -> anyhow::Result<Self> {
        Ok(FailureRecord {
            id: r.id,
            job_id: r.job_id,
            item_id: r.item_id,
            attempt_number: r.attempt_number,
            error_code: r.error_code,
            message: r.message,
            category: ErrorCategory::parse(&r.category)
                .ok_or_else(|| anyhow::anyhow!("unknown error category {:?}", r.category))?,
            severity: Severity::parse(&r.severity)
                .ok_or_else(|| anyhow::anyhow!("unknown severity {:?}", r.severity))?,
            retriable: r.retriable,
            next_retry_at: r.next_retry_at,
            created_at: r.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    job_id: Uuid,
    event_type: String,
    payload: Value,
    actor: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for Event {
    type Error = anyhow::Error;

    fn try_from(r: EventRow) -> anyhow::Result<Self> {
        Ok(Event {
            id: r.id,
            job_id: r.job_id,
            event_type: EventType::parse(&r.event_type)
                .ok_or_else(|| anyhow::anyhow!("unknown event type {:?}", r.event_type))?,
            payload: r.payload,
            actor: r.actor,
            created_at: r.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TemplateRow {
    id: Uuid,
    name: String,
    job_type: String,
    config: Value,
    usage_count: i64,
    last_used_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<TemplateRow> for Template {
    type Error = anyhow::Error;

    fn try_from(r: TemplateRow) -> anyhow::Result<Self> {
        Ok(Template {
            id: r.id,
            name: r.name,
            job_type: parse_job_type(&r.job_type)?,
            config: r.config,
            usage_count: r.usage_count,
            last_used_at: r.last_used_at,
            created_at: r.created_at,
        })
    }
}

fn parse_job_type(s: &str) -> anyhow::Result<JobType> {
    JobType::parse(s).ok_or_else(|| anyhow::anyhow!("unknown job type {s:?}"))
}

fn convert_all<R, T>(rows: Vec<R>) -> anyhow::Result<Vec<T>>
where
    T: TryFrom<R, Error = anyhow::Error>,
{
    rows.into_iter().map(T::try_from).collect()
}

#[async_trait]
impl ItemStore for PgStore {
    // ----------------------------
    // Jobs
    // ----------------------------

    async fn create_job(&self, job: NewJob, items: Vec<NewItem>) -> anyhow::Result<Job> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO batch_jobs (
                id, tenant_id, job_type, config, priority, status, max_attempts,
                manifest_format, manifest_records, truncated_records, template_id,
                total_items
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(&job.tenant_id)
        .bind(job.job_type.as_str())
        .bind(&job.config)
        .bind(job.priority)
        .bind(JobStatus::Pending.as_str())
        .bind(job.max_attempts)
        .bind(job.manifest_format.as_str())
        .bind(job.manifest_records)
        .bind(job.truncated_records)
        .bind(job.template_id)
        .bind(items.len() as i32)
        .fetch_one(&mut *tx)
        .await?;

        let ids: Vec<Uuid> = items.iter().map(|i| i.id).collect();
        let seqs: Vec<i32> = items.iter().map(|i| i.seq).collect();
        let external_ids: Vec<String> = items.iter().map(|i| i.external_id.clone()).collect();
        let payloads: Vec<Value> = items.iter().map(|i| i.payload.clone()).collect();
        let keys: Vec<String> = items.iter().map(|i| i.idempotency_key.clone()).collect();

        sqlx::query(
            r#"
            INSERT INTO batch_items (
                id, job_id, seq, external_id, payload, status, attempts, max_attempts, idempotency_key
            )
            SELECT t.id, $1, t.seq, t.external_id, t.payload, $2, 0, $3, t.idempotency_key
            FROM unnest($4::uuid[], $5::int4[], $6::text[], $7::jsonb[], $8::text[])
                AS t(id, seq, external_id, payload, idempotency_key)
            "#,
        )
        .bind(job.id)
        .bind(ItemStatus::Pending.as_str())
        .bind(job.max_attempts)
        .bind(&ids)
        .bind(&seqs)
        .bind(&external_ids)
        .bind(&payloads)
        .bind(&keys)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Job::try_from(row)
    }

    async fn get_job(&self, job_id: Uuid) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM batch_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> anyhow::Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT *
            FROM batch_jobs
            WHERE ($1::text IS NULL OR tenant_id = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#,
        )
        .bind(filter.tenant_id.as_deref())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn runnable_jobs(&self, now: DateTime<Utc>, limit: i64) -> anyhow::Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id
            FROM batch_jobs
            WHERE status = 'pending'
               OR (status = 'running' AND (lease_expires_at IS NULL OR lease_expires_at < $1))
            ORDER BY priority DESC, created_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn lease_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease_until: DateTime<Utc>,
    ) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE batch_jobs
            SET status = 'running',
                worker_id = $2,
                lease_expires_at = $3,
                started_at = COALESCE(started_at, now()),
                finished_at = NULL,
                updated_at = now()
            WHERE id = $1
              AND (
                status = 'pending'
                OR (status = 'running' AND (lease_expires_at IS NULL OR lease_expires_at < now()))
              )
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(lease_until)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Job::try_from).transpose()
    }

    async fn renew_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease_until: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE batch_jobs
            SET lease_expires_at = $3
            WHERE id = $1 AND status = 'running' AND worker_id = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(lease_until)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn set_job_status(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
    ) -> anyhow::Result<bool> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let res = sqlx::query(
            r#"
            UPDATE batch_jobs
            SET status = $3,
                lease_expires_at = NULL,
                finished_at = CASE WHEN $4 THEN now() ELSE NULL END,
                updated_at = now()
            WHERE id = $1 AND status = ANY($2::text[])
            "#,
        )
        .bind(job_id)
        .bind(&from)
        .bind(to.as_str())
        .bind(to.is_terminal())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn finish_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        status: JobStatus,
        progress: &JobProgress,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE batch_jobs
            SET status = $3,
                processed_items = $4,
                succeeded_items = $5,
                failed_items = $6,
                skipped_items = $7,
                progress_percent = $8,
                throughput_items_per_sec = $9,
                estimated_completion_at = $10,
                last_error = COALESCE($11, last_error),
                checkpoint_seq = COALESCE($12, checkpoint_seq),
                lease_expires_at = NULL,
                finished_at = now(),
                updated_at = now()
            WHERE id = $1
              AND status = 'running'
              AND worker_id = $2
              AND NOT EXISTS (
                SELECT 1 FROM batch_items
                WHERE job_id = $1 AND status IN ('pending', 'processing', 'retried')
              )
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(status.as_str())
        .bind(progress.processed_items)
        .bind(progress.succeeded_items)
        .bind(progress.failed_items)
        .bind(progress.skipped_items)
        .bind(progress.progress_percent)
        .bind(progress.throughput_items_per_sec)
        .bind(progress.estimated_completion_at)
        .bind(progress.last_error.as_deref())
        .bind(progress.checkpoint_seq)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn save_progress(&self, job_id: Uuid, progress: &JobProgress) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE batch_jobs
            SET processed_items = $2,
                succeeded_items = $3,
                failed_items = $4,
                skipped_items = $5,
                progress_percent = $6,
                throughput_items_per_sec = $7,
                estimated_completion_at = $8,
                last_error = COALESCE($9, last_error),
                checkpoint_seq = COALESCE($10, checkpoint_seq),
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(progress.processed_items)
        .bind(progress.succeeded_items)
        .bind(progress.failed_items)
        .bind(progress.skipped_items)
        .bind(progress.progress_percent)
        .bind(progress.throughput_items_per_sec)
        .bind(progress.estimated_completion_at)
        .bind(progress.last_error.as_deref())
        .bind(progress.checkpoint_seq)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_job(&self, job_id: Uuid) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;

        // children first: no FK cascades
        sqlx::query("DELETE FROM job_events WHERE job_id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM item_failures WHERE job_id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM batch_items WHERE job_id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM batch_jobs WHERE id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(deleted > 0)
    }

    // ----------------------------
    // Items
    // ----------------------------

    async fn requeue_stale_items(&self, job_id: Uuid) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE batch_items
            SET status = 'pending', updated_at = now()
            WHERE job_id = $1 AND status = 'processing'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn claim_items(
        &self,
        job_id: Uuid,
        limit: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Item>> {
        let rows = sqlx::query_as::<_, ItemRow>(
            r#"
            UPDATE batch_items
            SET status = 'processing',
                attempts = attempts + 1,
                next_attempt_at = NULL,
                updated_at = now()
            WHERE id IN (
                SELECT id
                FROM batch_items
                WHERE job_id = $1
                  AND (
                    status = 'pending'
                    OR (status = 'retried' AND (next_attempt_at IS NULL OR next_attempt_at <= $2))
                  )
                ORDER BY seq ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $3
            )
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(now)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        // RETURNING order is unspecified
        let mut items: Vec<Item> = convert_all(rows)?;
        items.sort_by_key(|i| i.seq);
        Ok(items)
    }

    async fn complete_item(&self, item_id: Uuid, result: &Value) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE batch_items
            SET status = 'succeeded', result = $2, retriable = FALSE, updated_at = now()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(item_id)
        .bind(result)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn release_item(&self, item_id: Uuid) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE batch_items
            SET status = 'pending', attempts = GREATEST(attempts - 1, 0), updated_at = now()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn skip_item(&self, item_id: Uuid, reason: &str) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE batch_items
            SET status = 'skipped', last_error_message = $2, retriable = FALSE, updated_at = now()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(item_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn fail_item(
        &self,
        item_id: Uuid,
        failure: &NewFailure,
        next_status: ItemStatus,
    ) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;

        let job_id = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE batch_items
            SET status = $2,
                last_error_code = $3,
                last_error_category = $4,
                last_error_message = $5,
                retriable = $6,
                next_attempt_at = $7,
                updated_at = now()
            WHERE id = $1 AND status = 'processing'
            RETURNING job_id
            "#,
        )
        .bind(item_id)
        .bind(next_status.as_str())
        .bind(&failure.error_code)
        .bind(failure.category.as_str())
        .bind(&failure.message)
        .bind(failure.retriable)
        .bind(failure.next_retry_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job_id) = job_id else {
            tx.rollback().await?;
            return Ok(false);
        };

        sqlx::query(
            r#"
            INSERT INTO item_failures (
                id, job_id, item_id, attempt_number, error_code, message,
                category, severity, retriable, next_retry_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job_id)
        .bind(item_id)
        .bind(failure.attempt_number)
        .bind(&failure.error_code)
        .bind(&failure.message)
        .bind(failure.category.as_str())
        .bind(failure.severity.as_str())
        .bind(failure.retriable)
        .bind(failure.next_retry_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn count_items(&self, job_id: Uuid) -> anyhow::Result<ItemCounts> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT status, COUNT(*)
            FROM batch_items
            WHERE job_id = $1
            GROUP BY status
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = ItemCounts::default();
        for (status, n) in rows {
            let n = n as i32;
            match ItemStatus::parse(&status) {
                Some(ItemStatus::Pending) => counts.pending = n,
                Some(ItemStatus::Processing) => counts.processing = n,
                Some(ItemStatus::Retried) => counts.retried = n,
                Some(ItemStatus::Succeeded) => counts.succeeded = n,
                Some(ItemStatus::Failed) => counts.failed = n,
                Some(ItemStatus::Skipped) => counts.skipped = n,
                None => anyhow::bail!("unknown item status {status:?}"),
            }
        }
        Ok(counts)
    }

    async fn next_retry_at(&self, job_id: Uuid) -> anyhow::Result<Option<DateTime<Utc>>> {
        let at = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            r#"
            SELECT MIN(next_attempt_at)
            FROM batch_items
            WHERE job_id = $1 AND status = 'retried'
            "#,
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(at)
    }

    async fn list_items(
        &self,
        job_id: Uuid,
        status: Option<ItemStatus>,
    ) -> anyhow::Result<Vec<Item>> {
        let rows = sqlx::query_as::<_, ItemRow>(
            r#"
            SELECT *
            FROM batch_items
            WHERE job_id = $1
              AND ($2::text IS NULL OR status = $2)
            ORDER BY seq ASC
            "#,
        )
        .bind(job_id)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn list_failures(&self, job_id: Uuid) -> anyhow::Result<Vec<FailureRecord>> {
        let rows = sqlx::query_as::<_, FailureRow>(
            r#"
            SELECT *
            FROM item_failures
            WHERE job_id = $1
            ORDER BY created_at ASC, attempt_number ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn reset_failed_items(&self, job_id: Uuid) -> anyhow::Result<u64> {
        let mut tx = self.pool.begin().await?;

        // row lock keeps a scheduler from leasing the job mid-reset
        let status = sqlx::query_scalar::<_, String>(
            "SELECT status FROM batch_jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;
        match status.as_deref() {
            None | Some("running") | Some("cancelled") => {
                tx.rollback().await?;
                return Ok(0);
            }
            Some(_) => {}
        }

        let reset = sqlx::query(
            r#"
            UPDATE batch_items
            SET status = 'pending', next_attempt_at = NULL, updated_at = now()
            WHERE job_id = $1
              AND status = 'failed'
              AND retriable
              AND attempts < max_attempts
            "#,
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if reset > 0 {
            // re-derive aggregates from item rows so the counts invariant holds
            sqlx::query(
                r#"
                UPDATE batch_jobs j
                SET succeeded_items = c.s,
                    failed_items = c.f,
                    skipped_items = c.k,
                    processed_items = c.s + c.f + c.k,
                    progress_percent = CASE
                        WHEN j.total_items > 0
                        THEN round((c.s + c.f + c.k) * 100.0 / j.total_items, 2)::float8
                        ELSE 100
                    END,
                    updated_at = now()
                FROM (
                    SELECT
                        COUNT(*) FILTER (WHERE status = 'succeeded')::int AS s,
                        COUNT(*) FILTER (WHERE status = 'failed')::int AS f,
                        COUNT(*) FILTER (WHERE status = 'skipped')::int AS k
                    FROM batch_items
                    WHERE job_id = $1
                ) c
                WHERE j.id = $1
                "#,
            )
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(reset)
    }

    // ----------------------------
    // Events
    // ----------------------------

    async fn append_event(&self, event: NewEvent) -> anyhow::Result<Event> {
        let row = sqlx::query_as::<_, EventRow>(
            r#"
            INSERT INTO job_events (id, job_id, event_type, payload, actor)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, job_id, event_type, payload, actor, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.job_id)
        .bind(event.event_type.as_str())
        .bind(&event.payload)
        .bind(event.actor.as_deref())
        .fetch_one(&self.pool)
        .await?;
        Event::try_from(row)
    }

    async fn list_events(&self, job_id: Uuid) -> anyhow::Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, job_id, event_type, payload, actor, created_at
            FROM job_events
            WHERE job_id = $1
            ORDER BY created_at ASC, seq ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    // ----------------------------
    // Templates
    // ----------------------------

    async fn insert_template(&self, template: NewTemplate) -> anyhow::Result<Template> {
        let row = sqlx::query_as::<_, TemplateRow>(
            r#"
            INSERT INTO job_templates (id, name, job_type, config)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&template.name)
        .bind(template.job_type.as_str())
        .bind(&template.config)
        .fetch_one(&self.pool)
        .await?;
        Template::try_from(row)
    }

    async fn get_template(&self, template_id: Uuid) -> anyhow::Result<Option<Template>> {
        let row = sqlx::query_as::<_, TemplateRow>("SELECT * FROM job_templates WHERE id = $1")
            .bind(template_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Template::try_from).transpose()
    }

    async fn list_templates(&self, job_type: Option<JobType>) -> anyhow::Result<Vec<Template>> {
        let rows = sqlx::query_as::<_, TemplateRow>(
            r#"
            SELECT *
            FROM job_templates
            WHERE ($1::text IS NULL OR job_type = $1)
            ORDER BY name ASC
            "#,
        )
        .bind(job_type.map(|t| t.as_str()))
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn touch_template(&self, template_id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE job_templates
            SET usage_count = usage_count + 1, last_used_at = now()
            WHERE id = $1
            "#,
        )
        .bind(template_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
