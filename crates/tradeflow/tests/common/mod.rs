#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::sync::Semaphore;
use uuid::Uuid;

use tradeflow::jobs::{
    BatchScheduler, BlobSource, CreateJobRequest, Event, EventLog, EventSink, ItemContext, ItemOutcome, ItemStore,
    Job, JobManager, JobType, ManagerConfig, ManifestFormat, ManifestSource, MemoryStore,
    Processor, ProcessorConfig, ProcessorRegistry, RetryPolicy, SchedulerConfig,
};
use tradeflow::ItemError;

// ----------------------------
// Harness
// ----------------------------

pub struct Harness {
    pub store: Arc<dyn ItemStore>,
    pub registry: Arc<ProcessorRegistry>,
    pub events: EventLog,
    pub manager: JobManager,
}

impl Harness {
    pub fn scheduler(&self, config: SchedulerConfig) -> BatchScheduler {
        BatchScheduler::new(
            self.store.clone(),
            self.registry.clone(),
            self.events.clone(),
            config,
        )
    }

    pub async fn submit(&self, job_type: JobType, external_ids: &[String]) -> Job {
        self.manager
            .create_job(CreateJobRequest::new(
                "tenant-a",
                job_type,
                ManifestFormat::Json,
                json_manifest(external_ids),
            ))
            .await
            .expect("create job")
    }

    pub async fn job(&self, job_id: Uuid) -> Job {
        self.manager.get_job(job_id).await.expect("get job")
    }
}

pub fn memory_harness(registry: ProcessorRegistry) -> Harness {
    memory_harness_with(registry, StaticBlobs::default(), ManagerConfig::default())
}

pub fn memory_harness_with(
    registry: ProcessorRegistry,
    blobs: StaticBlobs,
    config: ManagerConfig,
) -> Harness {
    let store: Arc<dyn ItemStore> = Arc::new(MemoryStore::new());
    harness_on(store, registry, blobs, config)
}

pub fn harness_on(
    store: Arc<dyn ItemStore>,
    registry: ProcessorRegistry,
    blobs: StaticBlobs,
    config: ManagerConfig,
) -> Harness {
    let registry = Arc::new(registry);
    let events = EventLog::new(store.clone());
    let manager = JobManager::new(
        store.clone(),
        registry.clone(),
        events.clone(),
        Arc::new(blobs),
        config,
    );
    Harness {
        store,
        registry,
        events,
        manager,
    }
}

/// Immediate retries, short polls.
pub fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        worker_id: "test-worker".to_string(),
        batch_size: 10,
        concurrency: 4,
        lease_seconds: 30,
        poll_interval: Duration::from_millis(10),
        retry: RetryPolicy::new(0, 0),
    }
}

pub fn ids(prefix: &str, n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("{prefix}-{i}")).collect()
}

pub fn json_manifest(external_ids: &[String]) -> ManifestSource {
    let records: Vec<Value> = external_ids
        .iter()
        .map(|id| json!({ "external_id": id, "origin": "CNSHA" }))
        .collect();
    ManifestSource::Inline(serde_json::to_vec(&records).expect("serialize manifest"))
}

#[derive(Default)]
pub struct StaticBlobs {
    blobs: HashMap<String, Vec<u8>>,
}

impl StaticBlobs {
    pub fn with(mut self, reference: &str, bytes: Vec<u8>) -> Self {
        self.blobs.insert(reference.to_string(), bytes);
        self
    }
}

#[async_trait]
impl BlobSource for StaticBlobs {
    async fn fetch(&self, reference: &str) -> anyhow::Result<Vec<u8>> {
        self.blobs
            .get(reference)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such blob: {reference}"))
    }
}

// ----------------------------
// Fake processors
// ----------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NoConfig {}

impl ProcessorConfig for NoConfig {}

/// Completes every item, echoing its external id.
pub struct Succeed(pub JobType);

#[async_trait]
impl Processor for Succeed {
    type Config = NoConfig;

    fn job_type(&self) -> JobType {
        self.0
    }

    async fn execute(
        &self,
        _config: &NoConfig,
        ctx: &ItemContext,
        _payload: &Value,
    ) -> Result<ItemOutcome, ItemError> {
        Ok(ItemOutcome::Completed(json!({ "checked": ctx.external_id })))
    }
}

/// Skips every item.
pub struct SkipAll(pub JobType);

#[async_trait]
impl Processor for SkipAll {
    type Config = NoConfig;

    fn job_type(&self) -> JobType {
        self.0
    }

    async fn execute(
        &self,
        _config: &NoConfig,
        _ctx: &ItemContext,
        _payload: &Value,
    ) -> Result<ItemOutcome, ItemError> {
        Ok(ItemOutcome::Skipped("nothing to do".into()))
    }
}

/// Fails the listed external ids with `error` on every attempt; completes the rest.
pub struct FailFor {
    pub job_type: JobType,
    pub external_ids: Vec<String>,
    pub error: ItemError,
}

#[async_trait]
impl Processor for FailFor {
    type Config = NoConfig;

    fn job_type(&self) -> JobType {
        self.job_type
    }

    async fn execute(
        &self,
        _config: &NoConfig,
        ctx: &ItemContext,
        _payload: &Value,
    ) -> Result<ItemOutcome, ItemError> {
        if self.external_ids.contains(&ctx.external_id) {
            return Err(self.error.clone());
        }
        Ok(ItemOutcome::Completed(json!({ "checked": ctx.external_id })))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Seen {
    pub external_id: String,
    pub idempotency_key: String,
    pub attempt: i32,
}

/// Records every call; fails with a network error until `fail_attempts` is passed.
#[derive(Clone)]
pub struct Recording {
    pub job_type: JobType,
    pub fail_attempts: i32,
    pub seen: Arc<Mutex<Vec<Seen>>>,
}

impl Recording {
    pub fn new(job_type: JobType, fail_attempts: i32) -> Self {
        Self {
            job_type,
            fail_attempts,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Processor for Recording {
    type Config = NoConfig;

    fn job_type(&self) -> JobType {
        self.job_type
    }

    async fn execute(
        &self,
        _config: &NoConfig,
        ctx: &ItemContext,
        _payload: &Value,
    ) -> Result<ItemOutcome, ItemError> {
        self.seen.lock().push(Seen {
            external_id: ctx.external_id.clone(),
            idempotency_key: ctx.idempotency_key.clone(),
            attempt: ctx.attempt,
        });
        if ctx.attempt <= self.fail_attempts {
            return Err(ItemError::network("DEPENDENCY_DOWN", "registry unreachable"));
        }
        Ok(ItemOutcome::Completed(json!({ "attempt": ctx.attempt })))
    }
}

/// Downstream system that dedupes on the idempotency key: a repeated key is
/// acknowledged without applying the effect again. Ids in `lost_acks` apply
/// their effect on the first delivery, then fail with a network error as if
/// the acknowledgement never arrived.
#[derive(Clone)]
pub struct Ledger {
    pub job_type: JobType,
    pub lost_acks: Vec<String>,
    state: Arc<Mutex<LedgerState>>,
}

#[derive(Default)]
struct LedgerState {
    applied_keys: HashMap<String, String>,
    effects: HashMap<String, u32>,
    deliveries: HashMap<String, u32>,
}

impl Ledger {
    pub fn new(job_type: JobType, lost_acks: &[&str]) -> Self {
        Self {
            job_type,
            lost_acks: lost_acks.iter().map(|s| s.to_string()).collect(),
            state: Arc::new(Mutex::new(LedgerState::default())),
        }
    }

    /// Effects applied per external id.
    pub fn effects(&self) -> HashMap<String, u32> {
        self.state.lock().effects.clone()
    }

    /// Processor invocations per external id.
    pub fn deliveries(&self) -> HashMap<String, u32> {
        self.state.lock().deliveries.clone()
    }
}

#[async_trait]
impl Processor for Ledger {
    type Config = NoConfig;

    fn job_type(&self) -> JobType {
        self.job_type
    }

    async fn execute(
        &self,
        _config: &NoConfig,
        ctx: &ItemContext,
        _payload: &Value,
    ) -> Result<ItemOutcome, ItemError> {
        let delivery = {
            let mut state = self.state.lock();
            let delivery = {
                let n = state.deliveries.entry(ctx.external_id.clone()).or_insert(0);
                *n += 1;
                *n
            };
            if !state.applied_keys.contains_key(&ctx.idempotency_key) {
                state
                    .applied_keys
                    .insert(ctx.idempotency_key.clone(), ctx.external_id.clone());
                *state.effects.entry(ctx.external_id.clone()).or_insert(0) += 1;
            }
            delivery
        };
        if delivery == 1 && self.lost_acks.contains(&ctx.external_id) {
            return Err(ItemError::network("DEPENDENCY_DOWN", "ledger ack lost"));
        }
        Ok(ItemOutcome::Completed(json!({ "posted": ctx.external_id })))
    }
}

/// Holds every item until the test releases it.
#[derive(Clone)]
pub struct Gate {
    pub job_type: JobType,
    /// One permit added per item that entered the processor.
    pub entered: Arc<Semaphore>,
    /// One permit consumed per item allowed to finish.
    pub release: Arc<Semaphore>,
}

impl Gate {
    pub fn new(job_type: JobType) -> Self {
        Self {
            job_type,
            entered: Arc::new(Semaphore::new(0)),
            release: Arc::new(Semaphore::new(0)),
        }
    }

    pub async fn wait_entered(&self, n: u32) {
        self.entered
            .acquire_many(n)
            .await
            .expect("gate closed")
            .forget();
    }

    pub fn open(&self) {
        self.release.add_permits(10_000);
    }
}

#[async_trait]
impl Processor for Gate {
    type Config = NoConfig;

    fn job_type(&self) -> JobType {
        self.job_type
    }

    async fn execute(
        &self,
        _config: &NoConfig,
        ctx: &ItemContext,
        _payload: &Value,
    ) -> Result<ItemOutcome, ItemError> {
        self.entered.add_permits(1);
        if let Ok(permit) = self.release.acquire().await {
            permit.forget();
        }
        Ok(ItemOutcome::Completed(json!({ "checked": ctx.external_id })))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub threshold: f64,
    #[serde(default)]
    pub lists: Vec<String>,
}

impl ProcessorConfig for ThresholdConfig {
    fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(format!("threshold must be within 0..=1, got {}", self.threshold));
        }
        Ok(())
    }
}

/// Sanctions-style processor with a required, validated config.
pub struct Threshold;

#[async_trait]
impl Processor for Threshold {
    type Config = ThresholdConfig;

    fn job_type(&self) -> JobType {
        JobType::SanctionsScreening
    }

    async fn execute(
        &self,
        config: &ThresholdConfig,
        _ctx: &ItemContext,
        _payload: &Value,
    ) -> Result<ItemOutcome, ItemError> {
        Ok(ItemOutcome::Completed(json!({ "threshold": config.threshold })))
    }
}

pub fn registry_with<P: Processor>(processor: P) -> ProcessorRegistry {
    let mut registry = ProcessorRegistry::new();
    registry.register(processor);
    registry
}

/// Polls until the job reaches a terminal status or the deadline passes.
pub async fn wait_terminal(h: &Harness, job_id: Uuid, within: Duration) -> Job {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let job = h.job(job_id).await;
        if job.status.is_terminal() || tokio::time::Instant::now() >= deadline {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Job aggregates must match its item rows and stay within bounds.
pub async fn assert_aggregates_consistent(h: &Harness, job_id: Uuid) {
    let job = h.job(job_id).await;
    let counts = h.store.count_items(job_id).await.expect("count items");

    assert_eq!(
        job.processed_items,
        job.succeeded_items + job.failed_items + job.skipped_items
    );
    assert!(job.processed_items <= job.total_items);
    assert_eq!(counts.total(), job.total_items);
    assert_eq!(job.succeeded_items, counts.succeeded);
    assert_eq!(job.failed_items, counts.failed);
    assert_eq!(job.skipped_items, counts.skipped);
    assert!((0.0..=100.0).contains(&job.progress_percent));
}

// ----------------------------
// PostgreSQL
// ----------------------------

/// Connects to `TEST_DATABASE_URL`, migrates and truncates. `None` when the
/// variable is unset so the suite still runs without a database.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping postgres test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query(
        r#"
        TRUNCATE TABLE
            job_events,
            item_failures,
            batch_items,
            batch_jobs,
            job_templates
        RESTART IDENTITY CASCADE
        "#,
    )
    .execute(&pool)
    .await
    .expect("truncate failed");

    Some(pool)
}

/// Event sink that never finishes a delivery.
pub struct HangingSink;

#[async_trait]
impl EventSink for HangingSink {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn emit(&self, _event: &Event) -> anyhow::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}
