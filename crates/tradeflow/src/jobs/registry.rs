//! Processor registry.
//!
//! Processors are written against a typed [`Processor`] trait whose associated
//! `Config` is validated once, when a job is created. The registry stores them
//! type-erased behind [`DynProcessor`] so processors with different config types
//! share one map keyed by [`JobType`].
//!
//! Before a job runs, its stored config is bound to the processor, producing a
//! [`BoundProcessor`] the scheduler can hand to every item task without knowing
//! the concrete type.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use uuid::Uuid;

use crate::error::{ItemError, ValidationError};
use crate::jobs::error_codes::ErrorCode;
use crate::jobs::model::JobType;

/// Typed, validated configuration of one job type.
pub trait ProcessorConfig: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Rejects configs that deserialize but are unusable. The message ends up in
    /// [`ValidationError::InvalidConfig`].
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// What a processor did with one item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Completed(Value),
    /// The processor decided the item needs no work. Terminal, not a failure.
    Skipped(String),
}

/// Per-attempt context handed to a processor.
///
/// `idempotency_key` is identical across every attempt of the same item;
/// processors with side effects must dedupe on it.
#[derive(Debug, Clone)]
pub struct ItemContext {
    pub job_id: Uuid,
    pub item_id: Uuid,
    pub external_id: String,
    pub idempotency_key: String,
    pub attempt: i32,
}

#[async_trait]
pub trait Processor: Send + Sync + 'static {
    type Config: ProcessorConfig;

    fn job_type(&self) -> JobType;

    async fn execute(
        &self,
        config: &Self::Config,
        ctx: &ItemContext,
        payload: &Value,
    ) -> Result<ItemOutcome, ItemError>;
}

// ----------------------------
// Type erasure
// ----------------------------

/// Object-safe view of a [`Processor`].
pub trait DynProcessor: Send + Sync {
    fn job_type(&self) -> JobType;

    /// Deserializes and validates `config`, returning it normalized (defaults
    /// filled in) for storage on the job.
    fn validate_config(&self, config: &Value) -> Result<Value, ValidationError>;

    fn bind(self: Arc<Self>, config: &Value) -> Result<Arc<dyn ErasedBound>, ValidationError>;
}

#[async_trait]
pub trait ErasedBound: Send + Sync {
    async fn execute(&self, ctx: &ItemContext, payload: &Value) -> Result<ItemOutcome, ItemError>;
}

struct Bound<P: Processor> {
    processor: Arc<P>,
    config: P::Config,
}

#[async_trait]
impl<P: Processor> ErasedBound for Bound<P> {
    async fn execute(&self, ctx: &ItemContext, payload: &Value) -> Result<ItemOutcome, ItemError> {
        self.processor.execute(&self.config, ctx, payload).await
    }
}

fn typed_config<C: ProcessorConfig>(job_type: JobType, config: &Value) -> Result<C, ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidConfig {
        job_type: job_type.as_str().to_string(),
        reason,
    };

    // absent config means "all defaults"
    let raw = if config.is_null() {
        Value::Object(Default::default())
    } else {
        config.clone()
    };

    let typed: C = serde_json::from_value(raw).map_err(|e| invalid(e.to_string()))?;
    typed.validate().map_err(invalid)?;
    Ok(typed)
}

impl<P: Processor> DynProcessor for P {
    fn job_type(&self) -> JobType {
        Processor::job_type(self)
    }

    fn validate_config(&self, config: &Value) -> Result<Value, ValidationError> {
        let job_type = Processor::job_type(self);
        let typed: P::Config = typed_config(job_type, config)?;
        serde_json::to_value(&typed).map_err(|e| ValidationError::InvalidConfig {
            job_type: job_type.as_str().to_string(),
            reason: e.to_string(),
        })
    }

    fn bind(self: Arc<Self>, config: &Value) -> Result<Arc<dyn ErasedBound>, ValidationError> {
        let config: P::Config = typed_config(Processor::job_type(&*self), config)?;
        Ok(Arc::new(Bound {
            processor: self,
            config,
        }))
    }
}

// ----------------------------
// Registry
// ----------------------------

#[derive(Clone, Debug, Default)]
pub struct ProcessorOptions {
    max_concurrency: Option<usize>,
    timeout: Option<Duration>,
}

impl ProcessorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps in-flight items of this type across every job in the process.
    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    pub fn timeout(mut self, dur: Duration) -> Self {
        self.timeout = Some(dur);
        self
    }
}

#[derive(Clone)]
struct ProcessorEntry {
    processor: Arc<dyn DynProcessor>,
    semaphore: Option<Arc<Semaphore>>,
    timeout: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    entries: HashMap<JobType, ProcessorEntry>,
    default_timeout: Option<Duration>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timeout for processors registered without one of their own.
    pub fn with_default_timeout(mut self, dur: Duration) -> Self {
        self.default_timeout = Some(dur);
        self
    }

    pub fn register<P: Processor>(&mut self, processor: P) {
        self.register_with_options(processor, ProcessorOptions::new());
    }

    /// Replaces any processor already registered for the same job type.
    pub fn register_with_options<P: Processor>(&mut self, processor: P, opts: ProcessorOptions) {
        let job_type = Processor::job_type(&processor);
        let semaphore = opts
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        self.entries.insert(
            job_type,
            ProcessorEntry {
                processor: Arc::new(processor),
                semaphore,
                timeout: opts.timeout,
            },
        );
    }

    pub fn contains(&self, job_type: JobType) -> bool {
        self.entries.contains_key(&job_type)
    }

    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.entries.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }

    fn entry(&self, job_type: JobType) -> Result<&ProcessorEntry, ValidationError> {
        self.entries
            .get(&job_type)
            .ok_or_else(|| ValidationError::UnknownJobType(job_type.as_str().to_string()))
    }

    pub fn validate_config(&self, job_type: JobType, config: &Value) -> Result<Value, ValidationError> {
        self.entry(job_type)?.processor.validate_config(config)
    }

    pub fn bind(&self, job_type: JobType, config: &Value) -> Result<BoundProcessor, ValidationError> {
        let entry = self.entry(job_type)?;
        let inner = entry.processor.clone().bind(config)?;
        Ok(BoundProcessor {
            job_type,
            inner,
            semaphore: entry.semaphore.clone(),
            timeout: entry.timeout.or(self.default_timeout),
        })
    }
}

/// A processor with a job's config already applied. Cheap to clone into tasks.
#[derive(Clone)]
pub struct BoundProcessor {
    job_type: JobType,
    inner: Arc<dyn ErasedBound>,
    semaphore: Option<Arc<Semaphore>>,
    timeout: Option<Duration>,
}

impl BoundProcessor {
    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    /// Runs one attempt. Timeouts surface as `TIMEOUT` (network) and panics as
    /// `PANIC` (system); both are retriable.
    pub async fn run(&self, ctx: &ItemContext, payload: &Value) -> Result<ItemOutcome, ItemError> {
        let _permit = match &self.semaphore {
            Some(sem) => Some(sem.clone().acquire_owned().await.map_err(|_| {
                ItemError::system(ErrorCode::DependencyDown.as_str(), "processor semaphore closed")
            })?),
            None => None,
        };

        let fut = AssertUnwindSafe(self.inner.execute(ctx, payload)).catch_unwind();
        let res = match self.timeout {
            Some(dur) => match timeout(dur, fut).await {
                Ok(inner) => inner,
                Err(_) => {
                    return Err(ItemError::timeout(format!(
                        "processor timeout after {}ms",
                        dur.as_millis()
                    )))
                }
            },
            None => fut.await,
        };

        res.unwrap_or_else(|panic| {
            Err(ItemError::system(
                ErrorCode::Panic.as_str(),
                format!("processor panicked: {}", panic_message(panic.as_ref())),
            ))
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct EchoConfig {
        #[serde(default = "default_prefix")]
        prefix: String,
    }

    fn default_prefix() -> String {
        "echo".to_string()
    }

    impl ProcessorConfig for EchoConfig {
        fn validate(&self) -> Result<(), String> {
            if self.prefix.is_empty() {
                return Err("prefix must not be empty".to_string());
            }
            Ok(())
        }
    }

    struct Echo;

    #[async_trait]
    impl Processor for Echo {
        type Config = EchoConfig;

        fn job_type(&self) -> JobType {
            JobType::DocumentValidation
        }

        async fn execute(
            &self,
            config: &EchoConfig,
            ctx: &ItemContext,
            payload: &Value,
        ) -> Result<ItemOutcome, ItemError> {
            match payload.get("mode").and_then(Value::as_str) {
                Some("panic") => panic!("boom"),
                Some("slow") => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(ItemOutcome::Skipped("slow".into()))
                }
                _ => Ok(ItemOutcome::Completed(
                    json!({ "out": format!("{}:{}", config.prefix, ctx.external_id) }),
                )),
            }
        }
    }

    fn ctx() -> ItemContext {
        ItemContext {
            job_id: Uuid::new_v4(),
            item_id: Uuid::new_v4(),
            external_id: "DOC-1".into(),
            idempotency_key: "k".into(),
            attempt: 1,
        }
    }

    #[test]
    fn validate_config_fills_defaults() {
        let mut reg = ProcessorRegistry::new();
        reg.register(Echo);

        let cfg = reg
            .validate_config(JobType::DocumentValidation, &Value::Null)
            .unwrap();
        assert_eq!(cfg, json!({ "prefix": "echo" }));
    }

    #[test]
    fn validate_config_rejects_bad_values_and_unknown_types() {
        let mut reg = ProcessorRegistry::new();
        reg.register(Echo);

        let err = reg
            .validate_config(JobType::DocumentValidation, &json!({ "prefix": "" }))
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidConfig { .. }));

        let err = reg
            .validate_config(JobType::HsClassification, &json!({}))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownJobType("hs_classification".into())
        );
    }

    #[tokio::test]
    async fn bound_processor_runs_with_config() {
        let mut reg = ProcessorRegistry::new();
        reg.register(Echo);

        let bound = reg
            .bind(JobType::DocumentValidation, &json!({ "prefix": "chk" }))
            .unwrap();
        let out = bound.run(&ctx(), &json!({})).await.unwrap();
        assert_eq!(out, ItemOutcome::Completed(json!({ "out": "chk:DOC-1" })));
    }

    #[tokio::test]
    async fn panic_becomes_system_error() {
        let mut reg = ProcessorRegistry::new();
        reg.register(Echo);
        let bound = reg.bind(JobType::DocumentValidation, &json!({})).unwrap();

        let err = bound.run(&ctx(), &json!({ "mode": "panic" })).await.unwrap_err();
        assert_eq!(err.code, "PANIC");
        assert_eq!(err.category, crate::error::ErrorCategory::System);
        assert!(err.message.contains("boom"));
    }

    #[tokio::test]
    async fn timeout_becomes_network_error() {
        let mut reg = ProcessorRegistry::new();
        reg.register_with_options(
            Echo,
            ProcessorOptions::new().timeout(Duration::from_millis(20)),
        );
        let bound = reg.bind(JobType::DocumentValidation, &json!({})).unwrap();

        let err = bound.run(&ctx(), &json!({ "mode": "slow" })).await.unwrap_err();
        assert_eq!(err.code, "TIMEOUT");
        assert_eq!(err.category, crate::error::ErrorCategory::Network);
    }
}
