pub mod dispatcher;
pub mod error_codes;
pub mod events;
pub mod manager;
pub mod manifest;
pub mod memory_store;
pub mod model;
pub mod progress;
pub mod registry;
pub mod repo;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod timeline;

pub use dispatcher::{DispatcherConfig, JobDispatcher, JobQueue, JobQueueReceiver};
pub use events::{BroadcastSink, EventLog, EventSink};
pub use manager::{CreateJobRequest, JobManager, ManagerConfig};
pub use manifest::{BlobSource, FsBlobSource, ManifestFormat, ManifestSource};
pub use memory_store::MemoryStore;
pub use model::{
    Event, EventType, FailureRecord, Item, ItemCounts, ItemStatus, Job, JobStatus, JobType,
    Severity, Template,
};
pub use registry::{
    ItemContext, ItemOutcome, Processor, ProcessorConfig, ProcessorOptions, ProcessorRegistry,
};
pub use repo::PgStore;
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{BatchScheduler, RunOutcome, SchedulerConfig};
pub use store::{ItemStore, JobFilter};
pub use timeline::JobReport;
