use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use uuid::Uuid;

use tradeflow::config::Config;
use tradeflow::jobs::{
    BatchScheduler, CreateJobRequest, EventLog, FsBlobSource, ItemStatus, ItemStore, JobDispatcher,
    JobFilter, JobManager, JobQueue, JobQueueReceiver, JobStatus, JobType, ManifestFormat,
    ManifestSource, PgStore, ProcessorRegistry,
};
use tradeflow::{db, telemetry};

mod handlers;

#[derive(Parser)]
#[command(
    name = "tradeflow-worker",
    version,
    about = "Batch orchestration for trade-document manifests"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher until Ctrl-C.
    Run,
    /// Apply database migrations and exit.
    Migrate,
    /// Create a job from a manifest.
    Submit {
        #[arg(long)]
        tenant: String,
        #[arg(long = "type", value_parser = parse_job_type)]
        job_type: JobType,
        /// Manifest path, relative to the manifest root unless --inline is set.
        #[arg(long)]
        manifest: String,
        #[arg(long, default_value = "json", value_parser = parse_format)]
        format: ManifestFormat,
        /// Read the manifest locally and submit its bytes instead of a reference.
        #[arg(long)]
        inline: bool,
        /// Processor config as a JSON object.
        #[arg(long)]
        config: Option<String>,
        #[arg(long, default_value_t = 0)]
        priority: i32,
        #[arg(long)]
        max_attempts: Option<i32>,
        #[arg(long)]
        template: Option<Uuid>,
    },
    Jobs {
        #[arg(long)]
        tenant: Option<String>,
        #[arg(long, value_parser = parse_job_status)]
        status: Option<JobStatus>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    Status {
        job_id: Uuid,
    },
    Items {
        job_id: Uuid,
        #[arg(long, value_parser = parse_item_status)]
        status: Option<ItemStatus>,
    },
    Failures {
        job_id: Uuid,
    },
    Events {
        job_id: Uuid,
    },
    Report {
        job_id: Uuid,
    },
    Cancel {
        job_id: Uuid,
    },
    /// Reset retriable failed items and reopen the job.
    Retry {
        job_id: Uuid,
    },
    Delete {
        job_id: Uuid,
    },
    #[command(subcommand)]
    Template(TemplateCommand),
}

#[derive(Subcommand)]
enum TemplateCommand {
    Create {
        #[arg(long)]
        name: String,
        #[arg(long = "type", value_parser = parse_job_type)]
        job_type: JobType,
        #[arg(long)]
        config: String,
    },
    List {
        #[arg(long = "type", value_parser = parse_job_type)]
        job_type: Option<JobType>,
    },
}

fn parse_job_type(s: &str) -> Result<JobType, String> {
    JobType::parse(s).ok_or_else(|| {
        let known: Vec<&str> = JobType::ALL.iter().map(JobType::as_str).collect();
        format!("unknown job type {s:?}; expected one of {}", known.join(", "))
    })
}

fn parse_format(s: &str) -> Result<ManifestFormat, String> {
    ManifestFormat::parse(s).map_err(|e| e.to_string())
}

fn parse_job_status(s: &str) -> Result<JobStatus, String> {
    JobStatus::parse(s).ok_or_else(|| format!("unknown job status {s:?}"))
}

fn parse_item_status(s: &str) -> Result<ItemStatus, String> {
    ItemStatus::parse(s).ok_or_else(|| format!("unknown item status {s:?}"))
}

fn parse_json(raw: Option<&str>) -> anyhow::Result<serde_json::Value> {
    match raw {
        Some(s) => serde_json::from_str(s).context("config is not valid JSON"),
        None => Ok(serde_json::Value::Null),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = Config::from_env()?;
    telemetry::init(cfg.log_json);

    let pool = db::make_pool(&cfg.database_url, &cfg.db).await?;
    if cfg.migrate_on_startup || matches!(cli.command, Command::Migrate) {
        db::run_migrations(&pool).await?;
    }

    let store: Arc<dyn ItemStore> = Arc::new(PgStore::new(pool));
    let registry = Arc::new(handlers::build_registry(cfg.processor_timeout()));
    let events = EventLog::new(store.clone());
    let blobs = Arc::new(FsBlobSource::new(cfg.manifest_root.clone()));
    let (queue, queue_rx) = JobQueue::new();

    let manager = JobManager::new(
        store.clone(),
        registry.clone(),
        events.clone(),
        blobs,
        cfg.manager_config(),
    )
    .with_queue(queue);

    match cli.command {
        Command::Run => run_dispatcher(&cfg, store, registry, events, queue_rx).await?,
        Command::Migrate => {}

        Command::Submit {
            tenant,
            job_type,
            manifest,
            format,
            inline,
            config,
            priority,
            max_attempts,
            template,
        } => {
            let source = if inline {
                let bytes = tokio::fs::read(PathBuf::from(&manifest))
                    .await
                    .with_context(|| format!("reading manifest {manifest}"))?;
                ManifestSource::Inline(bytes)
            } else {
                ManifestSource::Reference(manifest)
            };

            let mut req = CreateJobRequest::new(tenant, job_type, format, source)
                .config(parse_json(config.as_deref())?)
                .priority(priority);
            if let Some(n) = max_attempts {
                req = req.max_attempts(n);
            }
            if let Some(t) = template {
                req = req.template(t);
            }

            print_json(&manager.create_job(req).await?)?;
        }

        Command::Jobs {
            tenant,
            status,
            limit,
        } => {
            let filter = JobFilter {
                tenant_id: tenant,
                status,
                limit,
            };
            print_json(&manager.list_jobs(&filter).await?)?;
        }
        Command::Status { job_id } => print_json(&manager.get_job(job_id).await?)?,
        Command::Items { job_id, status } => {
            print_json(&manager.list_items(job_id, status).await?)?
        }
        Command::Failures { job_id } => print_json(&manager.list_failures(job_id).await?)?,
        Command::Events { job_id } => print_json(&manager.list_events(job_id).await?)?,
        Command::Report { job_id } => print_json(&manager.job_report(job_id).await?)?,
        Command::Cancel { job_id } => print_json(&manager.cancel_job(job_id).await?)?,
        Command::Retry { job_id } => {
            let reset = manager.retry_failed(job_id).await?;
            print_json(&serde_json::json!({ "job_id": job_id, "reset_items": reset }))?;
        }
        Command::Delete { job_id } => {
            manager.delete_job(job_id).await?;
            print_json(&serde_json::json!({ "job_id": job_id, "deleted": true }))?;
        }

        Command::Template(TemplateCommand::Create {
            name,
            job_type,
            config,
        }) => {
            let config = parse_json(Some(&config))?;
            print_json(&manager.create_template(name, job_type, config).await?)?;
        }
        Command::Template(TemplateCommand::List { job_type }) => {
            print_json(&manager.list_templates(job_type).await?)?
        }
    }

    Ok(())
}

async fn run_dispatcher(
    cfg: &Config,
    store: Arc<dyn ItemStore>,
    registry: Arc<ProcessorRegistry>,
    events: EventLog,
    queue_rx: JobQueueReceiver,
) -> anyhow::Result<()> {
    tracing::info!(
        worker_id = %cfg.worker_id,
        batch_size = cfg.batch_size,
        concurrency = cfg.concurrency,
        max_concurrent_jobs = cfg.max_concurrent_jobs,
        lease_seconds = cfg.lease_seconds,
        job_types = ?registry.job_types(),
        "tradeflow worker starting"
    );

    let scheduler = BatchScheduler::new(store.clone(), registry, events, cfg.scheduler_config());
    let dispatcher = JobDispatcher::new(scheduler, store, cfg.dispatcher_config());

    dispatcher
        .run(queue_rx, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutdown signal received");
        })
        .await
}
