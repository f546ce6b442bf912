use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::jobs::dispatcher::DispatcherConfig;
use crate::jobs::manager::ManagerConfig;
use crate::jobs::retry::RetryPolicy;
use crate::jobs::scheduler::SchedulerConfig;

/// Runtime configuration, loaded from the environment (and `.env`).
///
/// Every `TRADEFLOW_*` key also accepts its unprefixed name as a fallback.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,
    pub batch_size: usize,
    pub concurrency: usize,
    pub max_manifest_items: usize,
    pub max_attempts: i32,
    pub retry_base_secs: i64,
    pub retry_max_secs: i64,
    pub max_concurrent_jobs: usize,
    pub lease_seconds: i64,
    pub poll_interval_ms: u64,
    pub processor_timeout_secs: u64,
    pub manifest_root: PathBuf,
    pub migrate_on_startup: bool,
    pub log_json: bool,
    pub db: DbConfig,
}

#[derive(Clone, Debug)]
pub struct DbConfig {
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub disable_jit: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            acquire_timeout_secs: 10,
            disable_jit: true,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let worker_id = env_or_fallback("TRADEFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "worker-1".to_string());

        let db_defaults = DbConfig::default();

        Ok(Self {
            database_url,
            worker_id,
            batch_size: env_parse("TRADEFLOW_BATCH_SIZE", "BATCH_SIZE").unwrap_or(10),
            concurrency: env_parse("TRADEFLOW_CONCURRENCY", "CONCURRENCY").unwrap_or(10),
            max_manifest_items: env_parse("TRADEFLOW_MAX_MANIFEST_ITEMS", "MAX_MANIFEST_ITEMS")
                .unwrap_or(200),
            max_attempts: env_parse("TRADEFLOW_MAX_ATTEMPTS", "MAX_ATTEMPTS").unwrap_or(3),
            retry_base_secs: env_parse("TRADEFLOW_RETRY_BASE_SECS", "RETRY_BASE_SECS")
                .unwrap_or(60),
            retry_max_secs: env_parse("TRADEFLOW_RETRY_MAX_SECS", "RETRY_MAX_SECS")
                .unwrap_or(3600),
            max_concurrent_jobs: env_parse("TRADEFLOW_MAX_CONCURRENT_JOBS", "MAX_CONCURRENT_JOBS")
                .unwrap_or(4),
            lease_seconds: env_parse("TRADEFLOW_LEASE_SECONDS", "LEASE_SECONDS").unwrap_or(30),
            poll_interval_ms: env_parse("TRADEFLOW_POLL_INTERVAL_MS", "POLL_INTERVAL_MS")
                .unwrap_or(1000),
            processor_timeout_secs: env_parse(
                "TRADEFLOW_PROCESSOR_TIMEOUT_SECS",
                "PROCESSOR_TIMEOUT_SECS",
            )
            .unwrap_or(60),
            manifest_root: env_or_fallback("TRADEFLOW_MANIFEST_ROOT", "MANIFEST_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            migrate_on_startup: env_bool("TRADEFLOW_MIGRATE_ON_STARTUP").unwrap_or(false),
            log_json: env_bool("TRADEFLOW_LOG_JSON").unwrap_or(false),
            db: DbConfig {
                max_connections: env_parse("TRADEFLOW_DB_MAX_CONNECTIONS", "DB_MAX_CONNECTIONS")
                    .unwrap_or(db_defaults.max_connections),
                acquire_timeout_secs: env_parse(
                    "TRADEFLOW_DB_ACQUIRE_TIMEOUT_SECS",
                    "DB_ACQUIRE_TIMEOUT_SECS",
                )
                .unwrap_or(db_defaults.acquire_timeout_secs),
                disable_jit: env_bool("TRADEFLOW_DB_DISABLE_JIT")
                    .unwrap_or(db_defaults.disable_jit),
            },
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_base_secs, self.retry_max_secs)
    }

    pub fn processor_timeout(&self) -> Duration {
        Duration::from_secs(self.processor_timeout_secs.max(1))
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            worker_id: self.worker_id.clone(),
            batch_size: self.batch_size.max(1),
            concurrency: self.concurrency.max(1),
            lease_seconds: self.lease_seconds.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(10)),
            retry: self.retry_policy(),
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            max_manifest_items: self.max_manifest_items.max(1),
            default_max_attempts: self.max_attempts.max(1),
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_concurrent_jobs: self.max_concurrent_jobs.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(10)),
            ..DispatcherConfig::default()
        }
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_parse<T: FromStr>(primary: &str, fallback: &str) -> Option<T> {
    env_or_fallback(primary, fallback).and_then(|s| s.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_key_wins_over_fallback() {
        std::env::set_var("TRADEFLOW_TEST_CFG_A", "7");
        std::env::set_var("TEST_CFG_A", "9");
        assert_eq!(env_parse::<usize>("TRADEFLOW_TEST_CFG_A", "TEST_CFG_A"), Some(7));

        std::env::set_var("TRADEFLOW_TEST_CFG_B", "  ");
        std::env::set_var("TEST_CFG_B", "12");
        assert_eq!(env_parse::<usize>("TRADEFLOW_TEST_CFG_B", "TEST_CFG_B"), Some(12));

        std::env::set_var("TRADEFLOW_TEST_CFG_C", "many");
        assert_eq!(env_parse::<usize>("TRADEFLOW_TEST_CFG_C", "TEST_CFG_C_UNSET"), None);
    }

    #[test]
    fn env_bool_accepts_common_spellings() {
        std::env::set_var("TRADEFLOW_TEST_BOOL_ON", "Yes");
        std::env::set_var("TRADEFLOW_TEST_BOOL_OFF", "0");
        assert_eq!(env_bool("TRADEFLOW_TEST_BOOL_ON"), Some(true));
        assert_eq!(env_bool("TRADEFLOW_TEST_BOOL_OFF"), Some(false));
        assert_eq!(env_bool("TRADEFLOW_TEST_BOOL_UNSET"), None);
    }
}
