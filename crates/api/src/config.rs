//! Process configuration, read from the environment (and `.env` when present).

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, anyhow};

use reconcile_infra::jobs::{JobExecutorConfig, RetryPolicy};
use reconcile_infra::{EngineConfig, ExecutionMode};
use reconcile_observability::ObservabilityConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Postgres is used when set and the `postgres` feature is compiled in.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub execution_mode: ExecutionMode,
    pub batch_max_entries: usize,
    pub batch_base_estimate: Duration,
    pub batch_per_entry_estimate: Duration,
    pub worker_poll_interval: Duration,
    pub worker_threads: usize,
    pub worker_max_attempts: u32,
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            database_url: None,
            database_max_connections: 10,
            execution_mode: engine.execution_mode,
            batch_max_entries: engine.batch_max_entries,
            batch_base_estimate: engine.batch_base_estimate,
            batch_per_entry_estimate: engine.batch_per_entry_estimate,
            worker_poll_interval: Duration::from_millis(50),
            worker_threads: 2,
            worker_max_attempts: 3,
            log_json: true,
        }
    }
}

impl Config {
    /// Load `.env` (if any), then read `RECONCILE_*` variables over the defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Ok(Self {
            host: env::var("RECONCILE_HOST").unwrap_or(defaults.host),
            port: parse_var("RECONCILE_PORT", defaults.port)?,
            database_url: env::var("RECONCILE_DATABASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            database_max_connections: parse_var(
                "RECONCILE_DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,
            execution_mode: match env::var("RECONCILE_EXECUTION_MODE") {
                Ok(raw) => raw
                    .parse()
                    .map_err(|e| anyhow!("RECONCILE_EXECUTION_MODE: {e}"))?,
                Err(_) => defaults.execution_mode,
            },
            batch_max_entries: parse_var("RECONCILE_BATCH_MAX_ENTRIES", defaults.batch_max_entries)?,
            batch_base_estimate: millis_var(
                "RECONCILE_BATCH_BASE_ESTIMATE_MS",
                defaults.batch_base_estimate,
            )?,
            batch_per_entry_estimate: millis_var(
                "RECONCILE_BATCH_PER_ENTRY_ESTIMATE_MS",
                defaults.batch_per_entry_estimate,
            )?,
            worker_poll_interval: millis_var("RECONCILE_WORKER_POLL_MS", defaults.worker_poll_interval)?,
            worker_threads: parse_var("RECONCILE_WORKER_THREADS", defaults.worker_threads)?,
            worker_max_attempts: parse_var("RECONCILE_WORKER_MAX_ATTEMPTS", defaults.worker_max_attempts)?,
            log_json: parse_var("RECONCILE_LOG_JSON", defaults.log_json)?,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn engine(&self) -> EngineConfig {
        let retry = RetryPolicy::default();
        EngineConfig {
            execution_mode: self.execution_mode,
            batch_max_entries: self.batch_max_entries,
            batch_base_estimate: self.batch_base_estimate,
            batch_per_entry_estimate: self.batch_per_entry_estimate,
            job_retry: RetryPolicy {
                max_attempts: self.worker_max_attempts.max(1),
                ..retry
            },
        }
    }

    pub fn executor(&self) -> JobExecutorConfig {
        JobExecutorConfig::default()
            .with_workers(self.worker_threads)
            .with_poll_interval(self.worker_poll_interval)
    }

    pub fn observability(&self) -> ObservabilityConfig {
        ObservabilityConfig {
            json: self.log_json,
            ..ObservabilityConfig::default()
        }
    }
}

fn parse_var<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value '{raw}'")),
        Err(_) => Ok(default),
    }
}

fn millis_var(key: &str, default: Duration) -> anyhow::Result<Duration> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_var(key, default_ms).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_engine_defaults() {
        let config = Config::default();
        let engine = config.engine();

        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert_eq!(engine.execution_mode, ExecutionMode::Deferred);
        assert_eq!(engine.batch_max_entries, 1000);
        assert_eq!(engine.batch_base_estimate, Duration::from_millis(2000));
        assert_eq!(engine.batch_per_entry_estimate, Duration::from_millis(250));
        assert_eq!(engine.job_retry.max_attempts, 3);
        assert!(config.observability().json);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let config = Config {
            worker_max_attempts: 0,
            ..Config::default()
        };
        assert_eq!(config.engine().job_retry.max_attempts, 1);
    }
}
