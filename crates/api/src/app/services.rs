//! Engine wiring and the bridge from async handlers to the synchronous engine.

use std::io;
use std::sync::Arc;

use tracing::info;

use reconcile_core::{DomainError, DomainResult};
use reconcile_infra::jobs::{InMemoryJobStore, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobStore};
use reconcile_infra::{EngineConfig, InMemoryLedgerStore, LedgerBackend, PaymentEngine};

use crate::config::Config;

pub type ApiEngine = PaymentEngine<LedgerBackend>;

/// Everything handlers need, shared as `Arc<AppServices>`.
pub struct AppServices {
    engine: Arc<ApiEngine>,
    jobs: Arc<InMemoryJobStore>,
}

impl AppServices {
    /// In-memory ledger (dev/test).
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::with_backend(LedgerBackend::InMemory(InMemoryLedgerStore::new()), config)
    }

    pub fn with_backend(ledger: LedgerBackend, config: EngineConfig) -> Self {
        let jobs = InMemoryJobStore::arc();
        let job_store: Arc<dyn JobStore> = jobs.clone();
        let engine = Arc::new(PaymentEngine::new(ledger, job_store, config));
        Self { engine, jobs }
    }

    /// Postgres when a database URL is configured and the `postgres` feature is on;
    /// in-memory otherwise.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        #[cfg(feature = "postgres")]
        if let Some(url) = &config.database_url {
            let store = reconcile_infra::store::postgres::PgLedgerStore::connect(
                url,
                config.database_max_connections,
            )
            .await?;
            info!("using postgres ledger store");
            return Ok(Self::with_backend(LedgerBackend::Postgres(store), config.engine()));
        }

        if config.database_url.is_some() && cfg!(not(feature = "postgres")) {
            tracing::warn!("RECONCILE_DATABASE_URL is set but postgres support is not compiled in");
        }
        info!("using in-memory ledger store");
        Ok(Self::in_memory(config.engine()))
    }

    pub fn engine(&self) -> &Arc<ApiEngine> {
        &self.engine
    }

    pub fn jobs(&self) -> &Arc<InMemoryJobStore> {
        &self.jobs
    }

    /// Start the worker pool that runs deferred batches and reversals.
    pub fn spawn_workers(&self, config: JobExecutorConfig) -> io::Result<JobExecutorHandle> {
        let mut executor = JobExecutor::new(Arc::clone(&self.jobs));
        self.engine.register_handlers(&mut executor);
        executor.spawn(config)
    }

    /// Run an engine call on the blocking pool. The engine takes row locks and
    /// may block, so it never runs on an async worker thread.
    pub async fn call<T, F>(&self, f: F) -> DomainResult<T>
    where
        F: FnOnce(&ApiEngine) -> DomainResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || f(&engine))
            .await
            .map_err(|e| DomainError::transient(format!("engine task failed: {e}")))?
    }
}
