//! Job executor with retry and backoff logic.
//!
//! A pool of plain OS threads polls the store, runs the handler registered for the
//! job's `type_name` and applies the job's retry policy. Handlers are synchronous;
//! the ledger store they call into may block.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobResult, JobStatus};

/// Job handler function type.
pub type JobHandler = Box<dyn Fn(&Job) -> JobResult + Send + Sync>;

/// Called once for every job that ends up dead-lettered.
pub type DeadLetterHook = Box<dyn Fn(&Job, &str) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How often an idle worker polls for new jobs
    pub poll_interval: Duration,
    pub workers: usize,
    /// Thread name prefix
    pub name: String,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            workers: 2,
            name: "reconcile-worker".to_string(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: Arc<AtomicBool>,
    workers: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Stop polling, wait for in-flight jobs to finish and return final stats.
    pub fn shutdown(mut self) -> ExecutorStats {
        self.shutdown.store(true, Ordering::SeqCst);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        self.stats()
    }

    pub fn stats(&self) -> ExecutorStats {
        match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Background job executor.
pub struct JobExecutor<S: JobStore> {
    store: S,
    handlers: HashMap<&'static str, JobHandler>,
    on_dead_letter: Option<DeadLetterHook>,
}

impl<S: JobStore + 'static> JobExecutor<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            on_dead_letter: None,
        }
    }

    /// Register a handler for a job `type_name`.
    pub fn register_handler<F>(&mut self, type_name: &'static str, handler: F)
    where
        F: Fn(&Job) -> JobResult + Send + Sync + 'static,
    {
        self.handlers.insert(type_name, Box::new(handler));
    }

    pub fn on_dead_letter<F>(&mut self, hook: F)
    where
        F: Fn(&Job, &str) + Send + Sync + 'static,
    {
        self.on_dead_letter = Some(Box::new(hook));
    }

    /// Claim and run one job, if any is ready. Returns whether a job ran.
    pub fn run_once(&self) -> Result<bool, JobStoreError> {
        match self.store.claim_next()? {
            Some(mut job) => {
                debug!(job_id = %job.id, kind = job.kind.type_name(), attempt = job.attempt, "claimed job");
                self.execute(&mut job)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Run a claimed job and record the outcome.
    pub fn execute(&self, job: &mut Job) -> Result<(), JobStoreError> {
        let result = match self.handlers.get(job.kind.type_name()) {
            Some(handler) => handler(job),
            None => JobResult::Abandon(format!("no handler for job kind: {}", job.kind.type_name())),
        };

        match result {
            JobResult::Success => {
                job.mark_completed();
                self.store.update(job)?;
                debug!(job_id = %job.id, "job completed successfully");
            }
            JobResult::Retry(error) => {
                job.mark_failed(error.clone());
                self.store.update(job)?;
                if matches!(job.status, JobStatus::DeadLettered { .. }) {
                    self.dead_letter(job, &error)?;
                } else {
                    debug!(job_id = %job.id, error = %error, "job failed, will retry");
                }
            }
            JobResult::Abandon(error) => {
                job.mark_dead(error.clone());
                self.store.update(job)?;
                self.dead_letter(job, &error)?;
            }
        }
        Ok(())
    }

    fn dead_letter(&self, job: &Job, reason: &str) -> Result<(), JobStoreError> {
        warn!(
            job_id = %job.id,
            company_id = %job.company_id,
            kind = job.kind.type_name(),
            attempts = job.attempt,
            reason,
            "job dead-lettered"
        );
        self.store.dead_letter(job.clone(), reason.to_string())?;
        if let Some(hook) = &self.on_dead_letter {
            hook(job, reason);
        }
        Ok(())
    }

    /// Spawn `config.workers` threads sharing this executor.
    pub fn spawn(self, config: JobExecutorConfig) -> io::Result<JobExecutorHandle>
    where
        S: Send + Sync,
    {
        let executor = Arc::new(self);
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));

        let mut workers = Vec::with_capacity(config.workers);
        for n in 0..config.workers.max(1) {
            let executor = Arc::clone(&executor);
            let shutdown = Arc::clone(&shutdown);
            let stats = Arc::clone(&stats);
            let poll_interval = config.poll_interval;
            let name = format!("{}-{n}", config.name);
            let worker = thread::Builder::new().name(name.clone()).spawn(move || {
                worker_loop(&executor, &name, poll_interval, &shutdown, &stats);
            })?;
            workers.push(worker);
        }
        info!(executor = %config.name, workers = workers.len(), "job executor started");

        Ok(JobExecutorHandle {
            shutdown,
            workers,
            stats,
        })
    }
}

fn worker_loop<S: JobStore + 'static>(
    executor: &JobExecutor<S>,
    name: &str,
    poll_interval: Duration,
    shutdown: &AtomicBool,
    stats: &Mutex<ExecutorStats>,
) {
    while !shutdown.load(Ordering::SeqCst) {
        let claimed = match executor.store.claim_next() {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(worker = name, error = %e, "failed to claim job");
                thread::sleep(poll_interval);
                continue;
            }
        };
        let Some(mut job) = claimed else {
            thread::sleep(poll_interval);
            continue;
        };

        debug!(worker = name, job_id = %job.id, kind = job.kind.type_name(), "claimed job");
        let outcome = executor.execute(&mut job);

        if let Ok(mut s) = stats.lock() {
            s.jobs_processed += 1;
            match &job.status {
                JobStatus::Completed => s.jobs_succeeded += 1,
                JobStatus::DeadLettered { .. } => {
                    s.jobs_failed += 1;
                    s.jobs_dead_lettered += 1;
                }
                _ => s.jobs_failed += 1,
            }
        }
        if let Err(e) = outcome {
            error!(worker = name, job_id = %job.id, error = %e, "failed to record job outcome");
        }
    }
    debug!(worker = name, "job worker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{JobKind, RetryPolicy};
    use reconcile_core::{BatchId, CompanyId};

    fn batch_job() -> Job {
        Job::new(
            CompanyId::new(),
            JobKind::ProcessBatch {
                batch_id: BatchId::new(),
            },
        )
        .with_retry_policy(RetryPolicy::fixed(2, Duration::ZERO))
    }

    #[test]
    fn successful_job_completes() {
        let store = InMemoryJobStore::arc();
        let mut executor = JobExecutor::new(store.clone());
        executor.register_handler(JobKind::PROCESS_BATCH, |_job| JobResult::Success);

        let job = batch_job();
        let company = job.company_id;
        let id = store.enqueue(job).unwrap();
        assert!(executor.run_once().unwrap());

        let stored = store.get(company, id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(store.stats().unwrap().dead_lettered, 0);
    }

    #[test]
    fn retries_then_dead_letters_and_runs_hook() {
        let store = InMemoryJobStore::arc();
        let mut executor = JobExecutor::new(store.clone());
        executor.register_handler(JobKind::PROCESS_BATCH, |_job| {
            JobResult::Retry("lock timeout".to_string())
        });
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let calls = Arc::clone(&hook_calls);
        executor.on_dead_letter(move |_job, reason| {
            assert_eq!(reason, "lock timeout");
            calls.fetch_add(1, Ordering::SeqCst);
        });

        let job = batch_job();
        let company = job.company_id;
        store.enqueue(job).unwrap();

        assert!(executor.run_once().unwrap());
        assert_eq!(hook_calls.load(Ordering::SeqCst), 0);
        assert!(executor.run_once().unwrap());
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
        assert!(!executor.run_once().unwrap());
        assert_eq!(store.list_dead_letters(company).unwrap().len(), 1);
    }

    #[test]
    fn unknown_kind_is_abandoned() {
        let store = InMemoryJobStore::arc();
        let executor = JobExecutor::new(store.clone());
        store.enqueue(batch_job()).unwrap();

        assert!(executor.run_once().unwrap());
        assert_eq!(store.stats().unwrap().dead_lettered, 1);
    }

    #[test]
    fn spawned_workers_drain_the_queue() {
        let store = InMemoryJobStore::arc();
        let mut executor = JobExecutor::new(store.clone());
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        executor.register_handler(JobKind::PROCESS_BATCH, move |_job| {
            counter.fetch_add(1, Ordering::SeqCst);
            JobResult::Success
        });
        for _ in 0..10 {
            store.enqueue(batch_job()).unwrap();
        }

        let handle = executor
            .spawn(
                JobExecutorConfig::default()
                    .with_workers(3)
                    .with_poll_interval(Duration::from_millis(5)),
            )
            .unwrap();
        for _ in 0..200 {
            if store.stats().unwrap().completed == 10 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let stats = handle.shutdown();

        assert_eq!(ran.load(Ordering::SeqCst), 10);
        assert_eq!(stats.jobs_succeeded, 10);
    }
}
