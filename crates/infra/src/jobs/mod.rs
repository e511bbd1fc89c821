//! Background job system with retry, backoff, and dead-letter handling.
//!
//! Jobs carry the work the engine defers past an HTTP response: processing a
//! batch, re-attempting one batch entry, and executing accepted reversals.
//!
//! - `Job`: company-scoped, typed by [`JobKind`]
//! - `JobStore`: persistence for jobs (in-memory)
//! - `JobExecutor`: worker pool applying each job's [`RetryPolicy`]
//! - dead-letter queue for jobs that exhausted their retries, plus a hook so the
//!   owning resource can be marked failed

pub mod executor;
pub mod store;
pub mod types;

pub use executor::{ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    BackoffStrategy, DeadLetterEntry, Job, JobId, JobKind, JobResult, JobStatus, RetryPolicy,
};
