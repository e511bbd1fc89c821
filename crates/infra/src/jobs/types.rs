//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use reconcile_core::{AllocationReversalId, BatchId, CompanyId, ReversalId};

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a job does. The payload travels inside the variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    /// Attempt every pending entry of a batch.
    ProcessBatch { batch_id: BatchId },
    /// Re-attempt one reopened entry.
    RetryBatchEntry { batch_id: BatchId, index: usize },
    ExecutePaymentReversal { reversal_id: ReversalId },
    ExecuteAllocationReversal { reversal_id: AllocationReversalId },
}

impl JobKind {
    pub const PROCESS_BATCH: &'static str = "batch.process";
    pub const RETRY_BATCH_ENTRY: &'static str = "batch.retry_entry";
    pub const PAYMENT_REVERSAL: &'static str = "reversal.payment";
    pub const ALLOCATION_REVERSAL: &'static str = "reversal.allocation";

    /// Routing key handlers are registered under.
    pub fn type_name(&self) -> &'static str {
        match self {
            JobKind::ProcessBatch { .. } => Self::PROCESS_BATCH,
            JobKind::RetryBatchEntry { .. } => Self::RETRY_BATCH_ENTRY,
            JobKind::ExecutePaymentReversal { .. } => Self::PAYMENT_REVERSAL,
            JobKind::ExecuteAllocationReversal { .. } => Self::ALLOCATION_REVERSAL,
        }
    }
}

/// Job execution status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be picked up
    Pending,
    /// Currently being executed
    Running,
    Completed,
    /// Failed, will be retried
    Failed { error: String, attempt: u32 },
    /// Exhausted retries or abandoned, moved to DLQ
    DeadLettered { error: String, attempts: u32 },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::DeadLettered { .. })
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    /// base * 2^(attempt - 1)
    #[default]
    Exponential,
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts before dead-lettering (at least 1).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before attempt `attempt + 1`, given `attempt` (1-indexed) just failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2_u32.saturating_pow(attempt - 1);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };
        delay.min(self.max_delay)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// A background job, owned by one company.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub company_id: CompanyId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub retry_policy: RetryPolicy,
    /// Attempts started so far.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Not claimable before this instant (retry backoff).
    pub scheduled_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(company_id: CompanyId, kind: JobKind) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            company_id,
            kind,
            status: JobStatus::Pending,
            retry_policy: RetryPolicy::default(),
            attempt: 0,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            last_error: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_none_or(|at| now >= at)
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Failed { .. }) && self.is_ready(now)
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.attempt += 1;
        self.updated_at = Utc::now();
    }

    pub fn mark_completed(&mut self) {
        self.status = JobStatus::Completed;
        self.updated_at = Utc::now();
    }

    /// Schedule a retry, or dead-letter once the policy is exhausted.
    pub fn mark_failed(&mut self, error: String) {
        let now = Utc::now();
        self.updated_at = now;
        self.last_error = Some(error.clone());

        if self.retry_policy.should_retry(self.attempt) {
            let delay = self.retry_policy.delay_for_attempt(self.attempt);
            self.scheduled_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            self.status = JobStatus::Failed {
                error,
                attempt: self.attempt,
            };
        } else {
            self.mark_dead(error);
        }
    }

    /// Dead-letter without further retries.
    pub fn mark_dead(&mut self, error: String) {
        self.updated_at = Utc::now();
        self.last_error = Some(error.clone());
        self.status = JobStatus::DeadLettered {
            error,
            attempts: self.attempt,
        };
    }
}

/// Outcome reported by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Success,
    /// Transient failure; retried per the job's policy.
    Retry(String),
    /// Permanent failure; dead-lettered immediately.
    Abandon(String),
}

/// Entry in the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: Job,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(job: Job, reason: String) -> Self {
        Self {
            job,
            dead_lettered_at: Utc::now(),
            reason,
        }
    }
}
