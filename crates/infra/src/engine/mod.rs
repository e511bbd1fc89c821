//! Payment engine: application-level orchestration over the ledger store.
//!
//! Every entry point takes an explicit [`OperationContext`] and runs its reads and
//! writes inside a single [`LedgerStore::transaction`] pinned to the context's
//! company. Pure rules live in `reconcile-payments` / `reconcile-billing`; this
//! module loads, locks, calls them and persists the outcome.
//!
//! ```text
//! request
//!   ↓
//! 1. ctx.ensure_authorized()          (upstream decision, no RBAC here)
//!   ↓
//! 2. transaction(company):
//!      lock rows (batch → payment → allocation → credit note → invoice)
//!      domain rule (allocate / request / execute ...)
//!      persist
//!   ↓
//! 3. dispatch follow-up work          (inline, or a job for the worker pool)
//! ```
//!
//! ## Deferred work
//!
//! Batch processing and reversal execution are accepted synchronously and then
//! run either right away ([`ExecutionMode::Inline`]) or by a worker
//! ([`ExecutionMode::Deferred`]). Either way the acceptance result reports
//! `pending`; callers read the final state back.

mod allocation;
mod batch;
mod credit;
mod lifecycle;
mod reversal;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use reconcile_core::{CompanyId, DomainError, DomainResult, OperationContext};

use crate::jobs::{Job, JobExecutor, JobKind, JobResult, JobStore, RetryPolicy};
use crate::store::LedgerStore;

pub use allocation::RecordedPayment;
pub use batch::{BatchSubmission, BatchView};
pub use credit::CreateCreditNoteCommand;
pub use lifecycle::CreateInvoiceCommand;
pub use reversal::{AllocationReversalOutcome, PaymentReversalAccepted};

/// When accepted reversals and batches are executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Right after acceptance, on the caller's thread.
    Inline,
    /// By the job worker pool.
    #[default]
    Deferred,
}

impl std::str::FromStr for ExecutionMode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inline" => Ok(ExecutionMode::Inline),
            "deferred" => Ok(ExecutionMode::Deferred),
            other => Err(DomainError::validation(
                "execution_mode",
                format!("'{other}' is not one of inline, deferred"),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub execution_mode: ExecutionMode,
    pub batch_max_entries: usize,
    /// Fixed part of a batch completion forecast.
    pub batch_base_estimate: Duration,
    pub batch_per_entry_estimate: Duration,
    /// Retry policy for deferred jobs.
    pub job_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::Deferred,
            batch_max_entries: 1000,
            batch_base_estimate: Duration::from_millis(2000),
            batch_per_entry_estimate: Duration::from_millis(250),
            job_retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    fn estimate(&self, now: DateTime<Utc>, entries: usize) -> DateTime<Utc> {
        let per_entry = self
            .batch_per_entry_estimate
            .saturating_mul(u32::try_from(entries).unwrap_or(u32::MAX));
        let total = self.batch_base_estimate.saturating_add(per_entry);
        chrono::Duration::from_std(total)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(now)
    }
}

/// The engine. Share it as `Arc<PaymentEngine<_>>`.
pub struct PaymentEngine<L: LedgerStore> {
    ledger: L,
    jobs: Arc<dyn JobStore>,
    config: EngineConfig,
}

impl<L: LedgerStore> PaymentEngine<L> {
    pub fn new(ledger: L, jobs: Arc<dyn JobStore>, config: EngineConfig) -> Self {
        Self {
            ledger,
            jobs,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    /// Authorize and open a transaction for the context's company.
    fn run<T, F>(&self, ctx: &OperationContext, f: F) -> DomainResult<T>
    where
        F: FnOnce(&mut dyn crate::store::LedgerTx) -> DomainResult<T>,
    {
        ctx.ensure_authorized()?;
        self.ledger.transaction(ctx.company_id(), f)
    }

    /// Execute now or enqueue, per [`ExecutionMode`].
    ///
    /// Inline failures are not returned: the accepted resource already exists and
    /// carries its own outcome. Transient inline failures fall back to a job.
    fn dispatch(&self, company_id: CompanyId, kind: JobKind) -> DomainResult<()> {
        if self.config.execution_mode == ExecutionMode::Deferred {
            return self.enqueue(company_id, kind);
        }
        match self.run_job(company_id, &kind) {
            Ok(()) => Ok(()),
            Err(err) if err.is_retryable() => {
                warn!(%company_id, kind = kind.type_name(), error = %err, "inline execution failed, deferring");
                self.enqueue(company_id, kind)
            }
            Err(err) => {
                warn!(%company_id, kind = kind.type_name(), error = %err, "inline execution failed");
                self.give_up(company_id, &kind, &err.to_string());
                Ok(())
            }
        }
    }

    fn enqueue(&self, company_id: CompanyId, kind: JobKind) -> DomainResult<()> {
        let job = Job::new(company_id, kind).with_retry_policy(self.config.job_retry.clone());
        let job_id = self.jobs.enqueue(job)?;
        debug!(%company_id, %job_id, "job enqueued");
        Ok(())
    }

    fn run_job(&self, company_id: CompanyId, kind: &JobKind) -> DomainResult<()> {
        match *kind {
            JobKind::ProcessBatch { batch_id } => self.process_batch(company_id, batch_id).map(drop),
            JobKind::RetryBatchEntry { batch_id, index } => {
                self.process_entry_and_finish(company_id, batch_id, index).map(drop)
            }
            JobKind::ExecutePaymentReversal { reversal_id } => {
                self.execute_payment_reversal(company_id, reversal_id).map(drop)
            }
            JobKind::ExecuteAllocationReversal { reversal_id } => {
                self.execute_allocation_reversal(company_id, reversal_id).map(drop)
            }
        }
    }

    /// Handler entry point for the worker pool.
    pub fn handle_job(&self, job: &Job) -> JobResult {
        match self.run_job(job.company_id, &job.kind) {
            Ok(()) => JobResult::Success,
            Err(err) if err.is_retryable() => JobResult::Retry(err.to_string()),
            Err(err) => JobResult::Abandon(err.to_string()),
        }
    }

    /// Mark the resource behind a job that will not be attempted again as failed.
    pub fn give_up(&self, company_id: CompanyId, kind: &JobKind, reason: &str) {
        let outcome = match *kind {
            JobKind::ProcessBatch { batch_id } | JobKind::RetryBatchEntry { batch_id, .. } => {
                self.fail_batch(company_id, batch_id, reason)
            }
            JobKind::ExecutePaymentReversal { reversal_id } => {
                self.fail_payment_reversal(company_id, reversal_id, reason)
            }
            JobKind::ExecuteAllocationReversal { reversal_id } => {
                self.fail_allocation_reversal(company_id, reversal_id, reason)
            }
        };
        match outcome {
            Ok(()) => info!(%company_id, kind = kind.type_name(), reason, "marked failed after giving up"),
            Err(err) => error!(%company_id, kind = kind.type_name(), error = %err, "could not record failure"),
        }
    }
}

impl<L: LedgerStore> PaymentEngine<L> {
    /// Route every job kind to this engine and mark dead-lettered work failed.
    pub fn register_handlers<S: JobStore + 'static>(
        self: &Arc<Self>,
        executor: &mut JobExecutor<S>,
    ) {
        for type_name in [
            JobKind::PROCESS_BATCH,
            JobKind::RETRY_BATCH_ENTRY,
            JobKind::PAYMENT_REVERSAL,
            JobKind::ALLOCATION_REVERSAL,
        ] {
            let engine = Arc::clone(self);
            executor.register_handler(type_name, move |job| engine.handle_job(job));
        }
        let engine = Arc::clone(self);
        executor.on_dead_letter(move |job, reason| engine.give_up(job.company_id, &job.kind, reason));
    }
}
