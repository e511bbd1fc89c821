//! Batch ingestion: accept a submission, then attempt each entry on its own.
//!
//! Every entry runs in its own transaction holding the batch lock, so a crash
//! between entries loses nothing: already attempted entries keep their outcome and
//! the next run picks up whatever is still pending.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use reconcile_core::{
    BatchId, CompanyId, DomainError, DomainResult, FieldErrors, OperationContext,
};
use reconcile_payments::{
    AcceptBatch, BatchSource, BatchStatus, EntryError, EntryStatus, Payment, PaymentBatch,
    RecordPayment, format_batch_number,
};

use super::PaymentEngine;
use super::allocation::record_in;
use crate::jobs::JobKind;
use crate::store::LedgerStore;

const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;
const BATCH_KEY_TAKEN: &str = "a batch with this idempotency key already exists";

/// A batch request: the tagged source plus the client's idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSubmission {
    pub source: BatchSource,
    pub idempotency_key: Option<String>,
}

/// Batch snapshot with the payments its entries created. Serializes as the batch's
/// own fields plus `batch_id`, `payments` and `progress_percentage`, matching the
/// keys of the submission response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchView {
    pub batch_id: BatchId,
    #[serde(flatten)]
    pub batch: PaymentBatch,
    pub payments: Vec<Payment>,
    pub progress_percentage: Decimal,
}

impl<L: LedgerStore> PaymentEngine<L> {
    /// Validate and accept a batch. Returns the `pending` batch; processing runs
    /// afterwards per the execution mode.
    ///
    /// A repeated idempotency key is a `Conflict` carrying the existing batch id.
    pub fn submit_batch(
        &self,
        ctx: &OperationContext,
        submission: BatchSubmission,
    ) -> DomainResult<PaymentBatch> {
        ctx.ensure_authorized()?;
        let key = submission.idempotency_key;
        if let Some(key) = &key {
            if key.trim().is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
                return Err(DomainError::validation(
                    "idempotency_key",
                    "must be between 1 and 255 characters",
                ));
            }
        }
        let validated = submission
            .source
            .validate_submission(self.config.batch_max_entries)?;

        let now = Utc::now();
        let today = now.date_naive();
        let estimated_completion = self.config.estimate(now, validated.entries.len());

        let lookup_key = key.clone();
        let accepted = self.run(ctx, |tx| {
            if let Some(key) = key.as_deref() {
                if let Some(existing) = tx.batch_by_key(key)? {
                    return Err(DomainError::conflict_with(BATCH_KEY_TAKEN, existing.id));
                }
            }

            let mut foreign_entries = Vec::new();
            for (index, entry) in validated.entries.iter().enumerate() {
                match tx.customer(entry.entity_id) {
                    Ok(_) => {}
                    Err(DomainError::NotFound) => foreign_entries.push(index),
                    Err(other) => return Err(other),
                }
            }

            let sequence = tx.next_batch_sequence(today)?;
            let batch = PaymentBatch::accept(AcceptBatch {
                company_id: ctx.company_id(),
                batch_number: format_batch_number(today, sequence),
                submission: validated,
                foreign_entries,
                idempotency_key: key,
                created_by: ctx.actor(),
                estimated_completion,
                occurred_at: now,
            })?;
            tx.insert_batch(&batch)?;
            Ok(batch)
        });
        let batch = match accepted {
            Ok(batch) => batch,
            Err(err) => return Err(self.resolve_key_conflict(ctx, lookup_key.as_deref(), err)),
        };

        info!(
            company_id = %ctx.company_id(),
            batch_id = %batch.id,
            batch_number = %batch.batch_number,
            source_type = batch.source_type.as_str(),
            receipts = batch.receipt_count,
            rejected = batch.failed_count,
            total = %batch.total_amount,
            "batch accepted"
        );
        self.dispatch(ctx.company_id(), JobKind::ProcessBatch { batch_id: batch.id })?;
        Ok(batch)
    }

    /// A concurrent submission can take the key between the lookup and the insert.
    /// The unique index then reports a conflict without the winner's id, so read it
    /// back in a fresh transaction.
    fn resolve_key_conflict(
        &self,
        ctx: &OperationContext,
        key: Option<&str>,
        err: DomainError,
    ) -> DomainError {
        let Some(key) = key else {
            return err;
        };
        if !matches!(err, DomainError::Conflict { existing_id: None, .. }) {
            return err;
        }
        match self.run(ctx, |tx| tx.batch_by_key(key)) {
            Ok(Some(existing)) => DomainError::conflict_with(BATCH_KEY_TAKEN, existing.id),
            _ => err,
        }
    }

    /// Attempt every pending entry, then complete the batch. Safe to re-run.
    pub fn process_batch(&self, company_id: CompanyId, batch_id: BatchId) -> DomainResult<PaymentBatch> {
        let batch = self.ledger.transaction(company_id, |tx| {
            let mut batch = tx.lock_batch(batch_id)?;
            if !batch.status.is_terminal() {
                batch.start(Utc::now())?;
                tx.save_batch(&batch)?;
            }
            Ok(batch)
        })?;
        if batch.status.is_terminal() {
            debug!(%company_id, %batch_id, status = batch.status.as_str(), "batch already finished");
            return Ok(batch);
        }

        for index in batch.pending_entries() {
            self.process_entry(company_id, batch_id, index)?;
        }
        self.finish_batch(company_id, batch_id)
    }

    pub(super) fn process_entry_and_finish(
        &self,
        company_id: CompanyId,
        batch_id: BatchId,
        index: usize,
    ) -> DomainResult<PaymentBatch> {
        self.process_entry(company_id, batch_id, index)?;
        self.finish_batch(company_id, batch_id)
    }

    /// Attempt one entry. Its failure is recorded on the entry and is not an error
    /// here; only a failure to record the outcome is.
    fn process_entry(&self, company_id: CompanyId, batch_id: BatchId, index: usize) -> DomainResult<()> {
        let now = Utc::now();
        let attempt = self.ledger.transaction(company_id, |tx| {
            let mut batch = tx.lock_batch(batch_id)?;
            let Some(entry) = batch
                .entries
                .get(index)
                .filter(|e| e.status == EntryStatus::Pending)
            else {
                return Ok(None);
            };
            let input = entry.input.clone();
            let record = RecordPayment {
                company_id,
                customer_id: input.entity_id,
                amount: input.amount,
                currency: input.currency,
                payment_method: input.payment_method,
                payment_date: input.payment_date,
                reference_number: input.reference_number,
                notes: input.notes,
                batch_id: Some(batch_id),
                created_by: batch.created_by,
                occurred_at: now,
            };
            let recorded = record_in(tx, record, input.allocation_strategy.as_ref(), "entity_id")?;
            batch.record_success(index, recorded.payment.id, recorded.allocated())?;
            tx.save_batch(&batch)?;
            Ok(Some(recorded))
        });

        match attempt {
            Ok(Some(recorded)) => {
                debug!(
                    %company_id,
                    %batch_id,
                    index,
                    payment_id = %recorded.payment.id,
                    allocated = %recorded.allocated(),
                    "batch entry succeeded"
                );
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                warn!(%company_id, %batch_id, index, error = %err, "batch entry failed");
                let error = entry_error(index, &err);
                self.ledger.transaction(company_id, |tx| {
                    let mut batch = tx.lock_batch(batch_id)?;
                    let pending = batch
                        .entries
                        .get(index)
                        .is_some_and(|e| e.status == EntryStatus::Pending);
                    if pending {
                        batch.record_failure(index, error)?;
                        tx.save_batch(&batch)?;
                    }
                    Ok(())
                })
            }
        }
    }

    fn finish_batch(&self, company_id: CompanyId, batch_id: BatchId) -> DomainResult<PaymentBatch> {
        let (batch, finished) = self.ledger.transaction(company_id, |tx| {
            let mut batch = tx.lock_batch(batch_id)?;
            let finished = batch.finish(Utc::now());
            if finished {
                tx.save_batch(&batch)?;
            }
            Ok((batch, finished))
        })?;
        if finished {
            info!(
                %company_id,
                %batch_id,
                processed = batch.processed_count,
                failed = batch.failed_count,
                "batch completed"
            );
        }
        Ok(batch)
    }

    /// Re-attempt one entry that failed transiently. Succeeded entries are untouched.
    pub fn retry_failed_entry(
        &self,
        ctx: &OperationContext,
        batch_id: BatchId,
        index: usize,
    ) -> DomainResult<PaymentBatch> {
        let estimate = self.config.estimate(Utc::now(), 1);
        let batch = self.run(ctx, |tx| {
            let mut batch = tx.lock_batch(batch_id)?;
            batch.reopen_entry(index, estimate)?;
            tx.save_batch(&batch)?;
            Ok(batch)
        })?;
        info!(company_id = %ctx.company_id(), %batch_id, index, "batch entry reopened");
        self.dispatch(ctx.company_id(), JobKind::RetryBatchEntry { batch_id, index })?;
        Ok(batch)
    }

    pub(super) fn fail_batch(&self, company_id: CompanyId, batch_id: BatchId, reason: &str) -> DomainResult<()> {
        self.ledger.transaction(company_id, |tx| {
            let mut batch = tx.lock_batch(batch_id)?;
            batch.fail_system(reason, Utc::now());
            tx.save_batch(&batch)
        })
    }

    pub fn get_batch(&self, ctx: &OperationContext, batch_id: BatchId) -> DomainResult<BatchView> {
        self.run(ctx, |tx| {
            let batch = tx.batch(batch_id)?;
            let mut payments = tx.payments_for_batch(batch_id)?;
            payments.sort_by_key(|p| p.id);
            let progress_percentage = batch.progress_percentage();
            Ok(BatchView {
                batch_id: batch.id,
                batch,
                payments,
                progress_percentage,
            })
        })
    }
}

/// Entry error with field keys scoped to the entry, e.g. `entries.3.entity_id`.
fn entry_error(index: usize, err: &DomainError) -> EntryError {
    let mut error = EntryError::from(err);
    error.fields = error.fields.map(|fields| {
        let mut scoped = FieldErrors::new();
        scoped.merge_prefixed(&format!("entries.{index}"), fields);
        scoped
    });
    error
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reconcile_core::{CustomerId, Money};
    use reconcile_payments::{EntryErrorKind, RawBatchEntry, SYSTEM_ERROR};

    use super::super::test_support::*;
    use super::super::{EngineConfig, ExecutionMode};
    use super::*;
    use crate::jobs::{InMemoryJobStore, JobExecutor, RetryPolicy};
    use crate::store::InMemoryLedgerStore;

    fn raw(entity_id: CustomerId, cents: i64) -> RawBatchEntry {
        RawBatchEntry {
            entity_id: entity_id.to_string(),
            payment_method: "bank_transfer".to_string(),
            amount: Decimal::new(cents, 2).into(),
            currency_id: "USD".to_string(),
            payment_date: "2025-03-01".to_string(),
            reference_number: None,
            auto_allocate: false,
            allocation_strategy: None,
            notes: None,
        }
    }

    fn manual(entries: Vec<RawBatchEntry>, key: Option<&str>) -> BatchSubmission {
        BatchSubmission {
            source: BatchSource::Manual { entries },
            idempotency_key: key.map(str::to_string),
        }
    }

    #[test]
    fn foreign_entries_fail_alone_and_the_batch_completes() {
        let engine = inline_engine();
        let ctx = test_company();
        let other = test_company();
        let mine = test_customer(&engine, &ctx);
        let theirs = test_customer(&engine, &other);

        let accepted = engine
            .submit_batch(
                &ctx,
                manual(vec![raw(mine.id, 10_000), raw(theirs.id, 5_000), raw(mine.id, 2_500)], None),
            )
            .unwrap();
        assert_eq!(accepted.status, BatchStatus::Pending);
        assert_eq!(accepted.receipt_count, 3);
        assert_eq!(accepted.total_amount, Money::from_minor(17_500));

        let view = engine.get_batch(&ctx, accepted.id).unwrap();
        assert_eq!(view.batch.status, BatchStatus::Completed);
        assert_eq!(view.batch.processed_count, 2);
        assert_eq!(view.batch.failed_count, 1);
        assert_eq!(view.progress_percentage, Decimal::ONE_HUNDRED);
        assert_eq!(view.payments.len(), 2);
        assert!(view.payments.iter().all(|p| p.customer_id == mine.id));

        let rejected = &view.batch.entries[1];
        assert_eq!(rejected.status, EntryStatus::Failed);
        assert!(rejected.payment_id.is_none());
        let fields = rejected.error.as_ref().unwrap().fields.as_ref().unwrap();
        assert!(fields.contains("entries.1.entity_id"));
    }

    #[test]
    fn batch_view_serializes_flat_with_numbered_payments() {
        let engine = inline_engine();
        let ctx = test_company();
        let customer = test_customer(&engine, &ctx);
        test_payment(&engine, &ctx, customer.id, 500);

        let accepted = engine
            .submit_batch(&ctx, manual(vec![raw(customer.id, 1_000), raw(customer.id, 2_000)], None))
            .unwrap();
        let json = serde_json::to_value(engine.get_batch(&ctx, accepted.id).unwrap()).unwrap();

        assert!(json.get("batch").is_none());
        assert_eq!(json["batch_id"], accepted.id.to_string());
        assert_eq!(json["batch_number"], accepted.batch_number);
        assert_eq!(json["status"], "completed");
        assert_eq!(json["processed_count"], 2);
        assert_eq!(json["failed_count"], 0);
        assert!(json["entries"].is_array());
        assert!(!json["progress_percentage"].is_null());
        let mut numbers: Vec<&str> = json["payments"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["payment_number"].as_str().unwrap())
            .collect();
        numbers.sort_unstable();
        assert_eq!(numbers, ["PAY-000002", "PAY-000003"]);
    }

    #[test]
    fn all_foreign_entries_reject_the_submission() {
        let engine = inline_engine();
        let ctx = test_company();
        let theirs = test_customer(&engine, &test_company());

        let err = engine
            .submit_batch(&ctx, manual(vec![raw(theirs.id, 1_000), raw(CustomerId::new(), 1_000)], None))
            .unwrap_err();

        let fields = err.field_errors().unwrap();
        assert!(fields.contains("entries.0.entity_id"));
        assert!(fields.contains("entries.1.entity_id"));
    }

    #[test]
    fn shape_errors_reject_the_whole_submission() {
        let engine = inline_engine();
        let ctx = test_company();
        let customer = test_customer(&engine, &ctx);

        let err = engine
            .submit_batch(&ctx, manual(vec![raw(customer.id, 1_000), raw(customer.id, 0)], None))
            .unwrap_err();

        assert!(err.field_errors().unwrap().contains("entries.1.amount"));
    }

    #[test]
    fn repeated_idempotency_key_points_at_the_first_batch() {
        let engine = inline_engine();
        let ctx = test_company();
        let customer = test_customer(&engine, &ctx);

        let first = engine
            .submit_batch(&ctx, manual(vec![raw(customer.id, 1_000)], Some("upload-1")))
            .unwrap();
        let err = engine
            .submit_batch(&ctx, manual(vec![raw(customer.id, 9_999)], Some("upload-1")))
            .unwrap_err();

        match err {
            DomainError::Conflict { existing_id, .. } => {
                assert_eq!(existing_id, Some(first.id.to_string()));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        let view = engine.get_batch(&ctx, first.id).unwrap();
        assert_eq!(view.payments.len(), 1);
    }

    #[test]
    fn key_taken_by_a_concurrent_insert_reports_the_winner() {
        let engine = inline_engine();
        let ctx = test_company();
        let customer = test_customer(&engine, &ctx);
        let winner = engine
            .submit_batch(&ctx, manual(vec![raw(customer.id, 1_000)], Some("upload-2")))
            .unwrap();

        // What a unique-index violation looks like when the key lookup raced.
        let lost = DomainError::conflict("duplicate key value violates unique constraint");
        match engine.resolve_key_conflict(&ctx, Some("upload-2"), lost) {
            DomainError::Conflict { existing_id, .. } => {
                assert_eq!(existing_id, Some(winner.id.to_string()));
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        let unrelated = DomainError::conflict("duplicate key value violates unique constraint");
        assert!(matches!(
            engine.resolve_key_conflict(&ctx, Some("never-used"), unrelated),
            DomainError::Conflict { existing_id: None, .. }
        ));
        assert!(matches!(
            engine.resolve_key_conflict(&ctx, Some("upload-2"), DomainError::NotFound),
            DomainError::NotFound
        ));
    }

    #[test]
    fn batch_numbers_count_up_per_day() {
        let engine = inline_engine();
        let ctx = test_company();
        let customer = test_customer(&engine, &ctx);

        let first = engine.submit_batch(&ctx, manual(vec![raw(customer.id, 100)], None)).unwrap();
        let second = engine.submit_batch(&ctx, manual(vec![raw(customer.id, 100)], None)).unwrap();

        let day = first.created_at.format("%Y%m%d").to_string();
        assert_eq!(first.batch_number, format!("BATCH-{day}-001"));
        assert_eq!(second.batch_number, format!("BATCH-{day}-002"));
        assert!(first.estimated_completion > first.created_at);
    }

    #[test]
    fn auto_allocating_entries_settle_invoices() {
        let engine = inline_engine();
        let ctx = test_company();
        let customer = test_customer(&engine, &ctx);
        let invoice = test_invoice(&engine, &ctx, customer.id, "INV-1", 40_000, 15);
        let mut entry = raw(customer.id, 50_000);
        entry.auto_allocate = true;

        let accepted = engine.submit_batch(&ctx, manual(vec![entry], None)).unwrap();

        let view = engine.get_batch(&ctx, accepted.id).unwrap();
        assert_eq!(view.batch.entries[0].allocated_amount, Money::from_minor(40_000));
        assert_eq!(view.payments[0].batch_id, Some(accepted.id));
        assert_eq!(
            engine.get_invoice(&ctx, invoice.id_typed()).unwrap().balance_due(),
            Money::ZERO
        );
    }

    #[test]
    fn transient_entry_failure_can_be_retried() {
        let (engine, ledger, jobs) = engine(ExecutionMode::Deferred);
        let ctx = test_company();
        let customer = test_customer(&engine, &ctx);
        let accepted = engine
            .submit_batch(&ctx, manual(vec![raw(customer.id, 1_000), raw(customer.id, 2_000)], None))
            .unwrap();

        // start passes, first entry fails
        ledger.fail_transactions_after(1, 1);
        let done = engine.process_batch(ctx.company_id(), accepted.id).unwrap();
        assert_eq!(done.status, BatchStatus::Completed);
        assert_eq!((done.processed_count, done.failed_count), (1, 1));
        let error = done.entries[0].error.clone().unwrap();
        assert_eq!(error.kind, EntryErrorKind::Transient);

        let reopened = engine.retry_failed_entry(&ctx, accepted.id, 0).unwrap();
        assert_eq!(reopened.status, BatchStatus::Processing);
        assert!(matches!(
            engine.retry_failed_entry(&ctx, accepted.id, 1),
            Err(DomainError::Conflict { .. })
        ));

        let mut executor = JobExecutor::new(jobs.clone());
        engine.register_handlers(&mut executor);
        while executor.run_once().unwrap() {}

        let view = engine.get_batch(&ctx, accepted.id).unwrap();
        assert_eq!(view.batch.status, BatchStatus::Completed);
        assert_eq!((view.batch.processed_count, view.batch.failed_count), (2, 0));
        assert_eq!(view.batch.entries[0].attempts, 2);
        assert_eq!(view.payments.len(), 2);
    }

    #[test]
    fn dead_lettered_batch_is_marked_failed() {
        let ledger = std::sync::Arc::new(InMemoryLedgerStore::new());
        let jobs = InMemoryJobStore::arc();
        let config = EngineConfig {
            execution_mode: ExecutionMode::Deferred,
            job_retry: RetryPolicy::fixed(1, Duration::ZERO),
            ..EngineConfig::default()
        };
        let engine = std::sync::Arc::new(PaymentEngine::new(ledger.clone(), jobs.clone(), config));
        let ctx = test_company();
        let customer = test_customer(&engine, &ctx);
        let accepted = engine
            .submit_batch(&ctx, manual(vec![raw(customer.id, 1_000)], None))
            .unwrap();

        let mut executor = JobExecutor::new(jobs.clone());
        engine.register_handlers(&mut executor);
        ledger.fail_next_transactions(1);
        assert!(executor.run_once().unwrap());

        let view = engine.get_batch(&ctx, accepted.id).unwrap();
        assert_eq!(view.batch.status, BatchStatus::Failed);
        assert_eq!(view.batch.error_type.as_deref(), Some(SYSTEM_ERROR));
        assert!(view.payments.is_empty());
    }

    #[test]
    fn foreign_batch_is_not_found() {
        let engine = inline_engine();
        let ctx = test_company();
        let customer = test_customer(&engine, &ctx);
        let accepted = engine.submit_batch(&ctx, manual(vec![raw(customer.id, 100)], None)).unwrap();

        assert_eq!(
            engine.get_batch(&test_company(), accepted.id).unwrap_err(),
            DomainError::NotFound
        );
    }
}
