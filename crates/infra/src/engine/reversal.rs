//! Reversal coordinator: accept reversal requests, execute them, record give-ups.
//!
//! Acceptance validates against the current state and stores a `pending` row in
//! one transaction. Execution re-locks everything and re-checks, since the world
//! may have moved between the two.

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use reconcile_core::{
    AllocationId, AllocationReversalId, CompanyId, DomainError, DomainResult, OperationContext,
    PaymentId, ReversalId,
};
use reconcile_payments::{
    AllocationReversal, PaymentReversal, ReversalStatus, ReverseAllocationCommand,
    ReversePaymentCommand,
};

use super::PaymentEngine;
use crate::jobs::JobKind;
use crate::store::LedgerStore;

/// An accepted payment reversal. `replayed` is set when the idempotency key matched
/// an earlier request and nothing new was created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentReversalAccepted {
    pub reversal: PaymentReversal,
    pub replayed: bool,
}

/// Per-allocation result of [`PaymentEngine::reverse_all_allocations`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationReversalOutcome {
    pub allocation_id: AllocationId,
    pub reversal: Option<AllocationReversal>,
    pub error: Option<String>,
}

impl<L: LedgerStore> PaymentEngine<L> {
    /// Accept a void or refund. Requests repeating an idempotency key get the
    /// first request's reversal back, whatever else they carry.
    pub fn reverse_payment(
        &self,
        ctx: &OperationContext,
        cmd: ReversePaymentCommand,
    ) -> DomainResult<PaymentReversalAccepted> {
        let now = Utc::now();
        let payment_id = cmd.payment_id;
        let key = cmd.idempotency_key.clone();

        let accepted = self.run(ctx, |tx| {
            if let Some(key) = cmd.idempotency_key.as_deref() {
                if let Some(existing) = tx.payment_reversal_by_key(key)? {
                    return replay(existing, payment_id);
                }
            }
            let payment = tx.lock_payment(cmd.payment_id)?;
            let (position, active_allocations) = tx.payment_position(&payment)?;
            let reversal = PaymentReversal::request(
                cmd,
                &payment,
                &position,
                active_allocations,
                ctx.actor(),
                now,
            )?;
            tx.insert_payment_reversal(&reversal)?;
            Ok(PaymentReversalAccepted {
                reversal,
                replayed: false,
            })
        });

        // A concurrent request with the same key may have won the insert.
        let accepted = match accepted {
            Err(conflict @ DomainError::Conflict { .. }) => {
                let winner = match key.as_deref() {
                    Some(key) => self.run(ctx, |tx| tx.payment_reversal_by_key(key))?,
                    None => None,
                };
                match winner {
                    Some(existing) => replay(existing, payment_id)?,
                    None => return Err(conflict),
                }
            }
            other => other?,
        };

        if accepted.replayed {
            info!(
                company_id = %ctx.company_id(),
                reversal_id = %accepted.reversal.id,
                "payment reversal replayed"
            );
            return Ok(accepted);
        }
        info!(
            company_id = %ctx.company_id(),
            payment_id = %payment_id,
            reversal_id = %accepted.reversal.id,
            method = accepted.reversal.reversal_method.as_str(),
            amount = %accepted.reversal.reversed_amount,
            "payment reversal accepted"
        );
        self.dispatch(
            ctx.company_id(),
            JobKind::ExecutePaymentReversal {
                reversal_id: accepted.reversal.id,
            },
        )?;
        Ok(accepted)
    }

    /// Execute a pending payment reversal. Terminal reversals are returned unchanged.
    pub fn execute_payment_reversal(
        &self,
        company_id: CompanyId,
        reversal_id: ReversalId,
    ) -> DomainResult<PaymentReversal> {
        let now = Utc::now();
        let reversal = self.ledger.transaction(company_id, |tx| {
            let payment_id = tx.payment_reversal(reversal_id)?.payment_id;
            let mut payment = tx.lock_payment(payment_id)?;
            let mut reversal = tx.lock_payment_reversal(reversal_id)?;
            if reversal.status.is_terminal() {
                return Ok(reversal);
            }
            let (position, active_allocations) = tx.payment_position(&payment)?;
            let status = reversal.execute(&mut payment, &position, active_allocations, now)?;
            tx.save_payment_reversal(&reversal)?;
            if status == ReversalStatus::Completed {
                tx.save_payment(&payment)?;
            }
            Ok(reversal)
        })?;
        log_payment_reversal(&reversal);
        Ok(reversal)
    }

    pub(super) fn fail_payment_reversal(
        &self,
        company_id: CompanyId,
        reversal_id: ReversalId,
        reason: &str,
    ) -> DomainResult<()> {
        self.ledger.transaction(company_id, |tx| {
            let mut reversal = tx.lock_payment_reversal(reversal_id)?;
            reversal.fail(reason, Utc::now());
            tx.save_payment_reversal(&reversal)
        })
    }

    /// Accept an allocation reversal. The invoice gets the full allocated amount
    /// back on execution; `refund_amount` is informational.
    pub fn reverse_allocation(
        &self,
        ctx: &OperationContext,
        cmd: ReverseAllocationCommand,
    ) -> DomainResult<AllocationReversal> {
        let now = Utc::now();
        let reversal = self.run(ctx, |tx| {
            tx.lock_payment(cmd.payment_id)?;
            let allocation = tx.lock_allocation(cmd.allocation_id)?;
            let earlier = tx.allocation_reversals_for(allocation.id)?;
            let in_flight = earlier.iter().find(|r| r.status != ReversalStatus::Failed);
            let reversal =
                AllocationReversal::request(cmd, &allocation, in_flight, ctx.actor(), now)?;
            tx.insert_allocation_reversal(&reversal)?;
            Ok(reversal)
        })?;
        info!(
            company_id = %ctx.company_id(),
            allocation_id = %reversal.allocation_id,
            reversal_id = %reversal.id,
            amount = %reversal.restored_amount,
            "allocation reversal accepted"
        );
        self.dispatch(
            ctx.company_id(),
            JobKind::ExecuteAllocationReversal {
                reversal_id: reversal.id,
            },
        )?;
        Ok(reversal)
    }

    /// Request a reversal for every active allocation of a payment.
    ///
    /// Each allocation is accepted independently; one failure does not stop the rest.
    pub fn reverse_all_allocations(
        &self,
        ctx: &OperationContext,
        payment_id: PaymentId,
        reason: &str,
    ) -> DomainResult<Vec<AllocationReversalOutcome>> {
        let active: Vec<AllocationId> = self
            .payment_allocations(ctx, payment_id)?
            .into_iter()
            .filter(|a| a.is_active())
            .map(|a| a.id)
            .collect();

        Ok(active
            .into_iter()
            .map(|allocation_id| {
                let cmd = ReverseAllocationCommand {
                    payment_id,
                    allocation_id,
                    reason: reason.to_string(),
                    refund_amount: None,
                };
                match self.reverse_allocation(ctx, cmd) {
                    Ok(reversal) => AllocationReversalOutcome {
                        allocation_id,
                        reversal: Some(reversal),
                        error: None,
                    },
                    Err(err) => AllocationReversalOutcome {
                        allocation_id,
                        reversal: None,
                        error: Some(err.to_string()),
                    },
                }
            })
            .collect())
    }

    /// Execute a pending allocation reversal. Terminal reversals are returned unchanged.
    pub fn execute_allocation_reversal(
        &self,
        company_id: CompanyId,
        reversal_id: AllocationReversalId,
    ) -> DomainResult<AllocationReversal> {
        let now = Utc::now();
        let reversal = self.ledger.transaction(company_id, |tx| {
            let pending = tx.allocation_reversal(reversal_id)?;
            tx.lock_payment(pending.payment_id)?;
            let mut allocation = tx.lock_allocation(pending.allocation_id)?;
            let mut invoice = tx.lock_invoice(pending.invoice_id)?;
            let mut reversal = tx.lock_allocation_reversal(reversal_id)?;
            if reversal.status.is_terminal() {
                return Ok(reversal);
            }
            let status = reversal.execute(&mut allocation, &mut invoice, now)?;
            tx.save_allocation_reversal(&reversal)?;
            if status == ReversalStatus::Completed {
                tx.save_allocation(&allocation)?;
                tx.save_invoice(&invoice)?;
            }
            Ok(reversal)
        })?;

        match reversal.status {
            ReversalStatus::Completed => info!(
                %company_id,
                reversal_id = %reversal.id,
                invoice_id = %reversal.invoice_id,
                restored = %reversal.restored_amount,
                "allocation reversal completed"
            ),
            ReversalStatus::Failed => warn!(
                %company_id,
                reversal_id = %reversal.id,
                reason = reversal.failure_reason.as_deref().unwrap_or_default(),
                "allocation reversal failed"
            ),
            ReversalStatus::Pending => {}
        }
        Ok(reversal)
    }

    pub(super) fn fail_allocation_reversal(
        &self,
        company_id: CompanyId,
        reversal_id: AllocationReversalId,
        reason: &str,
    ) -> DomainResult<()> {
        self.ledger.transaction(company_id, |tx| {
            let mut reversal = tx.lock_allocation_reversal(reversal_id)?;
            reversal.fail(reason, Utc::now());
            tx.save_allocation_reversal(&reversal)
        })
    }

    pub fn get_payment_reversal(
        &self,
        ctx: &OperationContext,
        id: ReversalId,
    ) -> DomainResult<PaymentReversal> {
        self.run(ctx, |tx| tx.payment_reversal(id))
    }

    pub fn get_allocation_reversal(
        &self,
        ctx: &OperationContext,
        id: AllocationReversalId,
    ) -> DomainResult<AllocationReversal> {
        self.run(ctx, |tx| tx.allocation_reversal(id))
    }

    pub fn payment_reversals(
        &self,
        ctx: &OperationContext,
        payment_id: PaymentId,
    ) -> DomainResult<Vec<PaymentReversal>> {
        self.run(ctx, |tx| {
            tx.payment(payment_id)?;
            tx.payment_reversals_for(payment_id)
        })
    }
}

fn replay(existing: PaymentReversal, payment_id: PaymentId) -> DomainResult<PaymentReversalAccepted> {
    if existing.payment_id != payment_id {
        return Err(DomainError::conflict_with(
            "idempotency key was already used for another payment",
            existing.id,
        ));
    }
    Ok(PaymentReversalAccepted {
        reversal: existing,
        replayed: true,
    })
}

fn log_payment_reversal(reversal: &PaymentReversal) {
    match reversal.status {
        ReversalStatus::Completed => info!(
            company_id = %reversal.company_id,
            payment_id = %reversal.payment_id,
            reversal_id = %reversal.id,
            amount = %reversal.reversed_amount,
            "payment reversal completed"
        ),
        ReversalStatus::Failed => warn!(
            company_id = %reversal.company_id,
            reversal_id = %reversal.id,
            reason = reversal.failure_reason.as_deref().unwrap_or_default(),
            "payment reversal failed"
        ),
        ReversalStatus::Pending => {}
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reconcile_core::{InvoiceId, Money};
    use reconcile_payments::{AllocateCommand, AllocationStatus, PaymentStatus, ReversalMethod};

    use super::super::test_support::*;
    use super::super::{EngineConfig, ExecutionMode};
    use super::*;
    use crate::jobs::{InMemoryJobStore, JobExecutor, JobStore, RetryPolicy};
    use crate::store::InMemoryLedgerStore;

    fn allocate(
        engine: &TestEngine,
        ctx: &OperationContext,
        payment_id: PaymentId,
        invoice_id: InvoiceId,
        cents: i64,
    ) -> AllocationId {
        engine
            .allocate_manual(
                ctx,
                AllocateCommand {
                    payment_id,
                    invoice_id,
                    amount: Money::from_minor(cents),
                },
            )
            .unwrap()
            .id
    }

    fn reverse_alloc_cmd(payment_id: PaymentId, allocation_id: AllocationId) -> ReverseAllocationCommand {
        ReverseAllocationCommand {
            payment_id,
            allocation_id,
            reason: "dup".to_string(),
            refund_amount: None,
        }
    }

    fn reverse_payment_cmd(
        payment_id: PaymentId,
        method: ReversalMethod,
        amount: Option<i64>,
        key: Option<&str>,
    ) -> ReversePaymentCommand {
        ReversePaymentCommand {
            payment_id,
            reason: "customer request".to_string(),
            method,
            amount: amount.map(Money::from_minor),
            metadata: serde_json::json!({}),
            idempotency_key: key.map(str::to_string),
        }
    }

    #[test]
    fn reversing_an_allocation_restores_the_invoice_once() {
        let engine = inline_engine();
        let ctx = test_company();
        let customer = test_customer(&engine, &ctx);
        let invoice = test_invoice(&engine, &ctx, customer.id, "INV-A", 100_000, 31);
        let payment = test_payment(&engine, &ctx, customer.id, 100_000);
        let allocation_id = allocate(&engine, &ctx, payment.id, invoice.id_typed(), 60_000);

        let accepted = engine
            .reverse_allocation(&ctx, reverse_alloc_cmd(payment.id, allocation_id))
            .unwrap();
        assert_eq!(accepted.status, ReversalStatus::Pending);

        let done = engine.get_allocation_reversal(&ctx, accepted.id).unwrap();
        assert_eq!(done.status, ReversalStatus::Completed);
        assert_eq!(
            engine.get_invoice(&ctx, invoice.id_typed()).unwrap().balance_due(),
            Money::from_minor(100_000)
        );
        let allocation = engine.get_allocation(&ctx, allocation_id).unwrap();
        assert_eq!(allocation.status, AllocationStatus::Reversed);
        assert_eq!(allocation.reversal_reason.as_deref(), Some("dup"));

        let err = engine
            .reverse_allocation(&ctx, reverse_alloc_cmd(payment.id, allocation_id))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict { .. }));
        assert_eq!(
            engine.get_invoice(&ctx, invoice.id_typed()).unwrap().balance_due(),
            Money::from_minor(100_000)
        );
    }

    #[test]
    fn allocation_reversal_requires_reason_and_bounded_refund() {
        let engine = inline_engine();
        let ctx = test_company();
        let customer = test_customer(&engine, &ctx);
        let invoice = test_invoice(&engine, &ctx, customer.id, "INV-A", 10_000, 31);
        let payment = test_payment(&engine, &ctx, customer.id, 10_000);
        let allocation_id = allocate(&engine, &ctx, payment.id, invoice.id_typed(), 5_000);

        let err = engine
            .reverse_allocation(
                &ctx,
                ReverseAllocationCommand {
                    reason: "  ".to_string(),
                    refund_amount: Some(Money::from_minor(5_001)),
                    ..reverse_alloc_cmd(payment.id, allocation_id)
                },
            )
            .unwrap_err();

        let fields = err.field_errors().unwrap();
        assert!(fields.contains("reason"));
        assert!(fields.contains("refund_amount"));
        assert!(engine.get_allocation(&ctx, allocation_id).unwrap().is_active());
    }

    #[test]
    fn deferred_reversal_stays_pending_until_a_worker_runs() {
        let (engine, _ledger, jobs) = engine(ExecutionMode::Deferred);
        let ctx = test_company();
        let customer = test_customer(&engine, &ctx);
        let invoice = test_invoice(&engine, &ctx, customer.id, "INV-A", 10_000, 31);
        let payment = test_payment(&engine, &ctx, customer.id, 10_000);
        let allocation_id = allocate(&engine, &ctx, payment.id, invoice.id_typed(), 10_000);

        let accepted = engine
            .reverse_allocation(&ctx, reverse_alloc_cmd(payment.id, allocation_id))
            .unwrap();
        assert_eq!(
            engine.get_allocation_reversal(&ctx, accepted.id).unwrap().status,
            ReversalStatus::Pending
        );
        assert_eq!(jobs.stats().unwrap().pending, 1);

        let mut executor = JobExecutor::new(jobs.clone());
        engine.register_handlers(&mut executor);
        assert!(executor.run_once().unwrap());

        assert_eq!(
            engine.get_allocation_reversal(&ctx, accepted.id).unwrap().status,
            ReversalStatus::Completed
        );
        assert_eq!(
            engine.get_invoice(&ctx, invoice.id_typed()).unwrap().balance_due(),
            Money::from_minor(10_000)
        );
    }

    #[test]
    fn full_void_waits_for_allocations_to_be_reversed() {
        let engine = inline_engine();
        let ctx = test_company();
        let customer = test_customer(&engine, &ctx);
        let first = test_invoice(&engine, &ctx, customer.id, "INV-1", 30_000, 10);
        let second = test_invoice(&engine, &ctx, customer.id, "INV-2", 30_000, 20);
        let payment = test_payment(&engine, &ctx, customer.id, 50_000);
        allocate(&engine, &ctx, payment.id, first.id_typed(), 30_000);
        allocate(&engine, &ctx, payment.id, second.id_typed(), 10_000);

        let err = engine
            .reverse_payment(&ctx, reverse_payment_cmd(payment.id, ReversalMethod::Void, None, None))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict { .. }));

        let outcomes = engine.reverse_all_allocations(&ctx, payment.id, "voiding").unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.error.is_none()));

        let accepted = engine
            .reverse_payment(&ctx, reverse_payment_cmd(payment.id, ReversalMethod::Void, None, None))
            .unwrap();
        assert_eq!(accepted.reversal.reversed_amount, Money::from_minor(50_000));
        let done = engine.get_payment_reversal(&ctx, accepted.reversal.id).unwrap();
        assert_eq!(done.status, ReversalStatus::Completed);
        assert_eq!(engine.get_payment(&ctx, payment.id).unwrap().status, PaymentStatus::Reversed);

        let again = engine
            .reverse_payment(&ctx, reverse_payment_cmd(payment.id, ReversalMethod::Refund, Some(1), None))
            .unwrap_err();
        assert!(matches!(again, DomainError::Conflict { .. }));
    }

    #[test]
    fn partial_refund_leaves_payment_completed() {
        let engine = inline_engine();
        let ctx = test_company();
        let customer = test_customer(&engine, &ctx);
        let payment = test_payment(&engine, &ctx, customer.id, 100_000);

        engine
            .reverse_payment(
                &ctx,
                reverse_payment_cmd(payment.id, ReversalMethod::Refund, Some(20_000), None),
            )
            .unwrap();

        let summary = engine.payment_summary(&ctx, payment.id).unwrap();
        assert_eq!(summary.refunded, Money::from_minor(20_000));
        assert_eq!(summary.unallocated, Money::from_minor(80_000));
        assert_eq!(engine.get_payment(&ctx, payment.id).unwrap().status, PaymentStatus::Completed);
    }

    #[test]
    fn repeated_idempotency_key_returns_the_first_reversal() {
        let engine = inline_engine();
        let ctx = test_company();
        let customer = test_customer(&engine, &ctx);
        let payment = test_payment(&engine, &ctx, customer.id, 100_000);

        let first = engine
            .reverse_payment(
                &ctx,
                reverse_payment_cmd(payment.id, ReversalMethod::Refund, Some(10_000), Some("rev-1")),
            )
            .unwrap();
        let second = engine
            .reverse_payment(
                &ctx,
                reverse_payment_cmd(payment.id, ReversalMethod::Refund, Some(99_000), Some("rev-1")),
            )
            .unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.reversal.id, second.reversal.id);
        assert_eq!(second.reversal.reversed_amount, Money::from_minor(10_000));
        assert_eq!(engine.payment_reversals(&ctx, payment.id).unwrap().len(), 1);
    }

    #[test]
    fn idempotency_key_of_another_payment_conflicts() {
        let engine = inline_engine();
        let ctx = test_company();
        let customer = test_customer(&engine, &ctx);
        let one = test_payment(&engine, &ctx, customer.id, 10_000);
        let two = test_payment(&engine, &ctx, customer.id, 10_000);

        let first = engine
            .reverse_payment(&ctx, reverse_payment_cmd(one.id, ReversalMethod::Refund, Some(100), Some("k")))
            .unwrap();
        let err = engine
            .reverse_payment(&ctx, reverse_payment_cmd(two.id, ReversalMethod::Refund, Some(100), Some("k")))
            .unwrap_err();

        assert_eq!(
            err,
            DomainError::conflict_with(
                "idempotency key was already used for another payment",
                first.reversal.id
            )
        );
    }

    #[test]
    fn dead_lettered_reversal_is_marked_failed() {
        let ledger = std::sync::Arc::new(InMemoryLedgerStore::new());
        let jobs = InMemoryJobStore::arc();
        let config = EngineConfig {
            execution_mode: ExecutionMode::Deferred,
            job_retry: RetryPolicy::fixed(2, Duration::ZERO),
            ..EngineConfig::default()
        };
        let engine = std::sync::Arc::new(PaymentEngine::new(ledger.clone(), jobs.clone(), config));
        let ctx = test_company();
        let customer = test_customer(&engine, &ctx);
        let payment = test_payment(&engine, &ctx, customer.id, 10_000);
        let accepted = engine
            .reverse_payment(&ctx, reverse_payment_cmd(payment.id, ReversalMethod::Refund, Some(500), None))
            .unwrap();

        let mut executor = JobExecutor::new(jobs.clone());
        engine.register_handlers(&mut executor);
        ledger.fail_next_transactions(2);
        assert!(executor.run_once().unwrap());
        assert!(executor.run_once().unwrap());

        let reversal = engine.get_payment_reversal(&ctx, accepted.reversal.id).unwrap();
        assert_eq!(reversal.status, ReversalStatus::Failed);
        assert!(reversal.failure_reason.unwrap().contains("injected storage failure"));
        assert_eq!(jobs.list_dead_letters(ctx.company_id()).unwrap().len(), 1);
        assert_eq!(engine.payment_summary(&ctx, payment.id).unwrap().pending_reversal, Money::ZERO);
    }
}
