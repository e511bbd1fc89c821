//! Payment recording, manual and automatic allocation, and payment queries.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use reconcile_core::{
    AllocationId, DomainError, DomainResult, Money, OperationContext, PaymentId, UserId,
};
use reconcile_payments::{
    AllocateCommand, AllocationMethod, AllocationStrategy, AutoAllocateCommand, OpenInvoice,
    Payment, PaymentAllocation, PaymentSummary, RecordPayment, RecordPaymentCommand, allocate,
    plan,
};

use super::PaymentEngine;
use crate::store::{LedgerStore, LedgerTx, as_reference};

/// A new payment and whatever was auto-allocated from it in the same transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedPayment {
    pub payment: Payment,
    pub allocations: Vec<PaymentAllocation>,
}

impl RecordedPayment {
    pub fn allocated(&self) -> Money {
        self.allocations.iter().map(|a| a.allocated_amount).sum()
    }
}

/// Insert a payment for a customer of this company, then optionally auto-allocate it.
///
/// `customer_field` names the field a foreign or unknown customer is reported on.
pub(super) fn record_in(
    tx: &mut dyn LedgerTx,
    cmd: RecordPayment,
    strategy: Option<&AllocationStrategy>,
    customer_field: &str,
) -> DomainResult<RecordedPayment> {
    tx.customer(cmd.customer_id)
        .map_err(as_reference(customer_field))?;
    let actor = cmd.created_by;
    let at = cmd.occurred_at;
    let sequence = tx.next_payment_sequence()?;
    let payment = Payment::record(cmd, sequence)?;
    tx.insert_payment(&payment)?;

    let allocations = match strategy {
        Some(strategy) => auto_allocate_in(tx, &payment, strategy, actor, at)?,
        None => Vec::new(),
    };
    Ok(RecordedPayment {
        payment,
        allocations,
    })
}

/// Spread the payment's unallocated remainder over the customer's open invoices.
///
/// The payment must already be locked (or created) by this transaction. Open
/// invoices are locked before the plan is computed, so the plan sees balances no
/// other transaction can move.
pub(super) fn auto_allocate_in(
    tx: &mut dyn LedgerTx,
    payment: &Payment,
    strategy: &AllocationStrategy,
    actor: UserId,
    at: DateTime<Utc>,
) -> DomainResult<Vec<PaymentAllocation>> {
    payment.ensure_not_reversed()?;
    let (mut position, _) = tx.payment_position(payment)?;
    let available = position.checked_unallocated()?;
    if !available.is_positive() {
        return Ok(Vec::new());
    }

    let mut invoices = tx.lock_open_invoices(payment.customer_id, &payment.currency)?;
    let open: Vec<OpenInvoice> = invoices.iter().map(OpenInvoice::from).collect();
    let planned = plan(strategy, available, &open);
    debug!(
        payment_id = %payment.id,
        strategy = strategy.name(),
        open_invoices = open.len(),
        lines = planned.len(),
        "allocation planned"
    );

    let mut allocations = Vec::with_capacity(planned.len());
    for line in planned {
        let invoice = invoices
            .iter_mut()
            .find(|i| i.id_typed() == line.invoice_id)
            .ok_or_else(|| DomainError::invariant("planned an allocation to an invoice that is not locked"))?;
        let allocation = allocate(
            payment,
            &position,
            invoice,
            line.amount,
            strategy.method(),
            actor,
            at,
        )?;
        position.allocated = position.allocated.checked_add(allocation.allocated_amount)?;
        tx.insert_allocation(&allocation)?;
        tx.save_invoice(invoice)?;
        allocations.push(allocation);
    }
    Ok(allocations)
}

impl<L: LedgerStore> PaymentEngine<L> {
    /// Record a payment. Nothing is allocated unless `auto_allocate` names a strategy.
    pub fn record_payment(
        &self,
        ctx: &OperationContext,
        cmd: RecordPaymentCommand,
    ) -> DomainResult<RecordedPayment> {
        let record = RecordPayment {
            company_id: ctx.company_id(),
            customer_id: cmd.customer_id,
            amount: cmd.amount,
            currency: cmd.currency,
            payment_method: cmd.payment_method,
            payment_date: cmd.payment_date,
            reference_number: cmd.reference_number,
            notes: cmd.notes,
            batch_id: None,
            created_by: ctx.actor(),
            occurred_at: Utc::now(),
        };
        let strategy = cmd.auto_allocate;
        let recorded = self.run(ctx, |tx| {
            record_in(tx, record, strategy.as_ref(), "customer_id")
        })?;
        info!(
            company_id = %ctx.company_id(),
            payment_id = %recorded.payment.id,
            amount = %recorded.payment.amount,
            allocated = %recorded.allocated(),
            "payment recorded"
        );
        Ok(recorded)
    }

    /// Allocate an explicit amount of a payment to one invoice.
    pub fn allocate_manual(
        &self,
        ctx: &OperationContext,
        cmd: AllocateCommand,
    ) -> DomainResult<PaymentAllocation> {
        let now = Utc::now();
        let allocation = self.run(ctx, |tx| {
            let payment = tx.lock_payment(cmd.payment_id)?;
            let (position, _) = tx.payment_position(&payment)?;
            let mut invoice = tx
                .lock_invoice(cmd.invoice_id)
                .map_err(as_reference("invoice_id"))?;
            let allocation = allocate(
                &payment,
                &position,
                &mut invoice,
                cmd.amount,
                AllocationMethod::Manual,
                ctx.actor(),
                now,
            )?;
            tx.insert_allocation(&allocation)?;
            tx.save_invoice(&invoice)?;
            Ok(allocation)
        })?;
        info!(
            company_id = %ctx.company_id(),
            payment_id = %allocation.payment_id,
            invoice_id = %allocation.invoice_id,
            allocation_id = %allocation.id,
            amount = %allocation.allocated_amount,
            "allocation created"
        );
        Ok(allocation)
    }

    /// Allocate whatever is left on a payment using `strategy`. A remainder that no
    /// open invoice can absorb stays on the payment.
    pub fn auto_allocate(
        &self,
        ctx: &OperationContext,
        cmd: AutoAllocateCommand,
    ) -> DomainResult<Vec<PaymentAllocation>> {
        let now = Utc::now();
        let allocations = self.run(ctx, |tx| {
            let payment = tx.lock_payment(cmd.payment_id)?;
            auto_allocate_in(tx, &payment, &cmd.strategy, ctx.actor(), now)
        })?;
        info!(
            company_id = %ctx.company_id(),
            payment_id = %cmd.payment_id,
            strategy = cmd.strategy.name(),
            allocations = allocations.len(),
            "payment auto-allocated"
        );
        Ok(allocations)
    }

    pub fn get_payment(&self, ctx: &OperationContext, id: PaymentId) -> DomainResult<Payment> {
        self.run(ctx, |tx| tx.payment(id))
    }

    pub fn get_allocation(
        &self,
        ctx: &OperationContext,
        id: AllocationId,
    ) -> DomainResult<PaymentAllocation> {
        self.run(ctx, |tx| tx.allocation(id))
    }

    /// Every allocation of a payment, active and reversed.
    pub fn payment_allocations(
        &self,
        ctx: &OperationContext,
        payment_id: PaymentId,
    ) -> DomainResult<Vec<PaymentAllocation>> {
        self.run(ctx, |tx| {
            tx.payment(payment_id)?;
            tx.allocations_for_payment(payment_id)
        })
    }

    pub fn payment_summary(
        &self,
        ctx: &OperationContext,
        payment_id: PaymentId,
    ) -> DomainResult<PaymentSummary> {
        self.run(ctx, |tx| {
            let payment = tx.payment(payment_id)?;
            let (position, active_allocations) = tx.payment_position(&payment)?;
            Ok(PaymentSummary {
                payment_id,
                amount: payment.amount,
                allocated: position.allocated,
                refunded: position.reversed_completed,
                pending_reversal: position.reversed_pending,
                unallocated: position.unallocated(),
                active_allocations,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use reconcile_core::InvoiceId;
    use reconcile_payments::AllocationStatus;

    use super::super::test_support::*;
    use super::*;

    fn allocate_cmd(payment_id: PaymentId, invoice_id: InvoiceId, cents: i64) -> AllocateCommand {
        AllocateCommand {
            payment_id,
            invoice_id,
            amount: Money::from_minor(cents),
        }
    }

    #[test]
    fn recording_a_payment_never_allocates_by_itself() {
        let engine = inline_engine();
        let ctx = test_company();
        let customer = test_customer(&engine, &ctx);
        let invoice = test_invoice(&engine, &ctx, customer.id, "INV-1", 100_000, 31);

        let recorded = engine
            .record_payment(&ctx, payment_command(customer.id, 50_000))
            .unwrap();

        assert!(recorded.allocations.is_empty());
        assert_eq!(
            engine.get_invoice(&ctx, invoice.id_typed()).unwrap().balance_due(),
            Money::from_minor(100_000)
        );
    }

    #[test]
    fn payment_numbers_count_up_per_company() {
        let engine = inline_engine();
        let ctx = test_company();
        let other = test_company();
        let customer = test_customer(&engine, &ctx);
        let theirs = test_customer(&engine, &other);

        let first = test_payment(&engine, &ctx, customer.id, 1_000);
        let elsewhere = test_payment(&engine, &other, theirs.id, 1_000);
        let rejected = engine.record_payment(&ctx, payment_command(customer.id, 0));
        let second = test_payment(&engine, &ctx, customer.id, 2_000);

        assert!(rejected.is_err());
        assert_eq!(first.payment_number, "PAY-000001");
        assert_eq!(second.payment_number, "PAY-000002");
        assert_eq!(elsewhere.payment_number, "PAY-000001");
        assert_eq!(
            engine.get_payment(&ctx, second.id).unwrap().payment_number,
            "PAY-000002"
        );
    }

    #[test]
    fn manual_allocation_decrements_balance_due() {
        let engine = inline_engine();
        let ctx = test_company();
        let customer = test_customer(&engine, &ctx);
        let invoice = test_invoice(&engine, &ctx, customer.id, "INV-A", 100_000, 31);
        let payment = test_payment(&engine, &ctx, customer.id, 100_000);

        let allocation = engine
            .allocate_manual(&ctx, allocate_cmd(payment.id, invoice.id_typed(), 60_000))
            .unwrap();

        assert_eq!(allocation.status, AllocationStatus::Active);
        assert_eq!(allocation.allocation_method, AllocationMethod::Manual);
        assert_eq!(
            engine.get_invoice(&ctx, invoice.id_typed()).unwrap().balance_due(),
            Money::from_minor(40_000)
        );
        let summary = engine.payment_summary(&ctx, payment.id).unwrap();
        assert_eq!(summary.allocated, Money::from_minor(60_000));
        assert_eq!(summary.unallocated, Money::from_minor(40_000));
    }

    #[test]
    fn rejected_allocation_changes_nothing() {
        let engine = inline_engine();
        let ctx = test_company();
        let customer = test_customer(&engine, &ctx);
        let invoice = test_invoice(&engine, &ctx, customer.id, "INV-A", 10_000, 31);
        let payment = test_payment(&engine, &ctx, customer.id, 50_000);

        for cents in [0, 10_001] {
            let err = engine
                .allocate_manual(&ctx, allocate_cmd(payment.id, invoice.id_typed(), cents))
                .unwrap_err();
            assert!(err.field_errors().unwrap().contains("amount"));
        }

        assert_eq!(
            engine.get_invoice(&ctx, invoice.id_typed()).unwrap().balance_due(),
            Money::from_minor(10_000)
        );
        assert!(engine.payment_allocations(&ctx, payment.id).unwrap().is_empty());
    }

    #[test]
    fn allocation_cannot_exceed_the_payment() {
        let engine = inline_engine();
        let ctx = test_company();
        let customer = test_customer(&engine, &ctx);
        let first = test_invoice(&engine, &ctx, customer.id, "INV-1", 30_000, 10);
        let second = test_invoice(&engine, &ctx, customer.id, "INV-2", 30_000, 20);
        let payment = test_payment(&engine, &ctx, customer.id, 40_000);

        engine
            .allocate_manual(&ctx, allocate_cmd(payment.id, first.id_typed(), 30_000))
            .unwrap();
        let err = engine
            .allocate_manual(&ctx, allocate_cmd(payment.id, second.id_typed(), 20_000))
            .unwrap_err();

        assert!(err.field_errors().unwrap().contains("amount"));
        assert_eq!(
            engine.get_invoice(&ctx, second.id_typed()).unwrap().balance_due(),
            Money::from_minor(30_000)
        );
    }

    #[test]
    fn allocating_to_another_companys_invoice_is_a_validation_error() {
        let engine = inline_engine();
        let ctx = test_company();
        let other = test_company();
        let customer = test_customer(&engine, &ctx);
        let payment = test_payment(&engine, &ctx, customer.id, 10_000);
        let their_customer = test_customer(&engine, &other);
        let their_invoice = test_invoice(&engine, &other, their_customer.id, "INV-X", 10_000, 31);

        let err = engine
            .allocate_manual(&ctx, allocate_cmd(payment.id, their_invoice.id_typed(), 5_000))
            .unwrap_err();

        assert!(err.field_errors().unwrap().contains("invoice_id"));
        assert_eq!(
            engine
                .get_invoice(&other, their_invoice.id_typed())
                .unwrap()
                .balance_due(),
            Money::from_minor(10_000)
        );
    }

    #[test]
    fn foreign_payment_is_not_found() {
        let engine = inline_engine();
        let ctx = test_company();
        let other = test_company();
        let their_customer = test_customer(&engine, &other);
        let their_payment = test_payment(&engine, &other, their_customer.id, 10_000);

        assert_eq!(
            engine.get_payment(&ctx, their_payment.id).unwrap_err(),
            DomainError::NotFound
        );
    }

    #[test]
    fn fifo_spreads_a_payment_over_oldest_invoices_first() {
        let engine = inline_engine();
        let ctx = test_company();
        let customer = test_customer(&engine, &ctx);
        let c = test_invoice(&engine, &ctx, customer.id, "INV-C", 50_000, 28);
        let b = test_invoice(&engine, &ctx, customer.id, "INV-B", 50_000, 1);

        let recorded = fifo_payment(&engine, &ctx, customer.id, 75_000);

        let split: Vec<_> = recorded
            .allocations
            .iter()
            .map(|a| (a.invoice_id, a.allocated_amount))
            .collect();
        assert_eq!(
            split,
            vec![
                (b.id_typed(), Money::from_minor(50_000)),
                (c.id_typed(), Money::from_minor(25_000)),
            ]
        );
        assert!(recorded.allocations.iter().all(|a| a.allocation_method == AllocationMethod::Fifo));
        assert_eq!(
            engine.get_invoice(&ctx, c.id_typed()).unwrap().balance_due(),
            Money::from_minor(25_000)
        );
        let summary = engine.payment_summary(&ctx, recorded.payment.id).unwrap();
        assert_eq!(summary.unallocated, Money::ZERO);
    }

    #[test]
    fn remainder_stays_on_the_payment() {
        let engine = inline_engine();
        let ctx = test_company();
        let customer = test_customer(&engine, &ctx);
        test_invoice(&engine, &ctx, customer.id, "INV-1", 20_000, 5);

        let recorded = fifo_payment(&engine, &ctx, customer.id, 50_000);

        assert_eq!(recorded.allocated(), Money::from_minor(20_000));
        let summary = engine.payment_summary(&ctx, recorded.payment.id).unwrap();
        assert_eq!(summary.unallocated, Money::from_minor(30_000));

        // Nothing left to settle: a second pass is a no-op, not an error.
        let again = engine
            .auto_allocate(
                &ctx,
                AutoAllocateCommand {
                    payment_id: recorded.payment.id,
                    strategy: AllocationStrategy::LargestFirst,
                },
            )
            .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn concurrent_allocations_never_over_allocate_an_invoice() {
        let engine = inline_engine();
        let ctx = test_company();
        let customer = test_customer(&engine, &ctx);
        let invoice = test_invoice(&engine, &ctx, customer.id, "INV-HOT", 100_000, 31);
        let payments: Vec<_> = (0..8)
            .map(|_| test_payment(&engine, &ctx, customer.id, 60_000))
            .collect();

        let results: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = payments
                .iter()
                .map(|payment| {
                    let engine = Arc::clone(&engine);
                    let cmd = allocate_cmd(payment.id, invoice.id_typed(), 60_000);
                    scope.spawn(move || engine.allocate_manual(&ctx, cmd))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            engine.get_invoice(&ctx, invoice.id_typed()).unwrap().balance_due(),
            Money::from_minor(40_000)
        );
    }
}
