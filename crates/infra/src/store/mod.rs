//! Transactional, tenant-scoped ledger storage.
//!
//! Every engine operation runs as one [`LedgerStore::transaction`]: the closure
//! either returns `Ok` and all its writes become visible together, or returns
//! `Err` and none do. Inside, a [`LedgerTx`] is pinned to one company; rows of any
//! other company are reported as missing on read and refused on write.
//!
//! `lock_*` methods take an exclusive lock on the row for the rest of the
//! transaction (`SELECT ... FOR UPDATE` in Postgres). Lock order is always
//! batch, then payment, then allocation, then credit note, then invoice.

mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::sync::Arc;

use chrono::NaiveDate;

use reconcile_billing::{CreditApplication, CreditNote, Customer, Invoice};
use reconcile_core::{
    AllocationId, AllocationReversalId, BatchId, CompanyId, CreditApplicationId, CreditNoteId,
    Currency, CustomerId, DomainError, DomainResult, InvoiceId, Money, PaymentId, ReversalId,
};
use reconcile_payments::{
    AllocationReversal, Payment, PaymentAllocation, PaymentBatch, PaymentPosition,
    PaymentReversal, ReversalStatus,
};

pub use memory::InMemoryLedgerStore;

/// Unit of work bound to a single company.
pub trait LedgerTx {
    fn company_id(&self) -> CompanyId;

    fn customer(&mut self, id: CustomerId) -> DomainResult<Customer>;
    fn insert_customer(&mut self, customer: &Customer) -> DomainResult<()>;

    fn invoice(&mut self, id: InvoiceId) -> DomainResult<Invoice>;
    fn lock_invoice(&mut self, id: InvoiceId) -> DomainResult<Invoice>;
    /// Posted invoices of the customer with `balance_due > 0`, locked, in id order.
    fn lock_open_invoices(
        &mut self,
        customer_id: CustomerId,
        currency: &Currency,
    ) -> DomainResult<Vec<Invoice>>;
    fn insert_invoice(&mut self, invoice: &Invoice) -> DomainResult<()>;
    fn save_invoice(&mut self, invoice: &Invoice) -> DomainResult<()>;

    fn credit_note(&mut self, id: CreditNoteId) -> DomainResult<CreditNote>;
    fn lock_credit_note(&mut self, id: CreditNoteId) -> DomainResult<CreditNote>;
    fn insert_credit_note(&mut self, note: &CreditNote) -> DomainResult<()>;
    fn save_credit_note(&mut self, note: &CreditNote) -> DomainResult<()>;

    fn lock_credit_application(&mut self, id: CreditApplicationId)
    -> DomainResult<CreditApplication>;
    fn insert_credit_application(&mut self, application: &CreditApplication) -> DomainResult<()>;
    fn save_credit_application(&mut self, application: &CreditApplication) -> DomainResult<()>;
    fn credit_applications_for_invoice(
        &mut self,
        invoice_id: InvoiceId,
    ) -> DomainResult<Vec<CreditApplication>>;

    fn payment(&mut self, id: PaymentId) -> DomainResult<Payment>;
    fn lock_payment(&mut self, id: PaymentId) -> DomainResult<Payment>;
    fn insert_payment(&mut self, payment: &Payment) -> DomainResult<()>;
    fn save_payment(&mut self, payment: &Payment) -> DomainResult<()>;
    fn payments_for_batch(&mut self, batch_id: BatchId) -> DomainResult<Vec<Payment>>;

    fn allocation(&mut self, id: AllocationId) -> DomainResult<PaymentAllocation>;
    fn lock_allocation(&mut self, id: AllocationId) -> DomainResult<PaymentAllocation>;
    fn insert_allocation(&mut self, allocation: &PaymentAllocation) -> DomainResult<()>;
    fn save_allocation(&mut self, allocation: &PaymentAllocation) -> DomainResult<()>;
    fn allocations_for_payment(&mut self, payment_id: PaymentId)
    -> DomainResult<Vec<PaymentAllocation>>;
    fn allocations_for_invoice(&mut self, invoice_id: InvoiceId)
    -> DomainResult<Vec<PaymentAllocation>>;

    fn payment_reversal(&mut self, id: ReversalId) -> DomainResult<PaymentReversal>;
    fn lock_payment_reversal(&mut self, id: ReversalId) -> DomainResult<PaymentReversal>;
    /// `Conflict` carrying the existing id when `(company, idempotency_key)` is taken.
    fn insert_payment_reversal(&mut self, reversal: &PaymentReversal) -> DomainResult<()>;
    fn save_payment_reversal(&mut self, reversal: &PaymentReversal) -> DomainResult<()>;
    fn payment_reversal_by_key(&mut self, key: &str) -> DomainResult<Option<PaymentReversal>>;
    fn payment_reversals_for(&mut self, payment_id: PaymentId)
    -> DomainResult<Vec<PaymentReversal>>;

    fn allocation_reversal(&mut self, id: AllocationReversalId)
    -> DomainResult<AllocationReversal>;
    fn lock_allocation_reversal(
        &mut self,
        id: AllocationReversalId,
    ) -> DomainResult<AllocationReversal>;
    fn insert_allocation_reversal(&mut self, reversal: &AllocationReversal) -> DomainResult<()>;
    fn save_allocation_reversal(&mut self, reversal: &AllocationReversal) -> DomainResult<()>;
    fn allocation_reversals_for(
        &mut self,
        allocation_id: AllocationId,
    ) -> DomainResult<Vec<AllocationReversal>>;

    fn batch(&mut self, id: BatchId) -> DomainResult<PaymentBatch>;
    fn lock_batch(&mut self, id: BatchId) -> DomainResult<PaymentBatch>;
    /// `Conflict` carrying the existing id when `(company, idempotency_key)` is taken.
    fn insert_batch(&mut self, batch: &PaymentBatch) -> DomainResult<()>;
    fn save_batch(&mut self, batch: &PaymentBatch) -> DomainResult<()>;
    fn batch_by_key(&mut self, key: &str) -> DomainResult<Option<PaymentBatch>>;
    /// Next `NNN` for `BATCH-YYYYMMDD-NNN`, per company per day.
    fn next_batch_sequence(&mut self, date: NaiveDate) -> DomainResult<u32>;
    /// Next payment sequence for this company, starting at 1.
    fn next_payment_sequence(&mut self) -> DomainResult<u32>;

    /// Current position of a payment plus its number of active allocations.
    fn payment_position(&mut self, payment: &Payment) -> DomainResult<(PaymentPosition, usize)> {
        let mut position = PaymentPosition::new(payment.amount);
        let allocations = self.allocations_for_payment(payment.id)?;
        let active: Vec<_> = allocations.iter().filter(|a| a.is_active()).collect();
        position.allocated = active.iter().map(|a| a.allocated_amount).sum();
        for reversal in self.payment_reversals_for(payment.id)? {
            match reversal.status {
                ReversalStatus::Completed => {
                    position.reversed_completed =
                        position.reversed_completed.checked_add(reversal.reversed_amount)?;
                }
                ReversalStatus::Pending => {
                    position.reversed_pending =
                        position.reversed_pending.checked_add(reversal.reversed_amount)?;
                }
                ReversalStatus::Failed => {}
            }
        }
        Ok((position, active.len()))
    }

    /// `total - active allocations - active credit applications`, for consistency checks.
    fn expected_balance_due(&mut self, invoice: &Invoice) -> DomainResult<Money> {
        let allocated: Money = self
            .allocations_for_invoice(invoice.id_typed())?
            .iter()
            .filter(|a| a.is_active())
            .map(|a| a.allocated_amount)
            .sum();
        let credited: Money = self
            .credit_applications_for_invoice(invoice.id_typed())?
            .iter()
            .filter(|a| a.is_active())
            .map(|a| a.amount_applied)
            .sum();
        invoice
            .total_amount()
            .checked_sub(allocated)?
            .checked_sub(credited)
    }
}

/// Transaction factory.
pub trait LedgerStore: Send + Sync + 'static {
    fn transaction<T, F>(&self, company_id: CompanyId, f: F) -> DomainResult<T>
    where
        F: FnOnce(&mut dyn LedgerTx) -> DomainResult<T>;
}

impl<S: LedgerStore> LedgerStore for Arc<S> {
    fn transaction<T, F>(&self, company_id: CompanyId, f: F) -> DomainResult<T>
    where
        F: FnOnce(&mut dyn LedgerTx) -> DomainResult<T>,
    {
        (**self).transaction(company_id, f)
    }
}

/// Backend chosen at startup.
pub enum LedgerBackend {
    InMemory(InMemoryLedgerStore),
    #[cfg(feature = "postgres")]
    Postgres(postgres::PgLedgerStore),
}

impl LedgerStore for LedgerBackend {
    fn transaction<T, F>(&self, company_id: CompanyId, f: F) -> DomainResult<T>
    where
        F: FnOnce(&mut dyn LedgerTx) -> DomainResult<T>,
    {
        match self {
            LedgerBackend::InMemory(store) => store.transaction(company_id, f),
            #[cfg(feature = "postgres")]
            LedgerBackend::Postgres(store) => store.transaction(company_id, f),
        }
    }
}

/// A referenced row (as opposed to the row being acted on) that is missing or
/// owned by another company is a validation failure on `field`.
pub fn as_reference(field: &str) -> impl FnOnce(DomainError) -> DomainError + '_ {
    move |err| match err {
        DomainError::NotFound => {
            DomainError::validation(field, "does not exist or belongs to another company")
        }
        other => other,
    }
}
