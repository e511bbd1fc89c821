//! In-memory ledger store for tests/dev.
//!
//! One mutex guards all tables, so transactions are fully serialized. Writes are
//! staged in a private overlay and merged on commit; an `Err` from the closure
//! simply drops the overlay.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::NaiveDate;

use reconcile_billing::{CreditApplication, CreditNote, Customer, Invoice, InvoiceStatus};
use reconcile_core::tenant::{ensure_same_company, ensure_visible};
use reconcile_core::{
    AllocationId, AllocationReversalId, BatchId, CompanyId, CreditApplicationId, CreditNoteId,
    Currency, CustomerId, DomainError, DomainResult, InvoiceId, PaymentId, ReversalId,
    TenantScoped,
};
use reconcile_payments::{
    AllocationReversal, Payment, PaymentAllocation, PaymentBatch, PaymentReversal,
};

use super::{LedgerStore, LedgerTx};

#[derive(Debug, Default)]
struct Tables {
    customers: HashMap<CustomerId, Customer>,
    invoices: HashMap<InvoiceId, Invoice>,
    credit_notes: HashMap<CreditNoteId, CreditNote>,
    credit_applications: HashMap<CreditApplicationId, CreditApplication>,
    payments: HashMap<PaymentId, Payment>,
    allocations: HashMap<AllocationId, PaymentAllocation>,
    payment_reversals: HashMap<ReversalId, PaymentReversal>,
    allocation_reversals: HashMap<AllocationReversalId, AllocationReversal>,
    batches: HashMap<BatchId, PaymentBatch>,
    batch_sequences: HashMap<(CompanyId, NaiveDate), u32>,
    payment_sequences: HashMap<CompanyId, u32>,
}

impl Tables {
    fn apply(&mut self, writes: Tables) {
        self.customers.extend(writes.customers);
        self.invoices.extend(writes.invoices);
        self.credit_notes.extend(writes.credit_notes);
        self.credit_applications.extend(writes.credit_applications);
        self.payments.extend(writes.payments);
        self.allocations.extend(writes.allocations);
        self.payment_reversals.extend(writes.payment_reversals);
        self.allocation_reversals.extend(writes.allocation_reversals);
        self.batches.extend(writes.batches);
        self.batch_sequences.extend(writes.batch_sequences);
        self.payment_sequences.extend(writes.payment_sequences);
    }
}

/// Transaction-serializing in-memory store.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    tables: Mutex<Tables>,
    passes_before_failure: AtomicUsize,
    failures_to_inject: AtomicUsize,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` transactions fail with `Transient` before running.
    ///
    /// Simulates lock timeouts and outages for retry paths.
    pub fn fail_next_transactions(&self, count: usize) {
        self.fail_transactions_after(0, count);
    }

    /// Let `passes` transactions through, then fail the following `count`.
    pub fn fail_transactions_after(&self, passes: usize, count: usize) {
        self.passes_before_failure.store(passes, Ordering::SeqCst);
        self.failures_to_inject.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        if self.failures_to_inject.load(Ordering::SeqCst) == 0 {
            return false;
        }
        let passed = self
            .passes_before_failure
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if passed {
            return false;
        }
        self.failures_to_inject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn transaction<T, F>(&self, company_id: CompanyId, f: F) -> DomainResult<T>
    where
        F: FnOnce(&mut dyn LedgerTx) -> DomainResult<T>,
    {
        if self.take_injected_failure() {
            return Err(DomainError::transient("injected storage failure"));
        }
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| DomainError::transient("ledger store lock poisoned"))?;

        let mut tx = MemTx {
            company_id,
            base: &tables,
            writes: Tables::default(),
        };
        let out = f(&mut tx)?;
        let MemTx { writes, .. } = tx;
        tables.apply(writes);
        Ok(out)
    }
}

struct MemTx<'a> {
    company_id: CompanyId,
    base: &'a Tables,
    writes: Tables,
}

fn staged<'t, K: Eq + Hash, V>(
    writes: &'t HashMap<K, V>,
    base: &'t HashMap<K, V>,
    key: &K,
) -> Option<&'t V> {
    writes.get(key).or_else(|| base.get(key))
}

fn scan<K: Eq + Hash, V: Clone>(
    writes: &HashMap<K, V>,
    base: &HashMap<K, V>,
    mut pred: impl FnMut(&V) -> bool,
) -> Vec<V> {
    let mut out: Vec<V> = writes.values().filter(|v| pred(v)).cloned().collect();
    out.extend(
        base.iter()
            .filter(|(k, _)| !writes.contains_key(k))
            .map(|(_, v)| v)
            .filter(|v| pred(v))
            .cloned(),
    );
    out
}

/// Read a row, hiding other companies' rows.
fn read<K: Eq + Hash, V: Clone + TenantScoped>(
    company_id: CompanyId,
    writes: &HashMap<K, V>,
    base: &HashMap<K, V>,
    key: &K,
) -> DomainResult<V> {
    let row = staged(writes, base, key).ok_or(DomainError::NotFound)?;
    ensure_visible(company_id, row)?;
    Ok(row.clone())
}

/// Insert a new row owned by this company.
fn insert<K: Eq + Hash + Copy + core::fmt::Display, V: Clone + TenantScoped>(
    company_id: CompanyId,
    writes: &mut HashMap<K, V>,
    base: &HashMap<K, V>,
    key: K,
    row: &V,
) -> DomainResult<()> {
    ensure_same_company(company_id, row, "company_id")?;
    if staged(writes, base, &key).is_some() {
        return Err(DomainError::conflict_with("row already exists", key));
    }
    writes.insert(key, row.clone());
    Ok(())
}

/// Overwrite an existing row owned by this company.
fn save<K: Eq + Hash + Copy, V: Clone + TenantScoped>(
    company_id: CompanyId,
    writes: &mut HashMap<K, V>,
    base: &HashMap<K, V>,
    key: K,
    row: &V,
) -> DomainResult<()> {
    ensure_same_company(company_id, row, "company_id")?;
    let existing = staged(writes, base, &key).ok_or(DomainError::NotFound)?;
    ensure_visible(company_id, existing)?;
    writes.insert(key, row.clone());
    Ok(())
}

macro_rules! table {
    ($self:ident, $t:ident) => {
        (&mut $self.writes.$t, &$self.base.$t)
    };
}

impl LedgerTx for MemTx<'_> {
    fn company_id(&self) -> CompanyId {
        self.company_id
    }

    fn customer(&mut self, id: CustomerId) -> DomainResult<Customer> {
        let (w, b) = table!(self, customers);
        read(self.company_id, w, b, &id)
    }

    fn insert_customer(&mut self, customer: &Customer) -> DomainResult<()> {
        let (w, b) = table!(self, customers);
        insert(self.company_id, w, b, customer.id, customer)
    }

    fn invoice(&mut self, id: InvoiceId) -> DomainResult<Invoice> {
        let (w, b) = table!(self, invoices);
        read(self.company_id, w, b, &id)
    }

    fn lock_invoice(&mut self, id: InvoiceId) -> DomainResult<Invoice> {
        self.invoice(id)
    }

    fn lock_open_invoices(
        &mut self,
        customer_id: CustomerId,
        currency: &Currency,
    ) -> DomainResult<Vec<Invoice>> {
        let company_id = self.company_id;
        let mut open = scan(&self.writes.invoices, &self.base.invoices, |i| {
            i.company_id() == company_id
                && i.customer_id() == customer_id
                && i.currency() == currency
                && i.status() == InvoiceStatus::Posted
                && i.balance_due().is_positive()
        });
        open.sort_by_key(|i| i.id_typed());
        Ok(open)
    }

    fn insert_invoice(&mut self, invoice: &Invoice) -> DomainResult<()> {
        let (w, b) = table!(self, invoices);
        insert(self.company_id, w, b, invoice.id_typed(), invoice)
    }

    fn save_invoice(&mut self, invoice: &Invoice) -> DomainResult<()> {
        let (w, b) = table!(self, invoices);
        save(self.company_id, w, b, invoice.id_typed(), invoice)
    }

    fn credit_note(&mut self, id: CreditNoteId) -> DomainResult<CreditNote> {
        let (w, b) = table!(self, credit_notes);
        read(self.company_id, w, b, &id)
    }

    fn lock_credit_note(&mut self, id: CreditNoteId) -> DomainResult<CreditNote> {
        self.credit_note(id)
    }

    fn insert_credit_note(&mut self, note: &CreditNote) -> DomainResult<()> {
        let (w, b) = table!(self, credit_notes);
        insert(self.company_id, w, b, note.id_typed(), note)
    }

    fn save_credit_note(&mut self, note: &CreditNote) -> DomainResult<()> {
        let (w, b) = table!(self, credit_notes);
        save(self.company_id, w, b, note.id_typed(), note)
    }

    fn lock_credit_application(
        &mut self,
        id: CreditApplicationId,
    ) -> DomainResult<CreditApplication> {
        let (w, b) = table!(self, credit_applications);
        read(self.company_id, w, b, &id)
    }

    fn insert_credit_application(&mut self, application: &CreditApplication) -> DomainResult<()> {
        let (w, b) = table!(self, credit_applications);
        insert(self.company_id, w, b, application.id, application)
    }

    fn save_credit_application(&mut self, application: &CreditApplication) -> DomainResult<()> {
        let (w, b) = table!(self, credit_applications);
        save(self.company_id, w, b, application.id, application)
    }

    fn credit_applications_for_invoice(
        &mut self,
        invoice_id: InvoiceId,
    ) -> DomainResult<Vec<CreditApplication>> {
        let company_id = self.company_id;
        let mut rows = scan(
            &self.writes.credit_applications,
            &self.base.credit_applications,
            |a| a.company_id == company_id && a.invoice_id == invoice_id,
        );
        rows.sort_by_key(|a| a.id);
        Ok(rows)
    }

    fn payment(&mut self, id: PaymentId) -> DomainResult<Payment> {
        let (w, b) = table!(self, payments);
        read(self.company_id, w, b, &id)
    }

    fn lock_payment(&mut self, id: PaymentId) -> DomainResult<Payment> {
        self.payment(id)
    }

    fn insert_payment(&mut self, payment: &Payment) -> DomainResult<()> {
        let (w, b) = table!(self, payments);
        insert(self.company_id, w, b, payment.id, payment)
    }

    fn save_payment(&mut self, payment: &Payment) -> DomainResult<()> {
        let (w, b) = table!(self, payments);
        save(self.company_id, w, b, payment.id, payment)
    }

    fn payments_for_batch(&mut self, batch_id: BatchId) -> DomainResult<Vec<Payment>> {
        let company_id = self.company_id;
        let mut rows = scan(&self.writes.payments, &self.base.payments, |p| {
            p.company_id == company_id && p.batch_id == Some(batch_id)
        });
        rows.sort_by_key(|p| p.id);
        Ok(rows)
    }

    fn allocation(&mut self, id: AllocationId) -> DomainResult<PaymentAllocation> {
        let (w, b) = table!(self, allocations);
        read(self.company_id, w, b, &id)
    }

    fn lock_allocation(&mut self, id: AllocationId) -> DomainResult<PaymentAllocation> {
        self.allocation(id)
    }

    fn insert_allocation(&mut self, allocation: &PaymentAllocation) -> DomainResult<()> {
        let (w, b) = table!(self, allocations);
        insert(self.company_id, w, b, allocation.id, allocation)
    }

    fn save_allocation(&mut self, allocation: &PaymentAllocation) -> DomainResult<()> {
        let (w, b) = table!(self, allocations);
        save(self.company_id, w, b, allocation.id, allocation)
    }

    fn allocations_for_payment(
        &mut self,
        payment_id: PaymentId,
    ) -> DomainResult<Vec<PaymentAllocation>> {
        let company_id = self.company_id;
        let mut rows = scan(&self.writes.allocations, &self.base.allocations, |a| {
            a.company_id == company_id && a.payment_id == payment_id
        });
        rows.sort_by_key(|a| a.id);
        Ok(rows)
    }

    fn allocations_for_invoice(
        &mut self,
        invoice_id: InvoiceId,
    ) -> DomainResult<Vec<PaymentAllocation>> {
        let company_id = self.company_id;
        let mut rows = scan(&self.writes.allocations, &self.base.allocations, |a| {
            a.company_id == company_id && a.invoice_id == invoice_id
        });
        rows.sort_by_key(|a| a.id);
        Ok(rows)
    }

    fn payment_reversal(&mut self, id: ReversalId) -> DomainResult<PaymentReversal> {
        let (w, b) = table!(self, payment_reversals);
        read(self.company_id, w, b, &id)
    }

    fn lock_payment_reversal(&mut self, id: ReversalId) -> DomainResult<PaymentReversal> {
        self.payment_reversal(id)
    }

    fn insert_payment_reversal(&mut self, reversal: &PaymentReversal) -> DomainResult<()> {
        if let Some(key) = &reversal.idempotency_key {
            if let Some(existing) = self.payment_reversal_by_key(key)? {
                return Err(DomainError::conflict_with(
                    "idempotency key already used for a payment reversal",
                    existing.id,
                ));
            }
        }
        let (w, b) = table!(self, payment_reversals);
        insert(self.company_id, w, b, reversal.id, reversal)
    }

    fn save_payment_reversal(&mut self, reversal: &PaymentReversal) -> DomainResult<()> {
        let (w, b) = table!(self, payment_reversals);
        save(self.company_id, w, b, reversal.id, reversal)
    }

    fn payment_reversal_by_key(&mut self, key: &str) -> DomainResult<Option<PaymentReversal>> {
        let company_id = self.company_id;
        let found = scan(
            &self.writes.payment_reversals,
            &self.base.payment_reversals,
            |r| r.company_id == company_id && r.idempotency_key.as_deref() == Some(key),
        );
        Ok(found.into_iter().next())
    }

    fn payment_reversals_for(&mut self, payment_id: PaymentId) -> DomainResult<Vec<PaymentReversal>> {
        let company_id = self.company_id;
        let mut rows = scan(
            &self.writes.payment_reversals,
            &self.base.payment_reversals,
            |r| r.company_id == company_id && r.payment_id == payment_id,
        );
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }

    fn allocation_reversal(&mut self, id: AllocationReversalId) -> DomainResult<AllocationReversal> {
        let (w, b) = table!(self, allocation_reversals);
        read(self.company_id, w, b, &id)
    }

    fn lock_allocation_reversal(
        &mut self,
        id: AllocationReversalId,
    ) -> DomainResult<AllocationReversal> {
        self.allocation_reversal(id)
    }

    fn insert_allocation_reversal(&mut self, reversal: &AllocationReversal) -> DomainResult<()> {
        let (w, b) = table!(self, allocation_reversals);
        insert(self.company_id, w, b, reversal.id, reversal)
    }

    fn save_allocation_reversal(&mut self, reversal: &AllocationReversal) -> DomainResult<()> {
        let (w, b) = table!(self, allocation_reversals);
        save(self.company_id, w, b, reversal.id, reversal)
    }

    fn allocation_reversals_for(
        &mut self,
        allocation_id: AllocationId,
    ) -> DomainResult<Vec<AllocationReversal>> {
        let company_id = self.company_id;
        let mut rows = scan(
            &self.writes.allocation_reversals,
            &self.base.allocation_reversals,
            |r| r.company_id == company_id && r.allocation_id == allocation_id,
        );
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }

    fn batch(&mut self, id: BatchId) -> DomainResult<PaymentBatch> {
        let (w, b) = table!(self, batches);
        read(self.company_id, w, b, &id)
    }

    fn lock_batch(&mut self, id: BatchId) -> DomainResult<PaymentBatch> {
        self.batch(id)
    }

    fn insert_batch(&mut self, batch: &PaymentBatch) -> DomainResult<()> {
        if let Some(key) = &batch.idempotency_key {
            if let Some(existing) = self.batch_by_key(key)? {
                return Err(DomainError::conflict_with(
                    "a batch with this idempotency key already exists",
                    existing.id,
                ));
            }
        }
        let (w, b) = table!(self, batches);
        insert(self.company_id, w, b, batch.id, batch)
    }

    fn save_batch(&mut self, batch: &PaymentBatch) -> DomainResult<()> {
        let (w, b) = table!(self, batches);
        save(self.company_id, w, b, batch.id, batch)
    }

    fn batch_by_key(&mut self, key: &str) -> DomainResult<Option<PaymentBatch>> {
        let company_id = self.company_id;
        let found = scan(&self.writes.batches, &self.base.batches, |b| {
            b.company_id == company_id && b.idempotency_key.as_deref() == Some(key)
        });
        Ok(found.into_iter().next())
    }

    fn next_batch_sequence(&mut self, date: NaiveDate) -> DomainResult<u32> {
        let key = (self.company_id, date);
        let current = staged(
            &self.writes.batch_sequences,
            &self.base.batch_sequences,
            &key,
        )
        .copied()
        .unwrap_or(0);
        let next = current + 1;
        self.writes.batch_sequences.insert(key, next);
        Ok(next)
    }

    fn next_payment_sequence(&mut self) -> DomainResult<u32> {
        let next = staged(
            &self.writes.payment_sequences,
            &self.base.payment_sequences,
            &self.company_id,
        )
        .copied()
        .unwrap_or(0)
            + 1;
        self.writes.payment_sequences.insert(self.company_id, next);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use reconcile_billing::DraftInvoice;
    use reconcile_core::Money;

    use super::*;

    fn invoice(company_id: CompanyId) -> Invoice {
        let mut invoice = Invoice::draft(DraftInvoice {
            company_id,
            customer_id: CustomerId::new(),
            invoice_number: "INV-1".to_string(),
            currency: Currency::new("USD").unwrap(),
            total_amount: Money::from_minor(10_000),
            issue_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            due_date: NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
            occurred_at: Utc::now(),
        })
        .unwrap();
        invoice.post(Utc::now()).unwrap();
        invoice
    }

    #[test]
    fn failed_transaction_leaves_no_trace() {
        let store = InMemoryLedgerStore::new();
        let company = CompanyId::new();
        let inv = invoice(company);

        let result: DomainResult<()> = store.transaction(company, |tx| {
            tx.insert_invoice(&inv)?;
            Err(DomainError::invariant("boom"))
        });
        assert!(result.is_err());

        let found = store.transaction(company, |tx| tx.invoice(inv.id_typed()));
        assert_eq!(found, Err(DomainError::NotFound));
    }

    #[test]
    fn writes_are_visible_inside_and_after_the_transaction() {
        let store = InMemoryLedgerStore::new();
        let company = CompanyId::new();
        let inv = invoice(company);

        store
            .transaction(company, |tx| {
                tx.insert_invoice(&inv)?;
                let mut locked = tx.lock_invoice(inv.id_typed())?;
                locked.cancel(Utc::now())?;
                tx.save_invoice(&locked)
            })
            .unwrap();

        let stored = store.transaction(company, |tx| tx.invoice(inv.id_typed())).unwrap();
        assert_eq!(stored.status(), InvoiceStatus::Cancelled);
    }

    #[test]
    fn other_companies_rows_are_invisible_and_unwritable() {
        let store = InMemoryLedgerStore::new();
        let mine = CompanyId::new();
        let theirs = CompanyId::new();
        let inv = invoice(theirs);

        store.transaction(theirs, |tx| tx.insert_invoice(&inv)).unwrap();

        assert_eq!(
            store.transaction(mine, |tx| tx.invoice(inv.id_typed())),
            Err(DomainError::NotFound)
        );
        let err = store.transaction(mine, |tx| tx.save_invoice(&inv)).unwrap_err();
        assert!(err.field_errors().is_some());
    }

    #[test]
    fn batch_sequence_is_per_company_per_day() {
        let store = InMemoryLedgerStore::new();
        let a = CompanyId::new();
        let b = CompanyId::new();
        let day = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();

        assert_eq!(store.transaction(a, |tx| tx.next_batch_sequence(day)).unwrap(), 1);
        assert_eq!(store.transaction(a, |tx| tx.next_batch_sequence(day)).unwrap(), 2);
        assert_eq!(store.transaction(b, |tx| tx.next_batch_sequence(day)).unwrap(), 1);
    }

    #[test]
    fn rolled_back_payment_sequence_is_reused() {
        let store = InMemoryLedgerStore::new();
        let company = CompanyId::new();

        assert_eq!(store.transaction(company, |tx| tx.next_payment_sequence()).unwrap(), 1);
        let aborted: DomainResult<u32> = store.transaction(company, |tx| {
            tx.next_payment_sequence()?;
            Err(DomainError::validation("amount", "must be greater than zero"))
        });
        assert!(aborted.is_err());
        assert_eq!(store.transaction(company, |tx| tx.next_payment_sequence()).unwrap(), 2);
        assert_eq!(store.transaction(CompanyId::new(), |tx| tx.next_payment_sequence()).unwrap(), 1);
    }

    #[test]
    fn injected_failures_are_transient_and_counted() {
        let store = InMemoryLedgerStore::new();
        store.fail_next_transactions(1);
        let company = CompanyId::new();
        let first = store.transaction(company, |tx| tx.next_batch_sequence(Utc::now().date_naive()));
        assert!(matches!(first, Err(DomainError::Transient(_))));
        assert!(store.transaction(company, |tx| tx.next_batch_sequence(Utc::now().date_naive())).is_ok());
    }

    #[test]
    fn failures_can_be_delayed() {
        let store = InMemoryLedgerStore::new();
        let company = CompanyId::new();
        let day = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        store.fail_transactions_after(1, 1);

        assert!(store.transaction(company, |tx| tx.next_batch_sequence(day)).is_ok());
        assert!(store.transaction(company, |tx| tx.next_batch_sequence(day)).is_err());
        assert_eq!(store.transaction(company, |tx| tx.next_batch_sequence(day)).unwrap(), 2);
    }
}
