//! Postgres-backed ledger store.
//!
//! Each row keeps its identity and tenancy in plain columns (`id`, `company_id`,
//! `idempotency_key`) and the rest of the entity in a `doc` JSONB column.
//! Secondary lookups (`payment_id`, `invoice_id`, ...) go through expression
//! indexes on `doc`.
//!
//! ## Error Mapping
//!
//! | PostgreSQL error | Code | DomainError |
//! |---|---|---|
//! | unique violation | `23505` | `Conflict` (duplicate idempotency key) |
//! | FK / check violation | `23503`, `23514` | `InvariantViolation` |
//! | lock timeout, deadlock, serialization failure | `55P03`, `40P01`, `40001` | `Transient` |
//! | anything else (pool closed, network, ...) | | `Transient` |
//!
//! ## Sync over async
//!
//! [`LedgerStore`] is synchronous. The adapter drives sqlx through a captured
//! `tokio::runtime::Handle`, so it must be called from a blocking context
//! (`spawn_blocking` or a plain worker thread), never from an async task.

use chrono::NaiveDate;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{instrument, warn};
use uuid::Uuid;

use reconcile_billing::{
    CreditApplication, CreditNote, CreditNoteRecord, Customer, Invoice, InvoiceRecord,
};
use reconcile_core::tenant::ensure_same_company;
use reconcile_core::{
    AllocationId, AllocationReversalId, BatchId, CompanyId, CreditApplicationId, CreditNoteId,
    Currency, CustomerId, DomainError, DomainResult, InvoiceId, PaymentId, ReversalId,
    TenantScoped,
};
use reconcile_payments::{
    AllocationReversal, Payment, PaymentAllocation, PaymentBatch, PaymentReversal,
};

use super::{LedgerStore, LedgerTx};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS customers (
    id UUID PRIMARY KEY,
    company_id UUID NOT NULL,
    idempotency_key TEXT,
    doc JSONB NOT NULL
);
CREATE TABLE IF NOT EXISTS invoices (
    id UUID PRIMARY KEY,
    company_id UUID NOT NULL,
    idempotency_key TEXT,
    doc JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_invoices_customer ON invoices (company_id, (doc->>'customer_id'));

CREATE TABLE IF NOT EXISTS credit_notes (
    id UUID PRIMARY KEY,
    company_id UUID NOT NULL,
    idempotency_key TEXT,
    doc JSONB NOT NULL
);
CREATE TABLE IF NOT EXISTS credit_applications (
    id UUID PRIMARY KEY,
    company_id UUID NOT NULL,
    idempotency_key TEXT,
    doc JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_credit_applications_invoice ON credit_applications (company_id, (doc->>'invoice_id'));

CREATE TABLE IF NOT EXISTS payments (
    id UUID PRIMARY KEY,
    company_id UUID NOT NULL,
    idempotency_key TEXT,
    doc JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_payments_batch ON payments (company_id, (doc->>'batch_id'));

CREATE TABLE IF NOT EXISTS payment_allocations (
    id UUID PRIMARY KEY,
    company_id UUID NOT NULL,
    idempotency_key TEXT,
    doc JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_allocations_payment ON payment_allocations (company_id, (doc->>'payment_id'));
CREATE INDEX IF NOT EXISTS idx_allocations_invoice ON payment_allocations (company_id, (doc->>'invoice_id'));

CREATE TABLE IF NOT EXISTS payment_reversals (
    id UUID PRIMARY KEY,
    company_id UUID NOT NULL,
    idempotency_key TEXT,
    doc JSONB NOT NULL,
    UNIQUE (company_id, idempotency_key)
);
CREATE INDEX IF NOT EXISTS idx_payment_reversals_payment ON payment_reversals (company_id, (doc->>'payment_id'));

CREATE TABLE IF NOT EXISTS allocation_reversals (
    id UUID PRIMARY KEY,
    company_id UUID NOT NULL,
    idempotency_key TEXT,
    doc JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_allocation_reversals_allocation ON allocation_reversals (company_id, (doc->>'allocation_id'));

CREATE TABLE IF NOT EXISTS payment_batches (
    id UUID PRIMARY KEY,
    company_id UUID NOT NULL,
    idempotency_key TEXT,
    doc JSONB NOT NULL,
    UNIQUE (company_id, idempotency_key)
);

CREATE TABLE IF NOT EXISTS batch_sequences (
    company_id UUID NOT NULL,
    day DATE NOT NULL,
    last_value INTEGER NOT NULL,
    PRIMARY KEY (company_id, day)
);

CREATE TABLE IF NOT EXISTS payment_sequences (
    company_id UUID PRIMARY KEY,
    last_value INTEGER NOT NULL
);
"#;

/// Failures while setting the store up (before any transaction runs).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("postgres store needs a tokio runtime: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),
}

/// Postgres ledger store. Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
    handle: Handle,
}

impl PgLedgerStore {
    /// Connect, capture the current runtime and create missing tables.
    #[instrument(skip(database_url), err)]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let handle = Handle::try_current()?;
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        let store = Self { pool, handle };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

impl LedgerStore for PgLedgerStore {
    #[instrument(skip_all, fields(company_id = %company_id))]
    fn transaction<T, F>(&self, company_id: CompanyId, f: F) -> DomainResult<T>
    where
        F: FnOnce(&mut dyn LedgerTx) -> DomainResult<T>,
    {
        let mut tx = self
            .handle
            .block_on(self.pool.begin())
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        self.handle
            .block_on(sqlx::query("SET LOCAL lock_timeout = '5s'").execute(&mut *tx))
            .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;

        let mut pg = PgTx {
            company_id,
            tx,
            handle: self.handle.clone(),
        };
        match f(&mut pg) {
            Ok(out) => {
                self.handle
                    .block_on(pg.tx.commit())
                    .map_err(|e| map_sqlx_error("commit_transaction", e))?;
                Ok(out)
            }
            Err(err) => {
                if let Err(rollback) = self.handle.block_on(pg.tx.rollback()) {
                    warn!(error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }
}

/// Row shape shared by every ledger table.
trait Document: Sized + TenantScoped {
    const TABLE: &'static str;

    fn key(&self) -> Uuid;

    fn idempotency_key(&self) -> Option<&str> {
        None
    }

    fn to_doc(&self) -> DomainResult<Value>;

    fn from_doc(doc: Value) -> DomainResult<Self>;
}

fn encode<T: Serialize>(value: &T) -> DomainResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| DomainError::invariant(format!("failed to encode row: {e}")))
}

fn decode<T: DeserializeOwned>(doc: Value) -> DomainResult<T> {
    serde_json::from_value(doc)
        .map_err(|e| DomainError::invariant(format!("failed to decode row: {e}")))
}

macro_rules! serde_document {
    ($ty:ty, $table:literal) => {
        serde_document!($ty, $table, |_row| None);
    };
    ($ty:ty, $table:literal, |$row:ident| $key:expr) => {
        impl Document for $ty {
            const TABLE: &'static str = $table;

            fn key(&self) -> Uuid {
                *self.id.as_uuid()
            }

            fn idempotency_key(&self) -> Option<&str> {
                let $row = self;
                $key
            }

            fn to_doc(&self) -> DomainResult<Value> {
                encode(self)
            }

            fn from_doc(doc: Value) -> DomainResult<Self> {
                decode(doc)
            }
        }
    };
}

serde_document!(Customer, "customers");
serde_document!(CreditApplication, "credit_applications");
serde_document!(Payment, "payments");
serde_document!(PaymentAllocation, "payment_allocations");
serde_document!(AllocationReversal, "allocation_reversals");
serde_document!(PaymentReversal, "payment_reversals", |row| row
    .idempotency_key
    .as_deref());
serde_document!(PaymentBatch, "payment_batches", |row| row
    .idempotency_key
    .as_deref());

impl Document for Invoice {
    const TABLE: &'static str = "invoices";

    fn key(&self) -> Uuid {
        *self.id_typed().as_uuid()
    }

    fn to_doc(&self) -> DomainResult<Value> {
        encode(&self.to_record())
    }

    fn from_doc(doc: Value) -> DomainResult<Self> {
        Invoice::rehydrate(decode::<InvoiceRecord>(doc)?)
    }
}

impl Document for CreditNote {
    const TABLE: &'static str = "credit_notes";

    fn key(&self) -> Uuid {
        *self.id_typed().as_uuid()
    }

    fn to_doc(&self) -> DomainResult<Value> {
        encode(&self.to_record())
    }

    fn from_doc(doc: Value) -> DomainResult<Self> {
        CreditNote::rehydrate(decode::<CreditNoteRecord>(doc)?)
    }
}

struct PgTx {
    company_id: CompanyId,
    tx: Transaction<'static, Postgres>,
    handle: Handle,
}

impl PgTx {
    fn fetch<D: Document>(&mut self, id: Uuid, lock: bool) -> DomainResult<D> {
        let sql = format!(
            "SELECT doc FROM {} WHERE company_id = $1 AND id = $2{}",
            D::TABLE,
            if lock { " FOR UPDATE" } else { "" }
        );
        let company = *self.company_id.as_uuid();
        let row: Option<(Value,)> = self
            .handle
            .block_on(
                sqlx::query_as(&sql)
                    .bind(company)
                    .bind(id)
                    .fetch_optional(&mut *self.tx),
            )
            .map_err(|e| map_sqlx_error("fetch", e))?;
        match row {
            Some((doc,)) => D::from_doc(doc),
            None => Err(DomainError::NotFound),
        }
    }

    /// Rows of this company matching `filter` (placeholders start at `$2`), in id order.
    fn scan<D: Document>(&mut self, filter: &str, binds: &[&str], lock: bool) -> DomainResult<Vec<D>> {
        let sql = format!(
            "SELECT doc FROM {} WHERE company_id = $1 AND {filter} ORDER BY id{}",
            D::TABLE,
            if lock { " FOR UPDATE" } else { "" }
        );
        let mut query = sqlx::query_as::<_, (Value,)>(&sql).bind(*self.company_id.as_uuid());
        for value in binds {
            query = query.bind(*value);
        }
        let rows = self
            .handle
            .block_on(query.fetch_all(&mut *self.tx))
            .map_err(|e| map_sqlx_error("scan", e))?;
        rows.into_iter().map(|(doc,)| D::from_doc(doc)).collect()
    }

    fn insert<D: Document>(&mut self, row: &D) -> DomainResult<()> {
        ensure_same_company(self.company_id, row, "company_id")?;
        let sql = format!(
            "INSERT INTO {} (id, company_id, idempotency_key, doc) VALUES ($1, $2, $3, $4)",
            D::TABLE
        );
        let doc = row.to_doc()?;
        self.handle
            .block_on(
                sqlx::query(&sql)
                    .bind(row.key())
                    .bind(*self.company_id.as_uuid())
                    .bind(row.idempotency_key())
                    .bind(doc)
                    .execute(&mut *self.tx),
            )
            .map_err(|e| map_sqlx_error("insert", e))?;
        Ok(())
    }

    fn save<D: Document>(&mut self, row: &D) -> DomainResult<()> {
        ensure_same_company(self.company_id, row, "company_id")?;
        let sql = format!(
            "UPDATE {} SET doc = $3 WHERE company_id = $1 AND id = $2",
            D::TABLE
        );
        let doc = row.to_doc()?;
        let result = self
            .handle
            .block_on(
                sqlx::query(&sql)
                    .bind(*self.company_id.as_uuid())
                    .bind(row.key())
                    .bind(doc)
                    .execute(&mut *self.tx),
            )
            .map_err(|e| map_sqlx_error("save", e))?;
        if result.rows_affected() == 0 {
            return Err(DomainError::NotFound);
        }
        Ok(())
    }

    fn by_idempotency_key<D: Document>(&mut self, key: &str) -> DomainResult<Option<D>> {
        Ok(self.scan::<D>("idempotency_key = $2", &[key], false)?.into_iter().next())
    }
}

impl LedgerTx for PgTx {
    fn company_id(&self) -> CompanyId {
        self.company_id
    }

    fn customer(&mut self, id: CustomerId) -> DomainResult<Customer> {
        self.fetch(*id.as_uuid(), false)
    }

    fn insert_customer(&mut self, customer: &Customer) -> DomainResult<()> {
        self.insert(customer)
    }

    fn invoice(&mut self, id: InvoiceId) -> DomainResult<Invoice> {
        self.fetch(*id.as_uuid(), false)
    }

    fn lock_invoice(&mut self, id: InvoiceId) -> DomainResult<Invoice> {
        self.fetch(*id.as_uuid(), true)
    }

    fn lock_open_invoices(
        &mut self,
        customer_id: CustomerId,
        currency: &Currency,
    ) -> DomainResult<Vec<Invoice>> {
        let customer = customer_id.to_string();
        self.scan(
            "doc->>'customer_id' = $2 AND doc->>'currency' = $3 \
             AND doc->>'status' = 'posted' AND (doc->>'balance_due')::numeric > 0",
            &[customer.as_str(), currency.as_str()],
            true,
        )
    }

    fn insert_invoice(&mut self, invoice: &Invoice) -> DomainResult<()> {
        self.insert(invoice)
    }

    fn save_invoice(&mut self, invoice: &Invoice) -> DomainResult<()> {
        self.save(invoice)
    }

    fn credit_note(&mut self, id: CreditNoteId) -> DomainResult<CreditNote> {
        self.fetch(*id.as_uuid(), false)
    }

    fn lock_credit_note(&mut self, id: CreditNoteId) -> DomainResult<CreditNote> {
        self.fetch(*id.as_uuid(), true)
    }

    fn insert_credit_note(&mut self, note: &CreditNote) -> DomainResult<()> {
        self.insert(note)
    }

    fn save_credit_note(&mut self, note: &CreditNote) -> DomainResult<()> {
        self.save(note)
    }

    fn lock_credit_application(
        &mut self,
        id: CreditApplicationId,
    ) -> DomainResult<CreditApplication> {
        self.fetch(*id.as_uuid(), true)
    }

    fn insert_credit_application(&mut self, application: &CreditApplication) -> DomainResult<()> {
        self.insert(application)
    }

    fn save_credit_application(&mut self, application: &CreditApplication) -> DomainResult<()> {
        self.save(application)
    }

    fn credit_applications_for_invoice(
        &mut self,
        invoice_id: InvoiceId,
    ) -> DomainResult<Vec<CreditApplication>> {
        let invoice = invoice_id.to_string();
        self.scan("doc->>'invoice_id' = $2", &[invoice.as_str()], false)
    }

    fn payment(&mut self, id: PaymentId) -> DomainResult<Payment> {
        self.fetch(*id.as_uuid(), false)
    }

    fn lock_payment(&mut self, id: PaymentId) -> DomainResult<Payment> {
        self.fetch(*id.as_uuid(), true)
    }

    fn insert_payment(&mut self, payment: &Payment) -> DomainResult<()> {
        self.insert(payment)
    }

    fn save_payment(&mut self, payment: &Payment) -> DomainResult<()> {
        self.save(payment)
    }

    fn payments_for_batch(&mut self, batch_id: BatchId) -> DomainResult<Vec<Payment>> {
        let batch = batch_id.to_string();
        self.scan("doc->>'batch_id' = $2", &[batch.as_str()], false)
    }

    fn allocation(&mut self, id: AllocationId) -> DomainResult<PaymentAllocation> {
        self.fetch(*id.as_uuid(), false)
    }

    fn lock_allocation(&mut self, id: AllocationId) -> DomainResult<PaymentAllocation> {
        self.fetch(*id.as_uuid(), true)
    }

    fn insert_allocation(&mut self, allocation: &PaymentAllocation) -> DomainResult<()> {
        self.insert(allocation)
    }

    fn save_allocation(&mut self, allocation: &PaymentAllocation) -> DomainResult<()> {
        self.save(allocation)
    }

    fn allocations_for_payment(
        &mut self,
        payment_id: PaymentId,
    ) -> DomainResult<Vec<PaymentAllocation>> {
        let payment = payment_id.to_string();
        self.scan("doc->>'payment_id' = $2", &[payment.as_str()], false)
    }

    fn allocations_for_invoice(
        &mut self,
        invoice_id: InvoiceId,
    ) -> DomainResult<Vec<PaymentAllocation>> {
        let invoice = invoice_id.to_string();
        self.scan("doc->>'invoice_id' = $2", &[invoice.as_str()], false)
    }

    fn payment_reversal(&mut self, id: ReversalId) -> DomainResult<PaymentReversal> {
        self.fetch(*id.as_uuid(), false)
    }

    fn lock_payment_reversal(&mut self, id: ReversalId) -> DomainResult<PaymentReversal> {
        self.fetch(*id.as_uuid(), true)
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
        self.insert(reversal)
    }

    fn save_payment_reversal(&mut self, reversal: &PaymentReversal) -> DomainResult<()> {
        self.save(reversal)
    }

    fn payment_reversal_by_key(&mut self, key: &str) -> DomainResult<Option<PaymentReversal>> {
        self.by_idempotency_key(key)
    }

    fn payment_reversals_for(&mut self, payment_id: PaymentId) -> DomainResult<Vec<PaymentReversal>> {
        let payment = payment_id.to_string();
        self.scan("doc->>'payment_id' = $2", &[payment.as_str()], false)
    }

    fn allocation_reversal(&mut self, id: AllocationReversalId) -> DomainResult<AllocationReversal> {
        self.fetch(*id.as_uuid(), false)
    }

    fn lock_allocation_reversal(
        &mut self,
        id: AllocationReversalId,
    ) -> DomainResult<AllocationReversal> {
        self.fetch(*id.as_uuid(), true)
    }

    fn insert_allocation_reversal(&mut self, reversal: &AllocationReversal) -> DomainResult<()> {
        self.insert(reversal)
    }

    fn save_allocation_reversal(&mut self, reversal: &AllocationReversal) -> DomainResult<()> {
        self.save(reversal)
    }

    fn allocation_reversals_for(
        &mut self,
        allocation_id: AllocationId,
    ) -> DomainResult<Vec<AllocationReversal>> {
        let allocation = allocation_id.to_string();
        self.scan("doc->>'allocation_id' = $2", &[allocation.as_str()], false)
    }

    fn batch(&mut self, id: BatchId) -> DomainResult<PaymentBatch> {
        self.fetch(*id.as_uuid(), false)
    }

    fn lock_batch(&mut self, id: BatchId) -> DomainResult<PaymentBatch> {
        self.fetch(*id.as_uuid(), true)
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
        self.insert(batch)
    }

    fn save_batch(&mut self, batch: &PaymentBatch) -> DomainResult<()> {
        self.save(batch)
    }

    fn batch_by_key(&mut self, key: &str) -> DomainResult<Option<PaymentBatch>> {
        self.by_idempotency_key(key)
    }

    fn next_batch_sequence(&mut self, date: NaiveDate) -> DomainResult<u32> {
        let (value,): (i32,) = self
            .handle
            .block_on(
                sqlx::query_as(
                    r#"
                    INSERT INTO batch_sequences (company_id, day, last_value)
                    VALUES ($1, $2, 1)
                    ON CONFLICT (company_id, day)
                    DO UPDATE SET last_value = batch_sequences.last_value + 1
                    RETURNING last_value
                    "#,
                )
                .bind(*self.company_id.as_uuid())
                .bind(date)
                .fetch_one(&mut *self.tx),
            )
            .map_err(|e| map_sqlx_error("next_batch_sequence", e))?;
        u32::try_from(value)
            .map_err(|_| DomainError::invariant(format!("batch sequence out of range: {value}")))
    }

    fn next_payment_sequence(&mut self) -> DomainResult<u32> {
        let (value,): (i32,) = self
            .handle
            .block_on(
                sqlx::query_as(
                    r#"
                    INSERT INTO payment_sequences (company_id, last_value)
                    VALUES ($1, 1)
                    ON CONFLICT (company_id)
                    DO UPDATE SET last_value = payment_sequences.last_value + 1
                    RETURNING last_value
                    "#,
                )
                .bind(*self.company_id.as_uuid())
                .fetch_one(&mut *self.tx),
            )
            .map_err(|e| map_sqlx_error("next_payment_sequence", e))?;
        u32::try_from(value)
            .map_err(|_| DomainError::invariant(format!("payment sequence out of range: {value}")))
    }
}

/// Map SQLx errors to DomainError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> DomainError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => DomainError::conflict(msg),
                Some("23503") | Some("23514") => DomainError::invariant(msg),
                _ => DomainError::transient(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            DomainError::transient(format!("connection pool closed in {operation}"))
        }
        other => DomainError::transient(format!("sqlx error in {operation}: {other}")),
    }
}
