use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use reconcile_core::{
    CompanyId, Currency, CustomerId, DomainError, DomainResult, Entity, FieldErrors, InvoiceId,
    Money, TenantScoped,
};

use crate::balance::BoundedBalance;

/// Invoice status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Draft,
    Posted,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Posted => "posted",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "draft" => Ok(InvoiceStatus::Draft),
            "posted" => Ok(InvoiceStatus::Posted),
            "cancelled" => Ok(InvoiceStatus::Cancelled),
            other => Err(DomainError::invariant(format!("unknown invoice status '{other}'"))),
        }
    }
}

/// Derived settlement state, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    PartiallyPaid,
    Paid,
}

/// Flat persisted shape of an invoice (one row).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub id: InvoiceId,
    pub company_id: CompanyId,
    pub customer_id: CustomerId,
    pub invoice_number: String,
    pub currency: Currency,
    pub total_amount: Money,
    pub balance_due: Money,
    pub status: InvoiceStatus,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub posted_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

/// Command: create a draft invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftInvoice {
    pub company_id: CompanyId,
    pub customer_id: CustomerId,
    pub invoice_number: String,
    pub currency: Currency,
    pub total_amount: Money,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

/// Invoice with a guarded `balance_due`.
///
/// Invariant: `0 <= balance_due <= total_amount`. The balance only moves through
/// [`BoundedBalance`], and only while the invoice is `posted`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    id: InvoiceId,
    company_id: CompanyId,
    customer_id: CustomerId,
    invoice_number: String,
    currency: Currency,
    total_amount: Money,
    balance_due: Money,
    status: InvoiceStatus,
    issue_date: NaiveDate,
    due_date: NaiveDate,
    created_at: DateTime<Utc>,
    posted_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
}

impl Invoice {
    pub fn draft(cmd: DraftInvoice) -> DomainResult<Self> {
        let mut errors = FieldErrors::new();
        if cmd.invoice_number.trim().is_empty() {
            errors.add("invoice_number", "is required");
        }
        if !cmd.total_amount.is_positive() {
            errors.add("total_amount", "must be greater than zero");
        }
        if cmd.due_date < cmd.issue_date {
            errors.add("due_date", "must not be before the issue date");
        }
        errors.into_result()?;

        Ok(Self {
            id: InvoiceId::new(),
            company_id: cmd.company_id,
            customer_id: cmd.customer_id,
            invoice_number: cmd.invoice_number,
            currency: cmd.currency,
            total_amount: cmd.total_amount,
            balance_due: cmd.total_amount,
            status: InvoiceStatus::Draft,
            issue_date: cmd.issue_date,
            due_date: cmd.due_date,
            created_at: cmd.occurred_at,
            posted_at: None,
            cancelled_at: None,
        })
    }

    /// Rebuild from storage, refusing rows that already break the balance invariant.
    pub fn rehydrate(record: InvoiceRecord) -> DomainResult<Self> {
        if record.balance_due.is_negative() || record.balance_due > record.total_amount {
            return Err(DomainError::invariant(format!(
                "invoice {} has balance_due {} outside [0, {}]",
                record.id, record.balance_due, record.total_amount
            )));
        }
        Ok(Self {
            id: record.id,
            company_id: record.company_id,
            customer_id: record.customer_id,
            invoice_number: record.invoice_number,
            currency: record.currency,
            total_amount: record.total_amount,
            balance_due: record.balance_due,
            status: record.status,
            issue_date: record.issue_date,
            due_date: record.due_date,
            created_at: record.created_at,
            posted_at: record.posted_at,
            cancelled_at: record.cancelled_at,
        })
    }

    pub fn to_record(&self) -> InvoiceRecord {
        InvoiceRecord {
            id: self.id,
            company_id: self.company_id,
            customer_id: self.customer_id,
            invoice_number: self.invoice_number.clone(),
            currency: self.currency.clone(),
            total_amount: self.total_amount,
            balance_due: self.balance_due,
            status: self.status,
            issue_date: self.issue_date,
            due_date: self.due_date,
            created_at: self.created_at,
            posted_at: self.posted_at,
            cancelled_at: self.cancelled_at,
        }
    }

    pub fn id_typed(&self) -> InvoiceId {
        self.id
    }

    pub fn customer_id(&self) -> CustomerId {
        self.customer_id
    }

    pub fn invoice_number(&self) -> &str {
        &self.invoice_number
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn status(&self) -> InvoiceStatus {
        self.status
    }

    pub fn issue_date(&self) -> NaiveDate {
        self.issue_date
    }

    pub fn due_date(&self) -> NaiveDate {
        self.due_date
    }

    pub fn total_amount(&self) -> Money {
        self.total_amount
    }

    pub fn balance_due(&self) -> Money {
        self.balance_due
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn payment_status(&self) -> PaymentStatus {
        if self.balance_due.is_zero() {
            PaymentStatus::Paid
        } else if self.balance_due < self.total_amount {
            PaymentStatus::PartiallyPaid
        } else {
            PaymentStatus::Unpaid
        }
    }

    /// Posted with something left to pay.
    pub fn is_open(&self) -> bool {
        self.status == InvoiceStatus::Posted && self.balance_due.is_positive()
    }

    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        self.is_open() && self.due_date < today
    }

    /// Only posted invoices may receive allocations or credit.
    pub fn ensure_accepts_settlement(&self, field: &str) -> DomainResult<()> {
        if self.status != InvoiceStatus::Posted {
            return Err(DomainError::validation(
                field,
                format!("invoice is {}, only posted invoices can be settled", self.status.as_str()),
            ));
        }
        Ok(())
    }

    pub fn post(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        if self.status != InvoiceStatus::Draft {
            return Err(DomainError::conflict(format!(
                "invoice is already {}",
                self.status.as_str()
            )));
        }
        self.status = InvoiceStatus::Posted;
        self.balance_due = self.total_amount;
        self.posted_at = Some(at);
        Ok(())
    }

    /// Cancel an invoice that nothing has been settled against yet.
    pub fn cancel(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        if self.status == InvoiceStatus::Cancelled {
            return Err(DomainError::conflict("invoice is already cancelled"));
        }
        if self.balance_due != self.total_amount {
            return Err(DomainError::conflict(
                "invoice has allocations or credit applied; reverse them first",
            ));
        }
        self.status = InvoiceStatus::Cancelled;
        self.cancelled_at = Some(at);
        Ok(())
    }
}

impl BoundedBalance for Invoice {
    fn ceiling(&self) -> Money {
        self.total_amount
    }

    fn available(&self) -> Money {
        self.balance_due
    }

    fn set_available(&mut self, value: Money) {
        self.balance_due = value;
    }

    fn balance_field(&self) -> &'static str {
        "balance_due"
    }
}

impl Entity for Invoice {
    type Id = InvoiceId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl TenantScoped for Invoice {
    fn company_id(&self) -> CompanyId {
        self.company_id
    }
}
