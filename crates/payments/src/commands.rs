//! Command objects for the payment entry points.
//!
//! The company and actor are never part of a command; they come from the
//! `OperationContext` the caller passes alongside.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use reconcile_core::{
    CreditApplicationId, CreditNoteId, Currency, CustomerId, InvoiceId, Money, PaymentId,
};

use crate::payment::PaymentMethod;
use crate::strategy::AllocationStrategy;

/// Record a payment, optionally auto-allocating it right after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPaymentCommand {
    pub customer_id: CustomerId,
    pub amount: Money,
    pub currency: Currency,
    pub payment_method: PaymentMethod,
    pub payment_date: NaiveDate,
    pub reference_number: Option<String>,
    pub notes: Option<String>,
    pub auto_allocate: Option<AllocationStrategy>,
}

/// Allocate an explicit amount of a payment to one invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateCommand {
    pub payment_id: PaymentId,
    pub invoice_id: InvoiceId,
    pub amount: Money,
}

/// Spread a payment's unallocated remainder over the customer's open invoices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoAllocateCommand {
    pub payment_id: PaymentId,
    pub strategy: AllocationStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyCreditNoteCommand {
    pub credit_note_id: CreditNoteId,
    /// Defaults to the invoice the credit note was raised against.
    pub invoice_id: Option<InvoiceId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseCreditApplicationCommand {
    pub application_id: CreditApplicationId,
    pub reason: String,
}

/// Where a payment's money went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSummary {
    pub payment_id: PaymentId,
    pub amount: Money,
    pub allocated: Money,
    pub refunded: Money,
    pub pending_reversal: Money,
    pub unallocated: Money,
    pub active_allocations: usize,
}
