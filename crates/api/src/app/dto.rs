use serde::Deserialize;
use serde_json::{Value, json};

use reconcile_billing::{CreditNote, Invoice};
use reconcile_core::{DomainResult, InvoiceId, Money, PaymentId};
use reconcile_infra::PaymentReversalAccepted;
use reconcile_payments::{AllocationReversal, PaymentBatch, ReversePaymentCommand};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateCustomerRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct AllocateRequest {
    pub invoice_id: InvoiceId,
    pub amount: Money,
}

#[derive(Debug, Deserialize)]
pub struct ReverseAllocationRequest {
    #[serde(default)]
    pub reason: Option<String>,
    pub refund_amount: Option<Money>,
}

#[derive(Debug, Deserialize)]
pub struct ReasonRequest {
    pub reason: String,
}

/// `reason` and `method` are checked by the engine so they come back as field errors.
#[derive(Debug, Deserialize)]
pub struct ReversePaymentRequest {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    pub amount: Option<Money>,
    #[serde(default)]
    pub metadata: Value,
}

impl ReversePaymentRequest {
    pub fn into_command(
        self,
        payment_id: PaymentId,
        idempotency_key: Option<String>,
    ) -> DomainResult<ReversePaymentCommand> {
        ReversePaymentCommand::parse(
            payment_id,
            self.reason,
            self.method.as_deref(),
            self.amount,
            self.metadata,
            idempotency_key,
        )
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ApplyCreditNoteRequest {
    pub invoice_id: Option<InvoiceId>,
}

// -------------------------
// Response mapping
// -------------------------

pub fn invoice_to_json(invoice: &Invoice) -> Value {
    let mut body = json!(invoice.to_record());
    body["payment_status"] = json!(invoice.payment_status());
    body
}

pub fn credit_note_to_json(note: &CreditNote) -> Value {
    json!(note.to_record())
}

/// `202` body for an accepted batch.
pub fn batch_accepted_to_json(batch: &PaymentBatch) -> Value {
    json!({
        "batch_id": batch.id,
        "batch_number": batch.batch_number,
        "status": batch.status,
        "receipt_count": batch.receipt_count,
        "total_amount": batch.total_amount,
        "currency": batch.currency,
        "estimated_completion": batch.estimated_completion,
        "message": format!(
            "batch accepted with {} entries; poll GET /payment-batches/{} for progress",
            batch.receipt_count, batch.id
        ),
    })
}

pub fn allocation_reversal_accepted_to_json(reversal: &AllocationReversal) -> Value {
    json!({
        "allocation_id": reversal.allocation_id,
        "reversal_id": reversal.id,
        "status": reversal.status,
        "message": "allocation reversal accepted",
        "reversed_at": reversal.requested_at,
    })
}

pub fn payment_reversal_accepted_to_json(accepted: &PaymentReversalAccepted) -> Value {
    let reversal = &accepted.reversal;
    let message = if accepted.replayed {
        "reversal already requested with this idempotency key"
    } else {
        "payment reversal accepted"
    };
    json!({
        "reversal_id": reversal.id,
        "payment_id": reversal.payment_id,
        "status": reversal.status,
        "reversed_amount": reversal.reversed_amount,
        "replayed": accepted.replayed,
        "message": message,
        "scheduled_at": reversal.requested_at,
    })
}
