//! Reversal records and their acceptance and execution rules.
//!
//! Reversals are accepted synchronously (a `pending` record) and executed later,
//! either right away or by a worker. Execution re-checks everything against the
//! state at that moment; a request that became invalid in between ends `failed`
//! without touching any balance.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use reconcile_billing::Invoice;
use reconcile_core::{
    AllocationId, AllocationReversalId, CompanyId, DomainError, DomainResult, Entity, FieldErrors,
    InvoiceId, Money, PaymentId, ReversalId, TenantScoped, UserId,
};

use crate::allocation::PaymentAllocation;
use crate::payment::{Payment, PaymentPosition};

pub const MAX_REASON_LEN: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReversalMethod {
    Void,
    Refund,
}

impl ReversalMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReversalMethod::Void => "void",
            ReversalMethod::Refund => "refund",
        }
    }
}

fn parse_method(s: &str) -> Result<ReversalMethod, String> {
    match s {
        "void" => Ok(ReversalMethod::Void),
        "refund" => Ok(ReversalMethod::Refund),
        other => Err(format!("'{other}' is not a reversal method (expected void or refund)")),
    }
}

impl FromStr for ReversalMethod {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_method(s).map_err(|message| DomainError::validation("method", message))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReversalStatus {
    Pending,
    Completed,
    Failed,
}

impl ReversalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReversalStatus::Pending => "pending",
            ReversalStatus::Completed => "completed",
            ReversalStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "pending" => Ok(ReversalStatus::Pending),
            "completed" => Ok(ReversalStatus::Completed),
            "failed" => Ok(ReversalStatus::Failed),
            other => Err(DomainError::invariant(format!("unknown reversal status '{other}'"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReversalStatus::Pending)
    }
}

fn check_reason(reason: &str, errors: &mut FieldErrors) {
    if reason.trim().is_empty() {
        errors.add("reason", "is required");
    } else if reason.chars().count() > MAX_REASON_LEN {
        errors.add("reason", format!("must be at most {MAX_REASON_LEN} characters"));
    }
}

/// Command: reverse (void or refund) a payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReversePaymentCommand {
    pub payment_id: PaymentId,
    pub reason: String,
    pub method: ReversalMethod,
    /// Defaults to everything not yet reversed.
    pub amount: Option<Money>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub idempotency_key: Option<String>,
}

impl ReversePaymentCommand {
    /// Build a command from untyped request fields, reporting a missing or
    /// blank `reason` and an unknown `method` together.
    pub fn parse(
        payment_id: PaymentId,
        reason: Option<String>,
        method: Option<&str>,
        amount: Option<Money>,
        metadata: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> DomainResult<Self> {
        let reason = reason.unwrap_or_default();
        let mut errors = FieldErrors::new();
        check_reason(&reason, &mut errors);
        let method = match method.map(parse_method) {
            Some(Ok(method)) => Some(method),
            Some(Err(message)) => {
                errors.add("method", message);
                None
            }
            None => {
                errors.add("method", "is required");
                None
            }
        };

        match method {
            Some(method) if errors.is_empty() => Ok(Self {
                payment_id,
                reason,
                method,
                amount,
                metadata,
                idempotency_key,
            }),
            _ => Err(DomainError::Validation(errors)),
        }
    }
}

/// One reversal request against a payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentReversal {
    pub id: ReversalId,
    pub company_id: CompanyId,
    pub payment_id: PaymentId,
    pub reversal_method: ReversalMethod,
    pub reversed_amount: Money,
    pub status: ReversalStatus,
    pub reason: String,
    pub metadata: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub requested_by: UserId,
    pub requested_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl PaymentReversal {
    /// Validate a reversal request against the payment's current position.
    ///
    /// `active_allocations` is the number of active allocations on the payment.
    pub fn request(
        cmd: ReversePaymentCommand,
        payment: &Payment,
        position: &PaymentPosition,
        active_allocations: usize,
        actor: UserId,
        at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let mut errors = FieldErrors::new();
        check_reason(&cmd.reason, &mut errors);
        if let Some(key) = &cmd.idempotency_key {
            if key.trim().is_empty() || key.len() > 255 {
                errors.add("idempotency_key", "must be between 1 and 255 characters");
            }
        }
        if let Some(amount) = cmd.amount {
            if !amount.is_positive() {
                errors.add("amount", "must be greater than zero");
            } else if amount > payment.amount {
                errors.add(
                    "amount",
                    format!("must not exceed the payment amount of {}", payment.amount),
                );
            }
        }
        errors.into_result()?;

        payment.ensure_not_reversed()?;

        let reserved = position.reserved_for_reversal();
        let outstanding = payment.amount.saturating_sub(reserved);
        if !outstanding.is_positive() {
            return Err(DomainError::conflict_with(
                "the full payment amount is already reversed or pending reversal",
                payment.id,
            ));
        }
        let amount = cmd.amount.unwrap_or(outstanding);

        if cmd.method == ReversalMethod::Void && (amount != payment.amount || reserved.is_positive())
        {
            return Err(DomainError::validation(
                "method",
                "void reverses the whole payment; use refund for partial amounts",
            ));
        }
        if amount > outstanding {
            return Err(DomainError::validation(
                "amount",
                format!("only {outstanding} of the payment remains reversible"),
            ));
        }

        let full = reserved.checked_add(amount)? == payment.amount;
        if full && active_allocations > 0 {
            return Err(DomainError::conflict_with(
                format!(
                    "payment still has {active_allocations} active allocation(s); reverse them first"
                ),
                payment.id,
            ));
        }
        let unallocated = position.checked_unallocated()?;
        if amount > unallocated {
            return Err(DomainError::conflict_with(
                format!(
                    "only {unallocated} of the payment is unallocated; reverse allocations before refunding more"
                ),
                payment.id,
            ));
        }

        Ok(Self {
            id: ReversalId::new(),
            company_id: payment.company_id,
            payment_id: payment.id,
            reversal_method: cmd.method,
            reversed_amount: amount,
            status: ReversalStatus::Pending,
            reason: cmd.reason,
            metadata: cmd.metadata,
            idempotency_key: cmd.idempotency_key,
            requested_by: actor,
            requested_at: at,
            completed_at: None,
            failure_reason: None,
        })
    }

    /// Execute a pending reversal.
    ///
    /// `position` must already include this reversal as pending. Returns the new
    /// status; the payment flips to `reversed` once completed reversals cover its
    /// full amount.
    pub fn execute(
        &mut self,
        payment: &mut Payment,
        position: &PaymentPosition,
        active_allocations: usize,
        at: DateTime<Utc>,
    ) -> DomainResult<ReversalStatus> {
        if self.status.is_terminal() {
            return Ok(self.status);
        }
        if payment.id != self.payment_id {
            return Err(DomainError::invariant("reversal does not reference the supplied payment"));
        }

        let failure = if payment.is_reversed() {
            Some("payment was reversed by another request".to_string())
        } else if position.checked_unallocated().is_err() {
            Some("payment allocations changed; not enough unallocated amount".to_string())
        } else {
            None
        };

        let completed_total = position.reversed_completed.checked_add(self.reversed_amount)?;
        let full = completed_total == payment.amount;
        let failure = failure.or_else(|| {
            (full && active_allocations > 0)
                .then(|| "payment gained active allocations before execution".to_string())
        });

        if let Some(reason) = failure {
            self.status = ReversalStatus::Failed;
            self.failure_reason = Some(reason);
            self.completed_at = Some(at);
            return Ok(self.status);
        }

        if full {
            payment.mark_reversed(at)?;
        }
        self.status = ReversalStatus::Completed;
        self.completed_at = Some(at);
        Ok(self.status)
    }

    /// Mark failed without executing (used when the worker gives up).
    pub fn fail(&mut self, reason: impl Into<String>, at: DateTime<Utc>) {
        if !self.status.is_terminal() {
            self.status = ReversalStatus::Failed;
            self.failure_reason = Some(reason.into());
            self.completed_at = Some(at);
        }
    }
}

impl Entity for PaymentReversal {
    type Id = ReversalId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl TenantScoped for PaymentReversal {
    fn company_id(&self) -> CompanyId {
        self.company_id
    }
}

/// Command: reverse one allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseAllocationCommand {
    pub payment_id: PaymentId,
    pub allocation_id: AllocationId,
    pub reason: String,
    /// Only informs what is handed back to the payer; the invoice always gets the
    /// full allocated amount back.
    pub refund_amount: Option<Money>,
}

/// One reversal request against an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationReversal {
    pub id: AllocationReversalId,
    pub company_id: CompanyId,
    pub payment_id: PaymentId,
    pub allocation_id: AllocationId,
    pub invoice_id: InvoiceId,
    pub reason: String,
    pub refund_amount: Option<Money>,
    pub restored_amount: Money,
    pub status: ReversalStatus,
    pub requested_by: UserId,
    pub requested_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl AllocationReversal {
    /// Accept a reversal request. `in_flight` is any non-failed reversal already
    /// recorded for this allocation.
    pub fn request(
        cmd: ReverseAllocationCommand,
        allocation: &PaymentAllocation,
        in_flight: Option<&AllocationReversal>,
        actor: UserId,
        at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let mut errors = FieldErrors::new();
        check_reason(&cmd.reason, &mut errors);
        if let Some(refund) = cmd.refund_amount {
            if refund.is_negative() {
                errors.add("refund_amount", "must not be negative");
            } else if refund > allocation.allocated_amount {
                errors.add(
                    "refund_amount",
                    format!(
                        "must not exceed the allocated amount of {}",
                        allocation.allocated_amount
                    ),
                );
            }
        }
        errors.into_result()?;

        if allocation.payment_id != cmd.payment_id {
            return Err(DomainError::NotFound);
        }
        allocation.ensure_active()?;
        if let Some(existing) = in_flight {
            return Err(DomainError::conflict_with(
                format!("allocation already has a {} reversal", existing.status.as_str()),
                existing.id,
            ));
        }

        Ok(Self {
            id: AllocationReversalId::new(),
            company_id: allocation.company_id,
            payment_id: allocation.payment_id,
            allocation_id: allocation.id,
            invoice_id: allocation.invoice_id,
            reason: cmd.reason,
            refund_amount: cmd.refund_amount,
            restored_amount: allocation.allocated_amount,
            status: ReversalStatus::Pending,
            requested_by: actor,
            requested_at: at,
            completed_at: None,
            failure_reason: None,
        })
    }

    /// Reverse the allocation and restore the invoice. A no-op once terminal.
    pub fn execute(
        &mut self,
        allocation: &mut PaymentAllocation,
        invoice: &mut Invoice,
        at: DateTime<Utc>,
    ) -> DomainResult<ReversalStatus> {
        if self.status.is_terminal() {
            return Ok(self.status);
        }
        if allocation.id != self.allocation_id {
            return Err(DomainError::invariant(
                "reversal does not reference the supplied allocation",
            ));
        }
        if !allocation.is_active() {
            self.status = ReversalStatus::Failed;
            self.failure_reason = Some("allocation was already reversed".to_string());
            self.completed_at = Some(at);
            return Ok(self.status);
        }
        self.restored_amount = allocation.reverse(invoice, self.requested_by, &self.reason, at)?;
        self.status = ReversalStatus::Completed;
        self.completed_at = Some(at);
        Ok(self.status)
    }

    pub fn fail(&mut self, reason: impl Into<String>, at: DateTime<Utc>) {
        if !self.status.is_terminal() {
            self.status = ReversalStatus::Failed;
            self.failure_reason = Some(reason.into());
            self.completed_at = Some(at);
        }
    }
}

impl Entity for AllocationReversal {
    type Id = AllocationReversalId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl TenantScoped for AllocationReversal {
    fn company_id(&self) -> CompanyId {
        self.company_id
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use reconcile_core::{Currency, CustomerId};

    use super::*;
    use crate::payment::{PaymentMethod, RecordPayment};

    fn payment(cents: i64) -> Payment {
        Payment::record(
            RecordPayment {
                company_id: CompanyId::new(),
                customer_id: CustomerId::new(),
                amount: Money::from_minor(cents),
                currency: Currency::new("USD").unwrap(),
                payment_method: PaymentMethod::Cash,
                payment_date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
                reference_number: None,
                notes: None,
                batch_id: None,
                created_by: UserId::new(),
                occurred_at: Utc::now(),
            },
            1,
        )
        .unwrap()
    }

    fn cmd(payment: &Payment, method: ReversalMethod, amount: Option<i64>) -> ReversePaymentCommand {
        ReversePaymentCommand {
            payment_id: payment.id,
            reason: "customer dispute".to_string(),
            method,
            amount: amount.map(Money::from_minor),
            metadata: serde_json::json!({ "return_code": "R01" }),
            idempotency_key: None,
        }
    }

    #[test]
    fn reason_is_mandatory() {
        let p = payment(1_000);
        let mut c = cmd(&p, ReversalMethod::Refund, None);
        c.reason = "  ".to_string();
        let err = PaymentReversal::request(
            c,
            &p,
            &PaymentPosition::new(p.amount),
            0,
            UserId::new(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(err.field_errors().unwrap().contains("reason"));
    }

    #[test]
    fn unknown_method_is_a_validation_error() {
        let err = "chargeback".parse::<ReversalMethod>().unwrap_err();
        assert!(err.field_errors().unwrap().contains("method"));
    }

    #[test]
    fn parsed_command_reports_every_bad_field() {
        let id = PaymentId::new();
        let err = ReversePaymentCommand::parse(id, None, Some("chargeback"), None, serde_json::Value::Null, None)
            .unwrap_err();
        let fields = err.field_errors().unwrap();
        assert!(fields.contains("reason"));
        assert!(fields.contains("method"));

        let err = ReversePaymentCommand::parse(id, Some("dup".into()), None, None, serde_json::Value::Null, None)
            .unwrap_err();
        assert_eq!(err.field_errors().unwrap().len(), 1);

        let cmd = ReversePaymentCommand::parse(
            id,
            Some("dup".into()),
            Some("void"),
            None,
            serde_json::Value::Null,
            Some("k-1".into()),
        )
        .unwrap();
        assert_eq!(cmd.method, ReversalMethod::Void);
        assert_eq!(cmd.idempotency_key.as_deref(), Some("k-1"));
    }

    #[test]
    fn full_reversal_with_active_allocations_conflicts() {
        let p = payment(1_000);
        let mut position = PaymentPosition::new(p.amount);
        position.allocated = Money::from_minor(400);
        let err = PaymentReversal::request(
            cmd(&p, ReversalMethod::Void, None),
            &p,
            &position,
            1,
            UserId::new(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Conflict { .. }));
    }

    #[test]
    fn partial_refund_is_limited_to_unallocated_amount() {
        let p = payment(1_000);
        let mut position = PaymentPosition::new(p.amount);
        position.allocated = Money::from_minor(700);

        let ok = PaymentReversal::request(
            cmd(&p, ReversalMethod::Refund, Some(300)),
            &p,
            &position,
            1,
            UserId::new(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(ok.reversed_amount, Money::from_minor(300));
        assert_eq!(ok.status, ReversalStatus::Pending);

        let err = PaymentReversal::request(
            cmd(&p, ReversalMethod::Refund, Some(301)),
            &p,
            &position,
            1,
            UserId::new(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Conflict { .. }));
    }

    #[test]
    fn void_must_cover_the_whole_payment() {
        let p = payment(1_000);
        let err = PaymentReversal::request(
            cmd(&p, ReversalMethod::Void, Some(500)),
            &p,
            &PaymentPosition::new(p.amount),
            0,
            UserId::new(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(err.field_errors().unwrap().contains("method"));
    }

    #[test]
    fn amount_above_payment_is_rejected() {
        let p = payment(1_000);
        let err = PaymentReversal::request(
            cmd(&p, ReversalMethod::Refund, Some(1_001)),
            &p,
            &PaymentPosition::new(p.amount),
            0,
            UserId::new(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(err.field_errors().unwrap().contains("amount"));
    }

    #[test]
    fn completing_partial_refunds_eventually_reverses_payment() {
        let mut p = payment(1_000);
        let mut position = PaymentPosition::new(p.amount);

        let mut first = PaymentReversal::request(
            cmd(&p, ReversalMethod::Refund, Some(400)),
            &p,
            &position,
            0,
            UserId::new(),
            Utc::now(),
        )
        .unwrap();
        position.reversed_pending = first.reversed_amount;
        assert_eq!(
            first.execute(&mut p, &position, 0, Utc::now()).unwrap(),
            ReversalStatus::Completed
        );
        assert!(!p.is_reversed());
        position.reversed_pending = Money::ZERO;
        position.reversed_completed = Money::from_minor(400);

        let mut rest = PaymentReversal::request(
            cmd(&p, ReversalMethod::Refund, None),
            &p,
            &position,
            0,
            UserId::new(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(rest.reversed_amount, Money::from_minor(600));
        position.reversed_pending = rest.reversed_amount;
        rest.execute(&mut p, &position, 0, Utc::now()).unwrap();
        assert!(p.is_reversed());

        let err = PaymentReversal::request(
            cmd(&p, ReversalMethod::Refund, None),
            &p,
            &position,
            0,
            UserId::new(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Conflict { .. }));
    }

    #[test]
    fn execution_fails_cleanly_when_allocations_appear() {
        let mut p = payment(1_000);
        let position = PaymentPosition::new(p.amount);
        let mut reversal = PaymentReversal::request(
            cmd(&p, ReversalMethod::Void, None),
            &p,
            &position,
            0,
            UserId::new(),
            Utc::now(),
        )
        .unwrap();

        let mut later = position;
        later.reversed_pending = reversal.reversed_amount;
        assert_eq!(
            reversal.execute(&mut p, &later, 2, Utc::now()).unwrap(),
            ReversalStatus::Failed
        );
        assert!(!p.is_reversed());
        assert!(reversal.failure_reason.is_some());
    }
}
