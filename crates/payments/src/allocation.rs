//! Payment allocations and the manual allocation rule.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use reconcile_billing::{BoundedBalance, Invoice};
use reconcile_core::{
    AllocationId, CompanyId, DomainError, DomainResult, Entity, InvoiceId, Money, PaymentId,
    TenantScoped, UserId,
};

use crate::payment::{Payment, PaymentPosition};

/// How an allocation came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationMethod {
    Manual,
    Fifo,
    LargestFirst,
    Proportional,
    CustomPriority,
}

impl AllocationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationMethod::Manual => "manual",
            AllocationMethod::Fifo => "fifo",
            AllocationMethod::LargestFirst => "largest_first",
            AllocationMethod::Proportional => "proportional",
            AllocationMethod::CustomPriority => "custom_priority",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "manual" => Ok(AllocationMethod::Manual),
            "fifo" => Ok(AllocationMethod::Fifo),
            "largest_first" => Ok(AllocationMethod::LargestFirst),
            "proportional" => Ok(AllocationMethod::Proportional),
            "custom_priority" => Ok(AllocationMethod::CustomPriority),
            other => Err(DomainError::invariant(format!(
                "unknown allocation method '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    Active,
    Reversed,
}

impl AllocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStatus::Active => "active",
            AllocationStatus::Reversed => "reversed",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "active" => Ok(AllocationStatus::Active),
            "reversed" => Ok(AllocationStatus::Reversed),
            other => Err(DomainError::invariant(format!(
                "unknown allocation status '{other}'"
            ))),
        }
    }
}

/// Links one payment to one invoice. Reversal is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAllocation {
    pub id: AllocationId,
    pub company_id: CompanyId,
    pub payment_id: PaymentId,
    pub invoice_id: InvoiceId,
    pub allocated_amount: Money,
    pub allocation_method: AllocationMethod,
    pub status: AllocationStatus,
    pub allocated_by: UserId,
    pub allocated_at: DateTime<Utc>,
    pub reversed_at: Option<DateTime<Utc>>,
    pub reversed_by_user_id: Option<UserId>,
    pub reversal_reason: Option<String>,
}

impl PaymentAllocation {
    pub fn is_active(&self) -> bool {
        self.status == AllocationStatus::Active
    }

    pub fn ensure_active(&self) -> DomainResult<()> {
        if !self.is_active() {
            return Err(DomainError::conflict_with(
                "allocation is already reversed",
                self.id,
            ));
        }
        Ok(())
    }

    /// Mark reversed and put the full allocated amount back on the invoice.
    pub fn reverse(
        &mut self,
        invoice: &mut Invoice,
        actor: UserId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> DomainResult<Money> {
        self.ensure_active()?;
        if invoice.id_typed() != self.invoice_id {
            return Err(DomainError::invariant(
                "allocation does not reference the supplied invoice",
            ));
        }
        invoice.restore(self.allocated_amount)?;
        self.status = AllocationStatus::Reversed;
        self.reversed_at = Some(at);
        self.reversed_by_user_id = Some(actor);
        self.reversal_reason = Some(reason.to_string());
        Ok(self.allocated_amount)
    }
}

impl Entity for PaymentAllocation {
    type Id = AllocationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl TenantScoped for PaymentAllocation {
    fn company_id(&self) -> CompanyId {
        self.company_id
    }
}

/// Check-and-consume for one payment/invoice pair.
///
/// Preconditions are checked before anything is touched; on success the invoice's
/// `balance_due` has been decremented and the returned allocation must be persisted
/// in the same transaction.
pub fn allocate(
    payment: &Payment,
    position: &PaymentPosition,
    invoice: &mut Invoice,
    amount: Money,
    method: AllocationMethod,
    actor: UserId,
    at: DateTime<Utc>,
) -> DomainResult<PaymentAllocation> {
    payment.ensure_not_reversed()?;
    if invoice.company_id() != payment.company_id {
        return Err(DomainError::validation("invoice_id", "does not belong to this company"));
    }
    if invoice.customer_id() != payment.customer_id {
        return Err(DomainError::validation(
            "invoice_id",
            "belongs to a different customer than the payment",
        ));
    }
    invoice.ensure_accepts_settlement("invoice_id")?;
    if invoice.currency() != &payment.currency {
        return Err(DomainError::validation(
            "invoice_id",
            format!(
                "invoice currency {} differs from payment currency {}",
                invoice.currency(),
                payment.currency
            ),
        ));
    }

    if !amount.is_positive() {
        return Err(DomainError::validation("amount", "must be greater than zero"));
    }
    if amount > invoice.balance_due() {
        return Err(DomainError::validation(
            "amount",
            format!("exceeds the invoice balance due of {}", invoice.balance_due()),
        ));
    }
    let unallocated = position.checked_unallocated()?;
    if amount > unallocated {
        return Err(DomainError::validation(
            "amount",
            format!("exceeds the payment's unallocated amount of {unallocated}"),
        ));
    }

    invoice.consume(amount)?;

    Ok(PaymentAllocation {
        id: AllocationId::new(),
        company_id: payment.company_id,
        payment_id: payment.id,
        invoice_id: invoice.id_typed(),
        allocated_amount: amount,
        allocation_method: method,
        status: AllocationStatus::Active,
        allocated_by: actor,
        allocated_at: at,
        reversed_at: None,
        reversed_by_user_id: None,
        reversal_reason: None,
    })
}
