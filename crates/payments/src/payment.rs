use core::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use reconcile_core::{
    BatchId, CompanyId, Currency, CustomerId, DomainError, DomainResult, Entity, Money, PaymentId,
    TenantScoped, UserId,
};

/// Recognised payment instruments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    BankTransfer,
    Card,
    Cheque,
    Other,
}

impl PaymentMethod {
    pub const ALL: [PaymentMethod; 5] = [
        PaymentMethod::Cash,
        PaymentMethod::BankTransfer,
        PaymentMethod::Card,
        PaymentMethod::Cheque,
        PaymentMethod::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::Card => "card",
            PaymentMethod::Cheque => "cheque",
            PaymentMethod::Other => "other",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PaymentMethod::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| {
                DomainError::validation(
                    "payment_method",
                    format!("'{s}' is not a recognised payment method"),
                )
            })
    }
}

impl core::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment lifecycle: `completed -> reversed` (terminal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Completed,
    Reversed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Completed => "completed",
            PaymentStatus::Reversed => "reversed",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "completed" => Ok(PaymentStatus::Completed),
            "reversed" => Ok(PaymentStatus::Reversed),
            other => Err(DomainError::invariant(format!("unknown payment status '{other}'"))),
        }
    }
}

/// `PAY-NNNNNN`, sequence per company starting at 1.
pub fn format_payment_number(sequence: u32) -> String {
    format!("PAY-{sequence:06}")
}

/// Command: record a received payment. Never allocates by itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPayment {
    pub company_id: CompanyId,
    pub customer_id: CustomerId,
    pub amount: Money,
    pub currency: Currency,
    pub payment_method: PaymentMethod,
    pub payment_date: NaiveDate,
    pub reference_number: Option<String>,
    pub notes: Option<String>,
    pub batch_id: Option<BatchId>,
    pub created_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// A received payment. `amount` is fixed at creation; only `status` moves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub company_id: CompanyId,
    pub payment_number: String,
    pub customer_id: CustomerId,
    pub amount: Money,
    pub currency: Currency,
    pub payment_method: PaymentMethod,
    pub payment_date: NaiveDate,
    pub reference_number: Option<String>,
    pub notes: Option<String>,
    pub status: PaymentStatus,
    pub batch_id: Option<BatchId>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub reversed_at: Option<DateTime<Utc>>,
}

impl Payment {
    /// `sequence` is the company's next payment sequence and becomes the payment number.
    pub fn record(cmd: RecordPayment, sequence: u32) -> DomainResult<Self> {
        if !cmd.amount.is_positive() {
            return Err(DomainError::validation("amount", "must be greater than zero"));
        }
        Ok(Self {
            id: PaymentId::new(),
            company_id: cmd.company_id,
            payment_number: format_payment_number(sequence),
            customer_id: cmd.customer_id,
            amount: cmd.amount,
            currency: cmd.currency,
            payment_method: cmd.payment_method,
            payment_date: cmd.payment_date,
            reference_number: cmd.reference_number,
            notes: cmd.notes,
            status: PaymentStatus::Completed,
            batch_id: cmd.batch_id,
            created_by: cmd.created_by,
            created_at: cmd.occurred_at,
            reversed_at: None,
        })
    }

    pub fn is_reversed(&self) -> bool {
        self.status == PaymentStatus::Reversed
    }

    pub fn ensure_not_reversed(&self) -> DomainResult<()> {
        if self.is_reversed() {
            return Err(DomainError::conflict_with("payment is already reversed", self.id));
        }
        Ok(())
    }

    /// Called by the reversal executor once completed reversals cover the full amount.
    pub(crate) fn mark_reversed(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_not_reversed()?;
        self.status = PaymentStatus::Reversed;
        self.reversed_at = Some(at);
        Ok(())
    }
}

impl Entity for Payment {
    type Id = PaymentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl TenantScoped for Payment {
    fn company_id(&self) -> CompanyId {
        self.company_id
    }
}

/// Where a payment's money currently sits.
///
/// `unallocated = amount - active allocations - (pending + completed reversals)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentPosition {
    pub amount: Money,
    pub allocated: Money,
    pub reversed_completed: Money,
    pub reversed_pending: Money,
}

impl PaymentPosition {
    pub fn new(amount: Money) -> Self {
        Self {
            amount,
            allocated: Money::ZERO,
            reversed_completed: Money::ZERO,
            reversed_pending: Money::ZERO,
        }
    }

    pub fn reserved_for_reversal(&self) -> Money {
        self.reversed_completed + self.reversed_pending
    }

    /// Amount still free for allocation or refund. Never negative for consistent data.
    pub fn unallocated(&self) -> Money {
        self.amount
            .saturating_sub(self.allocated)
            .saturating_sub(self.reserved_for_reversal())
    }

    /// Checked form of [`unallocated`](Self::unallocated) that reports corrupt state.
    pub fn checked_unallocated(&self) -> DomainResult<Money> {
        let committed = self.allocated.checked_add(self.reserved_for_reversal())?;
        if committed > self.amount {
            return Err(DomainError::invariant(format!(
                "payment commitments {committed} exceed its amount {}",
                self.amount
            )));
        }
        self.amount.checked_sub(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_cmd(cents: i64) -> RecordPayment {
        RecordPayment {
            company_id: CompanyId::new(),
            customer_id: CustomerId::new(),
            amount: Money::from_minor(cents),
            currency: Currency::new("USD").unwrap(),
            payment_method: PaymentMethod::BankTransfer,
            payment_date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            reference_number: Some("REF-1".to_string()),
            notes: None,
            batch_id: None,
            created_by: UserId::new(),
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn payment_method_parses_known_names_only() {
        assert_eq!("cheque".parse::<PaymentMethod>().unwrap(), PaymentMethod::Cheque);
        assert_eq!(
            "bank_transfer".parse::<PaymentMethod>().unwrap(),
            PaymentMethod::BankTransfer
        );
        let err = "bitcoin".parse::<PaymentMethod>().unwrap_err();
        assert!(err.field_errors().unwrap().contains("payment_method"));
    }

    #[test]
    fn zero_amount_payment_is_rejected() {
        assert!(Payment::record(record_cmd(0), 1).is_err());
        let payment = Payment::record(record_cmd(75_000), 42).unwrap();
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert_eq!(payment.payment_number, "PAY-000042");
    }

    #[test]
    fn reversed_payment_cannot_be_reversed_again() {
        let mut payment = Payment::record(record_cmd(100), 1).unwrap();
        payment.mark_reversed(Utc::now()).unwrap();
        assert!(matches!(
            payment.mark_reversed(Utc::now()),
            Err(DomainError::Conflict { .. })
        ));
    }

    #[test]
    fn position_subtracts_allocations_and_reversals() {
        let mut position = PaymentPosition::new(Money::from_minor(1_000));
        position.allocated = Money::from_minor(600);
        position.reversed_pending = Money::from_minor(100);
        assert_eq!(position.unallocated(), Money::from_minor(300));

        position.reversed_completed = Money::from_minor(400);
        assert!(position.checked_unallocated().is_err());
    }
}
