use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use reconcile_core::{
    CompanyId, CreditApplicationId, CreditNoteId, Currency, CustomerId, DomainError, DomainResult,
    Entity, FieldErrors, InvoiceId, Money, TenantScoped, UserId,
};

use crate::balance::BoundedBalance;
use crate::invoice::Invoice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditNoteStatus {
    Draft,
    Posted,
    Cancelled,
}

impl CreditNoteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditNoteStatus::Draft => "draft",
            CreditNoteStatus::Posted => "posted",
            CreditNoteStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "draft" => Ok(CreditNoteStatus::Draft),
            "posted" => Ok(CreditNoteStatus::Posted),
            "cancelled" => Ok(CreditNoteStatus::Cancelled),
            other => Err(DomainError::invariant(format!(
                "unknown credit note status '{other}'"
            ))),
        }
    }
}

/// Flat persisted shape of a credit note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditNoteRecord {
    pub id: CreditNoteId,
    pub company_id: CompanyId,
    pub invoice_id: InvoiceId,
    pub customer_id: CustomerId,
    pub credit_note_number: String,
    pub currency: Currency,
    pub amount: Money,
    pub total_amount: Money,
    pub remaining_balance: Money,
    pub status: CreditNoteStatus,
    pub reason: String,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub posted_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

/// Command: draft a credit note against an invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftCreditNote {
    pub company_id: CompanyId,
    pub invoice_id: InvoiceId,
    pub credit_note_number: String,
    pub amount: Money,
    pub reason: String,
    pub created_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// A credit note whose `remaining_balance` is consumed by applications.
///
/// `remaining_balance` starts at `total_amount` on posting and only decreases
/// (or is restored by reversing an application).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditNote {
    id: CreditNoteId,
    company_id: CompanyId,
    invoice_id: InvoiceId,
    customer_id: CustomerId,
    credit_note_number: String,
    currency: Currency,
    amount: Money,
    total_amount: Money,
    remaining_balance: Money,
    status: CreditNoteStatus,
    reason: String,
    created_by: UserId,
    created_at: DateTime<Utc>,
    posted_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
}

impl CreditNote {
    /// `amount` is checked against the invoice's `balance_due` at creation time.
    pub fn draft(cmd: DraftCreditNote, invoice: &Invoice) -> DomainResult<Self> {
        if invoice.company_id() != cmd.company_id || invoice.id_typed() != cmd.invoice_id {
            return Err(DomainError::validation(
                "invoice_id",
                "does not belong to this company",
            ));
        }
        invoice.ensure_accepts_settlement("invoice_id")?;

        let mut errors = FieldErrors::new();
        if cmd.credit_note_number.trim().is_empty() {
            errors.add("credit_note_number", "is required");
        }
        if cmd.reason.trim().is_empty() {
            errors.add("reason", "is required");
        }
        if !cmd.amount.is_positive() {
            errors.add("amount", "must be greater than zero");
        } else if cmd.amount > invoice.balance_due() {
            errors.add(
                "amount",
                format!("exceeds the invoice balance due of {}", invoice.balance_due()),
            );
        }
        errors.into_result()?;

        Ok(Self {
            id: CreditNoteId::new(),
            company_id: cmd.company_id,
            invoice_id: cmd.invoice_id,
            customer_id: invoice.customer_id(),
            credit_note_number: cmd.credit_note_number,
            currency: invoice.currency().clone(),
            amount: cmd.amount,
            total_amount: cmd.amount,
            remaining_balance: Money::ZERO,
            status: CreditNoteStatus::Draft,
            reason: cmd.reason,
            created_by: cmd.created_by,
            created_at: cmd.occurred_at,
            posted_at: None,
            cancelled_at: None,
        })
    }

    pub fn rehydrate(record: CreditNoteRecord) -> DomainResult<Self> {
        if record.remaining_balance.is_negative() || record.remaining_balance > record.total_amount
        {
            return Err(DomainError::invariant(format!(
                "credit note {} has remaining_balance {} outside [0, {}]",
                record.id, record.remaining_balance, record.total_amount
            )));
        }
        Ok(Self {
            id: record.id,
            company_id: record.company_id,
            invoice_id: record.invoice_id,
            customer_id: record.customer_id,
            credit_note_number: record.credit_note_number,
            currency: record.currency,
            amount: record.amount,
            total_amount: record.total_amount,
            remaining_balance: record.remaining_balance,
            status: record.status,
            reason: record.reason,
            created_by: record.created_by,
            created_at: record.created_at,
            posted_at: record.posted_at,
            cancelled_at: record.cancelled_at,
        })
    }

    pub fn to_record(&self) -> CreditNoteRecord {
        CreditNoteRecord {
            id: self.id,
            company_id: self.company_id,
            invoice_id: self.invoice_id,
            customer_id: self.customer_id,
            credit_note_number: self.credit_note_number.clone(),
            currency: self.currency.clone(),
            amount: self.amount,
            total_amount: self.total_amount,
            remaining_balance: self.remaining_balance,
            status: self.status,
            reason: self.reason.clone(),
            created_by: self.created_by,
            created_at: self.created_at,
            posted_at: self.posted_at,
            cancelled_at: self.cancelled_at,
        }
    }

    pub fn id_typed(&self) -> CreditNoteId {
        self.id
    }

    pub fn invoice_id(&self) -> InvoiceId {
        self.invoice_id
    }

    pub fn customer_id(&self) -> CustomerId {
        self.customer_id
    }

    pub fn credit_note_number(&self) -> &str {
        &self.credit_note_number
    }

    pub fn status(&self) -> CreditNoteStatus {
        self.status
    }

    pub fn amount(&self) -> Money {
        self.amount
    }

    pub fn total_amount(&self) -> Money {
        self.total_amount
    }

    pub fn remaining_balance(&self) -> Money {
        self.remaining_balance
    }

    pub fn post(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        if self.status != CreditNoteStatus::Draft {
            return Err(DomainError::conflict(format!(
                "credit note is already {}",
                self.status.as_str()
            )));
        }
        self.status = CreditNoteStatus::Posted;
        self.remaining_balance = self.total_amount;
        self.posted_at = Some(at);
        Ok(())
    }

    pub fn cancel(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        match self.status {
            CreditNoteStatus::Cancelled => {
                return Err(DomainError::conflict("credit note is already cancelled"));
            }
            CreditNoteStatus::Posted if self.remaining_balance != self.total_amount => {
                return Err(DomainError::conflict(
                    "credit note has been applied; reverse its applications first",
                ));
            }
            _ => {}
        }
        self.status = CreditNoteStatus::Cancelled;
        self.remaining_balance = Money::ZERO;
        self.cancelled_at = Some(at);
        Ok(())
    }
}

impl BoundedBalance for CreditNote {
    fn ceiling(&self) -> Money {
        self.total_amount
    }

    fn available(&self) -> Money {
        self.remaining_balance
    }

    fn set_available(&mut self, value: Money) {
        self.remaining_balance = value;
    }

    fn balance_field(&self) -> &'static str {
        "remaining_balance"
    }
}

impl Entity for CreditNote {
    type Id = CreditNoteId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl TenantScoped for CreditNote {
    fn company_id(&self) -> CompanyId {
        self.company_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditApplicationStatus {
    Active,
    Reversed,
}

/// One application of a credit note against one invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditApplication {
    pub id: CreditApplicationId,
    pub company_id: CompanyId,
    pub credit_note_id: CreditNoteId,
    pub invoice_id: InvoiceId,
    pub amount_applied: Money,
    pub status: CreditApplicationStatus,
    pub applied_by: UserId,
    pub applied_at: DateTime<Utc>,
    pub reversed_at: Option<DateTime<Utc>>,
    pub reversed_by: Option<UserId>,
    pub reversal_reason: Option<String>,
}

impl CreditApplication {
    pub fn is_active(&self) -> bool {
        self.status == CreditApplicationStatus::Active
    }
}

impl Entity for CreditApplication {
    type Id = CreditApplicationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl TenantScoped for CreditApplication {
    fn company_id(&self) -> CompanyId {
        self.company_id
    }
}

/// Consume `min(remaining_balance, balance_due)` from both sides.
///
/// Both documents are mutated in place; the caller persists them together with the
/// returned application in one transaction.
pub fn apply_credit(
    note: &mut CreditNote,
    invoice: &mut Invoice,
    actor: UserId,
    at: DateTime<Utc>,
) -> DomainResult<CreditApplication> {
    if note.status != CreditNoteStatus::Posted {
        return Err(DomainError::validation(
            "credit_note_id",
            format!("credit note is {}, only posted credit notes can be applied", note.status.as_str()),
        ));
    }
    if invoice.company_id() != note.company_id {
        return Err(DomainError::validation("invoice_id", "does not belong to this company"));
    }
    if invoice.customer_id() != note.customer_id {
        return Err(DomainError::validation(
            "invoice_id",
            "belongs to a different customer than the credit note",
        ));
    }
    invoice.ensure_accepts_settlement("invoice_id")?;

    let applied = note.remaining_balance.min(invoice.balance_due());
    if !applied.is_positive() {
        let field = if note.remaining_balance.is_zero() {
            "credit_note_id"
        } else {
            "invoice_id"
        };
        return Err(DomainError::validation(field, "nothing left to apply"));
    }

    invoice.consume(applied)?;
    note.consume(applied)?;

    Ok(CreditApplication {
        id: CreditApplicationId::new(),
        company_id: note.company_id,
        credit_note_id: note.id,
        invoice_id: invoice.id_typed(),
        amount_applied: applied,
        status: CreditApplicationStatus::Active,
        applied_by: actor,
        applied_at: at,
        reversed_at: None,
        reversed_by: None,
        reversal_reason: None,
    })
}

/// Undo an application, restoring both balances by the applied amount.
pub fn reverse_application(
    application: &mut CreditApplication,
    note: &mut CreditNote,
    invoice: &mut Invoice,
    actor: UserId,
    reason: &str,
    at: DateTime<Utc>,
) -> DomainResult<()> {
    if reason.trim().is_empty() {
        return Err(DomainError::validation("reason", "is required"));
    }
    if !application.is_active() {
        return Err(DomainError::conflict_with(
            "credit application is already reversed",
            application.id,
        ));
    }
    if application.credit_note_id != note.id || application.invoice_id != invoice.id_typed() {
        return Err(DomainError::invariant(
            "credit application does not reference the supplied documents",
        ));
    }

    invoice.restore(application.amount_applied)?;
    note.restore(application.amount_applied)?;

    application.status = CreditApplicationStatus::Reversed;
    application.reversed_at = Some(at);
    application.reversed_by = Some(actor);
    application.reversal_reason = Some(reason.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::invoice::DraftInvoice;

    fn posted_invoice(company_id: CompanyId, customer_id: CustomerId, cents: i64) -> Invoice {
        let mut invoice = Invoice::draft(DraftInvoice {
            company_id,
            customer_id,
            invoice_number: "INV-D".to_string(),
            currency: Currency::new("USD").unwrap(),
            total_amount: Money::from_minor(cents),
            issue_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            due_date: NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
            occurred_at: Utc::now(),
        })
        .unwrap();
        invoice.post(Utc::now()).unwrap();
        invoice
    }

    fn draft_cmd(invoice: &Invoice, cents: i64) -> DraftCreditNote {
        DraftCreditNote {
            company_id: invoice.company_id(),
            invoice_id: invoice.id_typed(),
            credit_note_number: "CN-0001".to_string(),
            amount: Money::from_minor(cents),
            reason: "damaged goods".to_string(),
            created_by: UserId::new(),
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn credit_note_amount_cannot_exceed_balance_due() {
        let invoice = posted_invoice(CompanyId::new(), CustomerId::new(), 10_000);
        let err = CreditNote::draft(draft_cmd(&invoice, 10_001), &invoice).unwrap_err();
        assert!(err.field_errors().unwrap().contains("amount"));
    }

    #[test]
    fn draft_credit_note_cannot_be_applied() {
        let mut invoice = posted_invoice(CompanyId::new(), CustomerId::new(), 10_000);
        let mut note = CreditNote::draft(draft_cmd(&invoice, 5_000), &invoice).unwrap();
        let err = apply_credit(&mut note, &mut invoice, UserId::new(), Utc::now()).unwrap_err();
        assert!(err.field_errors().unwrap().contains("credit_note_id"));
        assert_eq!(invoice.balance_due(), Money::from_minor(10_000));
    }

    #[test]
    fn partial_application_keeps_remaining_balance() {
        let company = CompanyId::new();
        let customer = CustomerId::new();
        // Credit note of 300 raised while its invoice owed 300.
        let mut source = posted_invoice(company, customer, 30_000);
        let mut note = CreditNote::draft(draft_cmd(&source, 30_000), &source).unwrap();
        note.post(Utc::now()).unwrap();

        // Invoice D only owes 200.
        let mut target = posted_invoice(company, customer, 50_000);
        target.consume(Money::from_minor(30_000)).unwrap();

        let application = apply_credit(&mut note, &mut target, UserId::new(), Utc::now()).unwrap();
        assert_eq!(application.amount_applied, Money::from_minor(20_000));
        assert_eq!(target.balance_due(), Money::ZERO);
        assert_eq!(note.remaining_balance(), Money::from_minor(10_000));

        let second = apply_credit(&mut note, &mut source, UserId::new(), Utc::now()).unwrap();
        assert_eq!(second.amount_applied, Money::from_minor(10_000));
        assert_eq!(note.remaining_balance(), Money::ZERO);
        assert_eq!(source.balance_due(), Money::from_minor(20_000));
    }

    #[test]
    fn cannot_apply_to_another_customers_invoice() {
        let company = CompanyId::new();
        let invoice = posted_invoice(company, CustomerId::new(), 10_000);
        let mut note = CreditNote::draft(draft_cmd(&invoice, 5_000), &invoice).unwrap();
        note.post(Utc::now()).unwrap();

        let mut other = posted_invoice(company, CustomerId::new(), 10_000);
        let err = apply_credit(&mut note, &mut other, UserId::new(), Utc::now()).unwrap_err();
        assert!(err.field_errors().unwrap().contains("invoice_id"));
    }

    #[test]
    fn reversing_an_application_restores_both_balances_once() {
        let mut invoice = posted_invoice(CompanyId::new(), CustomerId::new(), 10_000);
        let mut note = CreditNote::draft(draft_cmd(&invoice, 4_000), &invoice).unwrap();
        note.post(Utc::now()).unwrap();

        let mut application =
            apply_credit(&mut note, &mut invoice, UserId::new(), Utc::now()).unwrap();
        assert_eq!(invoice.balance_due(), Money::from_minor(6_000));

        reverse_application(
            &mut application,
            &mut note,
            &mut invoice,
            UserId::new(),
            "applied in error",
            Utc::now(),
        )
        .unwrap();
        assert_eq!(invoice.balance_due(), Money::from_minor(10_000));
        assert_eq!(note.remaining_balance(), Money::from_minor(4_000));

        let err = reverse_application(
            &mut application,
            &mut note,
            &mut invoice,
            UserId::new(),
            "again",
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Conflict { .. }));
        assert_eq!(invoice.balance_due(), Money::from_minor(10_000));
    }

    #[test]
    fn applied_credit_note_cannot_be_cancelled() {
        let mut invoice = posted_invoice(CompanyId::new(), CustomerId::new(), 10_000);
        let mut note = CreditNote::draft(draft_cmd(&invoice, 4_000), &invoice).unwrap();
        note.post(Utc::now()).unwrap();
        apply_credit(&mut note, &mut invoice, UserId::new(), Utc::now()).unwrap();

        assert!(matches!(note.cancel(Utc::now()), Err(DomainError::Conflict { .. })));
    }
}
