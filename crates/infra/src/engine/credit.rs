//! Credit notes and their applications to invoices.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use reconcile_billing::{
    CreditApplication, CreditNote, DraftCreditNote, apply_credit, reverse_application,
};
use reconcile_core::{CreditNoteId, DomainResult, InvoiceId, Money, OperationContext};
use reconcile_payments::{ApplyCreditNoteCommand, ReverseCreditApplicationCommand};

use super::PaymentEngine;
use crate::store::{LedgerStore, as_reference};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateCreditNoteCommand {
    pub invoice_id: InvoiceId,
    pub credit_note_number: String,
    pub amount: Money,
    pub reason: String,
    #[serde(default)]
    pub post: bool,
}

impl<L: LedgerStore> PaymentEngine<L> {
    /// Draft (and optionally post) a credit note against an invoice. The amount may
    /// not exceed the invoice's current balance due.
    pub fn create_credit_note(
        &self,
        ctx: &OperationContext,
        cmd: CreateCreditNoteCommand,
    ) -> DomainResult<CreditNote> {
        let now = Utc::now();
        let note = self.run(ctx, |tx| {
            let invoice = tx
                .lock_invoice(cmd.invoice_id)
                .map_err(as_reference("invoice_id"))?;
            let mut note = CreditNote::draft(
                DraftCreditNote {
                    company_id: ctx.company_id(),
                    invoice_id: cmd.invoice_id,
                    credit_note_number: cmd.credit_note_number,
                    amount: cmd.amount,
                    reason: cmd.reason,
                    created_by: ctx.actor(),
                    occurred_at: now,
                },
                &invoice,
            )?;
            if cmd.post {
                note.post(now)?;
            }
            tx.insert_credit_note(&note)?;
            Ok(note)
        })?;
        info!(
            company_id = %ctx.company_id(),
            credit_note_id = %note.id_typed(),
            invoice_id = %note.invoice_id(),
            amount = %note.amount(),
            "credit note created"
        );
        Ok(note)
    }

    pub fn post_credit_note(&self, ctx: &OperationContext, id: CreditNoteId) -> DomainResult<CreditNote> {
        self.run(ctx, |tx| {
            let mut note = tx.lock_credit_note(id)?;
            note.post(Utc::now())?;
            tx.save_credit_note(&note)?;
            Ok(note)
        })
    }

    pub fn cancel_credit_note(&self, ctx: &OperationContext, id: CreditNoteId) -> DomainResult<CreditNote> {
        self.run(ctx, |tx| {
            let mut note = tx.lock_credit_note(id)?;
            note.cancel(Utc::now())?;
            tx.save_credit_note(&note)?;
            Ok(note)
        })
    }

    pub fn get_credit_note(&self, ctx: &OperationContext, id: CreditNoteId) -> DomainResult<CreditNote> {
        self.run(ctx, |tx| tx.credit_note(id))
    }

    /// Apply `min(remaining_balance, balance_due)` of a posted credit note.
    pub fn apply_credit_note(
        &self,
        ctx: &OperationContext,
        cmd: ApplyCreditNoteCommand,
    ) -> DomainResult<CreditApplication> {
        let now = Utc::now();
        let application = self.run(ctx, |tx| {
            let mut note = tx
                .lock_credit_note(cmd.credit_note_id)
                .map_err(as_reference("credit_note_id"))?;
            let invoice_id = cmd.invoice_id.unwrap_or_else(|| note.invoice_id());
            let mut invoice = tx
                .lock_invoice(invoice_id)
                .map_err(as_reference("invoice_id"))?;
            let application = apply_credit(&mut note, &mut invoice, ctx.actor(), now)?;
            tx.save_credit_note(&note)?;
            tx.save_invoice(&invoice)?;
            tx.insert_credit_application(&application)?;
            Ok(application)
        })?;
        info!(
            company_id = %ctx.company_id(),
            credit_note_id = %application.credit_note_id,
            invoice_id = %application.invoice_id,
            amount = %application.amount_applied,
            "credit note applied"
        );
        Ok(application)
    }

    /// Undo an application, restoring the credit note and the invoice balance.
    pub fn reverse_credit_application(
        &self,
        ctx: &OperationContext,
        cmd: ReverseCreditApplicationCommand,
    ) -> DomainResult<CreditApplication> {
        let now = Utc::now();
        let application = self.run(ctx, |tx| {
            let mut application = tx.lock_credit_application(cmd.application_id)?;
            let mut note = tx.lock_credit_note(application.credit_note_id)?;
            let mut invoice = tx.lock_invoice(application.invoice_id)?;
            reverse_application(
                &mut application,
                &mut note,
                &mut invoice,
                ctx.actor(),
                &cmd.reason,
                now,
            )?;
            tx.save_credit_note(&note)?;
            tx.save_invoice(&invoice)?;
            tx.save_credit_application(&application)?;
            Ok(application)
        })?;
        info!(
            company_id = %ctx.company_id(),
            application_id = %application.id,
            amount = %application.amount_applied,
            "credit application reversed"
        );
        Ok(application)
    }

    pub fn invoice_credit_applications(
        &self,
        ctx: &OperationContext,
        invoice_id: InvoiceId,
    ) -> DomainResult<Vec<CreditApplication>> {
        self.run(ctx, |tx| {
            tx.invoice(invoice_id)?;
            tx.credit_applications_for_invoice(invoice_id)
        })
    }
}
