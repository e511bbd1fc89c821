//! Customers and invoices: just enough lifecycle for payments to settle against.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use reconcile_billing::{Customer, DraftInvoice, Invoice};
use reconcile_core::{Currency, CustomerId, DomainResult, InvoiceId, Money, OperationContext};

use super::PaymentEngine;
use crate::store::{LedgerStore, as_reference};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInvoiceCommand {
    pub customer_id: CustomerId,
    pub invoice_number: String,
    pub currency: Currency,
    pub total_amount: Money,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    /// Post right away instead of leaving a draft.
    #[serde(default)]
    pub post: bool,
}

impl<L: LedgerStore> PaymentEngine<L> {
    pub fn create_customer(&self, ctx: &OperationContext, name: &str) -> DomainResult<Customer> {
        let customer = Customer::new(ctx.company_id(), name, Utc::now())?;
        self.run(ctx, |tx| tx.insert_customer(&customer))?;
        info!(company_id = %ctx.company_id(), customer_id = %customer.id, "customer created");
        Ok(customer)
    }

    pub fn get_customer(&self, ctx: &OperationContext, id: CustomerId) -> DomainResult<Customer> {
        self.run(ctx, |tx| tx.customer(id))
    }

    pub fn create_invoice(
        &self,
        ctx: &OperationContext,
        cmd: CreateInvoiceCommand,
    ) -> DomainResult<Invoice> {
        let now = Utc::now();
        let invoice = self.run(ctx, |tx| {
            tx.customer(cmd.customer_id)
                .map_err(as_reference("customer_id"))?;
            let mut invoice = Invoice::draft(DraftInvoice {
                company_id: ctx.company_id(),
                customer_id: cmd.customer_id,
                invoice_number: cmd.invoice_number,
                currency: cmd.currency,
                total_amount: cmd.total_amount,
                issue_date: cmd.issue_date,
                due_date: cmd.due_date,
                occurred_at: now,
            })?;
            if cmd.post {
                invoice.post(now)?;
            }
            tx.insert_invoice(&invoice)?;
            Ok(invoice)
        })?;
        info!(
            company_id = %ctx.company_id(),
            invoice_id = %invoice.id_typed(),
            total = %invoice.total_amount(),
            status = invoice.status().as_str(),
            "invoice created"
        );
        Ok(invoice)
    }

    pub fn post_invoice(&self, ctx: &OperationContext, id: InvoiceId) -> DomainResult<Invoice> {
        self.run(ctx, |tx| {
            let mut invoice = tx.lock_invoice(id)?;
            invoice.post(Utc::now())?;
            tx.save_invoice(&invoice)?;
            Ok(invoice)
        })
    }

    pub fn cancel_invoice(&self, ctx: &OperationContext, id: InvoiceId) -> DomainResult<Invoice> {
        self.run(ctx, |tx| {
            let mut invoice = tx.lock_invoice(id)?;
            invoice.cancel(Utc::now())?;
            tx.save_invoice(&invoice)?;
            Ok(invoice)
        })
    }

    pub fn get_invoice(&self, ctx: &OperationContext, id: InvoiceId) -> DomainResult<Invoice> {
        self.run(ctx, |tx| tx.invoice(id))
    }
}

#[cfg(test)]
mod tests {
    use reconcile_billing::InvoiceStatus;
    use reconcile_core::{AccessDecision, DomainError};

    use super::super::test_support::*;
    use super::*;

    #[test]
    fn invoices_start_posted_with_full_balance() {
        let engine = inline_engine();
        let ctx = test_company();
        let customer = test_customer(&engine, &ctx);

        let invoice = test_invoice(&engine, &ctx, customer.id, "INV-1", 100_000, 31);

        assert_eq!(invoice.status(), InvoiceStatus::Posted);
        assert_eq!(invoice.balance_due(), Money::from_minor(100_000));
        assert_eq!(engine.get_invoice(&ctx, invoice.id_typed()).unwrap(), invoice);
    }

    #[test]
    fn invoice_for_foreign_customer_is_a_validation_error() {
        let engine = inline_engine();
        let ctx = test_company();
        let other = test_company();
        let foreign = test_customer(&engine, &other);

        let err = engine
            .create_invoice(
                &ctx,
                CreateInvoiceCommand {
                    customer_id: foreign.id,
                    invoice_number: "INV-1".to_string(),
                    currency: usd(),
                    total_amount: Money::from_minor(1_000),
                    issue_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                    due_date: NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
                    post: false,
                },
            )
            .unwrap_err();

        assert!(err.field_errors().unwrap().contains("customer_id"));
    }

    #[test]
    fn foreign_invoice_reads_as_not_found() {
        let engine = inline_engine();
        let ctx = test_company();
        let customer = test_customer(&engine, &ctx);
        let invoice = test_invoice(&engine, &ctx, customer.id, "INV-1", 1_000, 31);

        let err = engine.get_invoice(&test_company(), invoice.id_typed()).unwrap_err();
        assert_eq!(err, DomainError::NotFound);
    }

    #[test]
    fn denied_context_touches_nothing() {
        let engine = inline_engine();
        let ctx = test_company().with_decision(AccessDecision::Denied);

        assert_eq!(
            engine.create_customer(&ctx, "Acme Ltd").unwrap_err(),
            DomainError::Unauthorized
        );
    }

    #[test]
    fn cancelled_invoice_cannot_be_cancelled_again() {
        let engine = inline_engine();
        let ctx = test_company();
        let customer = test_customer(&engine, &ctx);
        let invoice = test_invoice(&engine, &ctx, customer.id, "INV-1", 1_000, 31);

        let cancelled = engine.cancel_invoice(&ctx, invoice.id_typed()).unwrap();
        assert_eq!(cancelled.status(), InvoiceStatus::Cancelled);
        assert!(matches!(
            engine.cancel_invoice(&ctx, invoice.id_typed()),
            Err(DomainError::Conflict { .. })
        ));
    }
}
