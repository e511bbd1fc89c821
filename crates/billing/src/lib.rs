//! `reconcile-billing`: the documents payments and credit settle against.
//!
//! Invoices and credit notes carry the only shared mutable money in the engine
//! (`balance_due`, `remaining_balance`). Both are moved exclusively through the
//! [`BoundedBalance`] primitive. This crate is pure; persistence and locking live
//! in `reconcile-infra`.

pub mod balance;
pub mod credit_note;
pub mod customer;
pub mod invoice;

pub use balance::BoundedBalance;
pub use credit_note::{
    CreditApplication, CreditApplicationStatus, CreditNote, CreditNoteRecord, CreditNoteStatus,
    DraftCreditNote, apply_credit, reverse_application,
};
pub use customer::Customer;
pub use invoice::{DraftInvoice, Invoice, InvoiceRecord, InvoiceStatus, PaymentStatus};
