//! `reconcile-core`: shared building blocks for the payment engine.
//!
//! This crate contains **pure** primitives (no infrastructure concerns): typed ids,
//! the error taxonomy, fixed-point money and the explicit tenant context.

pub mod entity;
pub mod error;
pub mod id;
pub mod money;
pub mod tenant;
pub mod value_object;

pub use entity::Entity;
pub use error::{DomainError, DomainResult, FieldErrors};
pub use id::{
    AllocationId, AllocationReversalId, BatchId, CompanyId, CreditApplicationId, CreditNoteId,
    CustomerId, InvoiceId, PaymentId, ReversalId, UserId,
};
pub use money::{Currency, Money, MONEY_SCALE};
pub use tenant::{AccessDecision, OperationContext, TenantScoped};
pub use value_object::ValueObject;
