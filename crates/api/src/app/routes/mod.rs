use axum::{Router, routing::get};

pub mod batches;
pub mod common;
pub mod credit_notes;
pub mod customers;
pub mod invoices;
pub mod payments;
pub mod system;

/// Router for all tenant-scoped endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .route("/dead-letters", get(system::dead_letters))
        .nest("/customers", customers::router())
        .nest("/invoices", invoices::router())
        .nest("/credit-notes", credit_notes::router())
        .nest("/credit-applications", credit_notes::applications_router())
        .nest("/payments", payments::router())
        .nest("/payment-reversals", payments::payment_reversals_router())
        .nest("/allocation-reversals", payments::allocation_reversals_router())
        .nest("/payment-batches", batches::router())
}
