//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: engine construction and the async-to-blocking bridge
//! - `routes/`: HTTP routes + handlers (one file per resource)
//! - `dto.rs`: request/response DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full HTTP router around already-constructed services.
pub fn build_app(services: Arc<AppServices>) -> Router {
    // Tenant-scoped routes: require tenant + principal headers.
    let scoped = routes::router().layer(axum::middleware::from_fn(middleware::context_middleware));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(scoped)
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
