use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};

use reconcile_core::{AllocationId, AllocationReversalId, PaymentId, ReversalId};
use reconcile_payments::{
    AllocateCommand, AllocationStrategy, AutoAllocateCommand, RecordPaymentCommand,
    ReverseAllocationCommand,
};

use crate::app::routes::common::{body, respond};
use crate::app::{dto, errors, services::AppServices};
use crate::context::{PrincipalContext, TenantContext, operation_context};
use crate::middleware::{IDEMPOTENCY_HEADER, header_str};

pub fn router() -> Router {
    Router::new()
        .route("/", post(record_payment))
        .route("/:id", get(get_payment))
        .route("/:id/summary", get(payment_summary))
        .route("/:id/allocations", get(list_allocations).post(allocate))
        .route("/:id/auto-allocate", post(auto_allocate))
        .route("/:id/allocations/reverse-all", post(reverse_all_allocations))
        .route("/:id/allocations/:allocation_id/reverse", post(reverse_allocation))
        .route("/:id/reverse", post(reverse_payment))
        .route("/:id/reversals", get(list_reversals))
}

pub fn payment_reversals_router() -> Router {
    Router::new().route("/:id", get(get_payment_reversal))
}

pub fn allocation_reversals_router() -> Router {
    Router::new().route("/:id", get(get_allocation_reversal))
}

pub async fn record_payment(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    payload: Result<Json<RecordPaymentCommand>, JsonRejection>,
) -> axum::response::Response {
    let cmd = match body(payload) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let ctx = operation_context(&tenant, &principal);
    let result = services
        .call(move |engine| engine.record_payment(&ctx, cmd))
        .await;
    respond(StatusCode::CREATED, result)
}

pub async fn get_payment(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: PaymentId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let ctx = operation_context(&tenant, &principal);
    let result = services.call(move |engine| engine.get_payment(&ctx, id)).await;
    respond(StatusCode::OK, result)
}

pub async fn payment_summary(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: PaymentId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let ctx = operation_context(&tenant, &principal);
    let result = services.call(move |engine| engine.payment_summary(&ctx, id)).await;
    respond(StatusCode::OK, result)
}

pub async fn list_allocations(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: PaymentId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let ctx = operation_context(&tenant, &principal);
    let result = services
        .call(move |engine| engine.payment_allocations(&ctx, id))
        .await
        .map(|items| serde_json::json!({ "items": items }));
    respond(StatusCode::OK, result)
}

pub async fn allocate(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    payload: Result<Json<dto::AllocateRequest>, JsonRejection>,
) -> axum::response::Response {
    let payment_id: PaymentId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let req = match body(payload) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let cmd = AllocateCommand {
        payment_id,
        invoice_id: req.invoice_id,
        amount: req.amount,
    };
    let ctx = operation_context(&tenant, &principal);
    let result = services
        .call(move |engine| engine.allocate_manual(&ctx, cmd))
        .await;
    respond(StatusCode::CREATED, result)
}

/// Body is the strategy, e.g. `{"strategy": "fifo"}`.
pub async fn auto_allocate(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    payload: Result<Json<AllocationStrategy>, JsonRejection>,
) -> axum::response::Response {
    let payment_id: PaymentId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let strategy = match body(payload) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let cmd = AutoAllocateCommand {
        payment_id,
        strategy,
    };
    let ctx = operation_context(&tenant, &principal);
    let result = services
        .call(move |engine| engine.auto_allocate(&ctx, cmd))
        .await
        .map(|items| serde_json::json!({ "items": items }));
    respond(StatusCode::CREATED, result)
}

pub async fn reverse_allocation(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path((id, allocation_id)): Path<(String, String)>,
    payload: Result<Json<dto::ReverseAllocationRequest>, JsonRejection>,
) -> axum::response::Response {
    let payment_id: PaymentId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let allocation_id: AllocationId = match errors::parse_id(&allocation_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let req = match body(payload) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let cmd = ReverseAllocationCommand {
        payment_id,
        allocation_id,
        reason: req.reason.unwrap_or_default(),
        refund_amount: req.refund_amount,
    };
    let ctx = operation_context(&tenant, &principal);
    let result = services
        .call(move |engine| engine.reverse_allocation(&ctx, cmd))
        .await
        .map(|reversal| dto::allocation_reversal_accepted_to_json(&reversal));
    respond(StatusCode::ACCEPTED, result)
}

pub async fn reverse_all_allocations(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    payload: Result<Json<dto::ReasonRequest>, JsonRejection>,
) -> axum::response::Response {
    let payment_id: PaymentId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let req = match body(payload) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let ctx = operation_context(&tenant, &principal);
    let result = services
        .call(move |engine| engine.reverse_all_allocations(&ctx, payment_id, &req.reason))
        .await
        .map(|items| serde_json::json!({ "items": items }));
    respond(StatusCode::ACCEPTED, result)
}

/// Void or refund. An `Idempotency-Key` header makes retries return the first
/// request's reversal.
pub async fn reverse_payment(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<dto::ReversePaymentRequest>, JsonRejection>,
) -> axum::response::Response {
    let payment_id: PaymentId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let req = match body(payload) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let idempotency_key = header_str(&headers, IDEMPOTENCY_HEADER).map(str::to_string);
    let cmd = match req.into_command(payment_id, idempotency_key) {
        Ok(cmd) => cmd,
        Err(e) => return errors::domain_error_to_response(e),
    };
    let ctx = operation_context(&tenant, &principal);
    let result = services
        .call(move |engine| engine.reverse_payment(&ctx, cmd))
        .await
        .map(|accepted| dto::payment_reversal_accepted_to_json(&accepted));
    respond(StatusCode::ACCEPTED, result)
}

pub async fn list_reversals(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: PaymentId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let ctx = operation_context(&tenant, &principal);
    let result = services
        .call(move |engine| engine.payment_reversals(&ctx, id))
        .await
        .map(|items| serde_json::json!({ "items": items }));
    respond(StatusCode::OK, result)
}

pub async fn get_payment_reversal(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: ReversalId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let ctx = operation_context(&tenant, &principal);
    let result = services
        .call(move |engine| engine.get_payment_reversal(&ctx, id))
        .await;
    respond(StatusCode::OK, result)
}

pub async fn get_allocation_reversal(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: AllocationReversalId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let ctx = operation_context(&tenant, &principal);
    let result = services
        .call(move |engine| engine.get_allocation_reversal(&ctx, id))
        .await;
    respond(StatusCode::OK, result)
}
