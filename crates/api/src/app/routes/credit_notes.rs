use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, rejection::JsonRejection},
    http::StatusCode,
    routing::{get, post},
};

use reconcile_billing::CreditNote;
use reconcile_core::{CreditApplicationId, CreditNoteId, DomainResult, OperationContext};
use reconcile_infra::CreateCreditNoteCommand;
use reconcile_payments::{ApplyCreditNoteCommand, ReverseCreditApplicationCommand};

use crate::app::routes::common::{body, respond};
use crate::app::services::{ApiEngine, AppServices};
use crate::app::{dto, errors};
use crate::context::{PrincipalContext, TenantContext, operation_context};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_credit_note))
        .route("/:id", get(get_credit_note))
        .route("/:id/post", post(post_credit_note))
        .route("/:id/cancel", post(cancel_credit_note))
        .route("/:id/apply", post(apply_credit_note))
}

pub fn applications_router() -> Router {
    Router::new().route("/:id/reverse", post(reverse_application))
}

pub async fn create_credit_note(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    payload: Result<Json<CreateCreditNoteCommand>, JsonRejection>,
) -> axum::response::Response {
    let cmd = match body(payload) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let ctx = operation_context(&tenant, &principal);
    let result = services
        .call(move |engine| engine.create_credit_note(&ctx, cmd))
        .await
        .map(|note| dto::credit_note_to_json(&note));
    respond(StatusCode::CREATED, result)
}

pub async fn get_credit_note(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    note_op(services, tenant, principal, id, |engine, ctx, id| engine.get_credit_note(ctx, id)).await
}

pub async fn post_credit_note(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    note_op(services, tenant, principal, id, |engine, ctx, id| engine.post_credit_note(ctx, id)).await
}

pub async fn cancel_credit_note(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    note_op(services, tenant, principal, id, |engine, ctx, id| engine.cancel_credit_note(ctx, id)).await
}

/// Body is optional; without `invoice_id` the note's own invoice is the target.
pub async fn apply_credit_note(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    payload: Option<Json<dto::ApplyCreditNoteRequest>>,
) -> axum::response::Response {
    let credit_note_id: CreditNoteId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let req = payload.map(|Json(v)| v).unwrap_or_default();
    let cmd = ApplyCreditNoteCommand {
        credit_note_id,
        invoice_id: req.invoice_id,
    };
    let ctx = operation_context(&tenant, &principal);
    let result = services
        .call(move |engine| engine.apply_credit_note(&ctx, cmd))
        .await;
    respond(StatusCode::CREATED, result)
}

pub async fn reverse_application(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    payload: Result<Json<dto::ReasonRequest>, JsonRejection>,
) -> axum::response::Response {
    let application_id: CreditApplicationId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let req = match body(payload) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let cmd = ReverseCreditApplicationCommand {
        application_id,
        reason: req.reason,
    };
    let ctx = operation_context(&tenant, &principal);
    let result = services
        .call(move |engine| engine.reverse_credit_application(&ctx, cmd))
        .await;
    respond(StatusCode::OK, result)
}

async fn note_op<F>(
    services: Arc<AppServices>,
    tenant: TenantContext,
    principal: PrincipalContext,
    id: String,
    op: F,
) -> axum::response::Response
where
    F: FnOnce(&ApiEngine, &OperationContext, CreditNoteId) -> DomainResult<CreditNote> + Send + 'static,
{
    let id: CreditNoteId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let ctx = operation_context(&tenant, &principal);
    let result = services
        .call(move |engine| op(engine, &ctx, id))
        .await
        .map(|note| dto::credit_note_to_json(&note));
    respond(StatusCode::OK, result)
}
