use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, rejection::JsonRejection},
    http::StatusCode,
    routing::{get, post},
};

use reconcile_billing::Invoice;
use reconcile_core::{DomainResult, InvoiceId};
use reconcile_infra::CreateInvoiceCommand;

use crate::app::routes::common::{body, respond};
use crate::app::services::{ApiEngine, AppServices};
use crate::app::{dto, errors};
use crate::context::{PrincipalContext, TenantContext, operation_context};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_invoice))
        .route("/:id", get(get_invoice))
        .route("/:id/post", post(post_invoice))
        .route("/:id/cancel", post(cancel_invoice))
        .route("/:id/credit-applications", get(credit_applications))
}

pub async fn create_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    payload: Result<Json<CreateInvoiceCommand>, JsonRejection>,
) -> axum::response::Response {
    let cmd = match body(payload) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let ctx = operation_context(&tenant, &principal);
    let result = services
        .call(move |engine| engine.create_invoice(&ctx, cmd))
        .await
        .map(|invoice| dto::invoice_to_json(&invoice));
    respond(StatusCode::CREATED, result)
}

pub async fn get_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    invoice_op(services, tenant, principal, id, |engine, ctx, id| engine.get_invoice(ctx, id)).await
}

pub async fn post_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    invoice_op(services, tenant, principal, id, |engine, ctx, id| engine.post_invoice(ctx, id)).await
}

pub async fn cancel_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    invoice_op(services, tenant, principal, id, |engine, ctx, id| engine.cancel_invoice(ctx, id)).await
}

pub async fn credit_applications(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: InvoiceId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let ctx = operation_context(&tenant, &principal);
    let result = services
        .call(move |engine| engine.invoice_credit_applications(&ctx, id))
        .await
        .map(|items| serde_json::json!({ "items": items }));
    respond(StatusCode::OK, result)
}

async fn invoice_op<F>(
    services: Arc<AppServices>,
    tenant: TenantContext,
    principal: PrincipalContext,
    id: String,
    op: F,
) -> axum::response::Response
where
    F: FnOnce(&ApiEngine, &reconcile_core::OperationContext, InvoiceId) -> DomainResult<Invoice>
        + Send
        + 'static,
{
    let id: InvoiceId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let ctx = operation_context(&tenant, &principal);
    let result = services
        .call(move |engine| op(engine, &ctx, id))
        .await
        .map(|invoice| dto::invoice_to_json(&invoice));
    respond(StatusCode::OK, result)
}
