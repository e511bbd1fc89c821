use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, rejection::JsonRejection},
    http::StatusCode,
    routing::{get, post},
};

use reconcile_core::CustomerId;

use crate::app::routes::common::{body, respond};
use crate::app::{dto, errors, services::AppServices};
use crate::context::{PrincipalContext, TenantContext, operation_context};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_customer))
        .route("/:id", get(get_customer))
}

pub async fn create_customer(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    payload: Result<Json<dto::CreateCustomerRequest>, JsonRejection>,
) -> axum::response::Response {
    let req = match body(payload) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let ctx = operation_context(&tenant, &principal);
    let result = services
        .call(move |engine| engine.create_customer(&ctx, &req.name))
        .await;
    respond(StatusCode::CREATED, result)
}

pub async fn get_customer(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: CustomerId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let ctx = operation_context(&tenant, &principal);
    let result = services.call(move |engine| engine.get_customer(&ctx, id)).await;
    respond(StatusCode::OK, result)
}
