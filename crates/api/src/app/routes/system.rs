use std::sync::Arc;

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};

use reconcile_infra::jobs::JobStore;

use crate::app::{errors, services::AppServices};
use crate::context::{PrincipalContext, TenantContext};

pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.jobs().stats() {
        Ok(stats) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok", "jobs": stats })),
        )
            .into_response(),
        Err(e) => errors::json_error(StatusCode::SERVICE_UNAVAILABLE, "unhealthy", e.to_string()),
    }
}

pub async fn whoami(
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
) -> impl IntoResponse {
    Json(serde_json::json!({
        "company_id": tenant.company_id(),
        "user_id": principal.user_id(),
        "decision": principal.decision(),
    }))
}

/// Jobs of this company that exhausted their retries.
pub async fn dead_letters(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    let ctx = crate::context::operation_context(&tenant, &principal);
    if let Err(e) = ctx.ensure_authorized() {
        return errors::domain_error_to_response(e);
    }
    match services.jobs().list_dead_letters(tenant.company_id()) {
        Ok(items) => (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response(),
        Err(e) => errors::domain_error_to_response(e.into()),
    }
}
