use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};

use reconcile_core::{BatchId, DomainError};
use reconcile_infra::BatchSubmission;
use reconcile_payments::BatchSource;

use crate::app::routes::common::{body, respond};
use crate::app::{dto, errors, services::AppServices};
use crate::context::{PrincipalContext, TenantContext, operation_context};
use crate::middleware::{IDEMPOTENCY_HEADER, header_str};

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit_batch))
        .route("/:id", get(get_batch))
        .route("/:id/entries/:index/retry", post(retry_entry))
}

/// Accepts `{"source_type": "manual" | "csv_import" | "bank_feed", ...}`.
pub async fn submit_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    headers: HeaderMap,
    payload: Result<Json<BatchSource>, JsonRejection>,
) -> axum::response::Response {
    let source = match body(payload) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let submission = BatchSubmission {
        source,
        idempotency_key: header_str(&headers, IDEMPOTENCY_HEADER).map(str::to_string),
    };
    let ctx = operation_context(&tenant, &principal);
    match services
        .call(move |engine| engine.submit_batch(&ctx, submission))
        .await
    {
        Ok(batch) => (StatusCode::ACCEPTED, Json(dto::batch_accepted_to_json(&batch))).into_response(),
        // A repeated key points the caller at the batch it already created.
        Err(DomainError::Conflict {
            message,
            existing_id: Some(existing),
        }) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "error": "conflict",
                "message": message,
                "existing_batch_id": existing,
            })),
        )
            .into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn get_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: BatchId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let ctx = operation_context(&tenant, &principal);
    let result = services.call(move |engine| engine.get_batch(&ctx, id)).await;
    respond(StatusCode::OK, result)
}

pub async fn retry_entry(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path((id, index)): Path<(String, String)>,
) -> axum::response::Response {
    let id: BatchId = match errors::parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Ok(index) = index.parse::<usize>() else {
        return errors::json_error(StatusCode::NOT_FOUND, "not_found", "not found");
    };
    let ctx = operation_context(&tenant, &principal);
    let result = services
        .call(move |engine| engine.retry_failed_entry(&ctx, id, index))
        .await;
    respond(StatusCode::ACCEPTED, result)
}
