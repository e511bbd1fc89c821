use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::extract::rejection::JsonRejection;
use serde_json::json;

use reconcile_core::DomainError;

/// Map the engine's error taxonomy onto HTTP.
pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::Validation(fields) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            axum::Json(json!({
                "error": "validation_error",
                "message": "the request is invalid",
                "errors": fields,
            })),
        )
            .into_response(),
        DomainError::Conflict { message, existing_id } => {
            let mut body = json!({ "error": "conflict", "message": message });
            if let Some(id) = existing_id {
                body["existing_id"] = json!(id);
            }
            (StatusCode::CONFLICT, axum::Json(body)).into_response()
        }
        DomainError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        DomainError::InvariantViolation(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invariant_violation", msg)
        }
        DomainError::Transient(msg) => {
            tracing::warn!(error = %msg, "transient failure surfaced to client");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "transient_failure", msg)
        }
        DomainError::Unauthorized => json_error(StatusCode::FORBIDDEN, "forbidden", "not permitted"),
    }
}

/// Malformed JSON or wrong field types never reach the engine.
pub fn json_rejection_to_response(rejection: JsonRejection) -> axum::response::Response {
    json_error(
        StatusCode::UNPROCESSABLE_ENTITY,
        "validation_error",
        rejection.body_text(),
    )
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Path ids that do not parse cannot name a visible row.
pub fn parse_id<T: std::str::FromStr>(raw: &str) -> Result<T, axum::response::Response> {
    raw.parse()
        .map_err(|_| json_error(StatusCode::NOT_FOUND, "not_found", "not found"))
}
