use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use reconcile_core::DomainResult;

use crate::app::errors;

/// Serialize an engine result with `status`, or map its error.
pub fn respond<T: Serialize>(status: StatusCode, result: DomainResult<T>) -> Response {
    match result {
        Ok(value) => (status, Json(value)).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

/// Unwrap a JSON body, answering `422` for malformed payloads.
pub fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    payload
        .map(|Json(value)| value)
        .map_err(errors::json_rejection_to_response)
}
