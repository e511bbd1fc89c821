use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use reconcile_core::{AccessDecision, CompanyId, UserId};

use crate::app::errors;
use crate::context::{PrincipalContext, TenantContext};

pub const COMPANY_HEADER: &str = "x-company-id";
pub const USER_HEADER: &str = "x-user-id";
/// `allow` or `deny`; absent means allowed.
pub const DECISION_HEADER: &str = "x-access-decision";
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// Turn the upstream tenant/identity headers into request extensions.
///
/// Without a usable tenant nothing is visible, so that is a 404; without an
/// identity or with a `deny` decision the request is forbidden.
pub async fn context_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let headers = req.headers();

    let Some(company_id) = header_id::<CompanyId>(headers, COMPANY_HEADER) else {
        return errors::json_error(StatusCode::NOT_FOUND, "not_found", "not found");
    };
    let Some(user_id) = header_id::<UserId>(headers, USER_HEADER) else {
        return errors::json_error(StatusCode::FORBIDDEN, "forbidden", "missing or invalid user identity");
    };
    let decision = match header_str(headers, DECISION_HEADER) {
        None | Some("allow") => AccessDecision::Granted,
        Some("deny") => AccessDecision::Denied,
        Some(_) => {
            return errors::json_error(StatusCode::FORBIDDEN, "forbidden", "unrecognised access decision");
        }
    };

    req.extensions_mut().insert(TenantContext::new(company_id));
    req.extensions_mut()
        .insert(PrincipalContext::new(user_id, decision));

    next.run(req).await
}

pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn header_id<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    header_str(headers, name).and_then(|v| v.parse().ok())
}
