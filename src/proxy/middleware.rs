// Request-id injection and bearer auth for the /v1 surface.

use axum::{
    body::Body,
    extract::State,
    http::{header, Request},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;

use super::common::errors::{error_response, ErrorKind};
use super::server::AppState;

/// Assign every request a short id, carried on the response as
/// `x-request-id` and attached to all log lines through a tracing span.
pub async fn request_id(req: Request<Body>, next: Next) -> Response {
    let id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
    let span = tracing::info_span!(
        "request",
        id = %id,
        method = %req.method(),
        path = %req.uri().path(),
    );
    let mut response = next.run(req).instrument(span).await;
    if let Ok(value) = id.parse() {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Static bearer auth. Applied to the /v1 routes only; the admin API and
/// model catalog stay open.
pub async fn client_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == state.client_token.as_str());

    if !authorized {
        return error_response(ErrorKind::Unauthorized, "missing or invalid bearer token");
    }
    next.run(req).await
}
