// /v1/messages and /v1/messages/count_tokens.

use axum::{
    body::Bytes,
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::warn;

use super::relay::{dispatch, WireFormat};
use crate::proxy::common::errors::{error_response, ErrorKind};
use crate::proxy::mappers::anthropic::normalize_request;
use crate::proxy::server::AppState;
use crate::proxy::tokenizer::estimate_request_tokens;

/// Anthropic Messages passthrough.
pub async fn handle_messages(State(state): State<AppState>, body: Bytes) -> Response {
    let request = match normalize_request(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!("request rejected: {}", e);
            return error_response(ErrorKind::BadRequest, e.to_string());
        }
    };
    dispatch(state, request, WireFormat::Anthropic).await
}

/// Token counting over the normalized request, no upstream call.
pub async fn handle_count_tokens(State(_state): State<AppState>, body: Bytes) -> Response {
    let request = match normalize_request(&body) {
        Ok(request) => request,
        Err(e) => return error_response(ErrorKind::BadRequest, e.to_string()),
    };
    let input_tokens = estimate_request_tokens(&request);
    Json(json!({ "input_tokens": input_tokens })).into_response()
}
