// /v1/chat/completions: OpenAI in, OpenAI out, Anthropic in between.

use axum::{body::Bytes, extract::State, response::Response};
use tracing::warn;

use super::relay::{dispatch, WireFormat};
use crate::proxy::common::errors::{error_response, ErrorKind};
use crate::proxy::mappers::anthropic::{message_text, PLACEHOLDER_PROMPT};
use crate::proxy::mappers::openai::{openai_to_anthropic, OpenAiRequest};
use crate::proxy::server::AppState;

pub async fn handle_chat_completions(State(state): State<AppState>, body: Bytes) -> Response {
    let openai_request: OpenAiRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!("chat completion request rejected: {}", e);
            return error_response(
                ErrorKind::BadRequest,
                format!("request body is not a valid chat completion request: {}", e),
            );
        }
    };

    let request = openai_to_anthropic(openai_request);
    if request.messages.is_empty() {
        return error_response(ErrorKind::BadRequest, "messages array must not be empty");
    }
    let last = request.messages.last().expect("non-empty");
    let text = message_text(&last.content);
    let trimmed = text.trim();
    let tool_result_only = matches!(
        &last.content,
        crate::proxy::mappers::anthropic::MessageContent::Array(blocks)
            if blocks.iter().any(|b| matches!(
                b,
                crate::proxy::mappers::anthropic::ContentBlock::ToolResult { .. }
            ))
    );
    if !tool_result_only && (trimmed.is_empty() || trimmed == PLACEHOLDER_PROMPT) {
        return error_response(ErrorKind::BadRequest, "final message content must not be empty");
    }

    dispatch(state, request, WireFormat::OpenAi).await
}
