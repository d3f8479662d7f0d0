// The shared upstream relay: credential acquisition with fallback, the
// generate call, and the streaming / aggregating drivers over the event
// parser and SSE state machine.

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{error, info, warn};

use crate::auth::LeasedToken;
use crate::proxy::common::errors::{error_response, ErrorKind};
use crate::proxy::mappers::anthropic::AnthropicRequest;
use crate::proxy::mappers::openai::{chat_chunk, chat_completion_response, finish_reason};
use crate::proxy::server::AppState;
use crate::proxy::tokenizer::estimate_request_tokens;
use crate::proxy::upstream::codewhisperer::{build_payload, send_generate_request};
use crate::proxy::upstream::event_stream::{
    parse_response, EventStreamParser, ParseError, UpstreamEvent,
};
use crate::proxy::upstream::sse::{BlockDelta, BlockStart, SseEvent, StreamSession};

/// Which wire dialect the client speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Anthropic,
    OpenAi,
}

/// Drive a normalized request through the pool and upstream, answering in
/// the requested dialect.
pub async fn dispatch(state: AppState, request: AnthropicRequest, format: WireFormat) -> Response {
    let input_tokens = estimate_request_tokens(&request);
    let payload = build_payload(&request);

    let (upstream, lease) = match acquire_and_send(&state, &payload).await {
        Ok(pair) => pair,
        Err(response) => return response,
    };

    info!(
        model = %request.model,
        stream = request.stream,
        input_tokens,
        account = lease.email.as_deref().unwrap_or("unknown"),
        "relaying to upstream"
    );

    let session = StreamSession::new(&request.model, input_tokens, request.tools_requested())
        .with_max_tokens(request.max_tokens);
    if request.stream {
        stream_response(state, upstream, session, lease, format)
    } else {
        aggregate_response(state, upstream, session, lease, format).await
    }
}

/// Acquire a credential and open the upstream call, falling back to the
/// next credential when the upstream rejects this one with a structured
/// ban. Transport failures and unstructured rejections end the request.
async fn acquire_and_send(
    state: &AppState,
    payload: &Value,
) -> Result<(reqwest::Response, LeasedToken), Response> {
    let max_attempts = state.store.runtime_credentials().len().max(1);

    for attempt in 1..=max_attempts {
        let lease = match state.pool.acquire().await {
            Ok(lease) => lease,
            Err(e) => return Err(error_response(ErrorKind::NoUsableCredential, e.to_string())),
        };

        let response =
            match send_generate_request(&state.client, &lease.token.access_token, payload).await {
                Ok(response) => response,
                Err(e) => {
                    state.pool.mark_error(&lease.handle, &e.to_string()).await;
                    error!("upstream request failed: {}", e);
                    return Err(error_response(
                        ErrorKind::UpstreamTransport,
                        "could not reach the upstream service",
                    ));
                }
            };

        let status = response.status();
        if status.is_success() {
            return Ok((response, lease));
        }

        let body = response.text().await.unwrap_or_default();
        error!(status = status.as_u16(), attempt, "upstream rejected request: {}", body);

        let reason = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("reason").and_then(|r| r.as_str()).map(str::to_string));
        if let Some(reason) = reason {
            // A structured rejection marks the account; the next credential
            // gets a chance within this request.
            let lower = reason.to_lowercase();
            if lower.contains("quota") || lower.contains("credit") {
                state.pool.mark_exhausted(&lease.handle).await;
            } else {
                state.pool.mark_banned(&lease.handle, &reason).await;
            }
            if attempt < max_attempts {
                continue;
            }
            return Err(error_response(
                ErrorKind::NoUsableCredential,
                "all credentials were rejected by the upstream",
            ));
        }

        state
            .pool
            .mark_error(&lease.handle, &format!("upstream status {}", status.as_u16()))
            .await;
        return Err(error_response(
            ErrorKind::UpstreamTransport,
            format!("upstream returned status {}", status.as_u16()),
        ));
    }

    Err(error_response(
        ErrorKind::NoUsableCredential,
        "credential fallback exhausted",
    ))
}

/// Encode machine events into the client's dialect. For OpenAI that means
/// chat.completion.chunk objects with per-tool delta indices and the
/// trailing [DONE] marker.
pub struct SseEncoder {
    format: WireFormat,
    chat_id: String,
    model: String,
    tool_ordinals: HashMap<usize, usize>,
}

impl SseEncoder {
    pub fn new(format: WireFormat, model: &str) -> Self {
        Self {
            format,
            chat_id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            tool_ordinals: HashMap::new(),
        }
    }

    pub fn emit(&mut self, event: &SseEvent) -> Vec<String> {
        match self.format {
            WireFormat::Anthropic => vec![event.to_sse()],
            WireFormat::OpenAi => self.emit_openai(event),
        }
    }

    fn chunk(&self, delta: Value, finish: Option<&'static str>) -> String {
        format!(
            "data: {}\n\n",
            chat_chunk(&self.chat_id, &self.model, delta, finish)
        )
    }

    fn emit_openai(&mut self, event: &SseEvent) -> Vec<String> {
        match event {
            SseEvent::MessageStart { .. } => {
                vec![self.chunk(serde_json::json!({"role": "assistant", "content": ""}), None)]
            }
            SseEvent::Ping | SseEvent::ContentBlockStop { .. } => Vec::new(),
            SseEvent::ContentBlockStart { index, block } => match block {
                BlockStart::Text => Vec::new(),
                BlockStart::ToolUse { id, name } => {
                    let ordinal = self.tool_ordinals.len();
                    self.tool_ordinals.insert(*index, ordinal);
                    vec![self.chunk(
                        serde_json::json!({
                            "tool_calls": [{
                                "index": ordinal,
                                "id": id,
                                "type": "function",
                                "function": {"name": name, "arguments": ""},
                            }]
                        }),
                        None,
                    )]
                }
            },
            SseEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta(text) => {
                    vec![self.chunk(serde_json::json!({"content": text}), None)]
                }
                BlockDelta::InputJsonDelta(partial) => {
                    let Some(ordinal) = self.tool_ordinals.get(index) else {
                        return Vec::new();
                    };
                    vec![self.chunk(
                        serde_json::json!({
                            "tool_calls": [{
                                "index": ordinal,
                                "function": {"arguments": partial},
                            }]
                        }),
                        None,
                    )]
                }
            },
            SseEvent::MessageDelta { stop_reason, .. } => {
                vec![self.chunk(serde_json::json!({}), Some(finish_reason(*stop_reason)))]
            }
            SseEvent::MessageStop => vec!["data: [DONE]\n\n".to_string()],
        }
    }
}

fn stream_response(
    state: AppState,
    upstream: reqwest::Response,
    mut session: StreamSession,
    lease: LeasedToken,
    format: WireFormat,
) -> Response {
    let mut encoder = SseEncoder::new(format, session.model());

    let sse_stream = async_stream::stream! {
        for event in session.initial_events() {
            for wire in encoder.emit(&event) {
                yield Ok::<Bytes, std::io::Error>(Bytes::from(wire));
            }
        }

        let mut parser = EventStreamParser::new();
        let mut byte_stream = upstream.bytes_stream();
        let mut failed = false;

        'receive: while let Some(chunk) = byte_stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!("upstream stream error: {}", e);
                    state.pool.mark_error(&lease.handle, &e.to_string()).await;
                    failed = true;
                    break 'receive;
                }
            };
            let events = match parser.feed(&chunk) {
                Ok(events) => events,
                Err(e) => {
                    warn!("upstream stream parse failed: {}", e);
                    failed = true;
                    break 'receive;
                }
            };
            for event in events {
                if let UpstreamEvent::Exception { message } = &event {
                    warn!("upstream exception mid-stream: {}", message);
                    state.pool.mark_error(&lease.handle, message).await;
                    failed = true;
                    break 'receive;
                }
                for sse in session.on_event(event) {
                    for wire in encoder.emit(&sse) {
                        yield Ok(Bytes::from(wire));
                    }
                }
            }
        }

        // Whatever happened upstream, the client gets a complete sequence.
        for sse in session.finish(failed) {
            for wire in encoder.emit(&sse) {
                yield Ok(Bytes::from(wire));
            }
        }

        info!(
            output_tokens = session.output_tokens(),
            failed,
            "stream finished"
        );
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(sse_stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn aggregate_response(
    state: AppState,
    upstream: reqwest::Response,
    mut session: StreamSession,
    lease: LeasedToken,
    format: WireFormat,
) -> Response {
    let body = match upstream.bytes().await {
        Ok(body) => body,
        Err(e) => {
            state.pool.mark_error(&lease.handle, &e.to_string()).await;
            error!("failed to read upstream body: {}", e);
            return error_response(ErrorKind::UpstreamTransport, "failed to read upstream response");
        }
    };

    let result = match parse_response(&body) {
        Ok(result) => result,
        Err(ParseError::Timeout) => {
            error!(bytes = body.len(), "upstream parse exceeded budget");
            return error_response(ErrorKind::ParseTimeout, "upstream response parse timed out");
        }
        Err(e) => {
            error!(bytes = body.len(), "upstream parse failed: {}", e);
            return error_response(ErrorKind::UpstreamParse, e.to_string());
        }
    };

    let mut failed = false;
    for event in result.events {
        if let UpstreamEvent::Exception { message } = &event {
            state.pool.mark_error(&lease.handle, message).await;
            failed = true;
            continue;
        }
        let _ = session.on_event(event);
    }
    let _ = session.finish(failed);

    if failed && session.content_blocks().is_empty() {
        return error_response(ErrorKind::UpstreamTransport, "upstream reported an error");
    }

    let stop_reason = session.final_stop_reason(failed);
    let body = match format {
        WireFormat::Anthropic => session.aggregate_response(stop_reason),
        WireFormat::OpenAi => chat_completion_response(
            &format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            session.model(),
            &session.content_blocks(),
            stop_reason,
            session.input_tokens(),
            session.output_tokens(),
        ),
    };
    (StatusCode::OK, Json(body)).into_response()
}
