// Token estimation with the Claude correction factor.
// Byte-count / 4 heuristic, 1.15x correction, plus small per-message and
// per-tool overheads. Deterministic and language-agnostic.
//
// The same estimator covers both directions: input tokens over the
// normalized request actually forwarded upstream, and output tokens over
// the content blocks actually delivered to the client.

use serde_json::Value;

use crate::proxy::mappers::anthropic::{
    AnthropicRequest, ContentBlock, MessageContent, SystemPrompt,
};

/// Claude tokenizes roughly 15% denser than the cl100k baseline.
pub const CLAUDE_CORRECTION_FACTOR: f64 = 1.15;

/// Per-message overhead tokens (role markers, separators).
pub const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

/// Estimate token count for a text string.
pub fn estimate_text_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    let base = (text.len() / 4).max(1);
    (base as f64 * CLAUDE_CORRECTION_FACTOR).round() as u32
}

/// Estimate tokens for a delivered tool_use block: name plus the canonical
/// JSON of its input, plus block overhead.
pub fn estimate_tool_use_tokens(name: &str, input: &Value) -> u32 {
    let input_json = serde_json::to_string(input).unwrap_or_default();
    estimate_text_tokens(name) + estimate_text_tokens(&input_json) + MESSAGE_OVERHEAD_TOKENS
}

fn estimate_content_tokens(content: &MessageContent) -> u32 {
    let tokens = match content {
        MessageContent::String(s) => estimate_text_tokens(s),
        MessageContent::Array(blocks) => {
            let mut total = 0u32;
            for block in blocks {
                total += match block {
                    ContentBlock::Text { text } => estimate_text_tokens(text),
                    ContentBlock::Image { .. } => 100,
                    ContentBlock::ToolUse { name, input, .. } => {
                        estimate_tool_use_tokens(name, input)
                    }
                    ContentBlock::ToolResult { content, .. } => {
                        estimate_text_tokens(&content.to_string())
                    }
                };
            }
            total
        }
    };
    tokens + MESSAGE_OVERHEAD_TOKENS
}

/// Estimate total input tokens for a normalized request:
/// system + messages + tool definitions + response priming.
pub fn estimate_request_tokens(request: &AnthropicRequest) -> u32 {
    let mut total: u32 = 0;

    if let Some(system) = &request.system {
        match system {
            SystemPrompt::String(s) => total += estimate_text_tokens(s),
            SystemPrompt::Array(blocks) => {
                for block in blocks {
                    total += estimate_text_tokens(&block.text);
                }
            }
        }
    }

    for msg in &request.messages {
        total += estimate_content_tokens(&msg.content);
    }

    if let Some(tools) = &request.tools {
        for tool in tools {
            total += estimate_text_tokens(&tool.name);
            if let Some(desc) = &tool.description {
                total += estimate_text_tokens(desc);
            }
            if let Some(schema) = &tool.input_schema {
                total += estimate_text_tokens(&schema.to_string());
            }
            total += MESSAGE_OVERHEAD_TOKENS;
        }
    }

    total + 3
}
