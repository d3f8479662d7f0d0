// Anthropic Messages API data model and request normalization.
//
// Incoming bodies are first parsed as a generic value so tool definitions
// can be canonicalized, then re-parsed strictly into `AnthropicRequest`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Clients occasionally send this placeholder instead of a real prompt;
/// it is rejected the same as an empty message.
pub const PLACEHOLDER_PROMPT: &str = "answer for user question";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl AnthropicRequest {
    pub fn tools_requested(&self) -> bool {
        self.tools.as_ref().is_some_and(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    String(String),
    Array(Vec<SystemBlock>),
}

impl SystemPrompt {
    pub fn as_text(&self) -> String {
        match self {
            SystemPrompt::String(s) => s.clone(),
            SystemPrompt::Array(blocks) => blocks
                .iter()
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    String(String),
    Array(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "image")]
    Image { source: ImageSource },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

/// Canonical Anthropic tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("request body is not valid JSON: {0}")]
    Parse(String),

    #[error("messages array must not be empty")]
    EmptyMessages,

    #[error("final message content must not be empty")]
    EmptyFinalMessage,
}

/// Plain text view of a message's content, used for validation and for the
/// upstream conversation payload.
pub fn message_text(content: &MessageContent) -> String {
    match content {
        MessageContent::String(s) => s.clone(),
        MessageContent::Array(blocks) => {
            let mut parts = Vec::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => parts.push(text.clone()),
                    ContentBlock::Image { source } => {
                        parts.push(format!("[Image: {}]", source.media_type))
                    }
                    _ => {}
                }
            }
            parts.join("\n")
        }
    }
}

/// Parse and normalize an Anthropic request body.
///
/// Tool entries shaped `{name, description, input_schema}` are rewritten to
/// exactly that canonical object; anything else passes through untouched.
/// Already-canonical requests survive unchanged apart from JSON key order.
pub fn normalize_request(body: &[u8]) -> Result<AnthropicRequest, RequestError> {
    let mut raw: Value =
        serde_json::from_slice(body).map_err(|e| RequestError::Parse(e.to_string()))?;

    if let Some(tools) = raw.get_mut("tools").and_then(|t| t.as_array_mut()) {
        for tool in tools.iter_mut() {
            let Some(map) = tool.as_object() else { continue };
            let (Some(name), Some(description), Some(schema)) = (
                map.get("name"),
                map.get("description"),
                map.get("input_schema"),
            ) else {
                continue;
            };
            *tool = serde_json::json!({
                "name": name,
                "description": description,
                "input_schema": schema,
            });
        }
    }

    let request: AnthropicRequest =
        serde_json::from_value(raw).map_err(|e| RequestError::Parse(e.to_string()))?;

    if request.messages.is_empty() {
        return Err(RequestError::EmptyMessages);
    }
    let last = request.messages.last().expect("non-empty");
    let text = message_text(&last.content);
    let trimmed = text.trim();
    // Tool results count as content even when no text accompanies them.
    let has_tool_results = matches!(&last.content, MessageContent::Array(blocks)
        if blocks.iter().any(|b| matches!(b, ContentBlock::ToolResult { .. })));
    if !has_tool_results && (trimmed.is_empty() || trimmed == PLACEHOLDER_PROMPT) {
        return Err(RequestError::EmptyFinalMessage);
    }

    Ok(request)
}
