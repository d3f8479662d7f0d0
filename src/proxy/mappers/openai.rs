// OpenAI Chat Completions compatibility layer.
//
// Inbound: an OpenAI request becomes an `AnthropicRequest` for the shared
// pipeline. Outbound: finished content blocks (or streaming events) become
// chat.completion / chat.completion.chunk objects.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::anthropic::{
    AnthropicRequest, ContentBlock, ImageSource, Message, MessageContent, SystemPrompt, Tool,
};
use crate::proxy::upstream::sse::StopReason;

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiRequest {
    pub model: String,
    pub messages: Vec<OpenAiMessage>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub max_completion_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub stop: Option<StopSpec>,
    #[serde(default)]
    pub tools: Option<Vec<OpenAiTool>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StopSpec {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<OpenAiContent>,
    #[serde(default)]
    pub tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OpenAiContent {
    Text(String),
    Parts(Vec<OpenAiContentPart>),
}

impl OpenAiContent {
    fn as_text(&self) -> String {
        match self {
            OpenAiContent::Text(s) => s.clone(),
            OpenAiContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    OpenAiContentPart::Text { text } => Some(text.as_str()),
                    OpenAiContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum OpenAiContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrlSpec },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageUrlSpec {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiTool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: OpenAiFunctionDef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiFunctionDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: OpenAiFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiFunctionCall {
    pub name: String,
    pub arguments: String,
}

/// Translate an OpenAI chat request into the Anthropic shape used by the
/// rest of the pipeline. System and developer messages fold into `system`;
/// tool-role messages become `tool_result` blocks; assistant tool calls
/// become `tool_use` blocks.
pub fn openai_to_anthropic(req: OpenAiRequest) -> AnthropicRequest {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Message> = Vec::new();

    for msg in &req.messages {
        match msg.role.as_str() {
            "system" | "developer" => {
                if let Some(content) = &msg.content {
                    let text = content.as_text();
                    if !text.is_empty() {
                        system_parts.push(text);
                    }
                }
            }
            "tool" => {
                let block = ContentBlock::ToolResult {
                    tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                    content: Value::String(
                        msg.content.as_ref().map(|c| c.as_text()).unwrap_or_default(),
                    ),
                    is_error: None,
                };
                messages.push(Message {
                    role: "user".into(),
                    content: MessageContent::Array(vec![block]),
                });
            }
            "assistant" => {
                let mut blocks: Vec<ContentBlock> = Vec::new();
                if let Some(content) = &msg.content {
                    let text = content.as_text();
                    if !text.is_empty() {
                        blocks.push(ContentBlock::Text { text });
                    }
                }
                for call in msg.tool_calls.iter().flatten() {
                    let input = serde_json::from_str(&call.function.arguments)
                        .unwrap_or_else(|_| json!({}));
                    blocks.push(ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        input,
                    });
                }
                if blocks.is_empty() {
                    continue;
                }
                messages.push(Message {
                    role: "assistant".into(),
                    content: MessageContent::Array(blocks),
                });
            }
            _ => {
                // user, or any unknown role treated as user
                let content = match &msg.content {
                    Some(OpenAiContent::Text(s)) => MessageContent::String(s.clone()),
                    Some(OpenAiContent::Parts(parts)) => {
                        let blocks: Vec<ContentBlock> = parts
                            .iter()
                            .filter_map(|part| match part {
                                OpenAiContentPart::Text { text } => {
                                    Some(ContentBlock::Text { text: text.clone() })
                                }
                                OpenAiContentPart::ImageUrl { image_url } => {
                                    data_uri_to_image(&image_url.url)
                                }
                            })
                            .collect();
                        MessageContent::Array(blocks)
                    }
                    None => MessageContent::String(String::new()),
                };
                messages.push(Message {
                    role: "user".into(),
                    content,
                });
            }
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(SystemPrompt::String(system_parts.join("\n\n")))
    };

    let tools = req.tools.map(|tools| {
        tools
            .into_iter()
            .filter(|t| t.tool_type == "function")
            .map(|t| Tool {
                name: t.function.name,
                description: t.function.description,
                input_schema: t.function.parameters,
            })
            .collect::<Vec<_>>()
    });

    let stop_sequences = req.stop.map(|s| match s {
        StopSpec::One(one) => vec![one],
        StopSpec::Many(many) => many,
    });

    AnthropicRequest {
        model: req.model,
        messages,
        system,
        tools,
        stream: req.stream.unwrap_or(false),
        max_tokens: req.max_tokens.or(req.max_completion_tokens),
        temperature: req.temperature,
        top_p: req.top_p,
        stop_sequences,
        metadata: None,
    }
}

/// `data:<media>;base64,<payload>` becomes an Anthropic image block;
/// remote URLs are dropped since the upstream only accepts inline bytes.
fn data_uri_to_image(url: &str) -> Option<ContentBlock> {
    let rest = url.strip_prefix("data:")?;
    let (header, data) = rest.split_once(',')?;
    let media_type = header.split(';').next().filter(|s| !s.is_empty())?;
    Some(ContentBlock::Image {
        source: ImageSource {
            source_type: "base64".into(),
            media_type: media_type.to_string(),
            data: data.to_string(),
        },
    })
}

pub fn finish_reason(stop_reason: StopReason) -> &'static str {
    match stop_reason {
        StopReason::ToolUse => "tool_calls",
        StopReason::MaxTokens => "length",
        _ => "stop",
    }
}

/// Assemble the non-streaming chat.completion body from the finished
/// Anthropic content blocks.
pub fn chat_completion_response(
    id: &str,
    model: &str,
    content_blocks: &[Value],
    stop_reason: StopReason,
    input_tokens: u32,
    output_tokens: u32,
) -> Value {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    for block in content_blocks {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                    text_parts.push(t);
                }
            }
            Some("tool_use") => {
                tool_calls.push(json!({
                    "id": block.get("id").cloned().unwrap_or_default(),
                    "type": "function",
                    "function": {
                        "name": block.get("name").cloned().unwrap_or_default(),
                        "arguments": serde_json::to_string(block.get("input").unwrap_or(&json!({})))
                            .unwrap_or_else(|_| "{}".into()),
                    }
                }));
            }
            _ => {}
        }
    }

    let mut message = json!({
        "role": "assistant",
        "content": if text_parts.is_empty() { Value::Null } else { Value::String(text_parts.concat()) },
    });
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }

    json!({
        "id": id,
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason(stop_reason),
        }],
        "usage": {
            "prompt_tokens": input_tokens,
            "completion_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens,
        }
    })
}

/// One streaming chunk. `delta` follows the OpenAI incremental shape.
pub fn chat_chunk(id: &str, model: &str, delta: Value, finish: Option<&str>) -> Value {
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish,
        }]
    })
}
