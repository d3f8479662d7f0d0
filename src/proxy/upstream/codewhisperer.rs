// CodeWhisperer request building.
//
// Anthropic conversations map onto the upstream `conversationState` shape:
// a history of alternating userInputMessage / assistantResponseMessage
// entries plus a current userInputMessage. The upstream requires the first
// turn to be a user turn and strict alternation, so gaps are padded with
// `(empty)` placeholders and an assistant-final transcript gains a
// trailing `Continue` user turn.

use serde_json::{json, Map, Value};

use crate::proxy::common::model_mapping::resolve_model;
use crate::proxy::mappers::anthropic::{
    message_text, AnthropicRequest, ContentBlock, Message, MessageContent,
};

pub const CODEWHISPERER_URL: &str =
    "https://codewhisperer.us-east-1.amazonaws.com/generateAssistantResponse";

const GENERATE_USER_AGENT: &str =
    "aws-sdk-js/1.0.27 ua/2.1 os/linux lang/js md/nodejs#20.16.0 api/codewhispererstreaming#1.0.27 m/E";

/// Tool descriptions beyond this length are truncated before forwarding.
const TOOL_DESCRIPTION_MAX_LENGTH: usize = 10_000;

/// One merged conversation turn.
#[derive(Debug, Default, Clone)]
struct Turn {
    role: String,
    text: String,
    tool_uses: Vec<Value>,
    tool_results: Vec<Value>,
    images: Vec<Value>,
}

impl Turn {
    fn placeholder(role: &str) -> Self {
        Turn {
            role: role.to_string(),
            text: "(empty)".to_string(),
            ..Default::default()
        }
    }

    fn absorb(&mut self, other: Turn) {
        if !other.text.is_empty() {
            if !self.text.is_empty() {
                self.text.push('\n');
            }
            self.text.push_str(&other.text);
        }
        self.tool_uses.extend(other.tool_uses);
        self.tool_results.extend(other.tool_results);
        self.images.extend(other.images);
    }
}

fn extract_turn(msg: &Message) -> Turn {
    let mut turn = Turn {
        role: msg.role.clone(),
        text: message_text(&msg.content),
        ..Default::default()
    };
    if let MessageContent::Array(blocks) = &msg.content {
        for block in blocks {
            match block {
                ContentBlock::ToolUse { id, name, input } => {
                    turn.tool_uses.push(json!({
                        "toolUseId": id,
                        "name": name,
                        "input": input,
                    }));
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    let text = match content {
                        Value::String(s) => s.clone(),
                        Value::Array(items) => items
                            .iter()
                            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                            .collect::<Vec<_>>()
                            .join("\n"),
                        other => other.to_string(),
                    };
                    let status = if is_error.unwrap_or(false) { "error" } else { "success" };
                    turn.tool_results.push(json!({
                        "toolUseId": tool_use_id,
                        "content": [{"text": text}],
                        "status": status,
                    }));
                }
                ContentBlock::Image { source } => {
                    let format = source
                        .media_type
                        .split('/')
                        .next_back()
                        .unwrap_or(&source.media_type);
                    turn.images.push(json!({
                        "format": format,
                        "source": {"bytes": source.data},
                    }));
                }
                ContentBlock::Text { .. } => {}
            }
        }
    }
    turn
}

/// Merge consecutive same-role messages, then pad to a strictly
/// alternating user-first transcript.
fn alternating_turns(messages: &[Message]) -> Vec<Turn> {
    let mut merged: Vec<Turn> = Vec::new();
    for msg in messages {
        let turn = extract_turn(msg);
        match merged.last_mut() {
            Some(last) if last.role == turn.role => last.absorb(turn),
            _ => merged.push(turn),
        }
    }
    if merged.is_empty() {
        return merged;
    }

    let mut alternated: Vec<Turn> = Vec::new();
    if merged[0].role != "user" {
        alternated.push(Turn::placeholder("user"));
    }
    for turn in merged {
        if let Some(last) = alternated.last() {
            if last.role == turn.role {
                let filler = if turn.role == "user" { "assistant" } else { "user" };
                alternated.push(Turn::placeholder(filler));
            }
        }
        alternated.push(turn);
    }
    alternated
}

fn tool_specifications(request: &AnthropicRequest) -> Vec<Value> {
    request
        .tools
        .iter()
        .flatten()
        .map(|tool| {
            let description = tool.description.as_deref().unwrap_or("");
            let description = if description.len() > TOOL_DESCRIPTION_MAX_LENGTH {
                &description[..TOOL_DESCRIPTION_MAX_LENGTH]
            } else {
                description
            };
            json!({
                "toolSpecification": {
                    "name": tool.name,
                    "description": description,
                    "inputSchema": {
                        "json": tool.input_schema.clone().unwrap_or_else(|| json!({})),
                    }
                }
            })
        })
        .collect()
}

fn user_input_message(turn: &Turn, model_id: &str, tools: Option<&[Value]>) -> Value {
    let content = if turn.text.is_empty() { "(empty)" } else { turn.text.as_str() };
    let mut message = json!({
        "content": content,
        "modelId": model_id,
        "origin": "AI_EDITOR",
    });
    if !turn.images.is_empty() {
        message["images"] = json!(turn.images);
    }

    let mut context = Map::new();
    if let Some(tools) = tools {
        if !tools.is_empty() {
            context.insert("tools".to_string(), json!(tools));
        }
    }
    if !turn.tool_results.is_empty() {
        context.insert("toolResults".to_string(), json!(turn.tool_results));
    }
    if !context.is_empty() {
        message["userInputMessageContext"] = Value::Object(context);
    }
    json!({"userInputMessage": message})
}

fn assistant_response_message(turn: &Turn) -> Value {
    let content = if turn.text.is_empty() { "(empty)" } else { turn.text.as_str() };
    let mut message = json!({"content": content});
    if !turn.tool_uses.is_empty() {
        message["toolUses"] = json!(turn.tool_uses);
    }
    json!({"assistantResponseMessage": message})
}

/// Build the upstream generateAssistantResponse payload.
pub fn build_payload(request: &AnthropicRequest) -> Value {
    let model_id = resolve_model(&request.model).to_string();
    let conversation_id = uuid::Uuid::new_v4().to_string();
    let specs = tool_specifications(request);

    let mut turns = alternating_turns(&request.messages);
    if turns.is_empty() {
        turns.push(Turn {
            role: "user".into(),
            text: "Continue".into(),
            ..Default::default()
        });
    }

    // Fold the system prompt into the opening user turn.
    if let Some(system) = &request.system {
        let system_text = system.as_text();
        if !system_text.is_empty() {
            if let Some(first) = turns.first_mut() {
                if first.role == "user" {
                    first.text = if first.text.is_empty() || first.text == "(empty)" {
                        system_text
                    } else {
                        format!("{}\n\n{}", system_text, first.text)
                    };
                }
            }
        }
    }

    // The current message must be a user turn.
    if turns.last().map(|t| t.role.as_str()) == Some("assistant") {
        turns.push(Turn {
            role: "user".into(),
            text: "Continue".into(),
            ..Default::default()
        });
    }

    let current = turns.pop().expect("at least one turn");
    let history: Vec<Value> = turns
        .iter()
        .map(|turn| {
            if turn.role == "user" {
                user_input_message(turn, &model_id, None)
            } else {
                assistant_response_message(turn)
            }
        })
        .collect();

    let mut conversation_state = json!({
        "chatTriggerType": "MANUAL",
        "conversationId": conversation_id,
        "currentMessage": user_input_message(&current, &model_id, Some(&specs)),
    });
    if !history.is_empty() {
        conversation_state["history"] = json!(history);
    }

    json!({"conversationState": conversation_state})
}

/// POST the payload with the AWS SDK header set the upstream expects.
pub async fn send_generate_request(
    client: &reqwest::Client,
    access_token: &str,
    payload: &Value,
) -> Result<reqwest::Response, reqwest::Error> {
    client
        .post(CODEWHISPERER_URL)
        .header("Authorization", format!("Bearer {}", access_token))
        .header("Content-Type", "application/json")
        .header("User-Agent", GENERATE_USER_AGENT)
        .header("x-amz-user-agent", "aws-sdk-js/1.0.27")
        .header("amz-sdk-invocation-id", uuid::Uuid::new_v4().to_string())
        .header("amz-sdk-request", "attempt=1; max=1")
        .header("Connection", "close")
        .json(payload)
        .send()
        .await
}
