// Client-facing SSE state machine.
//
// Consumes semantic upstream events and emits a legal Anthropic event
// sequence:
//
//   message_start · ping · (content_block_start · content_block_delta* ·
//   content_block_stop)* · message_delta · message_stop
//
// Guarantees, regardless of upstream behavior:
//   - a text block opens only once a non-empty text delta exists
//   - every opened block index is closed before message_delta
//   - block indices are dense, starting at 0, in emission order
//   - tool argument buffers that fail to parse degrade to `{}`
//
// The same machine drives streaming responses (events flushed as produced)
// and non-streaming responses (events folded into one aggregate body).

use std::collections::HashSet;

use serde_json::{json, Value};

use super::event_stream::{finalize_tool, ToolExecution, UpstreamEvent};
use crate::proxy::tokenizer::{estimate_text_tokens, estimate_tool_use_tokens};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
    Error,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::MaxTokens => "max_tokens",
            StopReason::StopSequence => "stop_sequence",
            StopReason::ToolUse => "tool_use",
            StopReason::Error => "error",
        }
    }
}

/// Stop-reason policy. Priority: tool_use over max_tokens over
/// stop_sequence over end_turn.
pub fn decide_stop_reason(
    saw_tool_use: bool,
    tools_requested: bool,
    hit_max_tokens: bool,
    stop_sequence_matched: bool,
) -> StopReason {
    if saw_tool_use && tools_requested {
        StopReason::ToolUse
    } else if hit_max_tokens {
        StopReason::MaxTokens
    } else if stop_sequence_matched {
        StopReason::StopSequence
    } else {
        StopReason::EndTurn
    }
}

/// The closed set of client events.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    MessageStart {
        id: String,
        model: String,
        input_tokens: u32,
    },
    Ping,
    ContentBlockStart {
        index: usize,
        block: BlockStart,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        stop_reason: StopReason,
        input_tokens: u32,
        output_tokens: u32,
    },
    MessageStop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockStart {
    Text,
    ToolUse { id: String, name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockDelta {
    TextDelta(String),
    InputJsonDelta(String),
}

impl SseEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            SseEvent::MessageStart { .. } => "message_start",
            SseEvent::Ping => "ping",
            SseEvent::ContentBlockStart { .. } => "content_block_start",
            SseEvent::ContentBlockDelta { .. } => "content_block_delta",
            SseEvent::ContentBlockStop { .. } => "content_block_stop",
            SseEvent::MessageDelta { .. } => "message_delta",
            SseEvent::MessageStop => "message_stop",
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            SseEvent::MessageStart {
                id,
                model,
                input_tokens,
            } => json!({
                "type": "message_start",
                "message": {
                    "id": id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": model,
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": input_tokens, "output_tokens": 0}
                }
            }),
            SseEvent::Ping => json!({"type": "ping"}),
            SseEvent::ContentBlockStart { index, block } => {
                let content_block = match block {
                    BlockStart::Text => json!({"type": "text", "text": ""}),
                    BlockStart::ToolUse { id, name } => json!({
                        "type": "tool_use", "id": id, "name": name, "input": {}
                    }),
                };
                json!({
                    "type": "content_block_start",
                    "index": index,
                    "content_block": content_block
                })
            }
            SseEvent::ContentBlockDelta { index, delta } => {
                let delta_json = match delta {
                    BlockDelta::TextDelta(text) => json!({"type": "text_delta", "text": text}),
                    BlockDelta::InputJsonDelta(partial) => {
                        json!({"type": "input_json_delta", "partial_json": partial})
                    }
                };
                json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": delta_json
                })
            }
            SseEvent::ContentBlockStop { index } => {
                json!({"type": "content_block_stop", "index": index})
            }
            SseEvent::MessageDelta {
                stop_reason,
                input_tokens,
                output_tokens,
            } => json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason.as_str(), "stop_sequence": null},
                "usage": {"input_tokens": input_tokens, "output_tokens": output_tokens}
            }),
            SseEvent::MessageStop => json!({"type": "message_stop"}),
        }
    }

    /// Wire form: `event: <name>\ndata: <json>\n\n`.
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event_name(), self.to_json())
    }
}

/// A finalized block, retained in index order for aggregation.
#[derive(Debug, Clone)]
enum FinishedBlock {
    Text(String),
    Tool(ToolExecution),
}

#[derive(Debug)]
struct OpenTool {
    index: usize,
    id: String,
    name: String,
    buffer: String,
}

/// Per-request streaming state. Owned by the request task, never shared.
pub struct StreamSession {
    message_id: String,
    model: String,
    input_tokens: u32,
    output_tokens: u32,
    tools_requested: bool,
    max_tokens_limit: Option<u32>,
    next_index: usize,
    open_text: Option<(usize, String)>,
    open_tools: Vec<OpenTool>,
    seen_tool_ids: HashSet<String>,
    saw_tool_use: bool,
    finished: Vec<(usize, FinishedBlock)>,
    terminated: bool,
}

impl StreamSession {
    pub fn new(model: &str, input_tokens: u32, tools_requested: bool) -> Self {
        let message_id = format!(
            "msg_{}",
            uuid::Uuid::new_v4().simple().to_string()[..24].to_string()
        );
        Self {
            message_id,
            model: model.to_string(),
            input_tokens,
            output_tokens: 0,
            tools_requested,
            max_tokens_limit: None,
            next_index: 0,
            open_text: None,
            open_tools: Vec::new(),
            seen_tool_ids: HashSet::new(),
            saw_tool_use: false,
            finished: Vec::new(),
            terminated: false,
        }
    }

    /// Client-requested output ceiling; reaching it is reflected in the
    /// stop reason.
    pub fn with_max_tokens(mut self, limit: Option<u32>) -> Self {
        self.max_tokens_limit = limit;
        self
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn input_tokens(&self) -> u32 {
        self.input_tokens
    }

    pub fn output_tokens(&self) -> u32 {
        self.output_tokens
    }

    /// message_start and ping, emitted before any upstream byte is consumed.
    pub fn initial_events(&self) -> Vec<SseEvent> {
        vec![
            SseEvent::MessageStart {
                id: self.message_id.clone(),
                model: self.model.clone(),
                input_tokens: self.input_tokens,
            },
            SseEvent::Ping,
        ]
    }

    /// Translate one upstream event into zero or more client events.
    pub fn on_event(&mut self, event: UpstreamEvent) -> Vec<SseEvent> {
        if self.terminated {
            return Vec::new();
        }
        match event {
            UpstreamEvent::TextDelta(text) => self.on_text(text),
            UpstreamEvent::ToolUseStart { id, name } => self.on_tool_start(id, name),
            UpstreamEvent::ToolInputDelta { id, fragment } => self.on_tool_fragment(id, fragment),
            UpstreamEvent::ToolUseStop { id } => self.on_tool_stop(id),
            // Usage numbers from upstream are advisory; billing follows the
            // estimator over delivered blocks.
            UpstreamEvent::Usage { .. } => Vec::new(),
            UpstreamEvent::Exception { .. } => Vec::new(),
        }
    }

    fn on_text(&mut self, text: String) -> Vec<SseEvent> {
        if text.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::new();
        let index = match &mut self.open_text {
            Some((index, buffer)) => {
                buffer.push_str(&text);
                *index
            }
            None => {
                let index = self.next_index;
                self.next_index += 1;
                self.open_text = Some((index, text.clone()));
                out.push(SseEvent::ContentBlockStart {
                    index,
                    block: BlockStart::Text,
                });
                index
            }
        };
        out.push(SseEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::TextDelta(text),
        });
        out
    }

    fn on_tool_start(&mut self, id: String, name: String) -> Vec<SseEvent> {
        if self.seen_tool_ids.contains(&id) {
            return Vec::new();
        }
        let mut out = self.close_text_block();

        self.saw_tool_use = true;
        let index = self.next_index;
        self.next_index += 1;
        self.seen_tool_ids.insert(id.clone());
        out.push(SseEvent::ContentBlockStart {
            index,
            block: BlockStart::ToolUse {
                id: id.clone(),
                name: name.clone(),
            },
        });
        self.open_tools.push(OpenTool {
            index,
            id,
            name,
            buffer: String::new(),
        });
        out
    }

    fn on_tool_fragment(&mut self, id: Option<String>, fragment: String) -> Vec<SseEvent> {
        // Fragments name their tool when the upstream interleaves; otherwise
        // they belong to the most recently opened tool.
        let tool = match id {
            Some(ref id) => self.open_tools.iter_mut().find(|t| &t.id == id),
            None => self.open_tools.last_mut(),
        };
        let Some(tool) = tool else {
            return Vec::new();
        };
        tool.buffer.push_str(&fragment);
        vec![SseEvent::ContentBlockDelta {
            index: tool.index,
            delta: BlockDelta::InputJsonDelta(fragment),
        }]
    }

    fn on_tool_stop(&mut self, id: Option<String>) -> Vec<SseEvent> {
        let position = match id {
            Some(ref id) => self.open_tools.iter().position(|t| &t.id == id),
            None => self.open_tools.len().checked_sub(1),
        };
        let Some(position) = position else {
            return Vec::new();
        };
        let tool = self.open_tools.remove(position);
        vec![self.finalize_tool_block(tool)]
    }

    fn close_text_block(&mut self) -> Vec<SseEvent> {
        let Some((index, buffer)) = self.open_text.take() else {
            return Vec::new();
        };
        self.output_tokens += estimate_text_tokens(&buffer);
        self.finished.push((index, FinishedBlock::Text(buffer)));
        vec![SseEvent::ContentBlockStop { index }]
    }

    fn finalize_tool_block(&mut self, tool: OpenTool) -> SseEvent {
        let index = tool.index;
        let execution = finalize_tool(tool.id, tool.name, &tool.buffer);
        self.output_tokens += estimate_tool_use_tokens(&execution.name, &execution.input);
        self.finished.push((index, FinishedBlock::Tool(execution)));
        SseEvent::ContentBlockStop { index }
    }

    /// Terminal sequence. Closes every still-open block, then emits
    /// message_delta and message_stop exactly once. `failed` forces the
    /// error stop reason after an upstream loss.
    pub fn finish(&mut self, failed: bool) -> Vec<SseEvent> {
        if self.terminated {
            return Vec::new();
        }
        self.terminated = true;

        let mut out = self.close_text_block();
        for tool in std::mem::take(&mut self.open_tools) {
            out.push(self.finalize_tool_block(tool));
        }

        if self.output_tokens == 0 && !self.finished.is_empty() {
            self.output_tokens = 1;
        }

        let stop_reason = self.final_stop_reason(failed);

        out.push(SseEvent::MessageDelta {
            stop_reason,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
        });
        out.push(SseEvent::MessageStop);
        out
    }

    /// Finished content blocks in index order, in client JSON shape.
    pub fn content_blocks(&self) -> Vec<Value> {
        let mut finished: Vec<&(usize, FinishedBlock)> = self.finished.iter().collect();
        finished.sort_by_key(|(index, _)| *index);
        finished
            .into_iter()
            .map(|(_, block)| match block {
                FinishedBlock::Text(text) => json!({"type": "text", "text": text}),
                FinishedBlock::Tool(tool) => json!({
                    "type": "tool_use",
                    "id": tool.id,
                    "name": tool.name,
                    "input": tool.input,
                }),
            })
            .collect()
    }

    /// The aggregate body for non-streaming responses. Must be called after
    /// `finish`.
    pub fn aggregate_response(&self, stop_reason: StopReason) -> Value {
        json!({
            "id": self.message_id,
            "type": "message",
            "role": "assistant",
            "model": self.model,
            "content": self.content_blocks(),
            "stop_reason": stop_reason.as_str(),
            "stop_sequence": null,
            "usage": {
                "input_tokens": self.input_tokens,
                "output_tokens": self.output_tokens,
            }
        })
    }

    fn max_tokens_reached(&self) -> bool {
        self.max_tokens_limit
            .is_some_and(|limit| self.output_tokens >= limit)
    }

    /// Stop reason the terminal events carried; meaningful after `finish`.
    pub fn final_stop_reason(&self, failed: bool) -> StopReason {
        if failed {
            StopReason::Error
        } else {
            decide_stop_reason(
                self.saw_tool_use,
                self.tools_requested,
                self.max_tokens_reached(),
                false,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(t: &str) -> UpstreamEvent {
        UpstreamEvent::TextDelta(t.to_string())
    }

    fn run(session: &mut StreamSession, events: Vec<UpstreamEvent>, failed: bool) -> Vec<SseEvent> {
        let mut out = session.initial_events();
        for ev in events {
            out.extend(session.on_event(ev));
        }
        out.extend(session.finish(failed));
        out
    }

    /// Start/stop pairing, dense indices, terminal ordering.
    fn assert_legal_sequence(events: &[SseEvent]) {
        assert!(matches!(events.first(), Some(SseEvent::MessageStart { .. })));
        assert!(matches!(events.get(1), Some(SseEvent::Ping)));
        assert!(matches!(events.last(), Some(SseEvent::MessageStop)));
        assert!(matches!(events[events.len() - 2], SseEvent::MessageDelta { .. }));

        let mut open: Vec<usize> = Vec::new();
        let mut closed: Vec<usize> = Vec::new();
        let mut next_expected = 0usize;
        let mut delta_seen = false;
        for ev in events {
            match ev {
                SseEvent::ContentBlockStart { index, .. } => {
                    assert!(!delta_seen, "block start after message_delta");
                    assert_eq!(*index, next_expected, "indices must be dense");
                    next_expected += 1;
                    open.push(*index);
                }
                SseEvent::ContentBlockDelta { index, .. } => {
                    assert!(open.contains(index), "delta for unopened block {}", index);
                }
                SseEvent::ContentBlockStop { index } => {
                    assert!(open.contains(index), "stop without start for {}", index);
                    open.retain(|i| i != index);
                    assert!(!closed.contains(index), "double stop for {}", index);
                    closed.push(*index);
                }
                SseEvent::MessageDelta { .. } => {
                    assert!(open.is_empty(), "message_delta with open blocks {:?}", open);
                    delta_seen = true;
                }
                _ => {}
            }
        }
        assert!(open.is_empty());
    }

    #[test]
    fn test_text_only_stream() {
        let mut session = StreamSession::new("claude-3-5-sonnet-20241022", 12, false);
        let events = run(
            &mut session,
            vec![text("he"), text("llo"), text(" world")],
            false,
        );
        assert_legal_sequence(&events);

        let deltas: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, SseEvent::ContentBlockDelta { .. }))
            .collect();
        assert_eq!(deltas.len(), 3);

        let SseEvent::MessageDelta {
            stop_reason,
            input_tokens,
            output_tokens,
        } = &events[events.len() - 2]
        else {
            panic!()
        };
        assert_eq!(*stop_reason, StopReason::EndTurn);
        assert_eq!(*input_tokens, 12);
        assert!(*output_tokens >= 1);
    }

    #[test]
    fn test_no_empty_text_block_on_tool_only_stream() {
        let mut session = StreamSession::new("m", 5, true);
        let events = run(
            &mut session,
            vec![
                UpstreamEvent::ToolUseStart { id: "T1".into(), name: "get_weather".into() },
                UpstreamEvent::ToolInputDelta { id: None, fragment: "{\"city\":".into() },
                UpstreamEvent::ToolInputDelta { id: None, fragment: "\"SF\"}".into() },
                UpstreamEvent::ToolUseStop { id: Some("T1".into()) },
            ],
            false,
        );
        assert_legal_sequence(&events);

        let starts: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SseEvent::ContentBlockStart { index, block } => Some((*index, block.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].0, 0);
        assert!(
            matches!(&starts[0].1, BlockStart::ToolUse { id, name } if id == "T1" && name == "get_weather")
        );

        let json_deltas = events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    SseEvent::ContentBlockDelta { delta: BlockDelta::InputJsonDelta(_), .. }
                )
            })
            .count();
        assert_eq!(json_deltas, 2);

        let SseEvent::MessageDelta { stop_reason, .. } = &events[events.len() - 2] else {
            panic!()
        };
        assert_eq!(*stop_reason, StopReason::ToolUse);
    }

    #[test]
    fn test_mixed_text_then_tool_indices() {
        let mut session = StreamSession::new("m", 5, true);
        let events = run(
            &mut session,
            vec![
                text("Let me check."),
                UpstreamEvent::ToolUseStart { id: "T1".into(), name: "f".into() },
                UpstreamEvent::ToolUseStop { id: Some("T1".into()) },
            ],
            false,
        );
        assert_legal_sequence(&events);

        let starts: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SseEvent::ContentBlockStart { index, block } => Some((*index, block.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(starts.len(), 2);
        assert!(matches!(starts[0], (0, BlockStart::Text)));
        assert!(matches!(&starts[1], (1, BlockStart::ToolUse { .. })));

        let blocks = session.content_blocks();
        assert_eq!(blocks[0]["type"], "text");
        assert_eq!(blocks[0]["text"], "Let me check.");
        assert_eq!(blocks[1]["type"], "tool_use");
        assert_eq!(blocks[1]["input"], json!({}));
    }

    #[test]
    fn test_upstream_truncation_closes_blocks_with_error_reason() {
        let mut session = StreamSession::new("m", 5, false);
        let mut events = session.initial_events();
        events.extend(session.on_event(text("partial")));
        // Connection dies here.
        events.extend(session.finish(true));

        assert_legal_sequence(&events);
        let SseEvent::MessageDelta { stop_reason, .. } = &events[events.len() - 2] else {
            panic!()
        };
        assert_eq!(*stop_reason, StopReason::Error);
    }

    #[test]
    fn test_missing_tool_stop_closed_by_finish() {
        let mut session = StreamSession::new("m", 5, true);
        let events = run(
            &mut session,
            vec![
                UpstreamEvent::ToolUseStart { id: "T1".into(), name: "f".into() },
                UpstreamEvent::ToolInputDelta { id: None, fragment: "{\"a\": 1}".into() },
                // No stop event arrives.
            ],
            false,
        );
        assert_legal_sequence(&events);
        let blocks = session.content_blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0]["input"]["a"], 1);
    }

    #[test]
    fn test_malformed_tool_arguments_degrade_to_empty_object() {
        let mut session = StreamSession::new("m", 5, true);
        run(
            &mut session,
            vec![
                UpstreamEvent::ToolUseStart { id: "T1".into(), name: "f".into() },
                UpstreamEvent::ToolInputDelta { id: None, fragment: "{broken".into() },
                UpstreamEvent::ToolUseStop { id: None },
            ],
            false,
        );
        let blocks = session.content_blocks();
        assert_eq!(blocks[0]["input"], json!({}));
    }

    #[test]
    fn test_duplicate_tool_start_ignored() {
        let mut session = StreamSession::new("m", 5, true);
        let events = run(
            &mut session,
            vec![
                UpstreamEvent::ToolUseStart { id: "T1".into(), name: "f".into() },
                UpstreamEvent::ToolUseStart { id: "T1".into(), name: "f".into() },
                UpstreamEvent::ToolUseStop { id: Some("T1".into()) },
            ],
            false,
        );
        assert_legal_sequence(&events);
        let starts = events
            .iter()
            .filter(|e| matches!(e, SseEvent::ContentBlockStart { .. }))
            .count();
        assert_eq!(starts, 1);
    }

    #[test]
    fn test_orphan_fragment_and_stop_ignored() {
        let mut session = StreamSession::new("m", 5, false);
        let events = run(
            &mut session,
            vec![
                UpstreamEvent::ToolInputDelta { id: None, fragment: "{}".into() },
                UpstreamEvent::ToolUseStop { id: None },
                text("still fine"),
            ],
            false,
        );
        assert_legal_sequence(&events);
        assert_eq!(session.content_blocks().len(), 1);
    }

    #[test]
    fn test_interleaved_tools_by_id() {
        let mut session = StreamSession::new("m", 5, true);
        let events = run(
            &mut session,
            vec![
                UpstreamEvent::ToolUseStart { id: "T1".into(), name: "a".into() },
                UpstreamEvent::ToolUseStart { id: "T2".into(), name: "b".into() },
                UpstreamEvent::ToolInputDelta { id: Some("T1".into()), fragment: "{\"x\":1}".into() },
                UpstreamEvent::ToolInputDelta { id: Some("T2".into()), fragment: "{\"y\":2}".into() },
                UpstreamEvent::ToolUseStop { id: Some("T1".into()) },
                UpstreamEvent::ToolUseStop { id: Some("T2".into()) },
            ],
            false,
        );
        assert_legal_sequence(&events);
        let blocks = session.content_blocks();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0]["name"], "a");
        assert_eq!(blocks[0]["input"]["x"], 1);
        assert_eq!(blocks[1]["name"], "b");
        assert_eq!(blocks[1]["input"]["y"], 2);
    }

    #[test]
    fn test_stop_reason_policy_priorities() {
        assert_eq!(decide_stop_reason(true, true, true, true), StopReason::ToolUse);
        assert_eq!(decide_stop_reason(true, false, true, false), StopReason::MaxTokens);
        assert_eq!(decide_stop_reason(false, true, false, true), StopReason::StopSequence);
        assert_eq!(decide_stop_reason(false, false, false, false), StopReason::EndTurn);
    }

    #[test]
    fn test_max_tokens_limit_reflected_in_stop_reason() {
        let mut session = StreamSession::new("m", 5, false).with_max_tokens(Some(10));
        let _ = session.on_event(text(&"x".repeat(400)));
        let events = session.finish(false);
        let SseEvent::MessageDelta { stop_reason, .. } = &events[events.len() - 2] else {
            panic!()
        };
        assert_eq!(*stop_reason, StopReason::MaxTokens);
    }

    #[test]
    fn test_tool_use_outranks_max_tokens() {
        let mut session = StreamSession::new("m", 5, true).with_max_tokens(Some(1));
        let _ = session.on_event(text(&"x".repeat(400)));
        let _ = session.on_event(UpstreamEvent::ToolUseStart { id: "T1".into(), name: "f".into() });
        let _ = session.finish(false);
        assert_eq!(session.final_stop_reason(false), StopReason::ToolUse);
    }

    #[test]
    fn test_finish_is_idempotent() {
        let mut session = StreamSession::new("m", 5, false);
        let _ = session.on_event(text("x"));
        let first = session.finish(false);
        assert!(!first.is_empty());
        assert!(session.finish(false).is_empty());
        assert!(session.on_event(text("late")).is_empty());
    }

    #[test]
    fn test_output_tokens_clamped_to_one() {
        let mut session = StreamSession::new("m", 5, false);
        let _ = session.on_event(text("x"));
        let _ = session.finish(false);
        assert!(session.output_tokens() >= 1);
    }

    #[test]
    fn test_aggregate_response_shape() {
        let mut session = StreamSession::new("claude-sonnet-4-20250514", 9, true);
        let _ = session.on_event(text("hello"));
        let _ = session.on_event(UpstreamEvent::ToolUseStart { id: "T1".into(), name: "f".into() });
        let _ = session.finish(false);
        let body = session.aggregate_response(session.final_stop_reason(false));

        assert_eq!(body["type"], "message");
        assert_eq!(body["role"], "assistant");
        assert_eq!(body["stop_reason"], "tool_use");
        assert_eq!(body["content"].as_array().unwrap().len(), 2);
        assert_eq!(body["usage"]["input_tokens"], 9);
        assert!(body["usage"]["output_tokens"].as_u64().unwrap() >= 1);
        assert!(body["id"].as_str().unwrap().starts_with("msg_"));
    }

    #[test]
    fn test_sse_wire_format() {
        let event = SseEvent::ContentBlockStop { index: 2 };
        let wire = event.to_sse();
        assert!(wire.starts_with("event: content_block_stop\ndata: "));
        assert!(wire.ends_with("\n\n"));
        let json_part = wire
            .trim_start_matches("event: content_block_stop\ndata: ")
            .trim_end();
        let parsed: Value = serde_json::from_str(json_part).unwrap();
        assert_eq!(parsed["index"], 2);
    }

    use proptest::prelude::*;

    fn arb_event() -> impl Strategy<Value = UpstreamEvent> {
        prop_oneof![
            "[a-zA-Z ]{0,12}".prop_map(UpstreamEvent::TextDelta),
            ("T[0-9]", "[a-z]{1,6}").prop_map(|(id, name)| UpstreamEvent::ToolUseStart {
                id,
                name
            }),
            prop_oneof![Just(None), Just(Some("T1".to_string())), Just(Some("T2".to_string()))]
                .prop_flat_map(|id| {
                    "[{}\"a-z:,0-9]{0,10}".prop_map(move |fragment| {
                        UpstreamEvent::ToolInputDelta {
                            id: id.clone(),
                            fragment,
                        }
                    })
                }),
            prop_oneof![Just(None), Just(Some("T1".to_string())), Just(Some("T9".to_string()))]
                .prop_map(|id| UpstreamEvent::ToolUseStop { id }),
        ]
    }

    proptest! {
        /// Invariants hold for arbitrary, adversarial upstream sequences:
        /// paired start/stop, dense indices, single terminal pair.
        #[test]
        fn prop_machine_invariants_under_adversarial_input(
            events in proptest::collection::vec(arb_event(), 0..24),
            failed in proptest::bool::ANY,
        ) {
            let mut session = StreamSession::new("m", 1, true);
            let mut out = session.initial_events();
            for ev in events {
                out.extend(session.on_event(ev));
            }
            out.extend(session.finish(failed));
            assert_legal_sequence(&out);

            let delta_count = out
                .iter()
                .filter(|e| matches!(e, SseEvent::MessageDelta { .. }))
                .count();
            prop_assert_eq!(delta_count, 1);
        }
    }
}
