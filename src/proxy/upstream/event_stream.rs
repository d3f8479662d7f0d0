// AWS binary event-stream decoding.
//
// Frame layout, all big-endian:
//
//   total_len:u32 | headers_len:u32 | prelude_crc:u32 | headers | payload | message_crc:u32
//
// `prelude_crc` covers the first 8 bytes, `message_crc` everything before
// itself. Headers are `{name_len:u8, name, value_type:u8, value}`; the
// `:message-type` and `:event-type` string headers drive dispatch.
//
// A malformed frame advances the cursor one byte and resynchronizes on the
// prelude CRC; too many consecutive failures terminate the stream.

use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Consecutive framing failures tolerated before giving up on the stream.
pub const MAX_PARSE_ERRORS: usize = 16;

/// Wall-clock budget for a non-streaming parse.
pub const NON_STREAM_PARSE_BUDGET: Duration = Duration::from_secs(10);

/// Upper bound on a single frame; larger prelude lengths are treated as
/// desynchronization rather than waiting for data that will never arrive.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const PRELUDE_LEN: usize = 12;
const MIN_FRAME_LEN: usize = 16;

/// Semantic events decoded from the upstream stream.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    TextDelta(String),
    ToolUseStart { id: String, name: String },
    ToolInputDelta { id: Option<String>, fragment: String },
    ToolUseStop { id: Option<String> },
    Usage { input_tokens: u32, output_tokens: u32 },
    Exception { message: String },
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("event stream desynchronized after {0} consecutive framing errors")]
    TooManyErrors(usize),

    #[error("event stream parse exceeded the {}s budget", NON_STREAM_PARSE_BUDGET.as_secs())]
    Timeout,
}

#[derive(Debug)]
enum FrameError {
    BadPrelude,
    BadCrc,
    BadHeaders,
}

#[derive(Debug)]
struct Frame {
    message_type: Option<String>,
    event_type: Option<String>,
    payload: Vec<u8>,
}

pub struct EventStreamParser {
    buffer: BytesMut,
    consecutive_errors: usize,
}

impl Default for EventStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            consecutive_errors: 0,
        }
    }

    /// Feed a chunk of upstream bytes, draining every complete frame into
    /// semantic events. Incomplete trailing bytes stay buffered for the
    /// next chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<UpstreamEvent>, ParseError> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(event) = self.next_event()? {
            events.push(event);
        }
        Ok(events)
    }

    /// Decode the next complete frame into an event, skipping frames that
    /// carry nothing the relay cares about. `None` means more bytes are
    /// needed.
    fn next_event(&mut self) -> Result<Option<UpstreamEvent>, ParseError> {
        loop {
            match self.next_frame()? {
                None => return Ok(None),
                Some(frame) => {
                    if let Some(event) = classify_frame(&frame) {
                        return Ok(Some(event));
                    }
                }
            }
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, ParseError> {
        loop {
            match decode_frame(&self.buffer) {
                Ok(Some((frame, consumed))) => {
                    self.buffer.advance(consumed);
                    self.consecutive_errors = 0;
                    return Ok(Some(frame));
                }
                Ok(None) => return Ok(None),
                Err(e) => {
                    self.consecutive_errors += 1;
                    debug!(errors = self.consecutive_errors, "framing error: {:?}", e);
                    if self.consecutive_errors >= MAX_PARSE_ERRORS {
                        return Err(ParseError::TooManyErrors(self.consecutive_errors));
                    }
                    // Resynchronize one byte at a time; the prelude CRC
                    // rejects garbage long before a bogus length stalls us.
                    self.buffer.advance(1);
                }
            }
        }
    }
}

/// Try to decode one frame from the front of `buf`.
/// `Ok(None)` means the buffer holds a valid-so-far prefix of a frame.
fn decode_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
    if buf.len() < PRELUDE_LEN {
        return Ok(None);
    }

    let total_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let headers_len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    let prelude_crc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

    if crc32fast::hash(&buf[..8]) != prelude_crc {
        return Err(FrameError::BadPrelude);
    }
    if total_len < MIN_FRAME_LEN || total_len > MAX_FRAME_LEN || headers_len > total_len - MIN_FRAME_LEN {
        return Err(FrameError::BadPrelude);
    }
    if buf.len() < total_len {
        return Ok(None);
    }

    let message_crc = u32::from_be_bytes([
        buf[total_len - 4],
        buf[total_len - 3],
        buf[total_len - 2],
        buf[total_len - 1],
    ]);
    if crc32fast::hash(&buf[..total_len - 4]) != message_crc {
        return Err(FrameError::BadCrc);
    }

    let headers = &buf[PRELUDE_LEN..PRELUDE_LEN + headers_len];
    let payload = buf[PRELUDE_LEN + headers_len..total_len - 4].to_vec();

    let mut message_type = None;
    let mut event_type = None;
    for (name, value) in parse_headers(headers)? {
        match name.as_str() {
            ":message-type" => message_type = value,
            ":event-type" => event_type = value,
            _ => {}
        }
    }

    Ok(Some((
        Frame {
            message_type,
            event_type,
            payload,
        },
        total_len,
    )))
}

/// Walk the header block. String values are returned; other recognized
/// value types are skipped over by their documented widths.
fn parse_headers(mut buf: &[u8]) -> Result<Vec<(String, Option<String>)>, FrameError> {
    let mut headers = Vec::new();
    while !buf.is_empty() {
        let name_len = buf[0] as usize;
        buf = &buf[1..];
        if buf.len() < name_len + 1 {
            return Err(FrameError::BadHeaders);
        }
        let name = String::from_utf8_lossy(&buf[..name_len]).into_owned();
        let value_type = buf[name_len];
        buf = &buf[name_len + 1..];

        let value = match value_type {
            // bool true / bool false carry no bytes
            0 | 1 => None,
            2 => {
                buf = skip(buf, 1)?;
                None
            }
            3 => {
                buf = skip(buf, 2)?;
                None
            }
            4 => {
                buf = skip(buf, 4)?;
                None
            }
            5 | 8 => {
                buf = skip(buf, 8)?;
                None
            }
            // byte array and string are u16-length prefixed
            6 | 7 => {
                if buf.len() < 2 {
                    return Err(FrameError::BadHeaders);
                }
                let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
                buf = &buf[2..];
                if buf.len() < len {
                    return Err(FrameError::BadHeaders);
                }
                let value = (value_type == 7)
                    .then(|| String::from_utf8_lossy(&buf[..len]).into_owned());
                buf = &buf[len..];
                value
            }
            9 => {
                buf = skip(buf, 16)?;
                None
            }
            _ => return Err(FrameError::BadHeaders),
        };
        headers.push((name, value));
    }
    Ok(headers)
}

fn skip(buf: &[u8], n: usize) -> Result<&[u8], FrameError> {
    if buf.len() < n {
        return Err(FrameError::BadHeaders);
    }
    Ok(&buf[n..])
}

fn classify_frame(frame: &Frame) -> Option<UpstreamEvent> {
    match frame.message_type.as_deref() {
        Some("exception") | Some("error") => {
            let message = serde_json::from_slice::<Value>(&frame.payload)
                .ok()
                .and_then(|v| {
                    v.get("message")
                        .or_else(|| v.get("Message"))
                        .and_then(|m| m.as_str())
                        .map(str::to_string)
                })
                .unwrap_or_else(|| String::from_utf8_lossy(&frame.payload).into_owned());
            warn!(
                event_type = frame.event_type.as_deref().unwrap_or("unknown"),
                "upstream exception frame: {}", message
            );
            Some(UpstreamEvent::Exception { message })
        }
        Some("event") | None => {
            let payload: Value = serde_json::from_slice(&frame.payload).ok()?;
            classify_payload(&payload)
        }
        Some(other) => {
            debug!("ignoring frame with message type {:?}", other);
            None
        }
    }
}

/// Classify an event payload. Order matters: a fragment may carry `name`
/// and `toolUseId` alongside `input`, so `stop`, usage and `input` are
/// checked before treating it as a tool start.
fn classify_payload(val: &Value) -> Option<UpstreamEvent> {
    if val.get("stop").and_then(|v| v.as_bool()).unwrap_or(false) {
        return Some(UpstreamEvent::ToolUseStop {
            id: val
                .get("toolUseId")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        });
    }

    if let Some(usage) = val.get("usage") {
        let read = |camel: &str, snake: &str| {
            usage
                .get(camel)
                .or_else(|| usage.get(snake))
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32
        };
        return Some(UpstreamEvent::Usage {
            input_tokens: read("inputTokens", "input_tokens"),
            output_tokens: read("outputTokens", "output_tokens"),
        });
    }

    if let Some(fragment) = val.get("input").and_then(|v| v.as_str()) {
        return Some(UpstreamEvent::ToolInputDelta {
            id: val
                .get("toolUseId")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            fragment: fragment.to_string(),
        });
    }

    if let (Some(name), Some(id)) = (
        val.get("name").and_then(|v| v.as_str()),
        val.get("toolUseId").and_then(|v| v.as_str()),
    ) {
        return Some(UpstreamEvent::ToolUseStart {
            id: id.to_string(),
            name: name.to_string(),
        });
    }

    if let Some(content) = val.get("content").and_then(|v| v.as_str()) {
        return Some(UpstreamEvent::TextDelta(content.to_string()));
    }

    None
}

// ===== Tool lifecycle reconstruction =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Pending,
    Streaming,
    Completed,
    Errored,
}

/// One reconstructed upstream tool call.
#[derive(Debug, Clone)]
pub struct ToolExecution {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub status: ToolStatus,
}

/// Accumulates tool argument fragments until the upstream marks them final.
#[derive(Debug, Default)]
pub struct ToolAssembler {
    current: Option<(String, String, String)>, // id, name, buffer
    completed: Vec<ToolExecution>,
}

impl ToolAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(&mut self, id: &str, name: &str) {
        self.finalize_current();
        self.current = Some((id.to_string(), name.to_string(), String::new()));
    }

    pub fn on_fragment(&mut self, fragment: &str) {
        if let Some((_, _, buffer)) = self.current.as_mut() {
            buffer.push_str(fragment);
        }
    }

    pub fn on_stop(&mut self) {
        self.finalize_current();
    }

    fn finalize_current(&mut self) {
        if let Some((id, name, buffer)) = self.current.take() {
            self.completed.push(finalize_tool(id, name, &buffer));
        }
    }

    /// Finish the stream: anything still open is finalized with whatever
    /// arguments arrived.
    pub fn finish(mut self) -> Vec<ToolExecution> {
        self.finalize_current();
        self.completed
    }
}

/// Arguments must form a JSON object; anything else degrades to `{}` with
/// the tool marked errored so the caller can tell the difference.
pub fn finalize_tool(id: String, name: String, buffer: &str) -> ToolExecution {
    let trimmed = buffer.trim();
    if trimmed.is_empty() {
        return ToolExecution {
            id,
            name,
            input: Value::Object(Default::default()),
            status: ToolStatus::Completed,
        };
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) if value.is_object() => ToolExecution {
            id,
            name,
            input: value,
            status: ToolStatus::Completed,
        },
        _ => ToolExecution {
            id,
            name,
            input: Value::Object(Default::default()),
            status: ToolStatus::Errored,
        },
    }
}

// ===== Non-streaming surface =====

/// Accumulated result of a full response-body parse.
#[derive(Debug)]
pub struct ParseResult {
    pub events: Vec<UpstreamEvent>,
    pub completion_text: String,
    pub tool_calls: Vec<ToolExecution>,
}

/// Parse a complete response body under the wall-clock budget.
pub fn parse_response(body: &[u8]) -> Result<ParseResult, ParseError> {
    let deadline = Instant::now() + NON_STREAM_PARSE_BUDGET;
    let mut parser = EventStreamParser::new();
    parser.buffer.extend_from_slice(body);

    let mut events = Vec::new();
    let mut completion_text = String::new();
    let mut assembler = ToolAssembler::new();

    loop {
        if Instant::now() >= deadline {
            return Err(ParseError::Timeout);
        }
        let Some(event) = parser.next_event()? else {
            break;
        };
        match &event {
            UpstreamEvent::TextDelta(text) => completion_text.push_str(text),
            UpstreamEvent::ToolUseStart { id, name } => assembler.on_start(id, name),
            UpstreamEvent::ToolInputDelta { fragment, .. } => assembler.on_fragment(fragment),
            UpstreamEvent::ToolUseStop { .. } => assembler.on_stop(),
            _ => {}
        }
        events.push(event);
    }

    Ok(ParseResult {
        events,
        completion_text,
        tool_calls: assembler.finish(),
    })
}

/// Encode one event-stream frame. Fixture builder for tests and local
/// mock upstreams; the relay itself only decodes.
pub fn encode_frame(message_type: &str, event_type: Option<&str>, payload: &[u8]) -> Vec<u8> {
    let mut headers = Vec::new();
    let mut push_header = |name: &str, value: &str| {
        headers.push(name.len() as u8);
        headers.extend_from_slice(name.as_bytes());
        headers.push(7u8); // string
        headers.extend_from_slice(&(value.len() as u16).to_be_bytes());
        headers.extend_from_slice(value.as_bytes());
    };
    push_header(":message-type", message_type);
    if let Some(et) = event_type {
        push_header(":event-type", et);
    }

    let total_len = PRELUDE_LEN + headers.len() + payload.len() + 4;
    let mut frame = Vec::with_capacity(total_len);
    frame.extend_from_slice(&(total_len as u32).to_be_bytes());
    frame.extend_from_slice(&(headers.len() as u32).to_be_bytes());
    let prelude_crc = crc32fast::hash(&frame[..8]);
    frame.extend_from_slice(&prelude_crc.to_be_bytes());
    frame.extend_from_slice(&headers);
    frame.extend_from_slice(payload);
    let message_crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&message_crc.to_be_bytes());
    frame
}
