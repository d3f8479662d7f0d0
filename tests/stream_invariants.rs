// End-to-end checks over the upstream decoder and the SSE state machine:
// encoded binary frames in, a legal Anthropic event sequence out.

use serde_json::{json, Value};

use kiro_relay::proxy::upstream::event_stream::{encode_frame, EventStreamParser, UpstreamEvent};
use kiro_relay::proxy::upstream::sse::{SseEvent, StreamSession};

fn event_frame(payload: Value) -> Vec<u8> {
    encode_frame(
        "event",
        Some("assistantResponseEvent"),
        payload.to_string().as_bytes(),
    )
}

/// Decode upstream bytes (in the given chunk sizes) through a fresh session
/// and return the full client event sequence.
fn drive(chunks: &[Vec<u8>], tools_requested: bool, drop_connection: bool) -> Vec<SseEvent> {
    let mut session = StreamSession::new("claude-3-5-sonnet-20241022", 8, tools_requested);
    let mut parser = EventStreamParser::new();

    let mut out = session.initial_events();
    for chunk in chunks {
        for event in parser.feed(chunk).expect("framing") {
            out.extend(session.on_event(event));
        }
    }
    out.extend(session.finish(drop_connection));
    out
}

fn stop_reason(events: &[SseEvent]) -> &'static str {
    events
        .iter()
        .find_map(|e| match e {
            SseEvent::MessageDelta { stop_reason, .. } => Some(stop_reason.as_str()),
            _ => None,
        })
        .expect("message_delta present")
}

/// Paired start/stop per index, dense indices, single terminal pair, and
/// nothing after message_stop.
fn assert_legal(events: &[SseEvent]) {
    assert!(matches!(events.first(), Some(SseEvent::MessageStart { .. })));
    assert!(matches!(events.get(1), Some(SseEvent::Ping)));
    assert!(matches!(events.last(), Some(SseEvent::MessageStop)));

    let mut open: Vec<usize> = Vec::new();
    let mut started: Vec<usize> = Vec::new();
    let mut stopped: Vec<usize> = Vec::new();
    let mut deltas = 0;
    for event in events {
        match event {
            SseEvent::ContentBlockStart { index, .. } => {
                assert_eq!(*index, started.len(), "dense index allocation");
                started.push(*index);
                open.push(*index);
            }
            SseEvent::ContentBlockDelta { index, .. } => {
                assert!(open.contains(index));
            }
            SseEvent::ContentBlockStop { index } => {
                assert!(open.contains(index));
                open.retain(|i| i != index);
                stopped.push(*index);
            }
            SseEvent::MessageDelta { .. } => {
                deltas += 1;
                assert!(open.is_empty(), "open blocks at message_delta: {:?}", open);
            }
            _ => {}
        }
    }
    assert_eq!(deltas, 1);
    let mut started_sorted = started.clone();
    started_sorted.sort_unstable();
    let mut stopped_sorted = stopped.clone();
    stopped_sorted.sort_unstable();
    assert_eq!(started_sorted, stopped_sorted, "start/stop multiset parity");
}

#[test]
fn text_only_stream_produces_canonical_sequence() {
    let chunks = vec![
        event_frame(json!({"content": "he"})),
        event_frame(json!({"content": "llo"})),
        event_frame(json!({"content": " world"})),
    ];
    let events = drive(&chunks, false, false);
    assert_legal(&events);

    let names: Vec<&str> = events.iter().map(|e| e.event_name()).collect();
    assert_eq!(
        names,
        vec![
            "message_start",
            "ping",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
    assert_eq!(stop_reason(&events), "end_turn");

    let SseEvent::MessageDelta { output_tokens, input_tokens, .. } = &events[events.len() - 2]
    else {
        panic!()
    };
    assert_eq!(*input_tokens, 8);
    assert!(*output_tokens >= 1);
}

#[test]
fn tool_only_stream_emits_single_tool_block() {
    let mut bytes = Vec::new();
    bytes.extend(event_frame(json!({"toolUseId": "T1", "name": "get_weather"})));
    bytes.extend(event_frame(json!({"toolUseId": "T1", "name": "get_weather", "input": "{\"city\""})));
    bytes.extend(event_frame(json!({"input": ":\"SF\"}"})));
    bytes.extend(event_frame(json!({"stop": true, "toolUseId": "T1"})));

    let events = drive(&[bytes], true, false);
    assert_legal(&events);

    // No text block opens on a tool-only stream.
    let starts: Vec<&SseEvent> = events
        .iter()
        .filter(|e| matches!(e, SseEvent::ContentBlockStart { .. }))
        .collect();
    assert_eq!(starts.len(), 1);
    let SseEvent::ContentBlockStart { index, block } = starts[0] else { panic!() };
    assert_eq!(*index, 0);
    let kiro_relay::proxy::upstream::sse::BlockStart::ToolUse { id, name } = block else {
        panic!("expected tool_use block");
    };
    assert_eq!(id, "T1");
    assert_eq!(name, "get_weather");

    let json_deltas = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                SseEvent::ContentBlockDelta {
                    delta: kiro_relay::proxy::upstream::sse::BlockDelta::InputJsonDelta(_),
                    ..
                }
            )
        })
        .count();
    assert_eq!(json_deltas, 2);
    assert_eq!(stop_reason(&events), "tool_use");
}

#[test]
fn mixed_text_and_tool_assigns_sequential_indices() {
    let mut bytes = Vec::new();
    bytes.extend(event_frame(json!({"content": "Let me check."})));
    bytes.extend(event_frame(json!({"toolUseId": "T1", "name": "get_weather"})));
    bytes.extend(event_frame(json!({"stop": true, "toolUseId": "T1"})));

    let events = drive(&[bytes], true, false);
    assert_legal(&events);

    let starts: Vec<(usize, bool)> = events
        .iter()
        .filter_map(|e| match e {
            SseEvent::ContentBlockStart { index, block } => Some((
                *index,
                matches!(block, kiro_relay::proxy::upstream::sse::BlockStart::Text),
            )),
            _ => None,
        })
        .collect();
    assert_eq!(starts, vec![(0, true), (1, false)]);
    assert_eq!(stop_reason(&events), "tool_use");
}

#[test]
fn upstream_truncation_still_closes_stream() {
    // One start and one delta arrive, then the connection dies.
    let chunks = vec![event_frame(json!({"content": "partial answer"}))];
    let events = drive(&chunks, false, true);
    assert_legal(&events);
    assert_eq!(stop_reason(&events), "error");

    // The open text block was closed before the terminal events.
    let names: Vec<&str> = events.iter().map(|e| e.event_name()).collect();
    let stop_pos = names.iter().position(|n| *n == "content_block_stop").unwrap();
    let delta_pos = names.iter().position(|n| *n == "message_delta").unwrap();
    assert!(stop_pos < delta_pos);
}

#[test]
fn frames_split_at_awkward_boundaries_decode_identically() {
    let mut bytes = Vec::new();
    bytes.extend(event_frame(json!({"content": "alpha"})));
    bytes.extend(event_frame(json!({"toolUseId": "T1", "name": "f"})));
    bytes.extend(event_frame(json!({"input": "{}"})));
    bytes.extend(event_frame(json!({"stop": true})));
    bytes.extend(event_frame(json!({"content": "omega"})));

    let whole = drive(&[bytes.clone()], true, false);
    for chunk_size in [1usize, 3, 7, 16, 64] {
        let chunks: Vec<Vec<u8>> = bytes.chunks(chunk_size).map(<[u8]>::to_vec).collect();
        let rechunked = drive(&chunks, true, false);
        assert_eq!(rechunked, whole, "chunk size {} diverged", chunk_size);
    }
}

#[test]
fn exception_frame_surfaces_as_event() {
    let frame = encode_frame(
        "exception",
        Some("throttlingException"),
        br#"{"message":"rate exceeded"}"#,
    );
    let mut parser = EventStreamParser::new();
    let events = parser.feed(&frame).unwrap();
    assert_eq!(
        events,
        vec![UpstreamEvent::Exception { message: "rate exceeded".into() }]
    );
}

#[test]
fn sse_wire_encoding_matches_anthropic_format() {
    let chunks = vec![event_frame(json!({"content": "hi"}))];
    let events = drive(&chunks, false, false);
    let wire: String = events.iter().map(SseEvent::to_sse).collect();

    for (event_line, data_snippet) in [
        ("event: message_start", "\"type\":\"message_start\""),
        ("event: ping", "\"type\":\"ping\""),
        ("event: content_block_start", "\"type\":\"text\""),
        ("event: content_block_delta", "\"text_delta\""),
        ("event: content_block_stop", "\"type\":\"content_block_stop\""),
        ("event: message_delta", "\"stop_reason\":\"end_turn\""),
        ("event: message_stop", "\"type\":\"message_stop\""),
    ] {
        assert!(wire.contains(event_line), "missing {}", event_line);
        assert!(wire.contains(data_snippet), "missing {}", data_snippet);
    }
    assert!(wire.ends_with("\n\n"));
}
