//! SSE re-encoder state machines for both downstream dialects.
//!
//! Both encoders consume decoded stream pieces in arrival order and produce
//! ready-to-send SSE frames. Tiny deltas are coalesced through a
//! micro-buffer so a chatty upstream does not turn into one syscall per
//! character.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use serde_json::Value;

use kgate_protocol::anthropic::{
    ContentDelta, MessageDeltaBody, MessageResponse, MessagesUsage, ResponseContentBlock,
    StreamEvent,
};
use kgate_protocol::openai::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, CompletionTokensDetails, CompletionUsage,
    FunctionCallDelta, PromptTokensDetails, ToolCallDelta,
};
use kgate_protocol::sse;

use crate::response::MAX_RETAINED_TEXT_BYTES;
use crate::tokens::estimate_tokens;
use crate::{StreamPiece, UsageTotals};

const COALESCE_MAX_BYTES: usize = 1024;
const COALESCE_MAX_DELAY: Duration = Duration::from_millis(16);

/// Holds frames until 1 KiB accumulates or 16 ms pass since the last flush.
#[derive(Debug)]
pub struct Coalescer {
    buf: BytesMut,
    last_flush: Instant,
}

impl Default for Coalescer {
    fn default() -> Self {
        Self::new()
    }
}

impl Coalescer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            last_flush: Instant::now(),
        }
    }

    pub fn push(&mut self, frame: Bytes) -> Option<Bytes> {
        self.buf.extend_from_slice(&frame);
        if self.buf.len() >= COALESCE_MAX_BYTES
            || self.last_flush.elapsed() >= COALESCE_MAX_DELAY
        {
            return self.flush();
        }
        None
    }

    pub fn flush(&mut self) -> Option<Bytes> {
        if self.buf.is_empty() {
            return None;
        }
        self.last_flush = Instant::now();
        Some(self.buf.split().freeze())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    ToolUse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initial,
    Started,
    Ended,
}

/// Outcome handed to the encoders at end of stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamClose {
    pub usage: UsageTotals,
}

// ---- Anthropic ----

pub struct AnthropicSseEncoder {
    message_id: String,
    model: String,
    phase: Phase,
    open_block: Option<BlockKind>,
    next_index: u32,
    saw_tool_use: bool,
    content_length_exceeded: bool,
    retained_text: String,
    retained_thinking: String,
    coalescer: Coalescer,
}

impl AnthropicSseEncoder {
    pub fn new(message_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            model: model.into(),
            phase: Phase::Initial,
            open_block: None,
            next_index: 0,
            saw_tool_use: false,
            content_length_exceeded: false,
            retained_text: String::new(),
            retained_thinking: String::new(),
            coalescer: Coalescer::new(),
        }
    }

    pub fn push(&mut self, piece: StreamPiece) -> Vec<Bytes> {
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        match piece {
            StreamPiece::Text(text) => {
                self.ensure_block(BlockKind::Text, &mut out);
                retain_capped(&mut self.retained_text, &text);
                self.emit(StreamEvent::ContentBlockDelta {
                    index: self.current_index(),
                    delta: ContentDelta::TextDelta { text },
                }, &mut out);
            }
            StreamPiece::Thinking(thinking) => {
                self.ensure_block(BlockKind::Thinking, &mut out);
                retain_capped(&mut self.retained_thinking, &thinking);
                self.emit(StreamEvent::ContentBlockDelta {
                    index: self.current_index(),
                    delta: ContentDelta::ThinkingDelta { thinking },
                }, &mut out);
            }
            StreamPiece::ToolUseStart { id, name } => {
                self.close_block(&mut out);
                self.saw_tool_use = true;
                let index = self.next_index;
                self.emit(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ResponseContentBlock::ToolUse {
                        id,
                        name,
                        input: Value::Object(serde_json::Map::new()),
                    },
                }, &mut out);
                self.open_block = Some(BlockKind::ToolUse);
            }
            StreamPiece::ToolUseDelta { id: _, fragment } => {
                if self.open_block == Some(BlockKind::ToolUse) {
                    self.emit(StreamEvent::ContentBlockDelta {
                        index: self.current_index(),
                        delta: ContentDelta::InputJsonDelta {
                            partial_json: fragment,
                        },
                    }, &mut out);
                }
            }
            StreamPiece::ToolUseStop { .. } => {
                if self.open_block == Some(BlockKind::ToolUse) {
                    self.close_block(&mut out);
                }
            }
            StreamPiece::ContentLengthExceeded => self.content_length_exceeded = true,
        }
        out
    }

    pub fn finish(&mut self, close: StreamClose) -> Vec<Bytes> {
        let mut out = Vec::new();
        if self.phase == Phase::Ended {
            return out;
        }
        self.ensure_started(&mut out);
        self.close_block(&mut out);

        let mut usage = close.usage;
        if usage.output_tokens == 0 {
            usage.output_tokens =
                estimate_tokens(&self.retained_text) + estimate_tokens(&self.retained_thinking);
        }
        let stop_reason = if self.content_length_exceeded {
            "max_tokens"
        } else if self.saw_tool_use {
            "tool_use"
        } else {
            "end_turn"
        };
        self.emit(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(stop_reason.to_string()),
                stop_sequence: None,
            },
            usage: MessagesUsage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                cache_read_input_tokens: (usage.cache_read_input_tokens > 0)
                    .then_some(usage.cache_read_input_tokens),
                cache_creation_input_tokens: (usage.cache_write_input_tokens > 0)
                    .then_some(usage.cache_write_input_tokens),
            },
        }, &mut out);
        self.emit(StreamEvent::MessageStop, &mut out);
        self.phase = Phase::Ended;
        if let Some(tail) = self.coalescer.flush() {
            out.push(tail);
        }
        out
    }

    /// Mid-stream failure: surface an error event, then close the stream
    /// shape correctly so clients never see a truncated frame sequence.
    pub fn fail(&mut self, kind: &str, message: &str) -> Vec<Bytes> {
        let mut out = Vec::new();
        if self.phase == Phase::Ended {
            return out;
        }
        self.ensure_started(&mut out);
        self.close_block(&mut out);
        self.emit(StreamEvent::Error {
            error: kgate_protocol::error::ErrorBody::new(kind, message),
        }, &mut out);
        self.emit(StreamEvent::MessageStop, &mut out);
        self.phase = Phase::Ended;
        if let Some(tail) = self.coalescer.flush() {
            out.push(tail);
        }
        out
    }

    pub fn ping(&mut self) -> Vec<Bytes> {
        let mut out = Vec::new();
        if self.phase != Phase::Ended {
            if let Some(pending) = self.coalescer.flush() {
                out.push(pending);
            }
            if let Some(frame) = sse::named_event_frame(&StreamEvent::Ping) {
                out.push(frame);
            }
        }
        out
    }

    fn ensure_started(&mut self, out: &mut Vec<Bytes>) {
        if self.phase != Phase::Initial {
            return;
        }
        self.phase = Phase::Started;
        let message = MessageResponse {
            id: self.message_id.clone(),
            r#type: "message".to_string(),
            role: "assistant".to_string(),
            model: self.model.clone(),
            content: Vec::new(),
            stop_reason: None,
            stop_sequence: None,
            usage: MessagesUsage::default(),
        };
        self.emit(StreamEvent::MessageStart { message }, out);
    }

    fn ensure_block(&mut self, kind: BlockKind, out: &mut Vec<Bytes>) {
        if self.open_block == Some(kind) {
            return;
        }
        self.close_block(out);
        let index = self.next_index;
        let content_block = match kind {
            BlockKind::Text => ResponseContentBlock::Text {
                text: String::new(),
            },
            BlockKind::Thinking => ResponseContentBlock::Thinking {
                thinking: String::new(),
                signature: None,
            },
            BlockKind::ToolUse => unreachable!("tool blocks open via ToolUseStart"),
        };
        self.emit(StreamEvent::ContentBlockStart {
            index,
            content_block,
        }, out);
        self.open_block = Some(kind);
    }

    fn close_block(&mut self, out: &mut Vec<Bytes>) {
        if self.open_block.take().is_some() {
            let index = self.next_index;
            self.emit(StreamEvent::ContentBlockStop { index }, out);
            self.next_index += 1;
        }
    }

    fn current_index(&self) -> u32 {
        self.next_index
    }

    fn emit(&mut self, event: StreamEvent, out: &mut Vec<Bytes>) {
        if let Some(frame) = sse::named_event_frame(&event)
            && let Some(flushed) = self.coalescer.push(frame)
        {
            out.push(flushed);
        }
    }
}

// ---- OpenAI ----

pub struct OpenAiSseEncoder {
    id: String,
    model: String,
    created: i64,
    sent_role: bool,
    finished: bool,
    tool_indices: HashMap<String, u32>,
    saw_tool_use: bool,
    content_length_exceeded: bool,
    retained_text: String,
    retained_thinking: String,
    coalescer: Coalescer,
}

impl OpenAiSseEncoder {
    pub fn new(id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            created,
            sent_role: false,
            finished: false,
            tool_indices: HashMap::new(),
            saw_tool_use: false,
            content_length_exceeded: false,
            retained_text: String::new(),
            retained_thinking: String::new(),
            coalescer: Coalescer::new(),
        }
    }

    pub fn push(&mut self, piece: StreamPiece) -> Vec<Bytes> {
        let mut out = Vec::new();
        let delta = match piece {
            StreamPiece::Text(text) => {
                retain_capped(&mut self.retained_text, &text);
                Some(ChunkDelta {
                    content: Some(text),
                    ..Default::default()
                })
            }
            StreamPiece::Thinking(thinking) => {
                retain_capped(&mut self.retained_thinking, &thinking);
                Some(ChunkDelta {
                    reasoning_content: Some(thinking),
                    ..Default::default()
                })
            }
            StreamPiece::ToolUseStart { id, name } => {
                self.saw_tool_use = true;
                let index = self.tool_indices.len() as u32;
                self.tool_indices.insert(id.clone(), index);
                Some(ChunkDelta {
                    tool_calls: Some(vec![ToolCallDelta {
                        index,
                        id: Some(id),
                        r#type: Some("function".to_string()),
                        function: Some(FunctionCallDelta {
                            name: Some(name),
                            arguments: Some(String::new()),
                        }),
                    }]),
                    ..Default::default()
                })
            }
            StreamPiece::ToolUseDelta { id, fragment } => {
                self.tool_indices.get(&id).copied().map(|index| ChunkDelta {
                    tool_calls: Some(vec![ToolCallDelta {
                        index,
                        id: None,
                        r#type: None,
                        function: Some(FunctionCallDelta {
                            name: None,
                            arguments: Some(fragment),
                        }),
                    }]),
                    ..Default::default()
                })
            }
            StreamPiece::ToolUseStop { .. } => None,
            StreamPiece::ContentLengthExceeded => {
                self.content_length_exceeded = true;
                None
            }
        };

        if let Some(mut delta) = delta {
            if !self.sent_role {
                delta.role = Some("assistant".to_string());
                self.sent_role = true;
            }
            self.emit_chunk(delta, None, None, &mut out);
        }
        out
    }

    pub fn finish(&mut self, close: StreamClose) -> Vec<Bytes> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.finished = true;

        let mut usage = close.usage;
        if usage.output_tokens == 0 {
            usage.output_tokens =
                estimate_tokens(&self.retained_text) + estimate_tokens(&self.retained_thinking);
        }
        let finish_reason = if self.content_length_exceeded {
            "length"
        } else if self.saw_tool_use {
            "tool_calls"
        } else {
            "stop"
        };
        let reasoning_tokens = estimate_tokens(&self.retained_thinking);
        let completion_usage = CompletionUsage {
            prompt_tokens: usage.total_input(),
            completion_tokens: usage.output_tokens,
            total_tokens: usage.total_input() + usage.output_tokens,
            prompt_tokens_details: (usage.cache_read_input_tokens > 0).then(|| {
                PromptTokensDetails {
                    cached_tokens: usage.cache_read_input_tokens,
                }
            }),
            completion_tokens_details: (!self.retained_thinking.is_empty())
                .then_some(CompletionTokensDetails { reasoning_tokens }),
        };

        let mut delta = ChunkDelta::default();
        if !self.sent_role {
            delta.role = Some("assistant".to_string());
            self.sent_role = true;
        }
        self.emit_chunk(
            delta,
            Some(finish_reason.to_string()),
            Some(completion_usage),
            &mut out,
        );
        if let Some(flushed) = self.coalescer.push(Bytes::from_static(sse::DONE_FRAME)) {
            out.push(flushed);
        }
        if let Some(tail) = self.coalescer.flush() {
            out.push(tail);
        }
        out
    }

    /// Mid-stream failure: emit an error payload, then terminate the stream.
    pub fn fail(&mut self, kind: &str, message: &str) -> Vec<Bytes> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.finished = true;
        let body = kgate_protocol::error::ErrorBody::new(kind, message);
        if let Some(frame) = sse::data_frame(&body.openai_envelope())
            && let Some(flushed) = self.coalescer.push(frame)
        {
            out.push(flushed);
        }
        if let Some(flushed) = self.coalescer.push(Bytes::from_static(sse::DONE_FRAME)) {
            out.push(flushed);
        }
        if let Some(tail) = self.coalescer.flush() {
            out.push(tail);
        }
        out
    }

    pub fn ping(&mut self) -> Vec<Bytes> {
        let mut out = Vec::new();
        if !self.finished {
            if let Some(pending) = self.coalescer.flush() {
                out.push(pending);
            }
            out.push(Bytes::from_static(sse::KEEPALIVE_FRAME));
        }
        out
    }

    fn emit_chunk(
        &mut self,
        delta: ChunkDelta,
        finish_reason: Option<String>,
        usage: Option<CompletionUsage>,
        out: &mut Vec<Bytes>,
    ) {
        let chunk = ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        };
        if let Some(frame) = sse::data_frame(&chunk)
            && let Some(flushed) = self.coalescer.push(frame)
        {
            out.push(flushed);
        }
    }
}

fn retain_capped(buf: &mut String, chunk: &str) {
    let remaining = MAX_RETAINED_TEXT_BYTES.saturating_sub(buf.len());
    if remaining == 0 {
        return;
    }
    if chunk.len() <= remaining {
        buf.push_str(chunk);
    } else {
        let mut cut = remaining;
        while cut > 0 && !chunk.is_char_boundary(cut) {
            cut -= 1;
        }
        buf.push_str(&chunk[..cut]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_events(frames: &[Bytes]) -> Vec<StreamEvent> {
        let joined: Vec<u8> = frames.iter().flat_map(|b| b.to_vec()).collect();
        let text = String::from_utf8(joined).unwrap();
        text.split("\n\n")
            .filter(|block| !block.trim().is_empty())
            .filter_map(|block| {
                let data = block
                    .lines()
                    .find_map(|line| line.strip_prefix("data: "))?;
                serde_json::from_str::<StreamEvent>(data).ok()
            })
            .collect()
    }

    fn decode_chunks(frames: &[Bytes]) -> Vec<ChatCompletionChunk> {
        let joined: Vec<u8> = frames.iter().flat_map(|b| b.to_vec()).collect();
        let text = String::from_utf8(joined).unwrap();
        text.split("\n\n")
            .filter_map(|block| block.strip_prefix("data: "))
            .filter(|data| data.trim() != "[DONE]")
            .filter_map(|data| serde_json::from_str::<ChatCompletionChunk>(data).ok())
            .collect()
    }

    fn assert_anthropic_trace_valid(events: &[StreamEvent]) {
        let starts = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::MessageStart { .. }))
            .count();
        let stops = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::MessageStop))
            .count();
        assert_eq!(starts, 1, "exactly one message_start");
        assert_eq!(stops, 1, "exactly one message_stop");
        assert!(matches!(events.last(), Some(StreamEvent::MessageStop)));

        let mut open: Option<u32> = None;
        let mut last_index: Option<u32> = None;
        for event in events {
            match event {
                StreamEvent::ContentBlockStart { index, .. } => {
                    assert!(open.is_none(), "one block open at a time");
                    if let Some(last) = last_index {
                        assert!(*index > last, "indices strictly increasing");
                    }
                    open = Some(*index);
                    last_index = Some(*index);
                }
                StreamEvent::ContentBlockStop { index } => {
                    assert_eq!(open.take(), Some(*index), "balanced start/stop");
                }
                StreamEvent::ContentBlockDelta { index, .. } => {
                    assert_eq!(open, Some(*index));
                }
                _ => {}
            }
        }
        assert!(open.is_none(), "all blocks closed");
    }

    #[test]
    fn thinking_then_text_produces_two_blocks() {
        let mut encoder = AnthropicSseEncoder::new("msg_1", "m");
        let mut frames = Vec::new();
        frames.extend(encoder.push(StreamPiece::Thinking("secret".to_string())));
        frames.extend(encoder.push(StreamPiece::Text("answer".to_string())));
        frames.extend(encoder.finish(StreamClose::default()));
        let events = decode_events(&frames);
        assert_anthropic_trace_valid(&events);

        let kinds: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockStart { content_block, .. } => Some(match content_block {
                    ResponseContentBlock::Thinking { .. } => "thinking",
                    ResponseContentBlock::Text { .. } => "text",
                    ResponseContentBlock::ToolUse { .. } => "tool_use",
                }),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec!["thinking", "text"]);
    }

    #[test]
    fn tool_use_sets_stop_reason() {
        let mut encoder = AnthropicSseEncoder::new("msg_1", "m");
        let mut frames = Vec::new();
        frames.extend(encoder.push(StreamPiece::ToolUseStart {
            id: "u1".to_string(),
            name: "t".to_string(),
        }));
        frames.extend(encoder.push(StreamPiece::ToolUseDelta {
            id: "u1".to_string(),
            fragment: "{\"x\":1}".to_string(),
        }));
        frames.extend(encoder.push(StreamPiece::ToolUseStop {
            id: "u1".to_string(),
            input: serde_json::json!({"x": 1}),
        }));
        frames.extend(encoder.finish(StreamClose::default()));
        let events = decode_events(&frames);
        assert_anthropic_trace_valid(&events);
        let stop_reason = events.iter().find_map(|e| match e {
            StreamEvent::MessageDelta { delta, .. } => delta.stop_reason.clone(),
            _ => None,
        });
        assert_eq!(stop_reason.as_deref(), Some("tool_use"));
    }

    #[test]
    fn empty_stream_still_emits_valid_trace() {
        let mut encoder = AnthropicSseEncoder::new("msg_1", "m");
        let frames = encoder.finish(StreamClose::default());
        let events = decode_events(&frames);
        assert_anthropic_trace_valid(&events);
    }

    #[test]
    fn error_path_still_terminates() {
        let mut encoder = AnthropicSseEncoder::new("msg_1", "m");
        let mut frames = Vec::new();
        frames.extend(encoder.push(StreamPiece::Text("partial".to_string())));
        frames.extend(encoder.fail("api_error", "upstream died"));
        let events = decode_events(&frames);
        assert!(matches!(events.last(), Some(StreamEvent::MessageStop)));
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Error { .. })));
        // finish after fail is a no-op
        assert!(encoder.finish(StreamClose::default()).is_empty());
    }

    #[test]
    fn openai_first_chunk_carries_role() {
        let mut encoder = OpenAiSseEncoder::new("c1", "m", 0);
        let mut frames = Vec::new();
        frames.extend(encoder.push(StreamPiece::Text("hi".to_string())));
        frames.extend(encoder.finish(StreamClose::default()));
        let chunks = decode_chunks(&frames);
        assert_eq!(chunks[0].choices[0].delta.role.as_deref(), Some("assistant"));
        assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("hi"));
        let last = chunks.last().unwrap();
        assert_eq!(last.choices[0].finish_reason.as_deref(), Some("stop"));
        assert!(last.usage.is_some());
    }

    #[test]
    fn openai_tool_calls_keep_consistent_indices() {
        let mut encoder = OpenAiSseEncoder::new("c1", "m", 0);
        let mut frames = Vec::new();
        frames.extend(encoder.push(StreamPiece::ToolUseStart {
            id: "a".to_string(),
            name: "first".to_string(),
        }));
        frames.extend(encoder.push(StreamPiece::ToolUseDelta {
            id: "a".to_string(),
            fragment: "{}".to_string(),
        }));
        frames.extend(encoder.push(StreamPiece::ToolUseStart {
            id: "b".to_string(),
            name: "second".to_string(),
        }));
        frames.extend(encoder.push(StreamPiece::ToolUseDelta {
            id: "b".to_string(),
            fragment: "{}".to_string(),
        }));
        frames.extend(encoder.finish(StreamClose::default()));
        let chunks = decode_chunks(&frames);

        let mut seen: Vec<(u32, Option<String>)> = Vec::new();
        for chunk in &chunks {
            for call in chunk.choices[0].delta.tool_calls.iter().flatten() {
                seen.push((call.index, call.id.clone()));
            }
        }
        assert_eq!(seen[0], (0, Some("a".to_string())));
        assert_eq!(seen[1], (0, None));
        assert_eq!(seen[2], (1, Some("b".to_string())));
        assert_eq!(seen[3], (1, None));
        assert_eq!(
            chunks.last().unwrap().choices[0].finish_reason.as_deref(),
            Some("tool_calls")
        );
    }

    #[test]
    fn openai_terminates_with_done() {
        let mut encoder = OpenAiSseEncoder::new("c1", "m", 0);
        let mut frames = Vec::new();
        frames.extend(encoder.push(StreamPiece::Text("x".to_string())));
        frames.extend(encoder.finish(StreamClose::default()));
        let joined: Vec<u8> = frames.iter().flat_map(|b| b.to_vec()).collect();
        let text = String::from_utf8(joined).unwrap();
        assert!(text.ends_with("data: [DONE]\n\n"));
    }

    #[test]
    fn length_finish_reason_on_overflow() {
        let mut encoder = OpenAiSseEncoder::new("c1", "m", 0);
        let mut frames = Vec::new();
        frames.extend(encoder.push(StreamPiece::Text("x".to_string())));
        frames.extend(encoder.push(StreamPiece::ContentLengthExceeded));
        frames.extend(encoder.finish(StreamClose::default()));
        let chunks = decode_chunks(&frames);
        assert_eq!(
            chunks.last().unwrap().choices[0].finish_reason.as_deref(),
            Some("length")
        );
    }

    #[test]
    fn coalescer_flushes_on_size() {
        let mut coalescer = Coalescer::new();
        let big = Bytes::from(vec![b'x'; COALESCE_MAX_BYTES]);
        let flushed = coalescer.push(big).unwrap();
        assert_eq!(flushed.len(), COALESCE_MAX_BYTES);
        assert!(coalescer.flush().is_none());
    }

    #[test]
    fn coalescer_flushes_after_delay() {
        let mut coalescer = Coalescer::new();
        std::thread::sleep(COALESCE_MAX_DELAY + Duration::from_millis(1));
        // Delay window elapsed, so even a tiny frame flushes.
        assert!(coalescer.push(Bytes::from_static(b"a")).is_some());
    }
}
