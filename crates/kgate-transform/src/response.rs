//! Accumulation of decoded stream pieces into non-streaming responses.

use serde_json::Value;

use kgate_protocol::anthropic::{MessageResponse, MessagesUsage, ResponseContentBlock};
use kgate_protocol::openai::{
    ChatChoice, ChatCompletion, CompletionTokensDetails, CompletionUsage, FunctionCall,
    PromptTokensDetails, ResponseMessage, ToolCall,
};

use crate::tokens::estimate_tokens;
use crate::{StreamPiece, UsageTotals};

/// Retained response text is capped; overflow is counted but not kept.
pub const MAX_RETAINED_TEXT_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
struct CollectedToolUse {
    id: String,
    name: String,
    fragments: String,
    input: Option<Value>,
}

#[derive(Debug, Default)]
pub struct ResponseCollector {
    text: String,
    thinking: String,
    tool_uses: Vec<CollectedToolUse>,
    usage: UsageTotals,
    content_length_exceeded: bool,
}

impl ResponseCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, piece: StreamPiece) {
        match piece {
            StreamPiece::Text(text) => append_capped(&mut self.text, &text),
            StreamPiece::Thinking(text) => append_capped(&mut self.thinking, &text),
            StreamPiece::ToolUseStart { id, name } => {
                self.tool_uses.push(CollectedToolUse {
                    id,
                    name,
                    fragments: String::new(),
                    input: None,
                });
            }
            StreamPiece::ToolUseDelta { id, fragment } => {
                if let Some(tool) = self.tool_uses.iter_mut().find(|t| t.id == id) {
                    append_capped(&mut tool.fragments, &fragment);
                }
            }
            StreamPiece::ToolUseStop { id, input } => {
                if let Some(tool) = self.tool_uses.iter_mut().find(|t| t.id == id) {
                    tool.input = Some(input);
                }
            }
            StreamPiece::ContentLengthExceeded => self.content_length_exceeded = true,
        }
    }

    pub fn set_usage(&mut self, mut usage: UsageTotals) {
        if usage.output_tokens == 0 {
            usage.output_tokens = estimate_tokens(&self.text) + estimate_tokens(&self.thinking);
        }
        self.usage = usage;
    }

    pub fn has_tool_use(&self) -> bool {
        !self.tool_uses.is_empty()
    }

    pub fn into_openai(self, id: String, model: String, created: i64) -> ChatCompletion {
        let finish_reason = if self.content_length_exceeded {
            "length"
        } else if self.has_tool_use() {
            "tool_calls"
        } else {
            "stop"
        };

        let reasoning_tokens = estimate_tokens(&self.thinking);
        let tool_calls: Vec<ToolCall> = self
            .tool_uses
            .iter()
            .map(|tool| ToolCall {
                id: tool.id.clone(),
                r#type: Some("function".to_string()),
                function: FunctionCall {
                    name: tool.name.clone(),
                    arguments: tool_arguments(tool),
                },
            })
            .collect();

        let usage = CompletionUsage {
            prompt_tokens: self.usage.total_input(),
            completion_tokens: self.usage.output_tokens,
            total_tokens: self.usage.total_input() + self.usage.output_tokens,
            prompt_tokens_details: (self.usage.cache_read_input_tokens > 0).then(|| {
                PromptTokensDetails {
                    cached_tokens: self.usage.cache_read_input_tokens,
                }
            }),
            completion_tokens_details: (reasoning_tokens > 0 && !self.thinking.is_empty())
                .then_some(CompletionTokensDetails { reasoning_tokens }),
        };

        ChatCompletion {
            id,
            object: "chat.completion".to_string(),
            created,
            model,
            choices: vec![ChatChoice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content: Some(self.text),
                    reasoning_content: (!self.thinking.is_empty()).then_some(self.thinking),
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                },
                finish_reason: Some(finish_reason.to_string()),
            }],
            usage,
        }
    }

    pub fn into_anthropic(self, id: String, model: String) -> MessageResponse {
        let stop_reason = if self.content_length_exceeded {
            "max_tokens"
        } else if self.has_tool_use() {
            "tool_use"
        } else {
            "end_turn"
        };

        let mut content = Vec::new();
        if !self.thinking.is_empty() {
            content.push(ResponseContentBlock::Thinking {
                thinking: self.thinking.clone(),
                signature: None,
            });
        }
        if !self.text.is_empty() {
            content.push(ResponseContentBlock::Text {
                text: self.text.clone(),
            });
        }
        for tool in &self.tool_uses {
            content.push(ResponseContentBlock::ToolUse {
                id: tool.id.clone(),
                name: tool.name.clone(),
                input: tool
                    .input
                    .clone()
                    .unwrap_or(Value::Object(serde_json::Map::new())),
            });
        }

        MessageResponse {
            id,
            r#type: "message".to_string(),
            role: "assistant".to_string(),
            model,
            content,
            stop_reason: Some(stop_reason.to_string()),
            stop_sequence: None,
            usage: MessagesUsage {
                input_tokens: self.usage.input_tokens,
                output_tokens: self.usage.output_tokens,
                cache_read_input_tokens: (self.usage.cache_read_input_tokens > 0)
                    .then_some(self.usage.cache_read_input_tokens),
                cache_creation_input_tokens: (self.usage.cache_write_input_tokens > 0)
                    .then_some(self.usage.cache_write_input_tokens),
            },
        }
    }
}

fn tool_arguments(tool: &CollectedToolUse) -> String {
    match &tool.input {
        Some(input) => serde_json::to_string(input).unwrap_or_else(|_| "{}".to_string()),
        None if !tool.fragments.is_empty() => tool.fragments.clone(),
        None => "{}".to_string(),
    }
}

fn append_capped(buf: &mut String, chunk: &str) {
    let remaining = MAX_RETAINED_TEXT_BYTES.saturating_sub(buf.len());
    if remaining == 0 {
        return;
    }
    if chunk.len() <= remaining {
        buf.push_str(chunk);
    } else {
        // Cut on a char boundary at or below the budget.
        let mut cut = remaining;
        while cut > 0 && !chunk.is_char_boundary(cut) {
            cut -= 1;
        }
        buf.push_str(&chunk[..cut]);
    }
}
