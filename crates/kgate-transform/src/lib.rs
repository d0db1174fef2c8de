pub mod anthropic;
pub mod openai;
pub mod payload;
pub mod response;
pub mod sanitize;
pub mod session;
pub mod stream;
pub mod thinking;
pub mod tokens;
pub mod tools;

use serde::{Deserialize, Serialize};

/// Aggregated token accounting for one upstream exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_write_input_tokens: u64,
    pub credits: f64,
}

impl UsageTotals {
    pub fn total_input(&self) -> u64 {
        self.input_tokens + self.cache_read_input_tokens + self.cache_write_input_tokens
    }
}

/// One decoded upstream stream fragment, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamPiece {
    Text(String),
    Thinking(String),
    ToolUseStart {
        id: String,
        name: String,
    },
    ToolUseDelta {
        id: String,
        fragment: String,
    },
    /// Final parsed input for the tool call; always follows its start.
    ToolUseStop {
        id: String,
        input: serde_json::Value,
    },
    ContentLengthExceeded,
}
