//! Client-facing error envelopes for both dialects.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub r#type: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            r#type: kind.into(),
            message: message.into(),
        }
    }

    /// Anthropic envelope: `{"type":"error","error":{...}}`.
    pub fn anthropic_envelope(&self) -> Value {
        json!({
            "type": "error",
            "error": { "type": self.r#type, "message": self.message },
        })
    }

    /// OpenAI envelope: `{"error":{"message":...,"type":...}}`.
    pub fn openai_envelope(&self) -> Value {
        json!({
            "error": { "message": self.message, "type": self.r#type, "code": Value::Null },
        })
    }
}
