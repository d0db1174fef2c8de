pub mod anthropic;
pub mod error;
pub mod openai;
pub mod sse;
pub mod upstream;

pub type JsonValue = serde_json::Value;
