//! Anthropic messages request → canonical upstream payload.

use serde_json::Value;

use kgate_protocol::anthropic::{ContentBlockParam, MessageContent, MessageParam, MessagesRequest};
use kgate_protocol::upstream::{
    AssistantResponseMessage, AssistantToolUse, HistoryEntry, ImageBlock, ImageBytes, ToolResult,
    ToolResultContent, UserInputMessage, UserInputMessageContext,
};

use crate::payload::RequestParts;
use crate::tools::ToolInput;

pub fn request_parts(request: &MessagesRequest) -> RequestParts {
    let entries = request.messages.iter().map(map_message).collect();

    let tools = request
        .tools
        .iter()
        .flatten()
        .map(|tool| ToolInput {
            name: tool.name.clone(),
            description: tool.description.clone(),
            schema: tool.input_schema.clone(),
        })
        .collect();

    RequestParts {
        system: request.system.as_ref().map(|s| s.joined_text()),
        entries,
        tools,
    }
}

pub fn session_id(request: &MessagesRequest) -> Option<&str> {
    request
        .metadata
        .as_ref()
        .and_then(|m| m.user_id.as_deref())
}

fn map_message(message: &MessageParam) -> HistoryEntry {
    if message.role == "assistant" {
        map_assistant(message)
    } else {
        map_user(message)
    }
}

fn map_user(message: &MessageParam) -> HistoryEntry {
    let mut text_parts: Vec<String> = Vec::new();
    let mut images: Vec<ImageBlock> = Vec::new();
    let mut results: Vec<ToolResult> = Vec::new();

    match &message.content {
        MessageContent::Text(text) => {
            if !text.is_empty() {
                text_parts.push(text.clone());
            }
        }
        MessageContent::Blocks(blocks) => {
            for block in blocks {
                match block.r#type.as_str() {
                    "text" => {
                        if let Some(text) = &block.text
                            && !text.is_empty()
                        {
                            text_parts.push(text.clone());
                        }
                    }
                    "image" => {
                        if let Some(image) = map_image(block) {
                            images.push(image);
                        }
                    }
                    "tool_result" => {
                        if let Some(result) = map_tool_result(block) {
                            results.push(result);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    let context = if results.is_empty() {
        None
    } else {
        Some(UserInputMessageContext {
            tool_results: Some(results),
            tools: None,
        })
    };

    HistoryEntry::User {
        user_input_message: UserInputMessage {
            content: text_parts.join("\n"),
            model_id: None,
            origin: None,
            images: if images.is_empty() { None } else { Some(images) },
            inference_config: None,
            user_input_message_context: context,
        },
    }
}

fn map_assistant(message: &MessageParam) -> HistoryEntry {
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_uses: Vec<AssistantToolUse> = Vec::new();

    match &message.content {
        MessageContent::Text(text) => {
            if !text.is_empty() {
                text_parts.push(text.clone());
            }
        }
        MessageContent::Blocks(blocks) => {
            for block in blocks {
                match block.r#type.as_str() {
                    "text" => {
                        if let Some(text) = &block.text
                            && !text.is_empty()
                        {
                            text_parts.push(text.clone());
                        }
                    }
                    "tool_use" => {
                        if let (Some(id), Some(name)) = (&block.id, &block.name) {
                            tool_uses.push(AssistantToolUse {
                                tool_use_id: id.clone(),
                                name: name.clone(),
                                input: block.input.clone().unwrap_or(Value::Object(
                                    serde_json::Map::new(),
                                )),
                            });
                        }
                    }
                    // Thinking blocks are model-internal; they never go back
                    // upstream.
                    "thinking" | "redacted_thinking" => {}
                    _ => {}
                }
            }
        }
    }

    HistoryEntry::Assistant {
        assistant_response_message: AssistantResponseMessage {
            content: text_parts.join("\n"),
            tool_uses: if tool_uses.is_empty() {
                None
            } else {
                Some(tool_uses)
            },
        },
    }
}

fn map_image(block: &ContentBlockParam) -> Option<ImageBlock> {
    let source = block.source.as_ref()?;
    if source.r#type != "base64" {
        return None;
    }
    let data = source.data.clone()?;
    let format = source
        .media_type
        .as_deref()
        .and_then(|m| m.strip_prefix("image/"))
        .map(|f| match f {
            "jpg" => "jpeg".to_string(),
            other => other.to_string(),
        })?;
    Some(ImageBlock {
        format,
        source: ImageBytes { bytes: data },
    })
}

fn map_tool_result(block: &ContentBlockParam) -> Option<ToolResult> {
    let id = block.tool_use_id.clone()?;
    let status = if block.is_error.unwrap_or(false) {
        "error"
    } else {
        "success"
    };
    let content = match &block.content {
        Some(Value::String(text)) => vec![ToolResultContent::text(text.clone())],
        Some(Value::Array(items)) => {
            let text: Vec<String> = items
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .map(str::to_string)
                .collect();
            if text.is_empty() {
                vec![ToolResultContent {
                    text: None,
                    json: Some(Value::Array(items.clone())),
                }]
            } else {
                vec![ToolResultContent::text(text.join("\n"))]
            }
        }
        Some(other) => vec![ToolResultContent {
            text: None,
            json: Some(other.clone()),
        }],
        None => vec![ToolResultContent::text("")],
    };
    Some(ToolResult {
        tool_use_id: id,
        status: status.to_string(),
        content,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn request(messages: Vec<MessageParam>) -> MessagesRequest {
        MessagesRequest {
            model: "claude-sonnet-4-5".to_string(),
            messages,
            max_tokens: Some(512),
            system: None,
            tools: None,
            tool_choice: None,
            thinking: None,
            metadata: None,
            stream: None,
            temperature: None,
            top_p: None,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn tool_use_and_result_blocks_map() {
        let messages: Vec<MessageParam> = serde_json::from_value(json!([
            { "role": "user", "content": "run it" },
            { "role": "assistant", "content": [
                { "type": "text", "text": "on it" },
                { "type": "tool_use", "id": "u1", "name": "t", "input": { "x": 1 } }
            ]},
            { "role": "user", "content": [
                { "type": "tool_result", "tool_use_id": "u1", "content": "done" }
            ]}
        ]))
        .unwrap();
        let parts = request_parts(&request(messages));
        assert_eq!(parts.entries.len(), 3);
        match &parts.entries[1] {
            HistoryEntry::Assistant {
                assistant_response_message,
            } => {
                let uses = assistant_response_message.tool_uses.as_ref().unwrap();
                assert_eq!(uses[0].tool_use_id, "u1");
                assert_eq!(uses[0].input["x"], 1);
            }
            _ => panic!("expected assistant"),
        }
        match &parts.entries[2] {
            HistoryEntry::User { user_input_message } => {
                let results = user_input_message
                    .user_input_message_context
                    .as_ref()
                    .and_then(|ctx| ctx.tool_results.as_ref())
                    .unwrap();
                assert_eq!(results[0].content[0].text.as_deref(), Some("done"));
            }
            _ => panic!("expected user"),
        }
    }

    #[test]
    fn error_results_carry_status() {
        let block: ContentBlockParam = serde_json::from_value(json!({
            "type": "tool_result", "tool_use_id": "u1",
            "content": "boom", "is_error": true
        }))
        .unwrap();
        let result = map_tool_result(&block).unwrap();
        assert_eq!(result.status, "error");
    }

    #[test]
    fn thinking_blocks_are_dropped() {
        let messages: Vec<MessageParam> = serde_json::from_value(json!([
            { "role": "assistant", "content": [
                { "type": "thinking", "thinking": "internal" },
                { "type": "text", "text": "visible" }
            ]}
        ]))
        .unwrap();
        let parts = request_parts(&request(messages));
        assert_eq!(parts.entries[0].text(), "visible");
    }

    #[test]
    fn base64_images_map_with_format_normalization() {
        let block: ContentBlockParam = serde_json::from_value(json!({
            "type": "image",
            "source": { "type": "base64", "media_type": "image/jpg", "data": "aGk=" }
        }))
        .unwrap();
        let image = map_image(&block).unwrap();
        assert_eq!(image.format, "jpeg");
    }

    #[test]
    fn session_id_reads_metadata() {
        let mut req = request(Vec::new());
        req.metadata = Some(kgate_protocol::anthropic::RequestMetadata {
            user_id: Some("sess-9".to_string()),
        });
        assert_eq!(session_id(&req), Some("sess-9"));
    }
}
