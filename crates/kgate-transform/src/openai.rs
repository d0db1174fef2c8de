//! OpenAI chat-completions request → canonical upstream payload.

use serde_json::Value;

use kgate_protocol::openai::{ChatCompletionRequest, ChatMessage, MessageContent};
use kgate_protocol::upstream::{
    AssistantResponseMessage, AssistantToolUse, HistoryEntry, ImageBlock, ImageBytes,
    ToolResult, ToolResultContent, UserInputMessage, UserInputMessageContext,
};

use crate::payload::{RequestParts, parse_image_data_url};
use crate::tools::ToolInput;

pub fn request_parts(request: &ChatCompletionRequest) -> RequestParts {
    let mut system_texts: Vec<String> = Vec::new();
    let mut entries: Vec<HistoryEntry> = Vec::new();
    let mut pending_results: Vec<ToolResult> = Vec::new();

    for message in &request.messages {
        match message.role.as_str() {
            "system" | "developer" => {
                if let Some(content) = &message.content {
                    let text = content.joined_text();
                    if !text.is_empty() {
                        system_texts.push(text);
                    }
                }
            }
            "tool" => {
                if let Some(result) = map_tool_message(message) {
                    pending_results.push(result);
                }
            }
            "assistant" => {
                entries.push(map_assistant_message(message));
            }
            // Unknown roles are treated as user turns so content survives.
            _ => {
                entries.push(map_user_message(message, std::mem::take(&mut pending_results)));
            }
        }
    }

    if !pending_results.is_empty() {
        entries.push(user_entry_with_results(String::new(), None, pending_results));
    }

    let tools = request
        .tools
        .iter()
        .flatten()
        .map(|tool| ToolInput {
            name: tool.function.name.clone(),
            description: tool.function.description.clone(),
            schema: tool.function.parameters.clone(),
        })
        .collect();

    RequestParts {
        system: if system_texts.is_empty() {
            None
        } else {
            Some(system_texts.join("\n"))
        },
        entries,
        tools,
    }
}

/// Session identifier used to derive a stable conversation id.
pub fn session_id(request: &ChatCompletionRequest) -> Option<&str> {
    request.user.as_deref()
}

fn map_user_message(message: &ChatMessage, results: Vec<ToolResult>) -> HistoryEntry {
    let mut text_parts: Vec<String> = Vec::new();
    let mut images: Vec<ImageBlock> = Vec::new();

    match &message.content {
        Some(MessageContent::Text(text)) => {
            if !text.is_empty() {
                text_parts.push(text.clone());
            }
        }
        Some(MessageContent::Parts(parts)) => {
            for part in parts {
                if let Some(text) = &part.text
                    && !text.is_empty()
                {
                    text_parts.push(text.clone());
                }
                if let Some(image) = &part.image_url
                    && let Some((format, data)) = parse_image_data_url(&image.url)
                {
                    images.push(ImageBlock {
                        format,
                        source: ImageBytes { bytes: data },
                    });
                }
            }
        }
        None => {}
    }

    user_entry_with_results(
        text_parts.join("\n"),
        if images.is_empty() { None } else { Some(images) },
        results,
    )
}

fn user_entry_with_results(
    content: String,
    images: Option<Vec<ImageBlock>>,
    results: Vec<ToolResult>,
) -> HistoryEntry {
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
            content,
            model_id: None,
            origin: None,
            images,
            inference_config: None,
            user_input_message_context: context,
        },
    }
}

fn map_assistant_message(message: &ChatMessage) -> HistoryEntry {
    let content = message
        .content
        .as_ref()
        .map(MessageContent::joined_text)
        .unwrap_or_default();

    let tool_uses: Vec<AssistantToolUse> = message
        .tool_calls
        .iter()
        .flatten()
        .map(|call| AssistantToolUse {
            tool_use_id: call.id.clone(),
            name: call.function.name.clone(),
            input: parse_arguments(&call.function.arguments),
        })
        .collect();

    HistoryEntry::Assistant {
        assistant_response_message: AssistantResponseMessage {
            content,
            tool_uses: if tool_uses.is_empty() {
                None
            } else {
                Some(tool_uses)
            },
        },
    }
}

fn map_tool_message(message: &ChatMessage) -> Option<ToolResult> {
    let id = message.tool_call_id.clone()?;
    let text = message
        .content
        .as_ref()
        .map(MessageContent::joined_text)
        .unwrap_or_default();
    Some(ToolResult {
        tool_use_id: id,
        status: "success".to_string(),
        content: vec![ToolResultContent::text(text)],
    })
}

fn parse_arguments(arguments: &str) -> Value {
    match serde_json::from_str::<Value>(arguments) {
        Ok(value @ Value::Object(_)) => value,
        Ok(other) => serde_json::json!({ "arguments": other }),
        Err(_) => serde_json::json!({ "arguments": arguments }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn message(role: &str, text: &str) -> ChatMessage {
        ChatMessage {
            role: role.to_string(),
            content: Some(MessageContent::Text(text.to_string())),
            tool_calls: None,
            tool_call_id: None,
            name: None,
            extra: BTreeMap::new(),
        }
    }

    fn request(messages: Vec<ChatMessage>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "claude-sonnet-4-5".to_string(),
            messages,
            tools: None,
            tool_choice: None,
            stream: None,
            stream_options: None,
            max_tokens: None,
            max_completion_tokens: None,
            temperature: None,
            top_p: None,
            user: None,
            reasoning_effort: None,
            reasoning: None,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn system_messages_are_lifted() {
        let parts = request_parts(&request(vec![
            message("system", "rule one"),
            message("system", "rule two"),
            message("user", "hi"),
        ]));
        assert_eq!(parts.system.as_deref(), Some("rule one\nrule two"));
        assert_eq!(parts.entries.len(), 1);
    }

    #[test]
    fn tool_results_merge_into_next_user() {
        let mut tool_msg = message("tool", "result body");
        tool_msg.tool_call_id = Some("u1".to_string());
        let parts = request_parts(&request(vec![
            message("user", "go"),
            message("assistant", "calling"),
            tool_msg,
            message("user", "next"),
        ]));
        assert_eq!(parts.entries.len(), 3);
        match &parts.entries[2] {
            HistoryEntry::User { user_input_message } => {
                let results = user_input_message
                    .user_input_message_context
                    .as_ref()
                    .and_then(|ctx| ctx.tool_results.as_ref())
                    .unwrap();
                assert_eq!(results[0].tool_use_id, "u1");
                assert_eq!(user_input_message.content, "next");
            }
            _ => panic!("expected user entry"),
        }
    }

    #[test]
    fn trailing_tool_result_becomes_user_turn() {
        let mut tool_msg = message("tool", "output");
        tool_msg.tool_call_id = Some("u2".to_string());
        let parts = request_parts(&request(vec![
            message("user", "go"),
            message("assistant", "calling"),
            tool_msg,
        ]));
        assert_eq!(parts.entries.len(), 3);
        assert!(parts.entries[2].is_user());
    }

    #[test]
    fn image_parts_are_extracted() {
        let part_text = kgate_protocol::openai::ContentPart {
            r#type: "text".to_string(),
            text: Some("look".to_string()),
            image_url: None,
            extra: BTreeMap::new(),
        };
        let part_image = kgate_protocol::openai::ContentPart {
            r#type: "image_url".to_string(),
            text: None,
            image_url: Some(kgate_protocol::openai::ImageUrl {
                url: "data:image/jpg;base64,aGk=".to_string(),
                detail: None,
            }),
            extra: BTreeMap::new(),
        };
        let msg = ChatMessage {
            role: "user".to_string(),
            content: Some(MessageContent::Parts(vec![part_text, part_image])),
            tool_calls: None,
            tool_call_id: None,
            name: None,
            extra: BTreeMap::new(),
        };
        let parts = request_parts(&request(vec![msg]));
        match &parts.entries[0] {
            HistoryEntry::User { user_input_message } => {
                assert_eq!(user_input_message.content, "look");
                let images = user_input_message.images.as_ref().unwrap();
                assert_eq!(images[0].format, "jpeg");
            }
            _ => panic!("expected user entry"),
        }
    }

    #[test]
    fn malformed_arguments_are_wrapped() {
        let parsed = parse_arguments("not json");
        assert_eq!(parsed["arguments"], "not json");
        let parsed = parse_arguments("{\"x\":1}");
        assert_eq!(parsed["x"], 1);
    }
}
