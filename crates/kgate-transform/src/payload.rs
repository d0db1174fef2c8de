//! Shared assembly of the canonical upstream payload from dialect parts.

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use kgate_protocol::upstream::{
    CHAT_TRIGGER_MANUAL, ConversationPayload, ConversationState, CurrentMessage, HistoryEntry,
    InferenceConfig, UserInputMessage,
};

use crate::sanitize::{FILLER_USER, sanitize_history};
use crate::thinking::ThinkingDirective;
use crate::tools::{ToolInput, ToolSpecCache, ensure_history_tools};

pub const SYSTEM_ACK: &str = "Understood. I will follow these instructions.";
const TOOL_SIZE_ADVISORY: &str = "When calling tools, keep every argument payload compact; \
oversized tool inputs and outputs may be truncated by the transport.";

/// Dialect-neutral output of a request transform: ordered turns (ending with
/// the current user turn when present), lifted system text, and declared
/// tools.
#[derive(Debug, Default)]
pub struct RequestParts {
    pub system: Option<String>,
    pub entries: Vec<HistoryEntry>,
    pub tools: Vec<ToolInput>,
}

pub struct PayloadOptions<'a> {
    pub conversation_id: String,
    pub model_id: String,
    pub origin: String,
    pub profile_arn: Option<String>,
    pub thinking: Option<&'a ThinkingDirective>,
    pub inference: Option<InferenceConfig>,
    pub now: OffsetDateTime,
    pub tool_cache: &'a ToolSpecCache,
}

pub fn assemble(parts: RequestParts, opts: &PayloadOptions<'_>) -> ConversationPayload {
    let mut entries = parts.entries;

    // The upstream has no system slot; lift it as an opening exchange.
    if let Some(system) = parts
        .system
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        let mut lifted = vec![HistoryEntry::user(system), HistoryEntry::assistant(SYSTEM_ACK)];
        lifted.append(&mut entries);
        entries = lifted;
    }

    let mut current = match entries.pop() {
        Some(HistoryEntry::User { user_input_message }) => user_input_message,
        Some(other) => {
            entries.push(other);
            UserInputMessage::text(FILLER_USER)
        }
        None => UserInputMessage::text(FILLER_USER),
    };

    let history = sanitize_history(entries);

    let mut specs = opts.tool_cache.convert(&parts.tools);
    ensure_history_tools(&mut specs, &history);

    if current.content.is_empty() {
        let has_results = current
            .user_input_message_context
            .as_ref()
            .and_then(|ctx| ctx.tool_results.as_ref())
            .is_some_and(|r| !r.is_empty());
        current.content = if has_results {
            " ".to_string()
        } else {
            FILLER_USER.to_string()
        };
    }

    if let Some(directive) = opts.thinking {
        current.content = format!("{}\n\n{}", directive.prelude(), current.content);
    }
    if !specs.is_empty() {
        current.content = format!("{TOOL_SIZE_ADVISORY}\n\n{}", current.content);
    }
    current.content = format!("Current time: {}\n\n{}", iso_utc(opts.now), current.content);

    current.model_id = Some(opts.model_id.clone());
    current.origin = Some(opts.origin.clone());
    current.inference_config = opts.inference.clone();
    if !specs.is_empty() {
        current
            .user_input_message_context
            .get_or_insert_default()
            .tools = Some(specs);
    }

    ConversationPayload {
        conversation_state: ConversationState {
            chat_trigger_type: CHAT_TRIGGER_MANUAL.to_string(),
            conversation_id: opts.conversation_id.clone(),
            current_message: CurrentMessage {
                user_input_message: current,
            },
            history,
        },
        profile_arn: opts.profile_arn.clone(),
    }
}

fn iso_utc(now: OffsetDateTime) -> String {
    now.format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

/// `data:image/<fmt>;base64,<data>` → `(format, base64)`, with `jpg`
/// normalized to `jpeg`.
pub fn parse_image_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:image/")?;
    let (format, data) = rest.split_once(";base64,")?;
    let format = match format.to_ascii_lowercase().as_str() {
        "jpg" => "jpeg".to_string(),
        other => other.to_string(),
    };
    if data.is_empty() {
        return None;
    }
    Some((format, data.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options<'a>(cache: &'a ToolSpecCache) -> PayloadOptions<'a> {
        PayloadOptions {
            conversation_id: "conv-1".to_string(),
            model_id: "model-x".to_string(),
            origin: "AI_EDITOR".to_string(),
            profile_arn: None,
            thinking: None,
            inference: None,
            now: OffsetDateTime::UNIX_EPOCH,
            tool_cache: cache,
        }
    }

    #[test]
    fn system_is_lifted_as_opening_exchange() {
        let cache = ToolSpecCache::new();
        let parts = RequestParts {
            system: Some("be terse".to_string()),
            entries: vec![HistoryEntry::user("hi")],
            tools: Vec::new(),
        };
        let payload = assemble(parts, &options(&cache));
        let history = &payload.conversation_state.history;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text(), "be terse");
        assert_eq!(history[1].text(), SYSTEM_ACK);
        assert!(
            payload
                .conversation_state
                .current_message
                .user_input_message
                .content
                .ends_with("hi")
        );
    }

    #[test]
    fn current_message_carries_time_prelude() {
        let cache = ToolSpecCache::new();
        let parts = RequestParts {
            system: None,
            entries: vec![HistoryEntry::user("q")],
            tools: Vec::new(),
        };
        let payload = assemble(parts, &options(&cache));
        assert!(
            payload
                .conversation_state
                .current_message
                .user_input_message
                .content
                .starts_with("Current time: 1970-01-01T00:00:00Z")
        );
    }

    #[test]
    fn trailing_assistant_yields_filler_current() {
        let cache = ToolSpecCache::new();
        let parts = RequestParts {
            system: None,
            entries: vec![HistoryEntry::user("q"), HistoryEntry::assistant("a")],
            tools: Vec::new(),
        };
        let payload = assemble(parts, &options(&cache));
        assert!(
            payload
                .conversation_state
                .current_message
                .user_input_message
                .content
                .ends_with(FILLER_USER)
        );
        assert_eq!(payload.conversation_state.history.len(), 2);
    }

    #[test]
    fn image_data_urls_parse_and_normalize() {
        let (format, data) = parse_image_data_url("data:image/jpg;base64,aGk=").unwrap();
        assert_eq!(format, "jpeg");
        assert_eq!(data, "aGk=");
        assert!(parse_image_data_url("data:image/png;base64,").is_none());
        assert!(parse_image_data_url("https://example.com/a.png").is_none());
    }
}
