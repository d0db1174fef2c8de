//! Typed views over the upstream's JSON event payloads, plus the error
//! taxonomy of the upstream client.

use serde::Deserialize;
use serde_json::Value;

use kgate_transform::UsageTotals;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream quota exhausted: {body}")]
    QuotaExhausted { body: String },
    #[error("upstream auth rejected ({status}): {body}")]
    Auth { status: u16, body: String },
    #[error("rate limited on every endpoint")]
    RateLimited,
    #[error("conversation too long for upstream")]
    ContentTooLong,
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("stream decode error: {0}")]
    Decode(String),
    #[error("upstream exception {kind}: {message}")]
    Exception { kind: String, message: String },
    #[error("dns failure: {0}")]
    Dns(String),
    #[error("stream idle timeout")]
    IdleTimeout,
    #[error("token refresh failed: {0}")]
    Refresh(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AssistantResponseEvent {
    pub content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolUseEvent {
    pub tool_use_id: String,
    pub name: Option<String>,
    pub input: Option<Value>,
    pub stop: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MeteringEvent {
    pub credits: Option<f64>,
    pub unit: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextUsageEvent {
    #[serde(alias = "contextUsagePercentage")]
    pub percentage: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReasoningContentEvent {
    #[serde(alias = "text")]
    pub content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExceptionEvent {
    #[serde(alias = "__type", alias = "name")]
    pub exception_type: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SupplementaryWebLinksEvent {
    pub supplementary_web_links: Vec<WebLink>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebLink {
    pub url: Option<String>,
    pub title: Option<String>,
    pub snippet: Option<String>,
}

impl SupplementaryWebLinksEvent {
    /// Markdown link list appended to the response text.
    pub fn to_markdown(&self) -> Option<String> {
        let lines: Vec<String> = self
            .supplementary_web_links
            .iter()
            .filter_map(|link| {
                let url = link.url.as_deref()?;
                let title = link.title.as_deref().unwrap_or(url);
                Some(format!("- [{title}]({url})"))
            })
            .collect();
        if lines.is_empty() {
            return None;
        }
        Some(format!("\n\n**Sources**\n{}\n", lines.join("\n")))
    }
}

/// Pull a readable reason out of an upstream error body. Falls back to the
/// raw body when it is not the usual JSON envelope.
pub fn enhance_error_body(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return body.to_string();
    };
    let message = value
        .get("message")
        .or_else(|| value.pointer("/error/message"))
        .and_then(Value::as_str);
    let reason = value
        .get("reason")
        .or_else(|| value.pointer("/error/reason"))
        .and_then(Value::as_str);
    match (message, reason) {
        (Some(message), Some(reason)) => format!("{message} ({reason})"),
        (Some(message), None) => message.to_string(),
        (None, Some(reason)) => reason.to_string(),
        (None, None) => body.to_string(),
    }
}

/// Merge one metadata payload into the running usage totals. Token fields
/// may live at the payload root or nested under `usage`; when only a total
/// is reported the input side is derived by subtraction.
pub fn merge_usage(totals: &mut UsageTotals, payload: &Value) {
    let node = payload.get("usage").unwrap_or(payload);
    let get = |key: &str| node.get(key).and_then(Value::as_u64);

    if let Some(value) = get("uncachedInputTokens") {
        totals.input_tokens = value;
    }
    if let Some(value) = get("cacheReadInputTokens") {
        totals.cache_read_input_tokens = value;
    }
    if let Some(value) = get("cacheWriteInputTokens") {
        totals.cache_write_input_tokens = value;
    }
    if let Some(value) = get("outputTokens") {
        totals.output_tokens = value;
    }
    if totals.input_tokens == 0
        && let Some(total) = get("totalTokens")
    {
        totals.input_tokens = total.saturating_sub(
            totals.output_tokens
                + totals.cache_read_input_tokens
                + totals.cache_write_input_tokens,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn usage_merges_from_root_and_nested() {
        let mut totals = UsageTotals::default();
        merge_usage(
            &mut totals,
            &json!({"uncachedInputTokens": 10, "outputTokens": 5}),
        );
        assert_eq!(totals.input_tokens, 10);
        assert_eq!(totals.output_tokens, 5);

        let mut nested = UsageTotals::default();
        merge_usage(
            &mut nested,
            &json!({"usage": {"uncachedInputTokens": 3, "cacheReadInputTokens": 7}}),
        );
        assert_eq!(nested.input_tokens, 3);
        assert_eq!(nested.cache_read_input_tokens, 7);
    }

    #[test]
    fn total_tokens_derives_input() {
        let mut totals = UsageTotals::default();
        merge_usage(&mut totals, &json!({"outputTokens": 5, "totalTokens": 30}));
        assert_eq!(totals.input_tokens, 25);
    }

    #[test]
    fn web_links_render_markdown() {
        let event: SupplementaryWebLinksEvent = serde_json::from_value(json!({
            "supplementaryWebLinks": [
                {"url": "https://example.com", "title": "Example"},
                {"url": "https://other.test"}
            ]
        }))
        .unwrap();
        let md = event.to_markdown().unwrap();
        assert!(md.contains("[Example](https://example.com)"));
        assert!(md.contains("[https://other.test](https://other.test)"));
    }

    #[test]
    fn error_bodies_are_enhanced() {
        let body = r#"{"message":"You reached the limit.","reason":"MONTHLY_REQUEST_COUNT"}"#;
        assert_eq!(
            enhance_error_body(body),
            "You reached the limit. (MONTHLY_REQUEST_COUNT)"
        );
        let nested = r#"{"error":{"message":"nope"}}"#;
        assert_eq!(enhance_error_body(nested), "nope");
        assert_eq!(enhance_error_body("plain text"), "plain text");
    }

    #[test]
    fn exception_event_reads_aliases() {
        let event: ExceptionEvent = serde_json::from_value(json!({
            "__type": "ContentLengthExceededException",
            "message": "too big"
        }))
        .unwrap();
        assert_eq!(
            event.exception_type.as_deref(),
            Some("ContentLengthExceededException")
        );
    }
}
