//! Tool specification conversion for the canonical payload.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use kgate_protocol::upstream::{HistoryEntry, InputSchema, ToolEntry, ToolSpecification};

const MAX_DESCRIPTION_CHARS: usize = 10_237;
const MAX_NAME_CHARS: usize = 64;
const MCP_PREFIX: &str = "mcp__";
const CACHE_CAP: usize = 8;
const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

const WRITE_ADVISORY: &str =
    "\nIMPORTANT: Keep a single call under 300 lines; write longer files in multiple appending calls.";
const EDIT_ADVISORY: &str =
    "\nIMPORTANT: Keep a single edit under 300 lines; split larger rewrites into multiple calls.";

/// Dialect-neutral tool description, produced by the request transforms.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInput {
    pub name: String,
    pub description: Option<String>,
    pub schema: Option<Value>,
}

/// Converted tool lists keyed by a fingerprint of names and description
/// lengths; conversion is deterministic so the fingerprint is a safe key.
pub struct ToolSpecCache {
    inner: Mutex<LruCache<String, CachedSpecs>>,
}

struct CachedSpecs {
    at: Instant,
    specs: Vec<ToolEntry>,
}

impl Default for ToolSpecCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolSpecCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAP).expect("cache cap"),
            )),
        }
    }

    pub fn convert(&self, tools: &[ToolInput]) -> Vec<ToolEntry> {
        if tools.is_empty() {
            return Vec::new();
        }
        let key = fingerprint(tools);
        if let Ok(mut cache) = self.inner.lock()
            && let Some(hit) = cache.get(&key)
            && hit.at.elapsed() < CACHE_TTL
        {
            return hit.specs.clone();
        }

        let specs: Vec<ToolEntry> = tools.iter().map(convert_tool).collect();
        if let Ok(mut cache) = self.inner.lock() {
            cache.put(
                key,
                CachedSpecs {
                    at: Instant::now(),
                    specs: specs.clone(),
                },
            );
        }
        specs
    }
}

fn fingerprint(tools: &[ToolInput]) -> String {
    let mut hasher = Sha256::new();
    for tool in tools {
        hasher.update(tool.name.as_bytes());
        hasher.update(b":");
        hasher.update(
            tool.description
                .as_ref()
                .map(|d| d.len())
                .unwrap_or(0)
                .to_le_bytes(),
        );
        hasher.update(b"|");
    }
    hex::encode(&hasher.finalize()[..16])
}

fn convert_tool(tool: &ToolInput) -> ToolEntry {
    let name = truncate_name(&tool.name);
    let mut description = tool
        .description
        .clone()
        .map(|d| truncate_chars(&d, MAX_DESCRIPTION_CHARS));
    if matches!(tool.name.as_str(), "Write" | "Edit") {
        let advisory = if tool.name == "Write" {
            WRITE_ADVISORY
        } else {
            EDIT_ADVISORY
        };
        let mut text = description.unwrap_or_default();
        text.push_str(advisory);
        description = Some(truncate_chars(&text, MAX_DESCRIPTION_CHARS));
    }

    ToolEntry {
        tool_specification: ToolSpecification {
            name,
            description,
            input_schema: InputSchema {
                json: tool.schema.clone().unwrap_or_else(empty_schema),
            },
        },
    }
}

pub fn empty_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    text.chars().take(max).collect()
}

fn truncate_name(name: &str) -> String {
    if name.chars().count() <= MAX_NAME_CHARS {
        return name.to_string();
    }
    if let Some(rest) = name.strip_prefix(MCP_PREFIX)
        && let Some(sep) = rest.find("__")
    {
        // Keep the full server prefix and shorten only the tool part.
        let prefix_len = MCP_PREFIX.len() + sep + 2;
        if prefix_len < MAX_NAME_CHARS {
            let head: String = name.chars().take(prefix_len).collect();
            let tail: String = name
                .chars()
                .skip(prefix_len)
                .take(MAX_NAME_CHARS - prefix_len)
                .collect();
            return format!("{head}{tail}");
        }
    }
    name.chars().take(MAX_NAME_CHARS).collect()
}

/// Every tool name referenced by a history tool use must be declared in the
/// current tool list; missing ones get empty-schema placeholders.
pub fn ensure_history_tools(specs: &mut Vec<ToolEntry>, history: &[HistoryEntry]) {
    for entry in history {
        let HistoryEntry::Assistant {
            assistant_response_message,
        } = entry
        else {
            continue;
        };
        for tool_use in assistant_response_message.tool_uses.iter().flatten() {
            let known = specs
                .iter()
                .any(|spec| spec.tool_specification.name == tool_use.name);
            if !known {
                specs.push(ToolEntry {
                    tool_specification: ToolSpecification {
                        name: tool_use.name.clone(),
                        description: None,
                        input_schema: InputSchema {
                            json: empty_schema(),
                        },
                    },
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgate_protocol::upstream::{AssistantResponseMessage, AssistantToolUse};

    fn tool(name: &str, description: &str) -> ToolInput {
        ToolInput {
            name: name.to_string(),
            description: Some(description.to_string()),
            schema: None,
        }
    }

    #[test]
    fn long_descriptions_are_truncated() {
        let cache = ToolSpecCache::new();
        let long = "d".repeat(MAX_DESCRIPTION_CHARS + 100);
        let specs = cache.convert(&[tool("t", &long)]);
        let description = specs[0].tool_specification.description.as_ref().unwrap();
        assert_eq!(description.chars().count(), MAX_DESCRIPTION_CHARS);
    }

    #[test]
    fn long_names_are_truncated() {
        let cache = ToolSpecCache::new();
        let specs = cache.convert(&[ToolInput {
            name: "n".repeat(80),
            description: None,
            schema: None,
        }]);
        assert_eq!(specs[0].tool_specification.name.chars().count(), 64);
    }

    #[test]
    fn mcp_names_keep_server_prefix() {
        let name = format!("mcp__myserver__{}", "t".repeat(80));
        let truncated = truncate_name(&name);
        assert_eq!(truncated.chars().count(), 64);
        assert!(truncated.starts_with("mcp__myserver__"));
    }

    #[test]
    fn write_and_edit_gain_advisories() {
        let cache = ToolSpecCache::new();
        let specs = cache.convert(&[tool("Write", "writes files"), tool("Edit", "edits files")]);
        assert!(
            specs[0]
                .tool_specification
                .description
                .as_ref()
                .unwrap()
                .contains("multiple appending calls")
        );
        assert!(
            specs[1]
                .tool_specification
                .description
                .as_ref()
                .unwrap()
                .contains("multiple calls")
        );
    }

    #[test]
    fn cache_returns_same_conversion() {
        let cache = ToolSpecCache::new();
        let tools = vec![tool("a", "x"), tool("b", "y")];
        let first = cache.convert(&tools);
        let second = cache.convert(&tools);
        assert_eq!(first, second);
    }

    #[test]
    fn history_tools_get_placeholders() {
        let mut specs = Vec::new();
        let history = vec![HistoryEntry::Assistant {
            assistant_response_message: AssistantResponseMessage {
                content: "x".to_string(),
                tool_uses: Some(vec![AssistantToolUse {
                    tool_use_id: "u1".to_string(),
                    name: "ghost_tool".to_string(),
                    input: serde_json::json!({}),
                }]),
            },
        }];
        ensure_history_tools(&mut specs, &history);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].tool_specification.name, "ghost_tool");
    }
}
