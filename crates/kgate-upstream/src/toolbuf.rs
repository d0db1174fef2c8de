//! Per-request tool-use buffers.
//!
//! The upstream streams tool calls as `(id, name?, input, stop)` fragments.
//! String inputs append, object inputs replace, and `stop` finalizes with a
//! best-effort JSON repair. A tool-use id is emitted at most once per
//! request even when the upstream duplicates its stop events.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde_json::Value;

/// Synthetic id the upstream uses to signal a context overflow in-band.
pub const CONTENT_LENGTH_TOOL_ID: &str = "__content_length_exceeded__";

const MAX_BUFFER_BYTES: usize = 1024 * 1024;
const STALE_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub enum ToolEvent {
    Start { id: String, name: String },
    Delta { id: String, fragment: String },
    Stop { id: String, input: Value },
}

#[derive(Debug)]
struct Buffer {
    name: String,
    text: String,
    object: Option<Value>,
    streamed_fragments: bool,
    last_update: Instant,
}

#[derive(Debug, Default)]
pub struct ToolBuffers {
    open: HashMap<String, Buffer>,
    emitted: HashSet<String>,
}

impl ToolBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event(
        &mut self,
        id: &str,
        name: Option<&str>,
        input: Option<&Value>,
        stop: bool,
    ) -> Vec<ToolEvent> {
        self.prune_stale();
        if self.emitted.contains(id) {
            return Vec::new();
        }

        let mut out = Vec::new();
        if !self.open.contains_key(id) {
            let Some(name) = name.filter(|n| !n.is_empty()) else {
                // Fragments for an unknown id with no name yet; nothing to
                // anchor a start event to.
                return Vec::new();
            };
            self.open.insert(
                id.to_string(),
                Buffer {
                    name: name.to_string(),
                    text: String::new(),
                    object: None,
                    streamed_fragments: false,
                    last_update: Instant::now(),
                },
            );
            out.push(ToolEvent::Start {
                id: id.to_string(),
                name: name.to_string(),
            });
        }

        let Some(buffer) = self.open.get_mut(id) else {
            return out;
        };
        buffer.last_update = Instant::now();
        match input {
            Some(Value::String(fragment)) => {
                let remaining = MAX_BUFFER_BYTES.saturating_sub(buffer.text.len());
                if remaining > 0 {
                    let take = fragment.len().min(remaining);
                    let mut cut = take;
                    while cut > 0 && !fragment.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    buffer.text.push_str(&fragment[..cut]);
                }
                buffer.streamed_fragments = true;
                out.push(ToolEvent::Delta {
                    id: id.to_string(),
                    fragment: fragment.clone(),
                });
            }
            Some(object @ Value::Object(_)) => {
                buffer.object = Some(object.clone());
            }
            Some(_) | None => {}
        }

        if stop {
            out.extend(self.finalize(id));
        }
        out
    }

    /// End of stream: close any buffers the upstream never stopped.
    pub fn flush(&mut self) -> Vec<ToolEvent> {
        let ids: Vec<String> = self.open.keys().cloned().collect();
        let mut out = Vec::new();
        for id in ids {
            out.extend(self.finalize(&id));
        }
        out
    }

    fn finalize(&mut self, id: &str) -> Vec<ToolEvent> {
        let Some(buffer) = self.open.remove(id) else {
            return Vec::new();
        };
        self.emitted.insert(id.to_string());

        let input = buffer
            .object
            .clone()
            .or_else(|| parse_or_repair(&buffer.text))
            .unwrap_or(Value::Object(serde_json::Map::new()));

        let mut out = Vec::new();
        // Inputs that only arrived as a whole object never produced
        // fragments; surface the final JSON once so streaming clients see
        // the arguments at all.
        if !buffer.streamed_fragments && !input.as_object().is_none_or(|o| o.is_empty()) {
            out.push(ToolEvent::Delta {
                id: id.to_string(),
                fragment: serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string()),
            });
        }
        out.push(ToolEvent::Stop {
            id: id.to_string(),
            input,
        });
        out
    }

    fn prune_stale(&mut self) {
        let now = Instant::now();
        self.open
            .retain(|_, buffer| now.duration_since(buffer.last_update) < STALE_AFTER);
    }
}

fn parse_or_repair(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    let repaired = repair_json(trimmed);
    serde_json::from_str::<Value>(&repaired).ok()
}

/// Balance a truncated JSON fragment: drop trailing partial escapes, close
/// an open string, then close brackets innermost-first.
fn repair_json(text: &str) -> String {
    let mut cleaned = String::with_capacity(text.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escape = false;

    for c in text.chars() {
        cleaned.push(c);
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    if escape {
        // Trailing lone backslash; drop it.
        cleaned.pop();
    } else if in_string {
        // A partial unicode escape may remain without its backslash flag
        // set (e.g. `\uD8` split after the u); trim it back.
        if let Some(pos) = cleaned.rfind('\\')
            && cleaned[pos..].starts_with("\\u")
            && cleaned.len() - pos < 6
        {
            cleaned.truncate(pos);
        }
    }
    if in_string {
        cleaned.push('"');
    }
    while let Some(closer) = stack.pop() {
        cleaned.push(closer);
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fragments_accumulate_and_stop_parses() {
        let mut buffers = ToolBuffers::new();
        let first = buffers.on_event("u1", Some("t"), Some(&json!("{\"x\"")), false);
        assert!(matches!(&first[0], ToolEvent::Start { name, .. } if name == "t"));
        assert!(matches!(&first[1], ToolEvent::Delta { .. }));
        let done = buffers.on_event("u1", None, Some(&json!(":1}")), true);
        match done.last().unwrap() {
            ToolEvent::Stop { input, .. } => assert_eq!(input["x"], 1),
            _ => panic!("expected stop"),
        }
    }

    #[test]
    fn object_input_replaces() {
        let mut buffers = ToolBuffers::new();
        buffers.on_event("u1", Some("t"), Some(&json!({"a": 1})), false);
        let done = buffers.on_event("u1", None, Some(&json!({"b": 2})), true);
        // Whole-object inputs surface one synthesized fragment before stop.
        assert!(matches!(&done[0], ToolEvent::Delta { .. }));
        match done.last().unwrap() {
            ToolEvent::Stop { input, .. } => {
                assert_eq!(input["b"], 2);
                assert!(input.get("a").is_none());
            }
            _ => panic!("expected stop"),
        }
    }

    #[test]
    fn duplicate_stop_is_dropped() {
        let mut buffers = ToolBuffers::new();
        buffers.on_event("u1", Some("t"), Some(&json!("{}")), true);
        let again = buffers.on_event("u1", Some("t"), Some(&json!("{}")), true);
        assert!(again.is_empty());
    }

    #[test]
    fn truncated_json_is_repaired() {
        let mut buffers = ToolBuffers::new();
        buffers.on_event("u1", Some("t"), Some(&json!("{\"items\": [1, 2, {\"k\": \"v")), false);
        let done = buffers.on_event("u1", None, None, true);
        match done.last().unwrap() {
            ToolEvent::Stop { input, .. } => {
                assert_eq!(input["items"][0], 1);
                assert_eq!(input["items"][2]["k"], "v");
            }
            _ => panic!("expected stop"),
        }
    }

    #[test]
    fn garbage_yields_empty_object() {
        let mut buffers = ToolBuffers::new();
        buffers.on_event("u1", Some("t"), Some(&json!("certainly not json}")), false);
        let done = buffers.on_event("u1", None, None, true);
        match done.last().unwrap() {
            ToolEvent::Stop { input, .. } => assert_eq!(input, &json!({})),
            _ => panic!("expected stop"),
        }
    }

    #[test]
    fn flush_closes_open_buffers() {
        let mut buffers = ToolBuffers::new();
        buffers.on_event("u1", Some("t"), Some(&json!("{\"x\": 1")), false);
        let flushed = buffers.flush();
        assert!(flushed.iter().any(|e| matches!(e, ToolEvent::Stop { .. })));
    }

    #[test]
    fn repair_handles_trailing_escape() {
        assert_eq!(repair_json("{\"a\": \"b\\"), "{\"a\": \"b\"}");
    }

    #[test]
    fn repair_drops_partial_unicode_escape() {
        let repaired = repair_json("{\"a\": \"x\\uD8");
        let value: Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(value["a"], "x");
    }
}
