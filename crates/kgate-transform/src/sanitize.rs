//! History sanitization for the canonical payload.
//!
//! The upstream rejects histories that do not strictly alternate user and
//! assistant turns, carry orphaned tool calls, or contain empty message
//! bodies. Sanitization is idempotent: running it on an already-clean
//! history returns it unchanged.

use std::collections::HashSet;

use kgate_protocol::upstream::HistoryEntry;

pub const FILLER_ASSISTANT: &str = "understood";
pub const FILLER_USER: &str = "Continue";
pub const FILLER_EMPTY_ASSISTANT: &str = "I understand.";

/// Truncation tiers applied when the upstream rejects a payload as too long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationTier {
    KeepHalf,
    KeepQuarter,
    DropAll,
}

impl TruncationTier {
    pub fn next(self) -> Option<Self> {
        match self {
            TruncationTier::KeepHalf => Some(TruncationTier::KeepQuarter),
            TruncationTier::KeepQuarter => Some(TruncationTier::DropAll),
            TruncationTier::DropAll => None,
        }
    }
}

pub fn sanitize_history(history: Vec<HistoryEntry>) -> Vec<HistoryEntry> {
    let history = strip_orphan_tools(history);
    let history = enforce_alternation(history);
    fill_empty_content(history)
}

/// Drop tool uses with no matching tool result in the next user turn (the
/// final assistant turn keeps its tool uses; results arrive in the current
/// message), drop results with no matching preceding use, and drop duplicate
/// result ids (first wins).
fn strip_orphan_tools(history: Vec<HistoryEntry>) -> Vec<HistoryEntry> {
    let mut out: Vec<HistoryEntry> = Vec::with_capacity(history.len());

    for entry in history {
        match entry {
            HistoryEntry::Assistant {
                mut assistant_response_message,
            } => {
                // Pairing against the next user turn happens when that turn
                // is visited below; here only normalize empty lists away.
                assistant_response_message.tool_uses = assistant_response_message
                    .tool_uses
                    .filter(|uses| !uses.is_empty());
                out.push(HistoryEntry::Assistant {
                    assistant_response_message,
                });
            }
            HistoryEntry::User {
                mut user_input_message,
            } => {
                let prior_uses: HashSet<String> = match out.last() {
                    Some(HistoryEntry::Assistant {
                        assistant_response_message,
                    }) => assistant_response_message
                        .tool_uses
                        .iter()
                        .flatten()
                        .map(|t| t.tool_use_id.clone())
                        .collect(),
                    _ => HashSet::new(),
                };

                if let Some(ctx) = user_input_message.user_input_message_context.as_mut()
                    && let Some(results) = ctx.tool_results.take()
                {
                    let mut seen = HashSet::new();
                    let kept: Vec<_> = results
                        .into_iter()
                        .filter(|r| prior_uses.contains(&r.tool_use_id))
                        .filter(|r| seen.insert(r.tool_use_id.clone()))
                        .collect();
                    if !kept.is_empty() {
                        ctx.tool_results = Some(kept);
                    }
                }
                if user_input_message
                    .user_input_message_context
                    .as_ref()
                    .is_some_and(|ctx| ctx.is_empty())
                {
                    user_input_message.user_input_message_context = None;
                }

                // Now that the pairing is known, strip uses on the previous
                // assistant that the results did not cover.
                let covered: HashSet<String> = user_input_message
                    .user_input_message_context
                    .as_ref()
                    .and_then(|ctx| ctx.tool_results.as_ref())
                    .map(|results| results.iter().map(|r| r.tool_use_id.clone()).collect())
                    .unwrap_or_default();
                if let Some(HistoryEntry::Assistant {
                    assistant_response_message,
                }) = out.last_mut()
                    && let Some(uses) = assistant_response_message.tool_uses.take()
                {
                    let kept: Vec<_> = uses
                        .into_iter()
                        .filter(|u| covered.contains(&u.tool_use_id))
                        .collect();
                    if !kept.is_empty() {
                        assistant_response_message.tool_uses = Some(kept);
                    }
                }

                out.push(HistoryEntry::User { user_input_message });
            }
        }
    }

    out
}

fn enforce_alternation(history: Vec<HistoryEntry>) -> Vec<HistoryEntry> {
    let mut out: Vec<HistoryEntry> = Vec::with_capacity(history.len());

    for entry in history {
        match (out.last().map(HistoryEntry::is_user), entry.is_user()) {
            (None, false) => {
                out.push(HistoryEntry::user(FILLER_USER));
                out.push(entry);
            }
            (Some(true), true) => {
                out.push(HistoryEntry::assistant(FILLER_ASSISTANT));
                out.push(entry);
            }
            (Some(false), false) => {
                out.push(HistoryEntry::user(FILLER_USER));
                out.push(entry);
            }
            _ => out.push(entry),
        }
    }

    if out.last().is_some_and(HistoryEntry::is_user) {
        out.push(HistoryEntry::assistant(FILLER_ASSISTANT));
    }

    out
}

fn fill_empty_content(history: Vec<HistoryEntry>) -> Vec<HistoryEntry> {
    history
        .into_iter()
        .map(|entry| match entry {
            HistoryEntry::Assistant {
                mut assistant_response_message,
            } => {
                if assistant_response_message.content.is_empty() {
                    assistant_response_message.content =
                        if assistant_response_message.tool_uses.is_some() {
                            " ".to_string()
                        } else {
                            FILLER_EMPTY_ASSISTANT.to_string()
                        };
                }
                HistoryEntry::Assistant {
                    assistant_response_message,
                }
            }
            HistoryEntry::User {
                mut user_input_message,
            } => {
                if user_input_message.content.is_empty() {
                    let has_results = user_input_message
                        .user_input_message_context
                        .as_ref()
                        .and_then(|ctx| ctx.tool_results.as_ref())
                        .is_some_and(|results| !results.is_empty());
                    user_input_message.content = if has_results {
                        " ".to_string()
                    } else {
                        FILLER_USER.to_string()
                    };
                }
                HistoryEntry::User { user_input_message }
            }
        })
        .collect()
}

/// Degraded retry: drop every tool use and tool result, then restore the
/// alternation invariants.
pub fn aggressive_sanitize(history: Vec<HistoryEntry>) -> Vec<HistoryEntry> {
    let stripped: Vec<HistoryEntry> = history
        .into_iter()
        .map(|entry| match entry {
            HistoryEntry::Assistant {
                mut assistant_response_message,
            } => {
                assistant_response_message.tool_uses = None;
                HistoryEntry::Assistant {
                    assistant_response_message,
                }
            }
            HistoryEntry::User {
                mut user_input_message,
            } => {
                if let Some(ctx) = user_input_message.user_input_message_context.as_mut() {
                    ctx.tool_results = None;
                }
                if user_input_message
                    .user_input_message_context
                    .as_ref()
                    .is_some_and(|ctx| ctx.is_empty())
                {
                    user_input_message.user_input_message_context = None;
                }
                HistoryEntry::User { user_input_message }
            }
        })
        .collect();
    sanitize_history(stripped)
}

/// Keep the trailing share of the history for the given tier, then
/// re-sanitize so the cut does not open on an orphaned pair.
pub fn truncate_history(history: &[HistoryEntry], tier: TruncationTier) -> Vec<HistoryEntry> {
    let keep = match tier {
        TruncationTier::KeepHalf => history.len() / 2,
        TruncationTier::KeepQuarter => history.len() / 4,
        TruncationTier::DropAll => 0,
    };
    let tail = history[history.len() - keep..].to_vec();
    sanitize_history(tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgate_protocol::upstream::{
        AssistantResponseMessage, AssistantToolUse, ToolResult, ToolResultContent,
        UserInputMessage, UserInputMessageContext,
    };
    use serde_json::json;

    fn assistant_with_tool(id: &str) -> HistoryEntry {
        HistoryEntry::Assistant {
            assistant_response_message: AssistantResponseMessage {
                content: "calling".to_string(),
                tool_uses: Some(vec![AssistantToolUse {
                    tool_use_id: id.to_string(),
                    name: "t".to_string(),
                    input: json!({}),
                }]),
            },
        }
    }

    fn user_with_result(id: &str) -> HistoryEntry {
        HistoryEntry::User {
            user_input_message: UserInputMessage {
                content: "done".to_string(),
                model_id: None,
                origin: None,
                images: None,
                user_input_message_context: Some(UserInputMessageContext {
                    tool_results: Some(vec![ToolResult {
                        tool_use_id: id.to_string(),
                        status: "success".to_string(),
                        content: vec![ToolResultContent::text("ok")],
                    }]),
                    tools: None,
                }),
            },
        }
    }

    fn assert_invariants(history: &[HistoryEntry]) {
        assert!(history.first().is_none_or(HistoryEntry::is_user));
        assert!(!history.last().is_some_and(HistoryEntry::is_user));
        for pair in history.windows(2) {
            assert_ne!(pair[0].is_user(), pair[1].is_user(), "must alternate");
        }
        for entry in history {
            assert!(!entry.text().is_empty());
        }
    }

    #[test]
    fn alternation_is_enforced() {
        let history = vec![
            HistoryEntry::user("a"),
            HistoryEntry::user("b"),
            HistoryEntry::assistant("c"),
            HistoryEntry::assistant("d"),
            HistoryEntry::user("e"),
        ];
        let out = sanitize_history(history);
        assert_invariants(&out);
        assert_eq!(out.len(), 8);
        assert_eq!(out[1].text(), FILLER_ASSISTANT);
        assert_eq!(out[4].text(), FILLER_USER);
        assert_eq!(out[7].text(), FILLER_ASSISTANT);
    }

    #[test]
    fn leading_assistant_gains_user() {
        let out = sanitize_history(vec![HistoryEntry::assistant("hello")]);
        assert_invariants(&out);
        assert_eq!(out[0].text(), FILLER_USER);
    }

    #[test]
    fn paired_tool_use_survives() {
        let history = vec![
            HistoryEntry::user("q"),
            assistant_with_tool("u1"),
            user_with_result("u1"),
            HistoryEntry::assistant("a"),
        ];
        let out = sanitize_history(history);
        assert_invariants(&out);
        match &out[1] {
            HistoryEntry::Assistant {
                assistant_response_message,
            } => assert!(assistant_response_message.tool_uses.is_some()),
            _ => panic!("expected assistant"),
        }
    }

    #[test]
    fn orphan_tool_use_is_stripped() {
        let history = vec![
            HistoryEntry::user("q"),
            assistant_with_tool("u1"),
            HistoryEntry::user("no result here"),
            HistoryEntry::assistant("a"),
        ];
        let out = sanitize_history(history);
        match &out[1] {
            HistoryEntry::Assistant {
                assistant_response_message,
            } => assert!(assistant_response_message.tool_uses.is_none()),
            _ => panic!("expected assistant"),
        }
    }

    #[test]
    fn trailing_tool_use_is_kept() {
        let history = vec![HistoryEntry::user("q"), assistant_with_tool("u1")];
        let out = sanitize_history(history);
        match out.last().unwrap() {
            HistoryEntry::Assistant {
                assistant_response_message,
            } => assert!(assistant_response_message.tool_uses.is_some()),
            _ => panic!("expected assistant"),
        }
    }

    #[test]
    fn orphan_result_is_dropped() {
        let history = vec![user_with_result("ghost"), HistoryEntry::assistant("a")];
        let out = sanitize_history(history);
        match &out[0] {
            HistoryEntry::User { user_input_message } => {
                assert!(user_input_message.user_input_message_context.is_none());
            }
            _ => panic!("expected user"),
        }
    }

    #[test]
    fn duplicate_results_first_wins() {
        let mut dup = user_with_result("u1");
        if let HistoryEntry::User { user_input_message } = &mut dup
            && let Some(ctx) = user_input_message.user_input_message_context.as_mut()
            && let Some(results) = ctx.tool_results.as_mut()
        {
            let mut second = results[0].clone();
            second.content = vec![ToolResultContent::text("late")];
            results.push(second);
        }
        let history = vec![
            HistoryEntry::user("q"),
            assistant_with_tool("u1"),
            dup,
            HistoryEntry::assistant("a"),
        ];
        let out = sanitize_history(history);
        match &out[2] {
            HistoryEntry::User { user_input_message } => {
                let results = user_input_message
                    .user_input_message_context
                    .as_ref()
                    .and_then(|ctx| ctx.tool_results.as_ref())
                    .unwrap();
                assert_eq!(results.len(), 1);
                assert_eq!(results[0].content[0].text.as_deref(), Some("ok"));
            }
            _ => panic!("expected user"),
        }
    }

    #[test]
    fn sanitize_is_idempotent() {
        let histories = vec![
            vec![
                HistoryEntry::user(""),
                HistoryEntry::user("b"),
                assistant_with_tool("u1"),
                user_with_result("u1"),
                HistoryEntry::assistant(""),
                HistoryEntry::assistant("tail"),
            ],
            vec![HistoryEntry::assistant("only")],
            vec![HistoryEntry::user("q"), assistant_with_tool("u9")],
        ];
        for history in histories {
            let once = sanitize_history(history);
            let twice = sanitize_history(once.clone());
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn aggressive_sanitize_removes_all_tool_content() {
        let history = vec![
            HistoryEntry::user("q"),
            assistant_with_tool("u1"),
            user_with_result("u1"),
            HistoryEntry::assistant("a"),
        ];
        let out = aggressive_sanitize(history);
        assert_invariants(&out);
        for entry in &out {
            match entry {
                HistoryEntry::Assistant {
                    assistant_response_message,
                } => assert!(assistant_response_message.tool_uses.is_none()),
                HistoryEntry::User { user_input_message } => {
                    assert!(
                        user_input_message
                            .user_input_message_context
                            .as_ref()
                            .and_then(|ctx| ctx.tool_results.as_ref())
                            .is_none()
                    );
                }
            }
        }
    }

    #[test]
    fn truncation_tiers_shrink_then_empty() {
        let mut history = Vec::new();
        for i in 0..20 {
            history.push(HistoryEntry::user(format!("q{i}")));
            history.push(HistoryEntry::assistant(format!("a{i}")));
        }
        let half = truncate_history(&history, TruncationTier::KeepHalf);
        assert!(half.len() <= 20 + 1);
        assert_invariants(&half);
        let quarter = truncate_history(&history, TruncationTier::KeepQuarter);
        assert!(quarter.len() < half.len());
        assert_invariants(&quarter);
        let none = truncate_history(&history, TruncationTier::DropAll);
        assert!(none.is_empty());
    }
}
