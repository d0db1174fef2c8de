//! Structured summary mining: artifacts, decisions, and breadcrumbs pulled
//! straight from the conversation text without any model call.

use std::sync::OnceLock;

use regex::Regex;

use crate::{TurnRole, TurnView};

const MAX_DECISIONS: usize = 20;
const MAX_ARTIFACTS: usize = 30;
const BREADCRUMB_COUNT: usize = 6;
const BREADCRUMB_CHARS: usize = 150;
const VERB_LOOKBEHIND_CHARS: usize = 48;

fn path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9_~-]+(?:/[A-Za-z0-9_.~-]+)+\.[A-Za-z0-9]{1,8}").expect("path regex")
    })
}

fn decision_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:decided to|chose|will use|决定|选择了?)\s*([^.。\n]{2,120})")
            .expect("decision regex")
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub path: String,
    pub action: &'static str,
}

pub fn mine_artifacts(turns: &[TurnView]) -> Vec<Artifact> {
    let mut out: Vec<Artifact> = Vec::new();
    for turn in turns {
        for found in path_regex().find_iter(&turn.text) {
            if out.len() >= MAX_ARTIFACTS {
                return out;
            }
            let path = found.as_str().to_string();
            if out.iter().any(|a| a.path == path) {
                continue;
            }
            let action = classify_action(&turn.text, found.start());
            out.push(Artifact { path, action });
        }
    }
    out
}

fn classify_action(text: &str, at: usize) -> &'static str {
    let from = at.saturating_sub(VERB_LOOKBEHIND_CHARS);
    let mut start = from;
    while start < at && !text.is_char_boundary(start) {
        start += 1;
    }
    let window = text[start..at].to_ascii_lowercase();
    if window.contains("creat") || window.contains("wrote") || window.contains("add") {
        "created"
    } else if window.contains("delet") || window.contains("remov") {
        "deleted"
    } else if window.contains("modif") || window.contains("edit") || window.contains("updat") {
        "modified"
    } else {
        "read"
    }
}

pub fn mine_decisions(turns: &[TurnView]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for turn in turns {
        for caps in decision_regex().captures_iter(&turn.text) {
            if out.len() >= MAX_DECISIONS {
                return out;
            }
            if let Some(group) = caps.get(1) {
                let decision = group.as_str().trim().to_string();
                if !decision.is_empty() && !out.contains(&decision) {
                    out.push(decision);
                }
            }
        }
    }
    out
}

pub fn breadcrumbs(turns: &[TurnView]) -> Vec<String> {
    turns
        .iter()
        .rev()
        .take(BREADCRUMB_COUNT)
        .map(|turn| {
            let role = match turn.role {
                TurnRole::User => "user",
                TurnRole::Assistant => "assistant",
            };
            let text: String = turn.text.chars().take(BREADCRUMB_CHARS).collect();
            format!("{role}: {text}")
        })
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect()
}

/// Assemble the combined Markdown summary document.
pub fn combine(
    intent: &str,
    play_by_play: &str,
    artifacts: &[Artifact],
    decisions: &[String],
    recent: &[String],
) -> String {
    let mut doc = String::new();
    doc.push_str("## Session Intent\n");
    doc.push_str(intent);
    doc.push_str("\n\n## Play-by-Play\n");
    doc.push_str(play_by_play);
    if !artifacts.is_empty() {
        doc.push_str("\n\n## Artifacts\n");
        for artifact in artifacts {
            doc.push_str(&format!("- {} ({})\n", artifact.path, artifact.action));
        }
    }
    if !decisions.is_empty() {
        doc.push_str("\n\n## Decisions\n");
        for decision in decisions {
            doc.push_str(&format!("- {decision}\n"));
        }
    }
    if !recent.is_empty() {
        doc.push_str("\n\n## Recent Context\n");
        for line in recent {
            doc.push_str(&format!("- {line}\n"));
        }
    }
    doc
}
