//! Thinking support: request-side budget derivation and tag injection, and
//! the stream-safe parser that splits upstream text into thinking and
//! regular segments.

use kgate_protocol::anthropic::MessagesRequest;
use kgate_protocol::openai::ChatCompletionRequest;

const OPEN_TAG: &str = "<thinking>";
const CLOSE_TAG: &str = "</thinking>";
const OVERFLOW_CHARS: usize = 100_000;
const FAST_PATH_MIN: usize = 256;

pub const MAX_BUDGET_TOKENS: u32 = 200_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingMode {
    Enabled,
    Adaptive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThinkingDirective {
    pub mode: ThinkingMode,
    pub budget_tokens: u32,
    pub effort: Option<String>,
}

impl ThinkingDirective {
    /// Synthetic tag block prepended to the current user message.
    pub fn prelude(&self) -> String {
        match self.mode {
            ThinkingMode::Enabled => format!(
                "<thinking_mode>enabled</thinking_mode>\n<max_thinking_length>{}</max_thinking_length>",
                self.budget_tokens
            ),
            ThinkingMode::Adaptive => format!(
                "<thinking_mode>adaptive</thinking_mode>\n<thinking_effort>{}</thinking_effort>",
                self.effort.as_deref().unwrap_or("medium")
            ),
        }
    }
}

fn effort_budget(effort: &str) -> Option<u32> {
    match effort {
        "low" | "minimal" => Some(1280),
        "medium" => Some(2048),
        "high" => Some(4096),
        _ => None,
    }
}

fn clamp_budget(budget: Option<u32>) -> u32 {
    budget.unwrap_or(MAX_BUDGET_TOKENS).min(MAX_BUDGET_TOKENS)
}

/// OpenAI dialect: thinking is on when the model name says so, a reasoning
/// knob is present, or the caller forces it.
pub fn detect_openai(request: &ChatCompletionRequest, force: bool) -> Option<ThinkingDirective> {
    let reasoning_tokens = request.reasoning.as_ref().and_then(|r| r.max_tokens);
    let effort = request
        .reasoning_effort
        .clone()
        .or_else(|| request.reasoning.as_ref().and_then(|r| r.effort.clone()));

    let enabled = force
        || request.model.contains("thinking")
        || effort.is_some()
        || reasoning_tokens.is_some();
    if !enabled {
        return None;
    }

    let budget = reasoning_tokens.or_else(|| effort.as_deref().and_then(effort_budget));
    Some(ThinkingDirective {
        mode: ThinkingMode::Enabled,
        budget_tokens: clamp_budget(budget),
        effort,
    })
}

pub fn detect_anthropic(request: &MessagesRequest, force: bool) -> Option<ThinkingDirective> {
    let config = request.thinking.as_ref();
    let mode = match config.map(|c| c.r#type.as_str()) {
        Some("enabled") => Some(ThinkingMode::Enabled),
        Some("adaptive") => Some(ThinkingMode::Adaptive),
        _ if force || request.model.contains("thinking") => Some(ThinkingMode::Enabled),
        _ => None,
    }?;

    Some(ThinkingDirective {
        mode,
        budget_tokens: clamp_budget(config.and_then(|c| c.budget_tokens)),
        effort: None,
    })
}

// ---- Stream parser ----

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedSegment {
    Text(String),
    Thinking(String),
}

/// Single-pass splitter for `<thinking>…</thinking>` blocks.
///
/// Safe against arbitrary chunk boundaries: bytes that could still become a
/// tag are held until the next chunk decides. A close tag only counts when
/// followed by a blank line (or at flush time), and tags preceded by a
/// quoting character are treated as literal content.
#[derive(Debug)]
pub struct ThinkingParser {
    buf: String,
    in_thinking: bool,
    prev_char: Option<char>,
    thinking_chars: usize,
    overflow: bool,
}

impl Default for ThinkingParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ThinkingParser {
    pub fn new() -> Self {
        Self {
            buf: String::new(),
            in_thinking: false,
            prev_char: None,
            thinking_chars: 0,
            overflow: false,
        }
    }

    pub fn overflowed(&self) -> bool {
        self.overflow
    }

    pub fn push(&mut self, chunk: &str) -> Vec<ParsedSegment> {
        self.buf.push_str(chunk);
        let mut out = Vec::new();
        loop {
            let progressed = if self.in_thinking {
                self.scan_in_block(&mut out)
            } else {
                self.scan_outside(&mut out)
            };
            if !progressed {
                break;
            }
        }
        out
    }

    pub fn finish(&mut self) -> Vec<ParsedSegment> {
        let mut out = Vec::new();
        if self.in_thinking {
            // A close tag with no trailing blank line is honored at flush.
            if let Some(pos) = self.find_unquoted(CLOSE_TAG)
                && self.buf[pos + CLOSE_TAG.len()..].trim().is_empty()
            {
                self.emit_thinking(&mut out, pos);
                self.consume(CLOSE_TAG.len());
                self.buf.clear();
                self.in_thinking = false;
                return out;
            }
            let rest = std::mem::take(&mut self.buf);
            if !rest.is_empty() {
                self.thinking_chars += rest.chars().count();
                out.push(ParsedSegment::Thinking(rest));
            }
            self.in_thinking = false;
        } else {
            let rest = std::mem::take(&mut self.buf);
            if !rest.is_empty() {
                out.push(ParsedSegment::Text(rest));
            }
        }
        out
    }

    fn scan_outside(&mut self, out: &mut Vec<ParsedSegment>) -> bool {
        match self.find_unquoted(OPEN_TAG) {
            Some(pos) => {
                self.emit_text(out, pos);
                self.consume(OPEN_TAG.len());
                self.in_thinking = true;
                self.thinking_chars = 0;
                true
            }
            None => {
                let hold = held_suffix(&self.buf, OPEN_TAG);
                self.emit_text(out, self.buf.len() - hold);
                false
            }
        }
    }

    fn scan_in_block(&mut self, out: &mut Vec<ParsedSegment>) -> bool {
        if self.thinking_chars > OVERFLOW_CHARS {
            // Runaway block with no close in sight; bail out to text mode.
            self.overflow = true;
            self.in_thinking = false;
            return true;
        }

        // Fast path: large buffer with no candidate tag start streams
        // straight through as thinking content.
        if self.buf.len() > FAST_PATH_MIN && !self.buf.contains("</") {
            let hold = held_suffix(&self.buf, CLOSE_TAG);
            self.emit_thinking(out, self.buf.len() - hold);
            return false;
        }

        let mut search_from = 0;
        loop {
            let Some(rel) = self.buf[search_from..].find(CLOSE_TAG) else {
                break;
            };
            let pos = search_from + rel;
            if self.is_quoted_at(pos) {
                search_from = pos + 1;
                continue;
            }
            let after = pos + CLOSE_TAG.len();
            if self.buf.len() >= after + 2 {
                if &self.buf[after..after + 2] == "\n\n" {
                    self.emit_thinking(out, pos);
                    self.consume(CLOSE_TAG.len() + 2);
                    self.in_thinking = false;
                    return true;
                }
                // Close tag without a blank line is literal content.
                search_from = pos + 1;
                continue;
            }
            // Tag found but the blank-line lookahead is incomplete; hold.
            self.emit_thinking(out, pos);
            return false;
        }

        let hold = held_suffix(&self.buf, CLOSE_TAG);
        self.emit_thinking(out, self.buf.len() - hold);
        false
    }

    fn find_unquoted(&self, tag: &str) -> Option<usize> {
        let mut search_from = 0;
        loop {
            let rel = self.buf[search_from..].find(tag)?;
            let pos = search_from + rel;
            if self.is_quoted_at(pos) {
                search_from = pos + 1;
                continue;
            }
            return Some(pos);
        }
    }

    fn is_quoted_at(&self, pos: usize) -> bool {
        let prev = if pos == 0 {
            self.prev_char
        } else {
            self.buf[..pos].chars().next_back()
        };
        matches!(prev, Some('"' | '\'' | '`' | '(' | '['))
    }

    fn emit_text(&mut self, out: &mut Vec<ParsedSegment>, upto: usize) {
        if upto == 0 {
            return;
        }
        let taken: String = self.buf.drain(..upto).collect();
        self.prev_char = taken.chars().next_back().or(self.prev_char);
        out.push(ParsedSegment::Text(taken));
    }

    fn emit_thinking(&mut self, out: &mut Vec<ParsedSegment>, upto: usize) {
        if upto == 0 {
            return;
        }
        let taken: String = self.buf.drain(..upto).collect();
        self.prev_char = taken.chars().next_back().or(self.prev_char);
        self.thinking_chars += taken.chars().count();
        out.push(ParsedSegment::Thinking(taken));
    }

    fn consume(&mut self, len: usize) {
        let taken: String = self.buf.drain(..len).collect();
        self.prev_char = taken.chars().next_back().or(self.prev_char);
    }
}

/// Length of the longest strict tag prefix the buffer ends with.
fn held_suffix(buf: &str, tag: &str) -> usize {
    let max = tag.len().saturating_sub(1).min(buf.len());
    for take in (1..=max).rev() {
        if !buf.is_char_boundary(buf.len() - take) {
            continue;
        }
        if buf.ends_with(&tag[..take]) {
            return take;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_chunks(chunks: &[&str]) -> (String, String) {
        let mut parser = ThinkingParser::new();
        let mut text = String::new();
        let mut thinking = String::new();
        for chunk in chunks {
            for seg in parser.push(chunk) {
                match seg {
                    ParsedSegment::Text(s) => text.push_str(&s),
                    ParsedSegment::Thinking(s) => thinking.push_str(&s),
                }
            }
        }
        for seg in parser.finish() {
            match seg {
                ParsedSegment::Text(s) => text.push_str(&s),
                ParsedSegment::Thinking(s) => thinking.push_str(&s),
            }
        }
        (text, thinking)
    }

    #[test]
    fn plain_text_passes_through() {
        let (text, thinking) = run_chunks(&["hello ", "world"]);
        assert_eq!(text, "hello world");
        assert_eq!(thinking, "");
    }

    #[test]
    fn block_split_across_chunks() {
        let (text, thinking) = run_chunks(&["<think", "ing>secret</think", "ing>\n\nanswer"]);
        assert_eq!(thinking, "secret");
        assert_eq!(text, "answer");
    }

    #[test]
    fn close_without_blank_line_is_content() {
        let (text, thinking) = run_chunks(&["<thinking>a</thinking>b</thinking>\n\nc"]);
        assert_eq!(thinking, "a</thinking>b");
        assert_eq!(text, "c");
    }

    #[test]
    fn close_at_flush_counts() {
        let (text, thinking) = run_chunks(&["<thinking>deep</thinking>"]);
        assert_eq!(thinking, "deep");
        assert_eq!(text, "");
    }

    #[test]
    fn quoted_tag_is_literal() {
        let (text, thinking) = run_chunks(&["say \"<thinking>\" to start"]);
        assert_eq!(thinking, "");
        assert_eq!(text, "say \"<thinking>\" to start");
    }

    #[test]
    fn unclosed_block_flushes_as_thinking() {
        let (text, thinking) = run_chunks(&["<thinking>never closed"]);
        assert_eq!(thinking, "never closed");
        assert_eq!(text, "");
    }

    #[test]
    fn chunking_invariance() {
        let input = "lead<thinking>alpha </thinking>\n\nmid \"<thinking>\" quoted <thinking>beta</thinking>";
        let whole = run_chunks(&[input]);
        for size in [1usize, 2, 3, 5, 7, 11] {
            let chunks: Vec<String> = input
                .chars()
                .collect::<Vec<char>>()
                .chunks(size)
                .map(|c| c.iter().collect())
                .collect();
            let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
            assert_eq!(run_chunks(&refs), whole, "chunk size {size}");
        }
    }

    #[test]
    fn overflow_forces_exit() {
        let mut parser = ThinkingParser::new();
        parser.push("<thinking>");
        let big = "x".repeat(OVERFLOW_CHARS + 10);
        parser.push(&big);
        parser.push("tail");
        assert!(parser.overflowed());
    }

    #[test]
    fn effort_budgets() {
        assert_eq!(effort_budget("low"), Some(1280));
        assert_eq!(effort_budget("medium"), Some(2048));
        assert_eq!(effort_budget("high"), Some(4096));
        assert_eq!(effort_budget("weird"), None);
    }

    #[test]
    fn budget_clamped_to_max() {
        assert_eq!(clamp_budget(Some(1_000_000)), MAX_BUDGET_TOKENS);
        assert_eq!(clamp_budget(None), MAX_BUDGET_TOKENS);
        assert_eq!(clamp_budget(Some(1500)), 1500);
    }

    #[test]
    fn adaptive_prelude_uses_effort() {
        let directive = ThinkingDirective {
            mode: ThinkingMode::Adaptive,
            budget_tokens: 2048,
            effort: Some("high".to_string()),
        };
        let prelude = directive.prelude();
        assert!(prelude.contains("<thinking_mode>adaptive</thinking_mode>"));
        assert!(prelude.contains("<thinking_effort>high</thinking_effort>"));
        assert!(!prelude.contains("max_thinking_length"));
    }
}
