//! Supported model catalog, name normalization, and aliasing.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpec {
    /// Name advertised on /v1/models.
    pub public_id: &'static str,
    /// Normalized match key (dotted minor versions).
    key: &'static str,
    /// Model id the upstream expects.
    pub upstream_id: &'static str,
    /// Opus-class models are blocked for free-tier credentials.
    pub opus_class: bool,
}

pub const MODELS: [ModelSpec; 5] = [
    ModelSpec {
        public_id: "claude-opus-4-5",
        key: "claude-opus-4.5",
        upstream_id: "CLAUDE_OPUS_4_5_20251101_V1_0",
        opus_class: true,
    },
    ModelSpec {
        public_id: "claude-sonnet-4-5",
        key: "claude-sonnet-4.5",
        upstream_id: "CLAUDE_SONNET_4_5_20250929_V1_0",
        opus_class: false,
    },
    ModelSpec {
        public_id: "claude-sonnet-4",
        key: "claude-sonnet-4",
        upstream_id: "CLAUDE_SONNET_4_20250514_V1_0",
        opus_class: false,
    },
    ModelSpec {
        public_id: "claude-haiku-4-5",
        key: "claude-haiku-4.5",
        upstream_id: "CLAUDE_HAIKU_4_5_20251001_V1_0",
        opus_class: false,
    },
    ModelSpec {
        public_id: "claude-3-7-sonnet-20250219",
        key: "claude-3.7-sonnet",
        upstream_id: "CLAUDE_3_7_SONNET_20250219_V1_0",
        opus_class: false,
    },
];

/// Lowercase, strip the `anthropic/` prefix and date suffixes, map `_` to
/// `.`, and join dashed minor versions (`-4-5` → `-4.5`).
pub fn normalize_model(name: &str) -> String {
    let mut name = name.trim().to_ascii_lowercase();
    if let Some(rest) = name.strip_prefix("anthropic/") {
        name = rest.to_string();
    }
    name = name.replace('_', ".");
    name = strip_date_suffix(&name);
    dot_minor_versions(&name)
}

fn strip_date_suffix(name: &str) -> String {
    if let Some(pos) = name.rfind('-') {
        let tail = &name[pos + 1..];
        if tail.len() == 8 && tail.chars().all(|c| c.is_ascii_digit()) {
            return name[..pos].to_string();
        }
    }
    name.to_string()
}

fn dot_minor_versions(name: &str) -> String {
    let parts: Vec<&str> = name.split('-').collect();
    let mut out: Vec<String> = Vec::with_capacity(parts.len());
    let mut i = 0;
    while i < parts.len() {
        let part = parts[i];
        let both_numeric = i + 1 < parts.len()
            && !part.is_empty()
            && part.chars().all(|c| c.is_ascii_digit())
            && !parts[i + 1].is_empty()
            && parts[i + 1].chars().all(|c| c.is_ascii_digit())
            && parts[i + 1].len() < 8;
        if both_numeric {
            out.push(format!("{part}.{}", parts[i + 1]));
            i += 2;
        } else {
            out.push(part.to_string());
            i += 1;
        }
    }
    out.join("-")
}

pub fn resolve_model(name: &str) -> Option<&'static ModelSpec> {
    // Thinking is a request attribute, not a distinct model.
    let normalized = normalize_model(name)
        .replace("-thinking", "")
        .replace("thinking-", "");
    if let Some(spec) = MODELS.iter().find(|m| m.key == normalized) {
        return Some(spec);
    }
    // gpt-* callers get the Claude equivalents.
    if normalized.starts_with("gpt-") || normalized.starts_with("o1") || normalized.starts_with("o3")
    {
        let key = if normalized.contains("mini") || normalized.contains("nano") {
            "claude-haiku-4.5"
        } else {
            "claude-sonnet-4.5"
        };
        return MODELS.iter().find(|m| m.key == key);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_rules() {
        assert_eq!(normalize_model("Claude-Sonnet-4-5"), "claude-sonnet-4.5");
        assert_eq!(
            normalize_model("anthropic/claude-opus-4-5"),
            "claude-opus-4.5"
        );
        assert_eq!(
            normalize_model("claude-3-7-sonnet-20250219"),
            "claude-3.7-sonnet"
        );
        assert_eq!(normalize_model("claude_sonnet-4"), "claude.sonnet-4");
    }

    #[test]
    fn known_models_resolve() {
        assert_eq!(
            resolve_model("claude-sonnet-4-5").unwrap().public_id,
            "claude-sonnet-4-5"
        );
        assert_eq!(
            resolve_model("claude-sonnet-4-5-20250929").unwrap().public_id,
            "claude-sonnet-4-5"
        );
        assert!(resolve_model("claude-opus-4-5").unwrap().opus_class);
    }

    #[test]
    fn gpt_names_alias_to_claude() {
        assert_eq!(
            resolve_model("gpt-4o").unwrap().public_id,
            "claude-sonnet-4-5"
        );
        assert_eq!(
            resolve_model("gpt-4o-mini").unwrap().public_id,
            "claude-haiku-4-5"
        );
    }

    #[test]
    fn unknown_models_are_rejected() {
        assert!(resolve_model("llama-3-70b").is_none());
        assert!(resolve_model("").is_none());
    }

    #[test]
    fn thinking_suffix_still_resolves() {
        assert_eq!(
            resolve_model("claude-sonnet-4-5-thinking").unwrap().public_id,
            "claude-sonnet-4-5"
        );
    }
}
