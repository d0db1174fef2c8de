//! Credential selection policies.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Insertion order, first eligible wins.
    Priority,
    /// Least loaded: inflight dominates, recent request count breaks ties.
    Balanced,
    /// Health/load composite with randomized tie-breaking.
    #[default]
    Smart,
}

impl SelectionPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "priority" => Some(SelectionPolicy::Priority),
            "balanced" => Some(SelectionPolicy::Balanced),
            "smart" => Some(SelectionPolicy::Smart),
            _ => None,
        }
    }
}

/// Candidates scoring within this share of the top smart score are
/// considered equivalent and drawn from uniformly.
pub const SMART_TIE_BAND: f64 = 0.15;
