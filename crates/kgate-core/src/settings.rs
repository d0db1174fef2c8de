//! Runtime-mutable settings, swapped atomically and persisted as a settings
//! document.

use serde::{Deserialize, Serialize};

use kgate_pool::SelectionPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub selection_policy: SelectionPolicy,
    pub compression_enabled: bool,
    pub auto_compress: bool,
    pub preferred_endpoint: Option<String>,
    pub compress_keep_count: usize,
    pub thinking_override: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            selection_policy: SelectionPolicy::default(),
            compression_enabled: true,
            auto_compress: true,
            preferred_endpoint: None,
            compress_keep_count: 30,
            thinking_override: false,
        }
    }
}
