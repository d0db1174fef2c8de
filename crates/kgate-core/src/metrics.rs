//! Request log ring and aggregate stats.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use time::OffsetDateTime;

const LOG_CAP: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub duration_ms: u64,
    pub model: String,
    pub api_dialect: String,
    pub credential_id: Option<String>,
    pub token_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

/// Append-only ring of the most recent requests.
#[derive(Debug, Default)]
pub struct RequestLog {
    inner: Mutex<VecDeque<RequestLogEntry>>,
}

impl RequestLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: RequestLogEntry) {
        if let Ok(mut ring) = self.inner.lock() {
            if ring.len() >= LOG_CAP {
                ring.pop_front();
            }
            ring.push_back(entry);
        }
    }

    pub fn snapshot(&self) -> Vec<RequestLogEntry> {
        self.inner
            .lock()
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn load(&self, entries: Vec<RequestLogEntry>) {
        if let Ok(mut ring) = self.inner.lock() {
            ring.clear();
            for entry in entries.into_iter().rev().take(LOG_CAP).rev() {
                ring.push_back(entry);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct ProxyStats {
    pub requests: AtomicU64,
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub input_tokens: AtomicU64,
    pub output_tokens: AtomicU64,
    per_model: Mutex<HashMap<String, u64>>,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, model: &str, input_tokens: u64, output_tokens: u64, success: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.input_tokens.fetch_add(input_tokens, Ordering::Relaxed);
        self.output_tokens
            .fetch_add(output_tokens, Ordering::Relaxed);
        if let Ok(mut per_model) = self.per_model.lock() {
            *per_model.entry(model.to_string()).or_insert(0) += 1;
        }
    }

    pub fn snapshot(&self) -> Value {
        let per_model = self
            .per_model
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default();
        json!({
            "requests": self.requests.load(Ordering::Relaxed),
            "successes": self.successes.load(Ordering::Relaxed),
            "failures": self.failures.load(Ordering::Relaxed),
            "input_tokens": self.input_tokens.load(Ordering::Relaxed),
            "output_tokens": self.output_tokens.load(Ordering::Relaxed),
            "per_model": per_model,
        })
    }

    pub fn load(&self, value: &Value) {
        let read = |key: &str| value.get(key).and_then(Value::as_u64).unwrap_or(0);
        self.requests.store(read("requests"), Ordering::Relaxed);
        self.successes.store(read("successes"), Ordering::Relaxed);
        self.failures.store(read("failures"), Ordering::Relaxed);
        self.input_tokens.store(read("input_tokens"), Ordering::Relaxed);
        self.output_tokens
            .store(read("output_tokens"), Ordering::Relaxed);
        if let Some(models) = value.get("per_model").and_then(Value::as_object)
            && let Ok(mut per_model) = self.per_model.lock()
        {
            per_model.clear();
            for (model, count) in models {
                per_model.insert(model.clone(), count.as_u64().unwrap_or(0));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str) -> RequestLogEntry {
        RequestLogEntry {
            timestamp: OffsetDateTime::UNIX_EPOCH,
            method: "POST".to_string(),
            path: path.to_string(),
            status_code: 200,
            duration_ms: 12,
            model: "claude-sonnet-4-5".to_string(),
            api_dialect: "openai".to_string(),
            credential_id: Some("c1".to_string()),
            token_count: 15,
            error_kind: None,
        }
    }

    #[test]
    fn ring_is_bounded() {
        let log = RequestLog::new();
        for i in 0..600 {
            log.push(entry(&format!("/{i}")));
        }
        let snapshot = log.snapshot();
        assert_eq!(snapshot.len(), 500);
        assert_eq!(snapshot[0].path, "/100");
    }

    #[test]
    fn stats_round_trip() {
        let stats = ProxyStats::new();
        stats.record("m1", 10, 5, true);
        stats.record("m1", 1, 1, false);
        let snapshot = stats.snapshot();
        let restored = ProxyStats::new();
        restored.load(&snapshot);
        assert_eq!(restored.requests.load(Ordering::Relaxed), 2);
        assert_eq!(restored.successes.load(Ordering::Relaxed), 1);
        assert_eq!(restored.input_tokens.load(Ordering::Relaxed), 11);
        assert_eq!(restored.snapshot()["per_model"]["m1"], 2);
    }
}
