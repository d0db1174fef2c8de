//! The two upstream endpoints and their health ranking.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const RECENT_ERROR_WINDOW: Duration = Duration::from_secs(30);
const CONSECUTIVE_ERROR_DEMOTION: u32 = 3;
const SUCCESS_RATE_MARGIN: f64 = 0.10;
const MIN_RATE_SAMPLES: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub name: &'static str,
    pub origin: &'static str,
    host_template: &'static str,
    path: &'static str,
}

impl Endpoint {
    pub fn host(&self, region: &str) -> String {
        self.host_template.replace("{region}", region)
    }

    pub fn url(&self, region: &str) -> String {
        format!("https://{}{}", self.host(region), self.path)
    }
}

pub const ENDPOINTS: [Endpoint; 2] = [
    Endpoint {
        name: "codewhisperer",
        origin: "AI_EDITOR",
        host_template: "codewhisperer.{region}.amazonaws.com",
        path: "/generateAssistantResponse",
    },
    Endpoint {
        name: "q",
        origin: "CHAT",
        host_template: "q.{region}.amazonaws.com",
        path: "/generateAssistantResponse",
    },
];

#[derive(Debug, Default, Clone)]
struct EndpointHealth {
    consecutive_errors: u32,
    last_error: Option<Instant>,
    successes: u64,
    failures: u64,
    latency_ewma_ms: f64,
    latency_samples: u64,
}

impl EndpointHealth {
    fn recently_failing(&self, now: Instant) -> bool {
        self.consecutive_errors >= CONSECUTIVE_ERROR_DEMOTION
            && self
                .last_error
                .is_some_and(|at| now.duration_since(at) <= RECENT_ERROR_WINDOW)
    }

    fn success_rate(&self) -> Option<f64> {
        let total = self.successes + self.failures;
        if total < MIN_RATE_SAMPLES {
            return None;
        }
        Some(self.successes as f64 / total as f64)
    }
}

#[derive(Debug, Default)]
pub struct EndpointTable {
    health: Mutex<HashMap<&'static str, EndpointHealth>>,
}

impl EndpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Order endpoints for the next attempt: caller preference first, then
    /// recent-failure demotion, then success rate (when both have samples
    /// and differ meaningfully), then EWMA latency.
    pub fn ordered(&self, prefer: Option<&str>) -> Vec<Endpoint> {
        let now = Instant::now();
        let health = self.lock();
        let mut endpoints: Vec<Endpoint> = ENDPOINTS.to_vec();

        endpoints.sort_by(|a, b| {
            let ha = health.get(a.name).cloned().unwrap_or_default();
            let hb = health.get(b.name).cloned().unwrap_or_default();

            if prefer == Some(a.name) && prefer != Some(b.name) {
                return std::cmp::Ordering::Less;
            }
            if prefer == Some(b.name) && prefer != Some(a.name) {
                return std::cmp::Ordering::Greater;
            }

            match (ha.recently_failing(now), hb.recently_failing(now)) {
                (true, false) => return std::cmp::Ordering::Greater,
                (false, true) => return std::cmp::Ordering::Less,
                _ => {}
            }

            if let (Some(rate_a), Some(rate_b)) = (ha.success_rate(), hb.success_rate())
                && (rate_a - rate_b).abs() > SUCCESS_RATE_MARGIN
            {
                return rate_b
                    .partial_cmp(&rate_a)
                    .unwrap_or(std::cmp::Ordering::Equal);
            }

            ha.latency_ewma_ms
                .partial_cmp(&hb.latency_ewma_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        endpoints
    }

    pub fn record_success(&self, name: &'static str, latency: Duration) {
        let mut health = self.lock();
        let entry = health.entry(name).or_default();
        entry.successes += 1;
        entry.consecutive_errors = 0;
        let sample = latency.as_millis() as f64;
        entry.latency_ewma_ms = if entry.latency_samples == 0 {
            sample
        } else {
            entry.latency_ewma_ms * 0.8 + sample * 0.2
        };
        entry.latency_samples += 1;
    }

    pub fn record_failure(&self, name: &'static str) {
        let mut health = self.lock();
        let entry = health.entry(name).or_default();
        entry.failures += 1;
        entry.consecutive_errors += 1;
        entry.last_error = Some(Instant::now());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<&'static str, EndpointHealth>> {
        match self.health.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_substitutes_region() {
        assert_eq!(
            ENDPOINTS[0].url("us-east-1"),
            "https://codewhisperer.us-east-1.amazonaws.com/generateAssistantResponse"
        );
    }

    #[test]
    fn preference_wins() {
        let table = EndpointTable::new();
        let ordered = table.ordered(Some("q"));
        assert_eq!(ordered[0].name, "q");
    }

    #[test]
    fn failing_endpoint_is_demoted() {
        let table = EndpointTable::new();
        for _ in 0..3 {
            table.record_failure("codewhisperer");
        }
        let ordered = table.ordered(None);
        assert_eq!(ordered.last().unwrap().name, "codewhisperer");
    }

    #[test]
    fn better_success_rate_ranks_first() {
        let table = EndpointTable::new();
        for _ in 0..10 {
            table.record_success("q", Duration::from_millis(900));
        }
        for _ in 0..5 {
            table.record_success("codewhisperer", Duration::from_millis(100));
            table.record_failure("codewhisperer");
        }
        let ordered = table.ordered(None);
        assert_eq!(ordered[0].name, "q");
    }

    #[test]
    fn latency_breaks_ties() {
        let table = EndpointTable::new();
        for _ in 0..6 {
            table.record_success("q", Duration::from_millis(50));
            table.record_success("codewhisperer", Duration::from_millis(500));
        }
        let ordered = table.ordered(None);
        assert_eq!(ordered[0].name, "q");
    }
}
