//! Cached DNS resolution with stale-on-failure fallback.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::net::lookup_host;
use tracing::warn;

const FRESH_TTL: Duration = Duration::from_secs(5 * 60);
const STALE_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, thiserror::Error)]
#[error("dns resolution failed for {host}: {reason}")]
pub struct DnsError {
    pub host: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
struct DnsEntry {
    addrs: Vec<SocketAddr>,
    resolved_at: Instant,
}

#[derive(Debug, Default)]
pub struct DnsCache {
    entries: Mutex<HashMap<String, DnsEntry>>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn resolve(&self, host: &str) -> Result<Vec<SocketAddr>, DnsError> {
        if let Some(entry) = self.cached(host)
            && entry.resolved_at.elapsed() < FRESH_TTL
        {
            return Ok(entry.addrs);
        }

        match lookup_host((host, 443)).await {
            Ok(addrs) => {
                let addrs: Vec<SocketAddr> = addrs.collect();
                if addrs.is_empty() {
                    return self.stale_or_err(host, "empty answer");
                }
                self.store(host, addrs.clone());
                Ok(addrs)
            }
            Err(err) => {
                warn!(event = "dns_lookup_failed", host = %host, error = %err);
                self.stale_or_err(host, &err.to_string())
            }
        }
    }

    fn stale_or_err(&self, host: &str, reason: &str) -> Result<Vec<SocketAddr>, DnsError> {
        if let Some(entry) = self.cached(host)
            && entry.resolved_at.elapsed() < STALE_TTL
        {
            return Ok(entry.addrs);
        }
        Err(DnsError {
            host: host.to_string(),
            reason: reason.to_string(),
        })
    }

    fn cached(&self, host: &str) -> Option<DnsEntry> {
        self.lock().get(host).cloned()
    }

    fn store(&self, host: &str, addrs: Vec<SocketAddr>) {
        self.lock().insert(
            host.to_string(),
            DnsEntry {
                addrs,
                resolved_at: Instant::now(),
            },
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DnsEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn localhost_resolves_and_caches() {
        let cache = DnsCache::new();
        let first = cache.resolve("localhost").await.unwrap();
        assert!(!first.is_empty());
        // Second hit comes from cache.
        let second = cache.resolve("localhost").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn unknown_host_without_cache_errors() {
        let cache = DnsCache::new();
        let result = cache.resolve("definitely-not-a-real-host.invalid").await;
        assert!(result.is_err());
    }
}
