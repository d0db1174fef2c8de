//! Credential model and per-credential bookkeeping.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub type CredentialId = String;

/// One upstream account: refreshable token set plus static attributes. The
/// mutable runtime bookkeeping lives in the pool, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: CredentialId,
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub region: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_tier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", with = "time::serde::rfc3339::option", default)]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub disabled: bool,
}

impl Credential {
    /// Free-tier accounts cannot serve Opus-class models. An unreported tier
    /// is treated as free.
    pub fn supports_opus(&self) -> bool {
        match self.subscription_tier.as_deref() {
            Some(tier) => !tier.eq_ignore_ascii_case("free"),
            None => false,
        }
    }

    pub fn expires_within(&self, window: time::Duration, now: OffsetDateTime) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - now <= window,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Quota,
    Auth,
    Banned,
    Other,
}

/// Read-only snapshot served by diagnostics endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    pub id: CredentialId,
    pub disabled: bool,
    pub quota_exhausted: bool,
    pub needs_refresh: bool,
    pub health: i64,
    pub inflight: u32,
    pub requests: u64,
    pub errors: u32,
    pub consecutive_errors: u32,
    pub recent_requests_5m: usize,
    pub cooldown_remaining_ms: u64,
    pub avg_latency_ms: f64,
    pub total_tokens: u64,
    pub subscription_tier: Option<String>,
}
