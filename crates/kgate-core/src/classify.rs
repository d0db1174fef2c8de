//! Upstream error classification.

use kgate_pool::ErrorKind;
use kgate_upstream::UpstreamError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Banned,
    Quota,
    Auth,
    RateLimit,
    ContentTooLong,
    InvalidModel,
    Client,
    Server,
    Network,
    Unknown,
}

#[derive(Debug, Clone, Copy)]
pub struct Classified {
    pub category: ErrorCategory,
    /// The request may be retried (usually on another credential).
    pub retryable: bool,
    pub refresh_token: bool,
    pub disable_credential: bool,
    pub suggested_delay_ms: u64,
}

const NETWORK_MARKERS: [&str; 9] = [
    "econnreset",
    "etimedout",
    "enotfound",
    "eai_again",
    "epipe",
    "econnrefused",
    "fetch failed",
    "timeout",
    "aborted",
];

pub fn classify(status: Option<u16>, message: &str) -> Classified {
    let lowered = message.to_ascii_lowercase();

    if lowered.contains("banned")
        || lowered.contains("suspended")
        || lowered.contains("account disabled")
    {
        return make(ErrorCategory::Banned, true, false, true, 0);
    }
    if status == Some(402)
        || lowered.contains("monthly_request_count")
        || lowered.contains("quota")
    {
        return make(ErrorCategory::Quota, true, false, false, 0);
    }
    if matches!(status, Some(401) | Some(403)) || lowered.contains("expiredtoken") {
        return make(ErrorCategory::Auth, true, true, false, 0);
    }
    if status == Some(429) || lowered.contains("throttl") || lowered.contains("rate limit") {
        return make(ErrorCategory::RateLimit, true, false, false, 1_000);
    }
    if lowered.contains("too long") || lowered.contains("contentlengthexceeded") {
        return make(ErrorCategory::ContentTooLong, false, false, false, 0);
    }
    if lowered.contains("model") && (lowered.contains("invalid") || lowered.contains("unsupported"))
    {
        return make(ErrorCategory::InvalidModel, false, false, false, 0);
    }
    if let Some(code) = status {
        if (400..500).contains(&code) {
            return make(ErrorCategory::Client, false, false, false, 0);
        }
        if code >= 500 {
            return make(ErrorCategory::Server, true, false, false, 500);
        }
    }
    if NETWORK_MARKERS.iter().any(|m| lowered.contains(m)) {
        return make(ErrorCategory::Network, true, false, false, 200);
    }
    make(ErrorCategory::Unknown, false, false, false, 0)
}

pub fn classify_upstream(err: &UpstreamError) -> Classified {
    match err {
        UpstreamError::QuotaExhausted { body } => classify(Some(402), body),
        UpstreamError::Auth { status, body } => classify(Some(*status), body),
        UpstreamError::RateLimited => classify(Some(429), ""),
        UpstreamError::ContentTooLong => classify(Some(400), "content too long"),
        UpstreamError::Status { status, body } => classify(Some(*status), body),
        UpstreamError::Network(message) | UpstreamError::Dns(message) => {
            classify(None, &format!("fetch failed {message}"))
        }
        UpstreamError::IdleTimeout => classify(None, "timeout"),
        UpstreamError::Decode(message) => classify(None, message),
        UpstreamError::Exception { kind, message } => {
            classify(None, &format!("{kind} {message}"))
        }
        UpstreamError::Refresh(message) => classify(None, message),
    }
}

/// Pool bookkeeping kind for a classified failure.
pub fn pool_error_kind(classified: &Classified) -> ErrorKind {
    match classified.category {
        ErrorCategory::Banned => ErrorKind::Banned,
        ErrorCategory::Quota => ErrorKind::Quota,
        ErrorCategory::Auth => ErrorKind::Auth,
        ErrorCategory::Network => ErrorKind::Network,
        _ => ErrorKind::Other,
    }
}

fn make(
    category: ErrorCategory,
    retryable: bool,
    refresh_token: bool,
    disable_credential: bool,
    suggested_delay_ms: u64,
) -> Classified {
    Classified {
        category,
        retryable,
        refresh_token,
        disable_credential,
        suggested_delay_ms,
    }
}
