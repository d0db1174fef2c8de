//! Refresh-token renewal against the upstream auth service.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use kgate_pool::Credential;

use crate::events::UpstreamError;

const REFRESH_HOST_TEMPLATE: &str = "https://prod.{region}.auth.desktop.kiro.dev/refreshToken";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    #[serde(alias = "subscriptionType")]
    pub subscription_tier: Option<String>,
    pub remaining_quota: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RefreshedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
    pub subscription_tier: Option<String>,
    pub remaining_quota: Option<u64>,
}

pub async fn refresh_credential(
    http: &wreq::Client,
    cred: &Credential,
) -> Result<RefreshedTokens, UpstreamError> {
    let Some(refresh_token) = cred.refresh_token.as_deref() else {
        return Err(UpstreamError::Refresh("no refresh token".to_string()));
    };
    let url = REFRESH_HOST_TEMPLATE.replace("{region}", &cred.region);

    info!(event = "token_refresh_start", credential_id = %cred.id);
    let body = serde_json::to_vec(&RefreshRequest { refresh_token })
        .map_err(|err| UpstreamError::Refresh(err.to_string()))?;
    let response = http
        .post(&url)
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await
        .map_err(|err| UpstreamError::Network(err.to_string()))?;

    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|err| UpstreamError::Network(err.to_string()))?;

    if !status.is_success() {
        warn!(
            event = "token_refresh_failed",
            credential_id = %cred.id,
            status = status.as_u16()
        );
        let body = String::from_utf8_lossy(&body).to_string();
        return match status.as_u16() {
            400 | 401 | 403 => Err(UpstreamError::Auth {
                status: status.as_u16(),
                body,
            }),
            _ => Err(UpstreamError::Refresh(format!("{status}: {body}"))),
        };
    }

    let parsed: RefreshResponse = serde_json::from_slice(&body)
        .map_err(|err| UpstreamError::Refresh(format!("bad refresh body: {err}")))?;
    if parsed.access_token.is_empty() {
        return Err(UpstreamError::Refresh("empty access token".to_string()));
    }

    info!(event = "token_refresh_done", credential_id = %cred.id);
    Ok(RefreshedTokens {
        access_token: parsed.access_token,
        refresh_token: parsed.refresh_token,
        expires_at: parsed
            .expires_in
            .map(|secs| OffsetDateTime::now_utc() + time::Duration::seconds(secs)),
        subscription_tier: parsed.subscription_tier,
        remaining_quota: parsed.remaining_quota,
    })
}
