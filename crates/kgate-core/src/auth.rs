//! Downstream authentication for the /v1 surface.

use std::collections::HashSet;

use crate::keys::{ApiKeyStore, KEY_PREFIX};

#[derive(Debug, Clone)]
pub enum AuthContext {
    /// Presented key matches the shared proxy key; any pool credential may
    /// serve the request.
    SharedKey,
    /// `key:refreshToken` form; a synthetic credential is materialized for
    /// that refresh token.
    AdHoc { refresh_token: String },
    /// Stored `kg-` key with its allow-lists.
    ApiKey {
        key_id: String,
        allowed_models: Option<Vec<String>>,
        allowed_credentials: Option<HashSet<String>>,
    },
}

impl AuthContext {
    pub fn allows_model(&self, public_id: &str) -> bool {
        match self {
            AuthContext::ApiKey {
                allowed_models: Some(models),
                ..
            } => models.iter().any(|m| m == public_id),
            _ => true,
        }
    }

    pub fn allowed_credentials(&self) -> Option<HashSet<String>> {
        match self {
            AuthContext::ApiKey {
                allowed_credentials,
                ..
            } => allowed_credentials.clone(),
            _ => None,
        }
    }
}

pub fn resolve(proxy_api_key: &str, presented: &str, keys: &ApiKeyStore) -> Option<AuthContext> {
    let presented = presented.trim();
    if presented.is_empty() {
        return None;
    }

    if presented == proxy_api_key {
        return Some(AuthContext::SharedKey);
    }

    if let Some((key, refresh_token)) = presented.split_once(':')
        && key == proxy_api_key
        && !refresh_token.is_empty()
    {
        return Some(AuthContext::AdHoc {
            refresh_token: refresh_token.to_string(),
        });
    }

    if presented.starts_with(KEY_PREFIX) {
        let record = keys.find_by_key(presented)?;
        if !record.enabled {
            return None;
        }
        return Some(AuthContext::ApiKey {
            key_id: record.id,
            allowed_models: record.allowed_models,
            allowed_credentials: record
                .allowed_credentials
                .map(|ids| ids.into_iter().collect()),
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_key_matches() {
        let keys = ApiKeyStore::new();
        assert!(matches!(
            resolve("secret", "secret", &keys),
            Some(AuthContext::SharedKey)
        ));
        assert!(resolve("secret", "wrong", &keys).is_none());
    }

    #[test]
    fn ad_hoc_refresh_token_form() {
        let keys = ApiKeyStore::new();
        match resolve("secret", "secret:my-refresh", &keys) {
            Some(AuthContext::AdHoc { refresh_token }) => {
                assert_eq!(refresh_token, "my-refresh");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(resolve("secret", "other:my-refresh", &keys).is_none());
    }

    #[test]
    fn stored_keys_respect_enabled_flag() {
        let keys = ApiKeyStore::new();
        let record = keys.create(None, Some(vec!["claude-sonnet-4-5".to_string()]), None);
        let ctx = resolve("secret", &record.key, &keys).unwrap();
        assert!(ctx.allows_model("claude-sonnet-4-5"));
        assert!(!ctx.allows_model("claude-opus-4-5"));

        keys.update(&record.id, |r| r.enabled = false);
        assert!(resolve("secret", &record.key, &keys).is_none());
    }
}
