//! `kg-` API key store.

use std::collections::HashMap;
use std::sync::Mutex;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

pub const KEY_PREFIX: &str = "kg-";
const MASK_VISIBLE: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub key: String,
    pub label: Option<String>,
    pub enabled: bool,
    pub allowed_models: Option<Vec<String>>,
    pub allowed_credentials: Option<Vec<String>>,
    pub requests: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl ApiKeyRecord {
    /// Everything but the raw key; served on every read after creation.
    pub fn masked(&self) -> Value {
        let visible: String = self.key.chars().take(MASK_VISIBLE).collect();
        serde_json::json!({
            "id": self.id,
            "key": format!("{visible}****"),
            "label": self.label,
            "enabled": self.enabled,
            "allowed_models": self.allowed_models,
            "allowed_credentials": self.allowed_credentials,
            "requests": self.requests,
            "created_at": self.created_at.unix_timestamp(),
        })
    }
}

#[derive(Debug, Default)]
pub struct ApiKeyStore {
    inner: Mutex<HashMap<String, ApiKeyRecord>>,
}

impl ApiKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &self,
        label: Option<String>,
        allowed_models: Option<Vec<String>>,
        allowed_credentials: Option<Vec<String>>,
    ) -> ApiKeyRecord {
        let mut raw = [0u8; 24];
        rand::rng().fill_bytes(&mut raw);
        let record = ApiKeyRecord {
            id: Uuid::new_v4().to_string(),
            key: format!("{KEY_PREFIX}{}", hex::encode(raw)),
            label,
            enabled: true,
            allowed_models,
            allowed_credentials,
            requests: 0,
            created_at: OffsetDateTime::now_utc(),
        };
        if let Ok(mut map) = self.inner.lock() {
            map.insert(record.id.clone(), record.clone());
        }
        record
    }

    pub fn find_by_key(&self, key: &str) -> Option<ApiKeyRecord> {
        self.inner
            .lock()
            .ok()?
            .values()
            .find(|record| record.key == key)
            .cloned()
    }

    pub fn get(&self, id: &str) -> Option<ApiKeyRecord> {
        self.inner.lock().ok()?.get(id).cloned()
    }

    pub fn bump(&self, id: &str) {
        if let Ok(mut map) = self.inner.lock()
            && let Some(record) = map.get_mut(id)
        {
            record.requests += 1;
        }
    }

    pub fn update(&self, id: &str, patch: impl FnOnce(&mut ApiKeyRecord)) -> Option<ApiKeyRecord> {
        let mut map = self.inner.lock().ok()?;
        let record = map.get_mut(id)?;
        patch(record);
        Some(record.clone())
    }

    pub fn delete(&self, id: &str) -> bool {
        self.inner
            .lock()
            .map(|mut map| map.remove(id).is_some())
            .unwrap_or(false)
    }

    pub fn list_masked(&self) -> Vec<Value> {
        self.inner
            .lock()
            .map(|map| {
                let mut records: Vec<&ApiKeyRecord> = map.values().collect();
                records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                records.iter().map(|record| record.masked()).collect()
            })
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<ApiKeyRecord> {
        self.inner
            .lock()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn load(&self, records: Vec<ApiKeyRecord>) {
        if let Ok(mut map) = self.inner.lock() {
            map.clear();
            for record in records {
                map.insert(record.id.clone(), record);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_keys_have_prefix_and_lookup() {
        let store = ApiKeyStore::new();
        let record = store.create(Some("ci".to_string()), None, None);
        assert!(record.key.starts_with(KEY_PREFIX));
        let found = store.find_by_key(&record.key).unwrap();
        assert_eq!(found.id, record.id);
    }

    #[test]
    fn masked_listing_hides_raw_key() {
        let store = ApiKeyStore::new();
        let record = store.create(None, None, None);
        let listed = store.list_masked();
        let masked = listed[0]["key"].as_str().unwrap();
        assert!(masked.ends_with("****"));
        assert_ne!(masked, record.key);
    }

    #[test]
    fn bump_counts_requests() {
        let store = ApiKeyStore::new();
        let record = store.create(None, None, None);
        store.bump(&record.id);
        store.bump(&record.id);
        assert_eq!(store.get(&record.id).unwrap().requests, 2);
    }
}
