//! In-memory storage, used by tests and as a no-persistence fallback.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;

use crate::storage::{Storage, StorageResult, SummaryRow};

#[derive(Default)]
struct MemoryInner {
    credentials: HashMap<String, Value>,
    api_keys: HashMap<String, Value>,
    settings: HashMap<String, Value>,
    request_logs: Vec<Value>,
    summaries: HashMap<String, SummaryRow>,
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn sync(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn load_credentials(&self) -> StorageResult<Vec<Value>> {
        Ok(self.lock().credentials.values().cloned().collect())
    }

    async fn upsert_credential(&self, id: &str, data: &Value) -> StorageResult<()> {
        self.lock().credentials.insert(id.to_string(), data.clone());
        Ok(())
    }

    async fn delete_credential(&self, id: &str) -> StorageResult<()> {
        self.lock().credentials.remove(id);
        Ok(())
    }

    async fn load_api_keys(&self) -> StorageResult<Vec<Value>> {
        Ok(self.lock().api_keys.values().cloned().collect())
    }

    async fn upsert_api_key(&self, id: &str, data: &Value) -> StorageResult<()> {
        self.lock().api_keys.insert(id.to_string(), data.clone());
        Ok(())
    }

    async fn delete_api_key(&self, id: &str) -> StorageResult<()> {
        self.lock().api_keys.remove(id);
        Ok(())
    }

    async fn load_setting(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self.lock().settings.get(key).cloned())
    }

    async fn put_setting(&self, key: &str, value: &Value) -> StorageResult<()> {
        self.lock().settings.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn load_request_logs(&self) -> StorageResult<Vec<Value>> {
        Ok(self.lock().request_logs.clone())
    }

    async fn replace_request_logs(&self, logs: &[Value]) -> StorageResult<()> {
        self.lock().request_logs = logs.to_vec();
        Ok(())
    }

    async fn get_summary(&self, key: &str) -> StorageResult<Option<SummaryRow>> {
        Ok(self.lock().summaries.get(key).cloned())
    }

    async fn put_summary(&self, key: &str, summary: &str) -> StorageResult<()> {
        self.lock().summaries.insert(
            key.to_string(),
            SummaryRow {
                summary: summary.to_string(),
                created_at: OffsetDateTime::now_utc(),
            },
        );
        Ok(())
    }

    async fn prune_summaries(&self, older_than: Duration, limit: usize) -> StorageResult<u64> {
        let cutoff =
            OffsetDateTime::now_utc() - time::Duration::seconds(older_than.as_secs() as i64);
        let mut inner = self.lock();
        let stale: Vec<String> = inner
            .summaries
            .iter()
            .filter(|(_, row)| row.created_at < cutoff)
            .take(limit)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            inner.summaries.remove(key);
        }
        Ok(stale.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn documents_round_trip() {
        let storage = MemoryStorage::new();
        storage
            .upsert_credential("c1", &json!({"id": "c1"}))
            .await
            .unwrap();
        let loaded = storage.load_credentials().await.unwrap();
        assert_eq!(loaded.len(), 1);
        storage.delete_credential("c1").await.unwrap();
        assert!(storage.load_credentials().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn summaries_prune_by_age() {
        let storage = MemoryStorage::new();
        storage.put_summary("k", "s").await.unwrap();
        assert_eq!(
            storage
                .prune_summaries(Duration::from_secs(3600), 50)
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            storage.prune_summaries(Duration::ZERO, 50).await.unwrap(),
            1
        );
    }
}
