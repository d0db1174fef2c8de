//! Persistence contract.
//!
//! Storage backs bootstrap loads, admin mutations, periodic snapshots, and
//! the compressor's durable cache tier. Runtime request handling never
//! reads the database; it works off in-memory state.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct SummaryRow {
    pub summary: String,
    pub created_at: OffsetDateTime,
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Entity-first schema sync, run once at bootstrap.
    async fn sync(&self) -> StorageResult<()>;

    // Credentials (opaque JSON documents keyed by credential id).
    async fn load_credentials(&self) -> StorageResult<Vec<Value>>;
    async fn upsert_credential(&self, id: &str, data: &Value) -> StorageResult<()>;
    async fn delete_credential(&self, id: &str) -> StorageResult<()>;

    // API keys.
    async fn load_api_keys(&self) -> StorageResult<Vec<Value>>;
    async fn upsert_api_key(&self, id: &str, data: &Value) -> StorageResult<()>;
    async fn delete_api_key(&self, id: &str) -> StorageResult<()>;

    // Config / settings / stats documents.
    async fn load_setting(&self, key: &str) -> StorageResult<Option<Value>>;
    async fn put_setting(&self, key: &str, value: &Value) -> StorageResult<()>;

    // Request-log snapshots (bounded; whole-buffer replacement).
    async fn load_request_logs(&self) -> StorageResult<Vec<Value>>;
    async fn replace_request_logs(&self, entries: &[Value]) -> StorageResult<()>;

    // Compressor summaries.
    async fn get_summary(&self, key: &str) -> StorageResult<Option<SummaryRow>>;
    async fn put_summary(&self, key: &str, summary: &str) -> StorageResult<()>;
    async fn prune_summaries(&self, older_than: Duration, limit: usize) -> StorageResult<u64>;
}
