//! Startup wiring: storage, in-memory state, engine, periodic tasks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use kgate_compress::{Compressor, CompressorConfig, StoredSummary, SummaryStore};
use kgate_pool::{Credential, CredentialPool, PoolConfig};
use kgate_storage::{SeaOrmStorage, Storage, StorageError};
use kgate_upstream::client::{UpstreamClient, UpstreamConfig};

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::config::ProxyConfig;
use crate::engine::{Engine, UpstreamSummaryBackend};
use crate::keys::{ApiKeyRecord, ApiKeyStore};
use crate::limiter::RateLimiter;
use crate::metrics::{ProxyStats, RequestLog, RequestLogEntry};
use crate::settings::RuntimeSettings;

pub const SETTING_SETTINGS: &str = "config/settings";
pub const SETTING_PROXY: &str = "config/proxy";
pub const SETTING_STATS: &str = "stats/proxy";

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("storage init failed: {0}")]
    Storage(#[from] StorageError),
    #[error("upstream client init failed: {0}")]
    Upstream(#[from] kgate_upstream::UpstreamError),
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub config: Arc<ProxyConfig>,
}

impl AppState {
    /// Final snapshot on graceful shutdown.
    pub async fn shutdown(&self) {
        snapshot(&self.engine).await;
        info!(event = "shutdown_snapshot_done");
    }
}

pub async fn bootstrap(config: ProxyConfig) -> Result<AppState, BootstrapError> {
    let storage: Arc<dyn Storage> =
        Arc::new(SeaOrmStorage::connect(&config.database_url).await?);
    storage.sync().await?;

    let settings: RuntimeSettings = storage
        .load_setting(SETTING_SETTINGS)
        .await?
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default();

    let pool = Arc::new(CredentialPool::new(PoolConfig {
        policy: settings.selection_policy,
        ..Default::default()
    }));
    for data in storage.load_credentials().await? {
        let quota_exhausted = data
            .get("quota_exhausted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        match serde_json::from_value::<Credential>(data) {
            Ok(cred) => {
                let id = cred.id.clone();
                pool.add(cred);
                pool.set_quota_exhausted(&id, quota_exhausted);
            }
            Err(err) => warn!(event = "credential_load_failed", error = %err),
        }
    }
    info!(event = "credentials_loaded", count = pool.len());

    let keys = Arc::new(ApiKeyStore::new());
    let mut key_records = Vec::new();
    for data in storage.load_api_keys().await? {
        match serde_json::from_value::<ApiKeyRecord>(data) {
            Ok(record) => key_records.push(record),
            Err(err) => warn!(event = "api_key_load_failed", error = %err),
        }
    }
    keys.load(key_records);

    let stats = Arc::new(ProxyStats::new());
    if let Some(value) = storage.load_setting(SETTING_STATS).await? {
        stats.load(&value);
    }

    let request_log = Arc::new(RequestLog::new());
    let mut log_entries = Vec::new();
    for data in storage.load_request_logs().await? {
        if let Ok(entry) = serde_json::from_value::<RequestLogEntry>(data) {
            log_entries.push(entry);
        }
    }
    request_log.load(log_entries);

    let upstream = Arc::new(UpstreamClient::new(UpstreamConfig::default())?);
    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
    let limiter = Arc::new(RateLimiter::new(config.rate_limit_per_minute));

    let compressor = if config.enable_compression {
        let backend = Arc::new(UpstreamSummaryBackend {
            pool: Arc::clone(&pool),
            upstream: Arc::clone(&upstream),
        });
        let store = Arc::new(StorageSummaryStore {
            storage: Arc::clone(&storage),
        });
        Some(Arc::new(Compressor::new(
            CompressorConfig {
                auto: settings.auto_compress,
                keep_count: settings.compress_keep_count,
                ..Default::default()
            },
            backend,
            Some(store),
        )))
    } else {
        None
    };

    let engine = Arc::new(Engine::new(
        pool,
        upstream,
        breaker,
        limiter,
        compressor,
        stats,
        request_log,
        keys,
        storage,
        settings,
    ));

    spawn_periodic_tasks(Arc::clone(&engine));

    Ok(AppState {
        engine,
        config: Arc::new(config),
    })
}

fn spawn_periodic_tasks(engine: Arc<Engine>) {
    let snapshot_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            snapshot(&snapshot_engine).await;
        }
    });

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            engine.pool.self_heal();
            if let Some(compressor) = &engine.compressor {
                compressor.cleanup().await;
            }
        }
    });
}

pub async fn snapshot(engine: &Engine) {
    if let Err(err) = engine
        .storage
        .put_setting(SETTING_STATS, &engine.stats.snapshot())
        .await
    {
        warn!(event = "stats_snapshot_failed", error = %err);
    }

    let entries: Vec<Value> = engine
        .request_log
        .snapshot()
        .into_iter()
        .filter_map(|entry| serde_json::to_value(entry).ok())
        .collect();
    if let Err(err) = engine.storage.replace_request_logs(&entries).await {
        warn!(event = "log_snapshot_failed", error = %err);
    }
}

/// Durable summary tier backed by the shared storage.
pub struct StorageSummaryStore {
    pub storage: Arc<dyn Storage>,
}

#[async_trait]
impl SummaryStore for StorageSummaryStore {
    async fn get(&self, key: &str) -> Option<StoredSummary> {
        self.storage
            .get_summary(key)
            .await
            .ok()
            .flatten()
            .map(|row| StoredSummary {
                summary: row.summary,
                saved_at: row.created_at,
            })
    }

    async fn put(&self, key: &str, summary: &str) {
        if let Err(err) = self.storage.put_summary(key, summary).await {
            warn!(event = "summary_persist_failed", error = %err);
        }
    }

    async fn prune(&self, older_than: Duration, limit: usize) -> usize {
        self.storage
            .prune_summaries(older_than, limit)
            .await
            .map(|n| n as usize)
            .unwrap_or(0)
    }
}
