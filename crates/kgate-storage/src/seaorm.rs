//! SeaORM-backed storage over SQLite.

use std::time::Duration;

use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, ConnectionTrait, Database, DatabaseBackend,
    DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Schema,
};
use serde_json::Value;
use time::OffsetDateTime;

use crate::entities;
use crate::storage::{Storage, StorageResult, SummaryRow};

#[derive(Clone)]
pub struct SeaOrmStorage {
    db: DatabaseConnection,
}

impl SeaOrmStorage {
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let db = Database::connect(dsn).await?;
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA journal_mode = WAL").await?;
        }
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

#[async_trait::async_trait]
impl Storage for SeaOrmStorage {
    async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::Credentials)
            .register(entities::ApiKeys)
            .register(entities::Settings)
            .register(entities::RequestLogs)
            .register(entities::Summaries)
            .sync(&self.db)
            .await?;
        Ok(())
    }

    async fn load_credentials(&self) -> StorageResult<Vec<Value>> {
        let rows = entities::Credentials::find().all(&self.db).await?;
        Ok(rows.into_iter().map(|m| m.data).collect())
    }

    async fn upsert_credential(&self, id: &str, data: &Value) -> StorageResult<()> {
        let now = OffsetDateTime::now_utc();
        let existing = entities::Credentials::find_by_id(id.to_string())
            .one(&self.db)
            .await?;
        match existing {
            Some(model) => {
                let mut active: entities::credentials::ActiveModel = model.into();
                active.data = ActiveValue::Set(data.clone());
                active.updated_at = ActiveValue::Set(now);
                active.update(&self.db).await?;
            }
            None => {
                let active = entities::credentials::ActiveModel {
                    id: ActiveValue::Set(id.to_string()),
                    data: ActiveValue::Set(data.clone()),
                    updated_at: ActiveValue::Set(now),
                };
                entities::Credentials::insert(active).exec(&self.db).await?;
            }
        }
        Ok(())
    }

    async fn delete_credential(&self, id: &str) -> StorageResult<()> {
        entities::Credentials::delete_by_id(id.to_string())
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn load_api_keys(&self) -> StorageResult<Vec<Value>> {
        let rows = entities::ApiKeys::find().all(&self.db).await?;
        Ok(rows.into_iter().map(|m| m.data).collect())
    }

    async fn upsert_api_key(&self, id: &str, data: &Value) -> StorageResult<()> {
        let now = OffsetDateTime::now_utc();
        let existing = entities::ApiKeys::find_by_id(id.to_string())
            .one(&self.db)
            .await?;
        match existing {
            Some(model) => {
                let mut active: entities::api_keys::ActiveModel = model.into();
                active.data = ActiveValue::Set(data.clone());
                active.updated_at = ActiveValue::Set(now);
                active.update(&self.db).await?;
            }
            None => {
                let active = entities::api_keys::ActiveModel {
                    id: ActiveValue::Set(id.to_string()),
                    data: ActiveValue::Set(data.clone()),
                    updated_at: ActiveValue::Set(now),
                };
                entities::ApiKeys::insert(active).exec(&self.db).await?;
            }
        }
        Ok(())
    }

    async fn delete_api_key(&self, id: &str) -> StorageResult<()> {
        entities::ApiKeys::delete_by_id(id.to_string())
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn load_setting(&self, key: &str) -> StorageResult<Option<Value>> {
        let row = entities::Settings::find_by_id(key.to_string())
            .one(&self.db)
            .await?;
        Ok(row.map(|m| m.value))
    }

    async fn put_setting(&self, key: &str, value: &Value) -> StorageResult<()> {
        let now = OffsetDateTime::now_utc();
        let existing = entities::Settings::find_by_id(key.to_string())
            .one(&self.db)
            .await?;
        match existing {
            Some(model) => {
                let mut active: entities::settings::ActiveModel = model.into();
                active.value = ActiveValue::Set(value.clone());
                active.updated_at = ActiveValue::Set(now);
                active.update(&self.db).await?;
            }
            None => {
                let active = entities::settings::ActiveModel {
                    key: ActiveValue::Set(key.to_string()),
                    value: ActiveValue::Set(value.clone()),
                    updated_at: ActiveValue::Set(now),
                };
                entities::Settings::insert(active).exec(&self.db).await?;
            }
        }
        Ok(())
    }

    async fn load_request_logs(&self) -> StorageResult<Vec<Value>> {
        use entities::request_logs::Column;
        let rows = entities::RequestLogs::find()
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(|m| m.data).collect())
    }

    async fn replace_request_logs(&self, logs: &[Value]) -> StorageResult<()> {
        let now = OffsetDateTime::now_utc();
        entities::RequestLogs::delete_many().exec(&self.db).await?;
        for entry in logs {
            let active = entities::request_logs::ActiveModel {
                id: ActiveValue::NotSet,
                at: ActiveValue::Set(now),
                data: ActiveValue::Set(entry.clone()),
            };
            entities::RequestLogs::insert(active).exec(&self.db).await?;
        }
        Ok(())
    }

    async fn get_summary(&self, key: &str) -> StorageResult<Option<SummaryRow>> {
        let row = entities::Summaries::find_by_id(key.to_string())
            .one(&self.db)
            .await?;
        Ok(row.map(|m| SummaryRow {
            summary: m.summary,
            created_at: m.created_at,
        }))
    }

    async fn put_summary(&self, key: &str, summary: &str) -> StorageResult<()> {
        let now = OffsetDateTime::now_utc();
        let existing = entities::Summaries::find_by_id(key.to_string())
            .one(&self.db)
            .await?;
        match existing {
            Some(model) => {
                let mut active: entities::summaries::ActiveModel = model.into();
                active.summary = ActiveValue::Set(summary.to_string());
                active.created_at = ActiveValue::Set(now);
                active.update(&self.db).await?;
            }
            None => {
                let active = entities::summaries::ActiveModel {
                    cache_key: ActiveValue::Set(key.to_string()),
                    summary: ActiveValue::Set(summary.to_string()),
                    created_at: ActiveValue::Set(now),
                };
                entities::Summaries::insert(active).exec(&self.db).await?;
            }
        }
        Ok(())
    }

    async fn prune_summaries(&self, older_than: Duration, limit: usize) -> StorageResult<u64> {
        use entities::summaries::Column;
        let cutoff = OffsetDateTime::now_utc()
            - time::Duration::seconds(older_than.as_secs() as i64);
        let stale: Vec<String> = entities::Summaries::find()
            .filter(Column::CreatedAt.lt(cutoff))
            .order_by_asc(Column::CreatedAt)
            .limit(limit as u64)
            .all(&self.db)
            .await?
            .into_iter()
            .map(|m| m.cache_key)
            .collect();
        let mut pruned = 0;
        for key in stale {
            entities::Summaries::delete_by_id(key).exec(&self.db).await?;
            pruned += 1;
        }
        Ok(pruned)
    }
}
