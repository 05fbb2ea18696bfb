//! SQLite 会话记录存储（sqlx，完全异步）
//!
//! 消息与结果集以 JSON 列保存；client_address 建索引供跨会话聚合查询。

#![cfg(feature = "async-sqlite")]

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use super::{SessionPatch, SessionRecord, SessionRecordStore, StoreError};

pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn init_tables(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS session_records (
                session_id TEXT PRIMARY KEY,
                messages TEXT NOT NULL,
                property_sets TEXT NOT NULL,
                client_address TEXT,
                client_descriptor TEXT,
                title TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_session_records_address ON session_records(client_address)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// 读-改-写放在同一事务内
    async fn write(
        &self,
        session_id: &str,
        patch: SessionPatch,
        create_missing: bool,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM session_records WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await?;

        let mut record = match row {
            Some(row) => row_to_record(&row)?,
            None if create_missing => SessionRecord::new(session_id),
            None => return Err(StoreError::NotFound(session_id.to_string())),
        };
        record.apply(patch);

        sqlx::query(
            "INSERT OR REPLACE INTO session_records
             (session_id, messages, property_sets, client_address, client_descriptor, title, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.session_id)
        .bind(serde_json::to_string(&record.messages)?)
        .bind(serde_json::to_string(&record.property_sets)?)
        .bind(&record.client_address)
        .bind(&record.client_descriptor)
        .bind(&record.title)
        .bind(format_ts(&record.created_at))
        .bind(format_ts(&record.updated_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// 固定精度，保证 TEXT 列按字典序即时间序
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn row_to_record(row: &SqliteRow) -> Result<SessionRecord, StoreError> {
    let messages: String = row.try_get("messages")?;
    let property_sets: String = row.try_get("property_sets")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(SessionRecord {
        session_id: row.try_get("session_id")?,
        messages: serde_json::from_str(&messages)?,
        property_sets: serde_json::from_str(&property_sets)?,
        client_address: row.try_get("client_address")?,
        client_descriptor: row.try_get("client_descriptor")?,
        title: row.try_get("title")?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

#[async_trait]
impl SessionRecordStore for SqliteSessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM session_records WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn upsert(&self, session_id: &str, patch: SessionPatch) -> Result<(), StoreError> {
        self.write(session_id, patch, true).await
    }

    async fn update(&self, session_id: &str, patch: SessionPatch) -> Result<(), StoreError> {
        self.write(session_id, patch, false).await
    }

    async fn list_by_address(&self, address: &str) -> Result<Vec<SessionRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM session_records WHERE client_address = ? ORDER BY created_at ASC, session_id ASC",
        )
        .bind(address)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Message, PropertyRecord, PropertySet};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sqlite_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("sessions.db");

        let store = SqliteSessionStore::new(&db_path).await.unwrap();
        store
            .upsert(
                "s1",
                SessionPatch::messages(vec![Message::user("piso en Madrid")])
                    .with_client(Some("10.0.0.7".into()), Some("firefox".into())),
            )
            .await
            .unwrap();
        store
            .upsert(
                "s1",
                SessionPatch::property_sets(vec![PropertySet::new(vec![PropertyRecord::with_id("p1")])]),
            )
            .await
            .unwrap();
        store.close().await;

        let reopened = SqliteSessionStore::new(&db_path).await.unwrap();
        let record = reopened.get("s1").await.unwrap().unwrap();
        assert_eq!(record.messages[0].content, "piso en Madrid");
        assert_eq!(record.property_sets[0].properties[0].id.as_deref(), Some("p1"));
        assert_eq!(record.client_descriptor.as_deref(), Some("firefox"));

        let by_addr = reopened.list_by_address("10.0.0.7").await.unwrap();
        assert_eq!(by_addr.len(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_update_missing_record() {
        let dir = TempDir::new().unwrap();
        let store = SqliteSessionStore::new(dir.path().join("s.db")).await.unwrap();

        let err = store.update("nope", SessionPatch::title("t")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(store.get("nope").await.unwrap().is_none());
    }
}
