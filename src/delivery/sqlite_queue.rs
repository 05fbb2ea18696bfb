//! SQLite 回调队列（sqlx）
//!
//! 本地文件库没有变更通知，open_push 返回 Unsupported，订阅端退化为轮询。

#![cfg(feature = "async-sqlite")]

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use super::payload::CallbackRecord;
use super::queue::{CallbackQueue, PushChannel};
use crate::memory::PropertyRecord;
use crate::store::StoreError;

pub struct SqliteCallbackQueue {
    pool: SqlitePool,
}

impl SqliteCallbackQueue {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let queue = Self { pool };
        queue.init_tables().await?;
        Ok(queue)
    }

    async fn init_tables(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS callbacks (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                pending INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_callbacks_pending ON callbacks(session_id, pending)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS search_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                property TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// 插入回调记录（worker 侧）
    pub async fn insert_callback(&self, session_id: &str, payload: Value) -> Result<CallbackRecord, StoreError> {
        let record = CallbackRecord::new(session_id, payload);
        sqlx::query(
            "INSERT INTO callbacks (id, session_id, payload, pending, updated_at) VALUES (?, ?, ?, 1, ?)",
        )
        .bind(&record.id)
        .bind(&record.session_id)
        .bind(serde_json::to_string(&record.payload)?)
        .bind(format_ts(&record.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(record)
    }

    /// 写入搜索结果行（worker 侧）
    pub async fn insert_results(&self, session_id: &str, properties: &[PropertyRecord]) -> Result<(), StoreError> {
        let now = format_ts(&Utc::now());
        let mut tx = self.pool.begin().await?;
        for property in properties {
            sqlx::query("INSERT INTO search_results (session_id, property, created_at) VALUES (?, ?, ?)")
                .bind(session_id)
                .bind(serde_json::to_string(property)?)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get(&self, record_id: &str) -> Result<Option<CallbackRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM callbacks WHERE id = ?")
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_callback).transpose()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_to_callback(row: &SqliteRow) -> Result<CallbackRecord, StoreError> {
    let payload: String = row.try_get("payload")?;
    let pending: i64 = row.try_get("pending")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(CallbackRecord {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        payload: serde_json::from_str(&payload)?,
        pending: pending != 0,
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}

#[async_trait]
impl CallbackQueue for SqliteCallbackQueue {
    async fn fetch_pending(&self, session_id: &str) -> Result<Vec<CallbackRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM callbacks WHERE session_id = ? AND pending = 1 ORDER BY rowid ASC")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_callback).collect()
    }

    async fn mark_consumed(&self, record_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE callbacks SET pending = 0, updated_at = ? WHERE id = ? AND pending = 1")
            .bind(format_ts(&Utc::now()))
            .bind(record_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch_results(&self, session_id: &str, limit: usize) -> Result<Vec<PropertyRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT property FROM search_results WHERE session_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<PropertyRecord, StoreError> {
                let raw: String = row.try_get("property")?;
                Ok(serde_json::from_str(&raw)?)
            })
            .collect()
    }

    async fn open_push(&self, _session_id: &str) -> Result<PushChannel, StoreError> {
        Err(StoreError::Unsupported("push notifications"))
    }
}
