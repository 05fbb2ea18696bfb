//! 会话记录存储抽象层
//!
//! 以会话 ID 为键的文档存储：对话历史、房源结果集、来源网络地址与客户端描述。
//! 核心只依赖 get / upsert / update 与按网络地址过滤；字段级 last-writer-wins。

mod memory;
#[cfg(feature = "async-sqlite")]
mod sqlite;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::{Message, PropertySet};

pub use memory::MemorySessionStore;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteSessionStore;

/// 存储层错误（会话记录存储与回调队列共用）
#[derive(Error, Debug)]
pub enum StoreError {
    #[cfg(feature = "async-sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(#[from] chrono::ParseError),

    #[error("Session record not found: {0}")]
    NotFound(String),

    #[error("Unsupported: {0}")]
    Unsupported(&'static str),

    #[error("Channel error: {0}")]
    Channel(String),
}

/// 单个会话记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub messages: Vec<Message>,
    pub property_sets: Vec<PropertySet>,
    /// 来源网络地址（跨会话聚合的依据）
    pub client_address: Option<String>,
    /// 自由格式的客户端描述（浏览器 UA 等）
    pub client_descriptor: Option<String>,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            messages: Vec::new(),
            property_sets: Vec::new(),
            client_address: None,
            client_descriptor: None,
            title: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 按字段覆盖（未设置的字段保持不变）
    pub fn apply(&mut self, patch: SessionPatch) {
        let SessionPatch {
            messages,
            property_sets,
            client_address,
            client_descriptor,
            title,
        } = patch;

        if let Some(messages) = messages {
            self.messages = messages;
        }
        if let Some(sets) = property_sets {
            self.property_sets = sets;
        }
        if client_address.is_some() {
            self.client_address = client_address;
        }
        if client_descriptor.is_some() {
            self.client_descriptor = client_descriptor;
        }
        if title.is_some() {
            self.title = title;
        }
        self.updated_at = Utc::now();
    }
}

/// 部分更新：只有 Some 的字段会被写入
#[derive(Clone, Debug, Default)]
pub struct SessionPatch {
    pub messages: Option<Vec<Message>>,
    pub property_sets: Option<Vec<PropertySet>>,
    pub client_address: Option<String>,
    pub client_descriptor: Option<String>,
    pub title: Option<String>,
}

impl SessionPatch {
    pub fn messages(messages: Vec<Message>) -> Self {
        Self {
            messages: Some(messages),
            ..Self::default()
        }
    }

    pub fn property_sets(sets: Vec<PropertySet>) -> Self {
        Self {
            property_sets: Some(sets),
            ..Self::default()
        }
    }

    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    pub fn with_client(mut self, address: Option<String>, descriptor: Option<String>) -> Self {
        self.client_address = address;
        self.client_descriptor = descriptor;
        self
    }
}

/// 会话记录存储接口
#[async_trait]
pub trait SessionRecordStore: Send + Sync {
    /// 按会话 ID 读取
    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;

    /// 不存在则创建，存在则按字段覆盖（创建与更新的竞争可容忍）
    async fn upsert(&self, session_id: &str, patch: SessionPatch) -> Result<(), StoreError>;

    /// 仅更新已存在的记录；不存在时返回 NotFound
    async fn update(&self, session_id: &str, patch: SessionPatch) -> Result<(), StoreError>;

    /// 同一来源网络地址的全部记录，按创建时间升序
    async fn list_by_address(&self, address: &str) -> Result<Vec<SessionRecord>, StoreError>;
}

/// 追加一个结果集到会话记录（读-改-写，避免覆盖其它写者追加的结果集）
pub async fn append_property_set(
    store: &dyn SessionRecordStore,
    session_id: &str,
    set: PropertySet,
) -> Result<(), StoreError> {
    let mut sets = store
        .get(session_id)
        .await?
        .map(|r| r.property_sets)
        .unwrap_or_default();
    if sets.iter().any(|s| s.id == set.id) {
        return Ok(());
    }
    sets.push(set);
    store
        .upsert(session_id, SessionPatch::property_sets(sets))
        .await
}

/// 创建会话记录存储
///
/// 如果提供了 db_path 且启用了 async-sqlite feature，则使用 SQLite；否则使用内存存储
pub async fn create_session_store(db_path: Option<&Path>) -> Arc<dyn SessionRecordStore> {
    #[cfg(feature = "async-sqlite")]
    if let Some(path) = db_path {
        match SqliteSessionStore::new(path).await {
            Ok(store) => {
                tracing::info!("Using SQLite session store: {:?}", path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to open SQLite session store, falling back to memory: {}", e);
            }
        }
    }

    #[cfg(not(feature = "async-sqlite"))]
    if db_path.is_some() {
        tracing::warn!("SQLite session store requested but async-sqlite feature not enabled, using memory store");
    }

    tracing::info!("Using in-memory session store");
    Arc::new(MemorySessionStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_only_overwrites_set_fields() {
        let mut record = SessionRecord::new("s1");
        record.apply(SessionPatch::default().with_client(Some("10.0.0.1".into()), None));
        record.apply(SessionPatch::title("Pisos en Madrid"));

        assert_eq!(record.client_address.as_deref(), Some("10.0.0.1"));
        assert_eq!(record.title.as_deref(), Some("Pisos en Madrid"));
        assert!(record.messages.is_empty());
    }

    #[tokio::test]
    async fn test_append_property_set_keeps_existing_sets() {
        let store = MemorySessionStore::new();
        let first = PropertySet::new(vec![]);
        let second = PropertySet::new(vec![]);

        append_property_set(&store, "s1", first.clone()).await.unwrap();
        append_property_set(&store, "s1", second.clone()).await.unwrap();
        append_property_set(&store, "s1", second.clone()).await.unwrap();

        let record = store.get("s1").await.unwrap().unwrap();
        assert_eq!(record.property_sets.len(), 2);
        assert_eq!(record.property_sets[0].id, first.id);
        assert_eq!(record.property_sets[1].id, second.id);
    }
}
