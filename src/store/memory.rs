//! 内存会话记录存储（测试与无数据库时使用）

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{SessionPatch, SessionRecord, SessionRecordStore, StoreError};

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    records: RwLock<HashMap<String, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接写入完整记录（用于导入历史或测试准备数据）
    pub async fn insert(&self, record: SessionRecord) {
        self.records
            .write()
            .await
            .insert(record.session_id.clone(), record);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl SessionRecordStore for MemorySessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.records.read().await.get(session_id).cloned())
    }

    async fn upsert(&self, session_id: &str, patch: SessionPatch) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        records
            .entry(session_id.to_string())
            .or_insert_with(|| SessionRecord::new(session_id))
            .apply(patch);
        Ok(())
    }

    async fn update(&self, session_id: &str, patch: SessionPatch) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        match records.get_mut(session_id) {
            Some(record) => {
                record.apply(patch);
                Ok(())
            }
            None => Err(StoreError::NotFound(session_id.to_string())),
        }
    }

    async fn list_by_address(&self, address: &str) -> Result<Vec<SessionRecord>, StoreError> {
        let records = self.records.read().await;
        let mut matching: Vec<SessionRecord> = records
            .values()
            .filter(|r| r.client_address.as_deref() == Some(address))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(matching)
    }
}
