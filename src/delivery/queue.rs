//! 待处理回调队列
//!
//! 外部 worker 追加回调记录（session_id + 负载 + pending 标志）以及搜索结果行；
//! 投递层只读取 pending 记录、翻转 pending 标志、按会话查询结果，并可选地打开推送通道。

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use super::payload::CallbackRecord;
use crate::memory::PropertyRecord;
use crate::store::StoreError;

/// 回调队列接口
#[async_trait]
pub trait CallbackQueue: Send + Sync {
    /// 该会话全部 pending = true 的记录（插入顺序）
    async fn fetch_pending(&self, session_id: &str) -> Result<Vec<CallbackRecord>, StoreError>;

    /// 标记已消费（幂等）
    async fn mark_consumed(&self, record_id: &str) -> Result<(), StoreError>;

    /// 结果表：按会话过滤，最新在前，最多 limit 条
    async fn fetch_results(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<PropertyRecord>, StoreError>;

    /// 打开会话级推送通道；不支持或失败时调用方退化为轮询
    async fn open_push(&self, session_id: &str) -> Result<PushChannel, StoreError>;
}

/// 推送通道：新插入的回调记录流，关闭或 drop 时停止底层订阅
#[derive(Debug)]
pub struct PushChannel {
    rx: mpsc::UnboundedReceiver<CallbackRecord>,
    close: CancellationToken,
}

impl PushChannel {
    pub fn new(rx: mpsc::UnboundedReceiver<CallbackRecord>, close: CancellationToken) -> Self {
        Self { rx, close }
    }

    /// 下一条推送；通道断开时返回 None
    pub async fn recv(&mut self) -> Option<CallbackRecord> {
        self.rx.recv().await
    }

    pub fn close(&self) {
        self.close.cancel();
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.close.cancel();
    }
}

struct ResultRow {
    session_id: String,
    created_at: DateTime<Utc>,
    property: PropertyRecord,
}

/// 内存回调队列：插入即通过 broadcast 推送给已订阅的会话
pub struct MemoryCallbackQueue {
    records: RwLock<Vec<CallbackRecord>>,
    results: RwLock<Vec<ResultRow>>,
    inserts: broadcast::Sender<CallbackRecord>,
}

impl MemoryCallbackQueue {
    pub fn new() -> Self {
        let (inserts, _) = broadcast::channel(256);
        Self {
            records: RwLock::new(Vec::new()),
            results: RwLock::new(Vec::new()),
            inserts,
        }
    }

    /// 插入回调记录（worker 侧）
    pub async fn insert_callback(&self, session_id: &str, payload: Value) -> CallbackRecord {
        let record = CallbackRecord::new(session_id, payload);
        self.records.write().await.push(record.clone());
        // 没有订阅者时发送失败是正常的
        let _ = self.inserts.send(record.clone());
        record
    }

    /// 写入搜索结果行（worker 侧，供「搜索完成」回调的二次查询）
    pub async fn insert_results(&self, session_id: &str, properties: Vec<PropertyRecord>) {
        let now = Utc::now();
        let mut results = self.results.write().await;
        results.extend(properties.into_iter().map(|property| ResultRow {
            session_id: session_id.to_string(),
            created_at: now,
            property,
        }));
    }

    pub async fn get(&self, record_id: &str) -> Option<CallbackRecord> {
        self.records
            .read()
            .await
            .iter()
            .find(|r| r.id == record_id)
            .cloned()
    }

    pub async fn pending_count(&self, session_id: &str) -> usize {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| r.session_id == session_id && r.pending)
            .count()
    }
}

impl Default for MemoryCallbackQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CallbackQueue for MemoryCallbackQueue {
    async fn fetch_pending(&self, session_id: &str) -> Result<Vec<CallbackRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.session_id == session_id && r.pending)
            .cloned()
            .collect())
    }

    async fn mark_consumed(&self, record_id: &str) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if let Some(record) = records.iter_mut().find(|r| r.id == record_id) {
            if record.pending {
                record.pending = false;
                record.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn fetch_results(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<PropertyRecord>, StoreError> {
        let results = self.results.read().await;
        let mut rows: Vec<&ResultRow> = results
            .iter()
            .rev()
            .filter(|r| r.session_id == session_id)
            .collect();
        // 稳定排序：同一时间写入的行保持「后写在前」
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows
            .into_iter()
            .take(limit)
            .map(|r| r.property.clone())
            .collect())
    }

    async fn open_push(&self, session_id: &str) -> Result<PushChannel, StoreError> {
        let mut inserts = self.inserts.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let close = CancellationToken::new();
        let token = close.clone();
        let session_id = session_id.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = inserts.recv() => match received {
                        Ok(record) if record.session_id == session_id => {
                            if tx.send(record).is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // 丢失的推送由下一次轮询补上
                            tracing::warn!("Push channel for {} lagged, skipped {} inserts", session_id, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        Ok(PushChannel::new(rx, close))
    }
}

/// 创建回调队列
///
/// 与会话存储相同的选择逻辑：有 db_path 且启用 async-sqlite 时使用 SQLite（无推送，仅轮询），否则内存队列
pub async fn create_callback_queue(db_path: Option<&Path>) -> Arc<dyn CallbackQueue> {
    #[cfg(feature = "async-sqlite")]
    if let Some(path) = db_path {
        match super::sqlite_queue::SqliteCallbackQueue::new(path).await {
            Ok(queue) => {
                tracing::info!("Using SQLite callback queue: {:?}", path);
                return Arc::new(queue);
            }
            Err(e) => {
                tracing::warn!("Failed to open SQLite callback queue, falling back to memory: {}", e);
            }
        }
    }

    #[cfg(not(feature = "async-sqlite"))]
    if db_path.is_some() {
        tracing::warn!("SQLite callback queue requested but async-sqlite feature not enabled, using memory queue");
    }

    tracing::info!("Using in-memory callback queue");
    Arc::new(MemoryCallbackQueue::new())
}
