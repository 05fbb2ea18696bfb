//! 回调投递：推送 + 轮询扇入，幂等消费
//!
//! 两条至少一次的来源（推送通道、pending 轮询）合并成每会话一条去重后的记录流：
//! - 订阅时先打开推送通道，再做一次补漏轮询（订阅前已插入的记录）
//! - 推送通道未确认可用时按固定间隔轮询
//! - 每条记录：补全结果 → 去重 → 发出 → 标记已消费（无论哪条路径胜出都会尝试）

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::dedup::DedupSet;
use super::payload::CallbackRecord;
use super::queue::{CallbackQueue, PushChannel};
use crate::config::DeliverySection;
use crate::store::StoreError;

/// 投递参数
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// 推送不可用时的轮询间隔
    pub poll_interval: Duration,
    /// 二次查询结果的页大小
    pub results_page_size: usize,
    pub dedup_capacity: usize,
    pub dedup_ttl: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            results_page_size: 20,
            dedup_capacity: 512,
            dedup_ttl: Duration::from_secs(600),
        }
    }
}

impl From<&DeliverySection> for DeliveryConfig {
    fn from(section: &DeliverySection) -> Self {
        Self {
            poll_interval: Duration::from_secs(section.poll_interval_secs.max(1)),
            results_page_size: section.results_page_size,
            dedup_capacity: section.dedup_capacity,
            dedup_ttl: Duration::from_secs(section.dedup_ttl_secs),
        }
    }
}

/// 每会话的投递状态：去重集合 + 当前订阅的发送端
struct SessionSlot {
    generation: u64,
    tx: Option<mpsc::UnboundedSender<CallbackRecord>>,
    seen: DedupSet,
}

type Slots = Arc<Mutex<HashMap<String, SessionSlot>>>;

fn lock_slots(slots: &Slots) -> MutexGuard<'_, HashMap<String, SessionSlot>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 回调投递子系统
pub struct CallbackDelivery {
    queue: Arc<dyn CallbackQueue>,
    config: DeliveryConfig,
    slots: Slots,
    next_generation: AtomicU64,
}

impl CallbackDelivery {
    pub fn new(queue: Arc<dyn CallbackQueue>, config: DeliveryConfig) -> Self {
        Self {
            queue,
            config,
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    /// 订阅会话的回调流
    ///
    /// 推送通道打开失败不是错误：静默退化为仅轮询。
    pub async fn subscribe(self: &Arc<Self>, session_id: &str) -> CallbackSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut slots = lock_slots(&self.slots);
            let slot = slots
                .entry(session_id.to_string())
                .or_insert_with(|| SessionSlot {
                    generation,
                    tx: None,
                    seen: DedupSet::new(self.config.dedup_capacity, self.config.dedup_ttl),
                });
            slot.generation = generation;
            slot.tx = Some(tx);
        }

        let push = match self.queue.open_push(session_id).await {
            Ok(channel) => {
                tracing::debug!("Push channel open for session {}", session_id);
                Some(channel)
            }
            Err(e) => {
                tracing::debug!("Push channel unavailable for {} ({}), polling only", session_id, e);
                None
            }
        };

        let push_active = Arc::new(AtomicBool::new(push.is_some()));
        let token = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(self).run(
            session_id.to_string(),
            push,
            Arc::clone(&push_active),
            token.clone(),
        ));

        CallbackSubscription {
            session_id: session_id.to_string(),
            generation,
            rx,
            token,
            handle: Some(handle),
            push_active,
            slots: Arc::clone(&self.slots),
        }
    }

    /// 订阅的后台循环：补漏轮询，然后推送优先、失效时定时轮询
    async fn run(
        self: Arc<Self>,
        session_id: String,
        mut push: Option<PushChannel>,
        push_active: Arc<AtomicBool>,
        token: CancellationToken,
    ) {
        if let Err(e) = self.poll_pending(&session_id).await {
            tracing::warn!("Initial callback poll failed for {}: {}", session_id, e);
        }

        let start = tokio::time::Instant::now() + self.config.poll_interval;
        let mut interval = tokio::time::interval_at(start, self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let polling = push.is_none();
            let event = tokio::select! {
                _ = token.cancelled() => LoopEvent::Cancelled,
                received = recv_push(&mut push) => LoopEvent::Pushed(received),
                _ = interval.tick(), if polling => LoopEvent::PollDue,
            };

            match event {
                LoopEvent::Cancelled => break,
                LoopEvent::Pushed(Some(record)) => {
                    if record.session_id == session_id {
                        self.deliver(record).await;
                    }
                }
                LoopEvent::Pushed(None) => {
                    tracing::warn!("Push channel closed for {}, falling back to polling", session_id);
                    push = None;
                    push_active.store(false, Ordering::Relaxed);
                    interval.reset();
                }
                LoopEvent::PollDue => {
                    if let Err(e) = self.poll_pending(&session_id).await {
                        tracing::warn!("Callback poll failed for {}: {}", session_id, e);
                    }
                }
            }
        }

        if let Some(channel) = push.take() {
            channel.close();
        }
        tracing::debug!("Callback subscription loop for {} stopped", session_id);
    }

    /// 查询并投递该会话全部 pending 记录，返回本次新发出的记录
    pub async fn poll_pending(&self, session_id: &str) -> Result<Vec<CallbackRecord>, StoreError> {
        let pending = self.queue.fetch_pending(session_id).await?;
        let mut emitted = Vec::new();
        for record in pending {
            if let Some(record) = self.deliver(record).await {
                emitted.push(record);
            }
        }
        Ok(emitted)
    }

    /// 单条记录的投递：补全 → 去重发出 → 标记已消费
    async fn deliver(&self, mut record: CallbackRecord) -> Option<CallbackRecord> {
        let already_seen = lock_slots(&self.slots)
            .get(&record.session_id)
            .is_some_and(|slot| slot.seen.contains(&record.id));

        let emitted = if already_seen {
            None
        } else {
            self.enrich(&mut record).await;
            self.admit(&record).then_some(record.clone())
        };

        // 幂等；失败只记日志，下次轮询会再次观察到并被本地去重
        if let Err(e) = self.queue.mark_consumed(&record.id).await {
            tracing::warn!("Failed to mark callback {} consumed: {}", record.id, e);
        }
        emitted
    }

    /// 去重并发给当前订阅者；已见过返回 false
    ///
    /// 没有订阅者的会话不建立去重状态，记录只作为返回值交给调用方。
    fn admit(&self, record: &CallbackRecord) -> bool {
        let mut slots = lock_slots(&self.slots);
        let Some(slot) = slots.get_mut(&record.session_id) else {
            return true;
        };
        if !slot.seen.insert(&record.id) {
            tracing::debug!("Duplicate callback {} ignored", record.id);
            return false;
        }
        if let Some(tx) = &slot.tx {
            if tx.send(record.clone()).is_err() {
                slot.tx = None;
            }
        }
        true
    }

    /// 「搜索完成」但未内嵌结果：按会话查结果表（最新在前，限页大小）并挂到负载上
    async fn enrich(&self, record: &mut CallbackRecord) {
        if !record.needs_enrichment() {
            return;
        }
        match self
            .queue
            .fetch_results(&record.session_id, self.config.results_page_size)
            .await
        {
            Ok(properties) => match serde_json::to_value(&properties) {
                Ok(list) => {
                    if let Value::Object(obj) = &mut record.payload {
                        obj.insert("properties".to_string(), list);
                    }
                }
                Err(e) => tracing::warn!("Failed to attach results to {}: {}", record.id, e),
            },
            Err(e) => {
                tracing::warn!("Result lookup for callback {} failed: {}", record.id, e);
            }
        }
    }

    /// 当前持有去重状态的会话数
    pub fn tracked_sessions(&self) -> usize {
        lock_slots(&self.slots).len()
    }
}

enum LoopEvent {
    Cancelled,
    Pushed(Option<CallbackRecord>),
    PollDue,
}

async fn recv_push(push: &mut Option<PushChannel>) -> Option<CallbackRecord> {
    match push {
        Some(channel) => channel.recv().await,
        None => std::future::pending().await,
    }
}

/// 会话回调订阅；UI 拆除时必须 close（drop 也会停止后台循环并释放去重集合）
pub struct CallbackSubscription {
    session_id: String,
    generation: u64,
    rx: mpsc::UnboundedReceiver<CallbackRecord>,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
    push_active: Arc<AtomicBool>,
    slots: Slots,
}

impl CallbackSubscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn recv(&mut self) -> Option<CallbackRecord> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<CallbackRecord> {
        self.rx.try_recv().ok()
    }

    /// 推送通道是否仍然可用（否则处于轮询模式）
    pub fn is_push_active(&self) -> bool {
        self.push_active.load(Ordering::Relaxed)
    }

    /// 关闭订阅并等待后台循环退出
    pub async fn close(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!("Callback subscription task for {} ended abnormally: {}", self.session_id, e);
            }
        }
        self.release();
    }

    fn release(&mut self) {
        let mut slots = lock_slots(&self.slots);
        if slots
            .get(&self.session_id)
            .is_some_and(|slot| slot.generation == self.generation)
        {
            slots.remove(&self.session_id);
        }
    }
}

impl Stream for CallbackSubscription {
    type Item = CallbackRecord;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for CallbackSubscription {
    fn drop(&mut self) {
        self.token.cancel();
        self.release();
    }
}
