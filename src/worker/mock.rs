//! Mock worker（用于测试与离线演示，无需网络）
//!
//! 按脚本依次返回响应；脚本耗尽后回显最后一条用户输入。记录收到的全部请求。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::request::{ChatRequest, WorkerReply};
use super::traits::{ChatWorker, WorkerError};

#[derive(Default)]
pub struct MockWorker {
    script: Mutex<VecDeque<Result<WorkerReply, WorkerError>>>,
    requests: Mutex<Vec<ChatRequest>>,
    delay: Option<Duration>,
}

impl MockWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies(replies: impl IntoIterator<Item = WorkerReply>) -> Self {
        let worker = Self::new();
        for reply in replies {
            worker.push_reply(reply);
        }
        worker
    }

    /// 每次调用前等待，用于观察 AwaitingReply 期间的行为
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_reply(&self, reply: WorkerReply) {
        self.lock_script().push_back(Ok(reply));
    }

    pub fn push_error(&self, error: WorkerError) {
        self.lock_script().push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<WorkerReply, WorkerError>>> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ChatWorker for MockWorker {
    async fn send(&self, request: &ChatRequest) -> Result<WorkerReply, WorkerError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.lock_script().pop_front();
        scripted.unwrap_or_else(|| Ok(WorkerReply::text(format!("Echo: {}", request.message))))
    }
}
