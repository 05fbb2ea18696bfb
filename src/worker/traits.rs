//! 外发 worker 抽象
//!
//! 所有后端（HTTP / Mock）实现 ChatWorker：一次请求，一次同步响应；
//! 后续结果通过回调队列异步到达，不走这里。

use async_trait::async_trait;
use thiserror::Error;

use super::request::{ChatRequest, WorkerReply};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Worker returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Worker request timed out")]
    Timeout,

    #[error("Invalid worker response: {0}")]
    InvalidResponse(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait ChatWorker: Send + Sync {
    async fn send(&self, request: &ChatRequest) -> Result<WorkerReply, WorkerError>;
}
