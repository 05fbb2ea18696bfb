//! 编排器错误类型
//!
//! 只有输入校验类错误会阻止发送；传输与存储失败在时间线上留下错误消息后向上返回，调用方仅需记录。

use thiserror::Error;

use crate::store::StoreError;
use crate::worker::WorkerError;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Message is empty")]
    EmptyInput,

    /// 上一条消息仍在等待同步响应
    #[error("A message is already awaiting a reply")]
    Busy,

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
