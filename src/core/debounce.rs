//! 消息列表的去抖回写
//!
//! 每次本地追加都调度一次回写；窗口内的多次调度合并为最后一次快照。
//! 后台任务持有写入循环，flush 立即落盘，drop 时取消未落盘的回写。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::memory::Message;
use crate::store::{SessionPatch, SessionRecordStore};

enum WriterCommand {
    Schedule(Vec<Message>),
    Flush(oneshot::Sender<()>),
}

pub struct DebouncedWriter {
    tx: mpsc::UnboundedSender<WriterCommand>,
    handle: JoinHandle<()>,
}

impl DebouncedWriter {
    pub fn new(store: Arc<dyn SessionRecordStore>, session_id: impl Into<String>, delay: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_writer(store, session_id.into(), delay, rx));
        Self { tx, handle }
    }

    /// 调度回写当前会话的完整消息列表（重置计时）
    pub fn schedule(&self, messages: Vec<Message>) {
        if self.tx.send(WriterCommand::Schedule(messages)).is_err() {
            tracing::warn!("Debounced writer stopped, message write-back dropped");
        }
    }

    /// 立即写出尚未落盘的快照并等待完成
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WriterCommand::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// 丢弃尚未落盘的快照并停止
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for DebouncedWriter {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run_writer(
    store: Arc<dyn SessionRecordStore>,
    session_id: String,
    delay: Duration,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
) {
    let mut pending: Option<Vec<Message>> = None;

    loop {
        let command = if pending.is_some() {
            tokio::select! {
                command = rx.recv() => command,
                _ = tokio::time::sleep(delay) => {
                    write_messages(store.as_ref(), &session_id, pending.take()).await;
                    continue;
                }
            }
        } else {
            rx.recv().await
        };

        match command {
            Some(WriterCommand::Schedule(messages)) => pending = Some(messages),
            Some(WriterCommand::Flush(ack)) => {
                write_messages(store.as_ref(), &session_id, pending.take()).await;
                let _ = ack.send(());
            }
            None => {
                write_messages(store.as_ref(), &session_id, pending.take()).await;
                break;
            }
        }
    }
}

async fn write_messages(store: &dyn SessionRecordStore, session_id: &str, messages: Option<Vec<Message>>) {
    let Some(messages) = messages else {
        return;
    };
    let count = messages.len();
    match store.upsert(session_id, SessionPatch::messages(messages)).await {
        Ok(()) => tracing::debug!("Wrote {} messages for session {}", count, session_id),
        // 内存时间线为准，下一次调度会带着完整列表重试
        Err(e) => tracing::warn!("Message write-back for {} failed: {}", session_id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySessionStore;

    async fn stored_count(store: &MemorySessionStore, session_id: &str) -> Option<usize> {
        store.get(session_id).await.unwrap().map(|r| r.messages.len())
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedules_coalesce_into_one_write() {
        let store = Arc::new(MemorySessionStore::new());
        let writer = DebouncedWriter::new(store.clone(), "s1", Duration::from_millis(1000));

        writer.schedule(vec![Message::user("a")]);
        tokio::time::sleep(Duration::from_millis(400)).await;
        writer.schedule(vec![Message::user("a"), Message::assistant("b")]);
        tokio::time::sleep(Duration::from_millis(800)).await;
        // 第二次调度重置了计时
        assert_eq!(stored_count(&store, "s1").await, None);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(stored_count(&store, "s1").await, Some(2));
    }

    #[tokio::test]
    async fn test_flush_writes_immediately() {
        let store = Arc::new(MemorySessionStore::new());
        let writer = DebouncedWriter::new(store.clone(), "s1", Duration::from_secs(60));

        writer.schedule(vec![Message::user("hola")]);
        writer.flush().await;
        assert_eq!(stored_count(&store, "s1").await, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_pending_write() {
        let store = Arc::new(MemorySessionStore::new());
        let writer = DebouncedWriter::new(store.clone(), "s1", Duration::from_millis(100));

        writer.schedule(vec![Message::user("hola")]);
        writer.cancel();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(stored_count(&store, "s1").await, None);
    }
}
