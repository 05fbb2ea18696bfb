//! 实时推送通道（websocket）
//!
//! 包装任意 [`CallbackQueue`]：轮询、标记、结果查询走内层队列，
//! `open_push` 连接实时服务，加入 `realtime:callbacks:session_id=eq.<id>` 主题，
//! 把 INSERT 事件里的新行转成 [`CallbackRecord`]。
//! 加入被拒或超时即返回错误，订阅端退化为轮询。

#![cfg(feature = "realtime")]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use super::payload::CallbackRecord;
use super::queue::{CallbackQueue, PushChannel};
use crate::memory::PropertyRecord;
use crate::store::StoreError;

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub struct RealtimeCallbackQueue {
    inner: Arc<dyn CallbackQueue>,
    url: String,
}

impl RealtimeCallbackQueue {
    pub fn new(inner: Arc<dyn CallbackQueue>, url: impl Into<String>) -> Self {
        Self {
            inner,
            url: url.into(),
        }
    }
}

pub fn topic_for(session_id: &str) -> String {
    format!("realtime:callbacks:session_id=eq.{}", session_id)
}

fn frame(topic: &str, event: &str, payload: Value, reference: u64) -> WsMessage {
    WsMessage::Text(
        json!({
            "topic": topic,
            "event": event,
            "payload": payload,
            "ref": reference.to_string(),
        })
        .to_string()
        .into(),
    )
}

/// 从推送帧中取出新插入的回调行；兼容 `INSERT` 与 `postgres_changes` 两种事件形态
fn inserted_record(msg: &Value) -> Option<CallbackRecord> {
    let payload = msg.get("payload")?;
    let row = match msg.get("event").and_then(Value::as_str)? {
        "INSERT" => payload.get("record"),
        "postgres_changes" => {
            let data = payload.get("data")?;
            if data.get("type").and_then(Value::as_str) != Some("INSERT") {
                return None;
            }
            data.get("record")
        }
        _ => None,
    }?;

    match serde_json::from_value(row.clone()) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!("Ignoring malformed realtime row: {}", e);
            None
        }
    }
}

fn is_join_ok(msg: &Value, reference: &str) -> Option<bool> {
    if msg.get("event").and_then(Value::as_str) != Some("phx_reply")
        || msg.get("ref").and_then(Value::as_str) != Some(reference)
    {
        return None;
    }
    Some(msg.pointer("/payload/status").and_then(Value::as_str) == Some("ok"))
}

#[async_trait]
impl CallbackQueue for RealtimeCallbackQueue {
    async fn fetch_pending(&self, session_id: &str) -> Result<Vec<CallbackRecord>, StoreError> {
        self.inner.fetch_pending(session_id).await
    }

    async fn mark_consumed(&self, record_id: &str) -> Result<(), StoreError> {
        self.inner.mark_consumed(record_id).await
    }

    async fn fetch_results(&self, session_id: &str, limit: usize) -> Result<Vec<PropertyRecord>, StoreError> {
        self.inner.fetch_results(session_id, limit).await
    }

    async fn open_push(&self, session_id: &str) -> Result<PushChannel, StoreError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| StoreError::Channel(format!("connect failed: {}", e)))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let topic = topic_for(session_id);
        let join_payload = json!({
            "config": {
                "postgres_changes": [{
                    "event": "INSERT",
                    "schema": "public",
                    "table": "callbacks",
                    "filter": format!("session_id=eq.{}", session_id),
                }]
            }
        });
        ws_tx
            .send(frame(&topic, "phx_join", join_payload, 1))
            .await
            .map_err(|e| StoreError::Channel(format!("join send failed: {}", e)))?;

        // 等待加入确认
        let joined = tokio::time::timeout(JOIN_TIMEOUT, async {
            while let Some(msg) = ws_rx.next().await {
                let msg = msg.map_err(|e| StoreError::Channel(e.to_string()))?;
                if let WsMessage::Text(text) = msg {
                    let Ok(value) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    if let Some(ok) = is_join_ok(&value, "1") {
                        return Ok(ok);
                    }
                }
            }
            Err(StoreError::Channel("connection closed before join reply".into()))
        })
        .await
        .map_err(|_| StoreError::Channel("join timed out".into()))??;

        if !joined {
            return Err(StoreError::Channel(format!("join rejected for {}", topic)));
        }
        tracing::info!("Realtime channel joined: {}", topic);

        let (tx, rx) = mpsc::unbounded_channel();
        let close = CancellationToken::new();
        let token = close.clone();

        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            heartbeat.tick().await;
            let mut next_ref: u64 = 2;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        let _ = ws_tx.send(frame(&topic, "phx_leave", json!({}), next_ref)).await;
                        let _ = ws_tx.close().await;
                        break;
                    }
                    _ = heartbeat.tick() => {
                        next_ref += 1;
                        if ws_tx.send(frame("phoenix", "heartbeat", json!({}), next_ref)).await.is_err() {
                            break;
                        }
                    }
                    msg = ws_rx.next() => match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            let Ok(value) = serde_json::from_str::<Value>(&text) else {
                                continue;
                            };
                            if let Some(record) = inserted_record(&value) {
                                if tx.send(record).is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!("Realtime channel {} error: {}", topic, e);
                            break;
                        }
                    }
                }
            }
            // tx 在此 drop，订阅端收到 None 后切回轮询
            tracing::debug!("Realtime channel {} closed", topic);
        });

        Ok(PushChannel::new(rx, close))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::queue::MemoryCallbackQueue;
    use tokio::net::TcpListener;

    /// 本地假实时服务：确认加入，然后推送一条 INSERT
    async fn fake_server(accept_join: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut tx, mut rx) = ws.split();
            let join = rx.next().await.unwrap().unwrap();
            let join: Value = serde_json::from_str(join.to_text().unwrap()).unwrap();
            let topic = join["topic"].as_str().unwrap().to_string();
            let status = if accept_join { "ok" } else { "error" };
            let reply = json!({"topic": topic, "event": "phx_reply", "ref": "1", "payload": {"status": status}});
            tx.send(WsMessage::Text(reply.to_string().into())).await.unwrap();
            if !accept_join {
                return;
            }
            let insert = json!({
                "topic": topic,
                "event": "INSERT",
                "payload": {"record": {"id": 42, "session_id": "s1", "payload": {"type": "search_started"}, "pending": true}}
            });
            tx.send(WsMessage::Text(insert.to_string().into())).await.unwrap();
            while rx.next().await.is_some() {}
        });
        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn test_realtime_forwards_inserts() {
        let url = fake_server(true).await;
        let queue = RealtimeCallbackQueue::new(Arc::new(MemoryCallbackQueue::new()), url);

        let mut push = queue.open_push("s1").await.unwrap();
        let record = push.recv().await.unwrap();
        assert_eq!(record.id, "42");
        assert_eq!(record.tag(), Some("search_started"));
        push.close();
    }

    #[tokio::test]
    async fn test_realtime_join_rejected() {
        let url = fake_server(false).await;
        let queue = RealtimeCallbackQueue::new(Arc::new(MemoryCallbackQueue::new()), url);
        assert!(matches!(queue.open_push("s1").await, Err(StoreError::Channel(_))));
    }

    #[test]
    fn test_inserted_record_shapes() {
        let v = json!({"event": "postgres_changes", "payload": {"data": {"type": "UPDATE", "record": {}}}});
        assert!(inserted_record(&v).is_none());

        let v = json!({"event": "postgres_changes", "payload": {"data": {"type": "INSERT",
            "record": {"id": "a", "session_id": "s", "payload": {}}}}});
        assert_eq!(inserted_record(&v).unwrap().id, "a");
    }
}
