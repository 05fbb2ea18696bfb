//! HTTP worker 客户端（reqwest）
//!
//! 文本消息发 JSON；语音消息发 multipart：音频作为 `audio` 二进制部分，
//! 其余字段逐个作为文本部分（conversation_stats 以 JSON 编码）。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;

use super::request::{ChatRequest, WorkerReply};
use super::traits::{ChatWorker, WorkerError};
use crate::config::WorkerSection;

pub struct HttpWorker {
    client: Client,
    endpoint: String,
}

impl HttpWorker {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, WorkerError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn from_config(section: &WorkerSection) -> Result<Self, WorkerError> {
        Self::new(
            section.endpoint.clone(),
            Duration::from_secs(section.request_timeout_secs),
        )
    }

    fn multipart_form(request: &ChatRequest) -> Result<Form, WorkerError> {
        let stats = serde_json::to_string(&request.conversation_stats)
            .map_err(|e| WorkerError::InvalidResponse(e.to_string()))?;

        let mut form = Form::new()
            .text("message", request.message.clone())
            .text("message_type", request.message_type.as_str())
            .text("session_id", request.session_id.clone())
            .text("timestamp", request.timestamp.to_rfc3339())
            .text("language", request.language.clone())
            .text("conversation_text", request.conversation_text.clone())
            .text("conversation_stats", stats);

        if let Some(duration) = request.audio_duration {
            form = form.text("audio_duration", duration.to_string());
        }
        if let Some(audio) = &request.audio {
            let part = Part::bytes(audio.bytes.clone())
                .file_name(audio.file_name())
                .mime_str(&audio.mime_type)?;
            form = form.part("audio", part);
        }
        Ok(form)
    }
}

fn map_send_error(e: reqwest::Error) -> WorkerError {
    if e.is_timeout() {
        WorkerError::Timeout
    } else if e.is_connect() {
        WorkerError::Transport(e.to_string())
    } else {
        WorkerError::Http(e)
    }
}

#[async_trait]
impl ChatWorker for HttpWorker {
    async fn send(&self, request: &ChatRequest) -> Result<WorkerReply, WorkerError> {
        let builder = self.client.post(&self.endpoint);
        let builder = if request.is_voice() {
            builder.multipart(Self::multipart_form(request)?)
        } else {
            builder.json(request)
        };

        tracing::debug!(
            "Sending {} message for session {}",
            request.message_type.as_str(),
            request.session_id
        );
        let resp = builder.send().await.map_err(map_send_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(WorkerError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = resp.text().await.map_err(map_send_error)?;
        serde_json::from_str(&body).map_err(|e| WorkerError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ConversationStats;
    use crate::worker::request::{MessageKind, VoicePayload};
    use chrono::Utc;

    fn voice_request() -> ChatRequest {
        ChatRequest {
            message: "Mensaje de voz (3s)".into(),
            message_type: MessageKind::Voice,
            session_id: "session_1".into(),
            timestamp: Utc::now(),
            audio_duration: Some(3.0),
            language: "spanish".into(),
            conversation_text: String::new(),
            conversation_stats: ConversationStats::default(),
            audio: Some(VoicePayload::new(vec![0u8; 16], "audio/webm")),
        }
    }

    #[test]
    fn test_multipart_form_builds() {
        let form = HttpWorker::multipart_form(&voice_request()).unwrap();
        assert!(!form.boundary().is_empty());
    }

    #[test]
    fn test_multipart_rejects_bad_mime() {
        let mut req = voice_request();
        req.audio = Some(VoicePayload::new(vec![1], "not a mime"));
        assert!(HttpWorker::multipart_form(&req).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        let worker = HttpWorker::new("http://127.0.0.1:9/chat", Duration::from_secs(2)).unwrap();
        let mut req = voice_request();
        req.message_type = MessageKind::Text;
        req.audio = None;
        let err = worker.send(&req).await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Transport(_) | WorkerError::Timeout | WorkerError::Http(_)
        ));
    }
}
