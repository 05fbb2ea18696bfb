//! 出站请求 / 同步响应的线上格式

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::ConversationStats;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Voice,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Voice => "voice",
        }
    }
}

/// 语音二进制（不进 JSON，仅作为 multipart 的 `audio` 部分）
#[derive(Clone, Debug, PartialEq)]
pub struct VoicePayload {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl VoicePayload {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    /// multipart 里的文件名，扩展名跟随 MIME 类型
    pub fn file_name(&self) -> String {
        let essence = self.mime_type.split(';').next().unwrap_or_default().trim();
        let ext = match essence {
            "audio/ogg" | "audio/opus" => "ogg",
            "audio/mpeg" | "audio/mp3" => "mp3",
            "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
            "audio/mp4" | "audio/m4a" | "audio/x-m4a" => "m4a",
            _ => "webm",
        };
        format!("audio.{}", ext)
    }
}

/// 发往 worker 的请求信封
#[derive(Clone, Debug, Serialize)]
pub struct ChatRequest {
    pub message: String,
    pub message_type: MessageKind,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_duration: Option<f64>,
    pub language: String,
    /// 本地完整历史的文本转写（每次重建）
    pub conversation_text: String,
    pub conversation_stats: ConversationStats,
    #[serde(skip)]
    pub audio: Option<VoicePayload>,
}

impl ChatRequest {
    pub fn is_voice(&self) -> bool {
        self.message_type == MessageKind::Voice
    }
}

/// worker 的同步响应；字段缺失按空处理
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct WorkerReply {
    #[serde(default)]
    pub assistant_reply: Option<String>,
    #[serde(default)]
    pub search_started: bool,
    #[serde(default)]
    pub conversation_title: Option<String>,
}

impl WorkerReply {
    pub fn text(reply: impl Into<String>) -> Self {
        Self {
            assistant_reply: Some(reply.into()),
            ..Default::default()
        }
    }

    pub fn searching(reply: impl Into<String>) -> Self {
        Self {
            assistant_reply: Some(reply.into()),
            search_started: true,
            conversation_title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.conversation_title = Some(title.into());
        self
    }

    /// 非空白的助手回复
    pub fn reply_text(&self) -> Option<&str> {
        self.assistant_reply
            .as_deref()
            .filter(|s| !s.trim().is_empty())
    }
}
