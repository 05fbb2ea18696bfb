//! 对话时间线：消息与房源结果集
//!
//! 消息一旦追加即不可变；时间线同时承载 PropertySet，供 UI 渲染与外部 worker 的完整上下文重建。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::PropertySet;

/// 消息角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Error,
}

/// 单条消息（时间线内 id 唯一）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// 语音消息时长（秒）；音频本身不进入时间线
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_duration: Option<f64>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4()),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            audio_duration: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(Role::Error, content)
    }

    /// 语音消息：内容为占位描述，附带时长
    pub fn voice(duration_secs: f64) -> Self {
        let mut msg = Self::user(format!("Mensaje de voz ({:.0}s)", duration_secs));
        msg.audio_duration = Some(duration_secs);
        msg
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// 会话统计（随每次外发请求一起发送）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationStats {
    pub total: usize,
    pub user: usize,
    pub assistant: usize,
}

/// 对话时间线：有序消息 + 有序房源结果集
#[derive(Clone, Debug, Default)]
pub struct ConversationMemory {
    messages: Vec<Message>,
    property_sets: Vec<PropertySet>,
}

impl ConversationMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(messages: Vec<Message>, property_sets: Vec<PropertySet>) -> Self {
        Self {
            messages,
            property_sets,
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    pub fn push_property_set(&mut self, set: PropertySet) {
        self.property_sets.push(set);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn property_sets(&self) -> &[PropertySet] {
        &self.property_sets
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// 完整对话文本：每次请求都从全部历史重建，error 消息不进入上下文
    pub fn transcript(&self) -> String {
        self.messages
            .iter()
            .filter_map(|m| match m.role {
                Role::User => Some(format!("Usuario: {}", m.content)),
                Role::Assistant => Some(format!("Asistente: {}", m.content)),
                Role::Error => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn stats(&self) -> ConversationStats {
        let user = self.messages.iter().filter(|m| m.role == Role::User).count();
        let assistant = self
            .messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .count();
        ConversationStats {
            total: self.messages.len(),
            user,
            assistant,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_skips_error_messages() {
        let mut memory = ConversationMemory::new();
        memory.push(Message::user("piso en Madrid"));
        memory.push(Message::error("timeout"));
        memory.push(Message::assistant("Buscando..."));

        assert_eq!(
            memory.transcript(),
            "Usuario: piso en Madrid\nAsistente: Buscando..."
        );
    }

    #[test]
    fn test_stats_counts_roles() {
        let mut memory = ConversationMemory::new();
        memory.push(Message::user("hola"));
        memory.push(Message::assistant("hola, ¿qué buscas?"));
        memory.push(Message::user("ático en Valencia"));
        memory.push(Message::error("fallo"));

        let stats = memory.stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.user, 2);
        assert_eq!(stats.assistant, 1);
    }

    #[test]
    fn test_voice_message_carries_duration() {
        let msg = Message::voice(12.4);
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.audio_duration, Some(12.4));
        assert!(msg.content.contains("12s"));
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Role::Error).unwrap();
        assert_eq!(json, "\"error\"");
    }
}
