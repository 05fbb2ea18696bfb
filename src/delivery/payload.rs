//! 回调记录与负载协议
//!
//! 负载以原始 JSON 保存在记录里，投递层只在需要时改写（补全结果列表）；
//! 编排器在分发时才解析为带标签的 [`CallbackPayload`]，解析失败走错误分支而不是崩溃。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::memory::property::string_or_number;
use crate::memory::PropertyRecord;

pub const TAG_ASSISTANT_MESSAGE: &str = "assistant_message";
pub const TAG_SEARCH_COMPLETED: &str = "properties_search_completed";
pub const TAG_SEARCH_STARTED: &str = "search_started";

/// 回调记录（由外部 worker 插入，投递层只翻转 pending 标志）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallbackRecord {
    #[serde(deserialize_with = "required_id")]
    pub id: String,
    pub session_id: String,
    pub payload: Value,
    #[serde(default = "default_pending")]
    pub pending: bool,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_pending() -> bool {
    true
}

fn required_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    string_or_number(deserializer)?.ok_or_else(|| serde::de::Error::custom("callback id must be a string or number"))
}

impl CallbackRecord {
    pub fn new(session_id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: format!("cb_{}", uuid::Uuid::new_v4()),
            session_id: session_id.into(),
            payload,
            pending: true,
            updated_at: Utc::now(),
        }
    }

    /// 负载上的 `type` 标签（裸结果负载没有标签）
    pub fn tag(&self) -> Option<&str> {
        self.payload.get("type").and_then(Value::as_str)
    }

    /// 「搜索完成」但没有内嵌结果列表：需要二次查询补全
    pub fn needs_enrichment(&self) -> bool {
        self.tag() == Some(TAG_SEARCH_COMPLETED)
            && self.payload.get("properties").map_or(true, Value::is_null)
    }

    pub fn parse_payload(&self) -> Result<CallbackPayload, PayloadError> {
        CallbackPayload::parse(&self.payload)
    }
}

/// 解析后的负载
#[derive(Clone, Debug, PartialEq)]
pub enum CallbackPayload {
    AssistantMessage {
        message: String,
    },
    SearchCompleted {
        properties_count: Option<u64>,
        properties: Vec<PropertyRecord>,
        message: Option<String>,
    },
    SearchStarted {
        message: Option<String>,
    },
    /// 没有标签、只带结果列表的负载
    Results {
        properties: Vec<PropertyRecord>,
        message: Option<String>,
    },
    Unknown {
        tag: Option<String>,
        message: Option<String>,
    },
}

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("invalid properties list: {0}")]
    InvalidProperties(#[from] serde_json::Error),
}

impl CallbackPayload {
    pub fn parse(value: &Value) -> Result<Self, PayloadError> {
        let obj = value.as_object().ok_or(PayloadError::NotAnObject)?;
        let message = obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|m| !m.trim().is_empty());

        let payload = match obj.get("type").and_then(Value::as_str) {
            Some(TAG_ASSISTANT_MESSAGE) => CallbackPayload::AssistantMessage {
                message: message.ok_or(PayloadError::MissingField("message"))?,
            },
            Some(TAG_SEARCH_COMPLETED) => CallbackPayload::SearchCompleted {
                properties_count: obj.get("properties_count").and_then(Value::as_u64),
                properties: parse_properties(obj.get("properties"))?.unwrap_or_default(),
                message,
            },
            Some(TAG_SEARCH_STARTED) => CallbackPayload::SearchStarted { message },
            Some(other) => CallbackPayload::Unknown {
                tag: Some(other.to_string()),
                message,
            },
            None => match parse_properties(obj.get("properties"))? {
                Some(properties) => CallbackPayload::Results {
                    properties,
                    message,
                },
                None => CallbackPayload::Unknown { tag: None, message },
            },
        };
        Ok(payload)
    }

    /// 除 search_started 外，任何回调都会结束等待
    pub fn clears_waiting(&self) -> bool {
        !matches!(self, CallbackPayload::SearchStarted { .. })
    }
}

fn parse_properties(value: Option<&Value>) -> Result<Option<Vec<PropertyRecord>>, PayloadError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
    }
}

/// 最好努力地从任意负载中取出可展示的文字（畸形负载的兜底）
pub fn extract_text(value: &Value) -> Option<String> {
    ["message", "text", "content"]
        .iter()
        .find_map(|key| value.get(key).and_then(Value::as_str))
        .map(str::to_string)
        .filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_tagged_payloads() {
        let p = CallbackPayload::parse(&json!({"type": "assistant_message", "message": "Hola"})).unwrap();
        assert_eq!(p, CallbackPayload::AssistantMessage { message: "Hola".into() });

        let p = CallbackPayload::parse(&json!({"type": "search_started"})).unwrap();
        assert!(!p.clears_waiting());

        let p = CallbackPayload::parse(&json!({
            "type": "properties_search_completed",
            "properties_count": 2,
            "properties": [{"id": 1}, {"id": 2}]
        }))
        .unwrap();
        match p {
            CallbackPayload::SearchCompleted { properties_count, properties, .. } => {
                assert_eq!(properties_count, Some(2));
                assert_eq!(properties.len(), 2);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_parse_bare_and_unknown_payloads() {
        let p = CallbackPayload::parse(&json!({"properties": [{"id": "x"}], "message": "Mira"})).unwrap();
        assert!(matches!(p, CallbackPayload::Results { ref properties, .. } if properties.len() == 1));

        let p = CallbackPayload::parse(&json!({"type": "progress", "message": "50%"})).unwrap();
        assert_eq!(
            p,
            CallbackPayload::Unknown { tag: Some("progress".into()), message: Some("50%".into()) }
        );
        assert!(p.clears_waiting());

        let p = CallbackPayload::parse(&json!({})).unwrap();
        assert_eq!(p, CallbackPayload::Unknown { tag: None, message: None });
    }

    #[test]
    fn test_parse_malformed_payloads() {
        assert!(matches!(CallbackPayload::parse(&json!("text")), Err(PayloadError::NotAnObject)));
        assert!(matches!(
            CallbackPayload::parse(&json!({"type": "assistant_message"})),
            Err(PayloadError::MissingField("message"))
        ));
        assert!(matches!(
            CallbackPayload::parse(&json!({"type": "properties_search_completed", "properties": "oops"})),
            Err(PayloadError::InvalidProperties(_))
        ));
    }

    #[test]
    fn test_needs_enrichment() {
        let bare = CallbackRecord::new("s", json!({"type": "properties_search_completed", "properties_count": 3}));
        assert!(bare.needs_enrichment());

        let embedded = CallbackRecord::new("s", json!({"type": "properties_search_completed", "properties": []}));
        assert!(!embedded.needs_enrichment());
    }

    #[test]
    fn test_record_accepts_numeric_id() {
        let record: CallbackRecord = serde_json::from_value(json!({
            "id": 17,
            "session_id": "s1",
            "payload": {"type": "search_started"}
        }))
        .unwrap();
        assert_eq!(record.id, "17");
        assert!(record.pending);
    }

    #[test]
    fn test_extract_text() {
        assert_eq!(extract_text(&json!({"text": "hola"})).as_deref(), Some("hola"));
        assert_eq!(extract_text(&json!({"foo": 1})), None);
    }
}
