//! 房源结果集
//!
//! 房源记录对本核心是不透明的：只解析标识与定位字段，其余字段原样保留。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// 单条房源记录
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyRecord {
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    /// 其它字段（图片、面积等）原样透传
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PropertyRecord {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// 是否带有可用于地图展示的坐标
    pub fn has_location(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

/// 一次完成的搜索产生的一批结果（创建后不可变）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PropertySet {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub properties: Vec<PropertyRecord>,
}

impl PropertySet {
    pub fn new(properties: Vec<PropertyRecord>) -> Self {
        Self {
            id: format!("set_{}", uuid::Uuid::new_v4()),
            timestamp: Utc::now(),
            properties,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

/// 外部表的 id 可能是整数也可能是字符串，统一成字符串
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_and_string_ids() {
        let records: Vec<PropertyRecord> = serde_json::from_str(
            r#"[{"id": 42, "city": "Madrid"}, {"id": "abc", "latitude": 40.4, "longitude": -3.7}]"#,
        )
        .unwrap();

        assert_eq!(records[0].id.as_deref(), Some("42"));
        assert_eq!(records[1].id.as_deref(), Some("abc"));
        assert!(!records[0].has_location());
        assert!(records[1].has_location());
    }

    #[test]
    fn test_unknown_fields_are_kept() {
        let record: PropertyRecord =
            serde_json::from_str(r#"{"id": 1, "rooms": 3, "images": ["a.jpg"]}"#).unwrap();
        assert_eq!(record.extra.get("rooms"), Some(&serde_json::json!(3)));

        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["images"], serde_json::json!(["a.jpg"]));
    }
}
