//! 跨会话对话聚合
//!
//! 启动时把同一来源网络地址的所有会话记录合并成一条按时间排序的时间线（仅用于展示，
//! 写入永远只落到当前会话自己的记录）。没有可用地址时回退到当前会话自身的历史。

use crate::memory::{Message, PropertySet};
use crate::store::{SessionRecord, SessionRecordStore, StoreError};

/// 聚合后的展示历史，另含当前会话自身的消息（写回只使用后者）
#[derive(Clone, Debug, Default)]
pub struct AggregatedHistory {
    pub messages: Vec<Message>,
    pub property_sets: Vec<PropertySet>,
    pub own_messages: Vec<Message>,
    pub own_property_sets: Vec<PropertySet>,
    pub title: Option<String>,
    /// 当前会话是否已有存储记录
    pub has_own_record: bool,
    /// 参与合并的会话数（含当前会话）
    pub source_sessions: usize,
}

/// 地址是否可用于聚合（空串与 unknown 不算）
pub fn is_usable_address(address: Option<&str>) -> bool {
    match address.map(str::trim) {
        None | Some("") => false,
        Some(a) => !a.eq_ignore_ascii_case("unknown"),
    }
}

/// 按给定顺序拼接各记录的消息与结果集，再按时间戳做稳定排序
pub fn merge_records(records: &[SessionRecord]) -> (Vec<Message>, Vec<PropertySet>) {
    let mut messages: Vec<Message> = records
        .iter()
        .flat_map(|r| r.messages.iter().cloned())
        .collect();
    let mut sets: Vec<PropertySet> = records
        .iter()
        .flat_map(|r| r.property_sets.iter().cloned())
        .collect();

    // sort_by_key 是稳定排序：时间戳相同的条目保持来源顺序
    messages.sort_by_key(|m| m.timestamp);
    sets.sort_by_key(|s| s.timestamp);
    (messages, sets)
}

/// 加载当前会话的展示历史
///
/// 聚合地址取自会话记录；新会话还没有记录时用 `client_address`（本次连接的来源地址）。
pub async fn load_history(
    store: &dyn SessionRecordStore,
    session_id: &str,
    client_address: Option<&str>,
) -> Result<AggregatedHistory, StoreError> {
    let own = store.get(session_id).await?;

    let address = own
        .as_ref()
        .and_then(|r| r.client_address.as_deref())
        .filter(|a| is_usable_address(Some(*a)))
        .or_else(|| client_address.filter(|a| is_usable_address(Some(*a))))
        .map(str::to_string);

    let mut records = match address.as_deref() {
        Some(address) => store.list_by_address(address).await?,
        None => Vec::new(),
    };
    if let Some(own) = &own {
        if !records.iter().any(|r| r.session_id == own.session_id) {
            records.push(own.clone());
        }
    }
    if records.is_empty() {
        return Ok(AggregatedHistory::default());
    }

    let (messages, property_sets) = merge_records(&records);
    tracing::debug!(
        "Aggregated {} messages from {} sessions for {}",
        messages.len(),
        records.len(),
        session_id
    );

    let mut history = AggregatedHistory {
        messages,
        property_sets,
        source_sessions: records.len(),
        ..AggregatedHistory::default()
    };
    if let Some(own) = own {
        history.own_messages = own.messages;
        history.own_property_sets = own.property_sets;
        history.title = own.title;
        history.has_own_record = true;
    }
    Ok(history)
}
