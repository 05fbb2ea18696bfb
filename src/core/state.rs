//! 状态定义：ChatState / RecordingState 与 UiState 投影
//!
//! UI 只持有轻量的 UiState；「正在加载」「等待回调」「输入锁定」等标志都由两个状态枚举推导，
//! 不单独维护。

use serde::Serialize;

use crate::memory::{Message, PropertySet};

/// 对话状态机：Idle → AwaitingReply → Idle | AwaitingCallback → Idle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum ChatState {
    #[default]
    Idle,
    /// 已发出请求，等待同步响应
    AwaitingReply,
    /// 后台搜索已开始，等待回调（唯一需要持久化的状态）
    AwaitingCallback,
}

/// 语音录制/发送状态
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum RecordingState {
    #[default]
    Idle,
    Preparing,
    Sending,
}

/// UI 看到的「投影」状态
#[derive(Clone, Debug, Default, Serialize)]
pub struct UiState {
    pub chat: ChatState,
    pub recording: RecordingState,
    pub messages: Vec<Message>,
    pub property_sets: Vec<PropertySet>,
    pub title: Option<String>,
}

impl UiState {
    pub fn is_loading(&self) -> bool {
        self.chat == ChatState::AwaitingReply
    }

    pub fn is_waiting_for_callback(&self) -> bool {
        self.chat == ChatState::AwaitingCallback
    }

    pub fn is_recording(&self) -> bool {
        self.recording != RecordingState::Idle
    }

    /// 输入框锁定：等待同步响应或语音发送中
    pub fn input_locked(&self) -> bool {
        self.is_loading() || self.recording == RecordingState::Sending
    }
}
