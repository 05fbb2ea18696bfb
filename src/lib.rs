//! Hogar - 对话式房源搜索客户端核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 对话状态机编排器、状态投影、会话上下文、去抖回写
//! - **delivery**: 回调投递（推送/轮询扇入、去重、结果补全、标记消费）
//! - **memory**: 消息与房源结果集、跨会话聚合、等待标志
//! - **observability**: 日志初始化
//! - **store**: 会话记录存储（内存 / SQLite）
//! - **worker**: 外发请求（HTTP / Mock）

pub mod config;
pub mod core;
pub mod delivery;
pub mod memory;
pub mod observability;
pub mod store;
pub mod worker;
