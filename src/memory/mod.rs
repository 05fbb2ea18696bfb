//! 时间线层：消息、房源结果集、跨会话聚合、等待标志持久化

pub mod aggregator;
pub mod conversation;
pub mod property;
pub mod waiting_flag;

pub use aggregator::{is_usable_address, load_history, merge_records, AggregatedHistory};
pub use conversation::{ConversationMemory, ConversationStats, Message, Role};
pub use property::{PropertyRecord, PropertySet};
pub use waiting_flag::{waiting_flag_key, FileWaitingFlags, MemoryWaitingFlags, WaitingFlagStore};
