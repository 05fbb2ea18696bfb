//! 回调投递层：待处理队列、推送/轮询扇入、去重、结果补全

pub mod dedup;
pub mod payload;
pub mod queue;
#[cfg(feature = "realtime")]
pub mod realtime;
#[cfg(feature = "async-sqlite")]
pub mod sqlite_queue;
pub mod subscriber;

pub use dedup::DedupSet;
pub use payload::{
    extract_text, CallbackPayload, CallbackRecord, PayloadError, TAG_ASSISTANT_MESSAGE, TAG_SEARCH_COMPLETED,
    TAG_SEARCH_STARTED,
};
pub use queue::{create_callback_queue, CallbackQueue, MemoryCallbackQueue, PushChannel};
#[cfg(feature = "realtime")]
pub use realtime::RealtimeCallbackQueue;
#[cfg(feature = "async-sqlite")]
pub use sqlite_queue::SqliteCallbackQueue;
pub use subscriber::{CallbackDelivery, CallbackSubscription, DeliveryConfig};
