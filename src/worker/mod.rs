//! 外发 worker：请求信封、传输抽象、HTTP 与 Mock 实现

pub mod http;
pub mod mock;
pub mod request;
pub mod traits;

pub use http::HttpWorker;
pub use mock::MockWorker;
pub use request::{ChatRequest, MessageKind, VoicePayload, WorkerReply};
pub use traits::{ChatWorker, WorkerError};
