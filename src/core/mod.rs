//! 核心编排层：错误、状态投影、会话上下文、去抖回写、对话状态机

pub mod debounce;
pub mod error;
pub mod orchestrator;
pub mod session;
pub mod state;

pub use debounce::DebouncedWriter;
pub use error::ChatError;
pub use orchestrator::{ChatOrchestrator, OrchestratorOptions};
pub use session::{IdentityFile, SessionContext, SessionIdentity};
pub use state::{ChatState, RecordingState, UiState};
