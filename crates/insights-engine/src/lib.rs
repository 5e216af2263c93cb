pub mod batch;
pub mod bridge;
pub mod chat_batch;
pub mod driver;
pub mod error;
pub mod registry;
pub mod tools;
pub mod truncate;

pub use batch::{BatchConfig, BatchError, BatchExecutor, BatchProcessor, JobHandle, JobId};
pub use bridge::{StreamBridge, StreamOutcome, TokenStream};
pub use chat_batch::BatchedChatClient;
pub use driver::{ChatResponse, DriverConfig, RunDriver, RunPhase, RunState, SessionState, ToolCallLedger};
pub use error::EngineError;
pub use registry::ToolRegistry;
