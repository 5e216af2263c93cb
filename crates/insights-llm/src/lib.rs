pub mod azure;
pub mod config;
pub mod planner;
pub mod sse;

pub mod mock;

pub use azure::AzureAssistantsBackend;
pub use config::{AzureConfig, ConfigError};
pub use mock::{MockBackend, MockChatBatchBackend, MockPlanner, MockResponse};
pub use planner::AzureChatPlanner;
