use std::time::Duration;

use insights_core::errors::RemoteError;
use insights_core::tools::ToolError;

use crate::batch::BatchError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("batch error: {0}")]
    Batch(#[from] BatchError),

    #[error("tool not registered: {0}")]
    UnknownTool(String),

    #[error("run timeout after {0:?}")]
    RunTimeout(Duration),

    #[error("{0}")]
    Internal(String),
}
