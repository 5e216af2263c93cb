use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ids::ToolCallId;

/// Arguments decoded from a tool call's JSON argument string.
pub type ToolArgs = serde_json::Map<String, serde_json::Value>;

/// Tool definition registered with the assistant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// A function the assistant may ask the local process to run.
#[async_trait]
pub trait LocalTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;

    /// Run the tool. The returned value is JSON-encoded before it is sent
    /// back to the run.
    async fn invoke(&self, args: ToolArgs) -> Result<serde_json::Value, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters_schema: self.parameters_schema(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("unsupported tool call type: {0}")]
    UnsupportedType(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("tool panicked: {0}")]
    Panicked(String),
}

/// Output for one tool call, submitted back to the run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub tool_call_id: ToolCallId,
    pub output: String,
}

impl ToolOutput {
    pub fn new(tool_call_id: ToolCallId, output: impl Into<String>) -> Self {
        Self {
            tool_call_id,
            output: output.into(),
        }
    }

    /// Explicit error value in place of a result, so the run can continue.
    pub fn error(tool_call_id: ToolCallId, error: &ToolError) -> Self {
        let output = serde_json::json!({ "error": error.to_string() }).to_string();
        Self { tool_call_id, output }
    }

    pub fn is_error(&self) -> bool {
        serde_json::from_str::<serde_json::Value>(&self.output)
            .ok()
            .and_then(|v| v.get("error").cloned())
            .is_some()
    }
}

/// Decode a JSON argument string into keyword arguments.
/// An empty string means "no arguments".
pub fn parse_arguments(raw: &str) -> Result<ToolArgs, ToolError> {
    if raw.trim().is_empty() {
        return Ok(ToolArgs::new());
    }
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(ToolError::InvalidArguments(format!(
            "expected a JSON object, got {other}"
        ))),
        Err(e) => Err(ToolError::InvalidArguments(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_object_arguments() {
        let args = parse_arguments(r#"{"question": "top month"}"#).unwrap();
        assert_eq!(args["question"], "top month");
    }

    #[test]
    fn empty_arguments_are_allowed() {
        assert!(parse_arguments("").unwrap().is_empty());
        assert!(parse_arguments("  ").unwrap().is_empty());
    }

    #[test]
    fn non_object_arguments_rejected() {
        let err = parse_arguments("[1, 2]").unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
        let err = parse_arguments("{not json").unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn error_output_is_json() {
        let out = ToolOutput::error(
            ToolCallId::from_raw("call_9"),
            &ToolError::UnknownTool("plot".into()),
        );
        let value: serde_json::Value = serde_json::from_str(&out.output).unwrap();
        assert_eq!(value["error"], "unknown tool: plot");
        assert!(out.is_error());
        assert!(!ToolOutput::new(ToolCallId::from_raw("c"), "[]").is_error());
    }

    #[test]
    fn tool_error_display() {
        let err = ToolError::Timeout(Duration::from_secs(60));
        assert!(err.to_string().contains("60"));
    }
}
