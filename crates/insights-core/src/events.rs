use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::RemoteError;
use crate::ids::{FileId, RunId, ToolCallId};
use crate::usage::RunUsage;

/// Status of a remote run, as reported by the service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Incomplete,
    Expired,
}

impl RunStatus {
    /// The run will not change state again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Failed | Self::Completed | Self::Incomplete | Self::Expired
        )
    }

    /// Terminal, but not a success.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Failed | Self::Incomplete | Self::Expired
        )
    }

    /// Still being worked on by the service.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Queued | Self::InProgress | Self::Cancelling)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::RequiresAction => "requires_action",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Incomplete => "incomplete",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error detail attached to a failed run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunErrorInfo {
    pub code: String,
    pub message: String,
}

impl fmt::Display for RunErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Point-in-time view of a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub id: RunId,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<RunUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<RunErrorInfo>,
    /// Populated only while `status == RequiresAction`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_tool_calls: Vec<ToolCall>,
}

impl RunSnapshot {
    pub fn new(id: RunId, status: RunStatus) -> Self {
        Self {
            id,
            status,
            model: None,
            usage: None,
            last_error: None,
            required_tool_calls: Vec::new(),
        }
    }
}

/// A tool invocation requested by the assistant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: ToolCallId,
    #[serde(flatten)]
    pub kind: ToolCallKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolCallKind {
    /// A local function; `arguments` is a JSON-encoded object.
    Function { name: String, arguments: String },
    /// Runs remotely; surfaced for rendering and tracing only.
    CodeInterpreter {
        input: String,
        #[serde(default)]
        outputs: Vec<CodeOutput>,
    },
    FileSearch,
}

impl ToolCall {
    pub fn function(id: ToolCallId, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id,
            kind: ToolCallKind::Function {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind {
            ToolCallKind::Function { .. } => "function",
            ToolCallKind::CodeInterpreter { .. } => "code_interpreter",
            ToolCallKind::FileSearch => "file_search",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CodeOutput {
    Logs { logs: String },
    Image { file_id: FileId },
}

/// Incremental update to a tool call that is still being generated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolCallDelta {
    FunctionArguments(String),
    CodeInput(String),
    CodeOutputs(Vec<CodeOutput>),
}

/// Content of a completed assistant message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text { value: String },
    ImageFile { file_id: FileId },
}

/// Events emitted by a streamed run. Ordering contract per stream:
///
/// RunUpdated(queued/in_progress) → (TextCreated → TextDelta* → MessageDone |
///   ToolCallCreated → ToolCallDelta* → ToolCallDone | ImageFileDone)* →
///   RunUpdated(requires_action | terminal)
///
/// `ToolCallDone` may be delivered more than once for the same id.
/// `Error` can appear at any point and ends the stream.
#[derive(Clone, Debug)]
pub enum RunEvent {
    RunUpdated { run: RunSnapshot },

    TextCreated,
    TextDelta { delta: String },

    ToolCallCreated { tool_call: ToolCall },
    ToolCallDelta { tool_call_id: ToolCallId, delta: ToolCallDelta },
    ToolCallDone { tool_call: ToolCall },

    ImageFileDone { file_id: FileId },
    MessageDone { content: Vec<MessageContent> },

    Error { error: RemoteError },
}

impl RunEvent {
    pub fn run_snapshot(&self) -> Option<&RunSnapshot> {
        match self {
            Self::RunUpdated { run } => Some(run),
            _ => None,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunUpdated { .. } => "run_updated",
            Self::TextCreated => "text_created",
            Self::TextDelta { .. } => "text_delta",
            Self::ToolCallCreated { .. } => "tool_call_created",
            Self::ToolCallDelta { .. } => "tool_call_delta",
            Self::ToolCallDone { .. } => "tool_call_done",
            Self::ImageFileDone { .. } => "image_file_done",
            Self::MessageDone { .. } => "message_done",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(!RunStatus::Completed.is_failure());
        assert!(RunStatus::Expired.is_failure());
        assert!(RunStatus::Cancelled.is_failure());
        assert!(RunStatus::InProgress.is_pending());
        assert!(!RunStatus::RequiresAction.is_pending());
        assert!(!RunStatus::RequiresAction.is_terminal());
    }

    #[test]
    fn status_serde_matches_wire_names() {
        let json = serde_json::to_string(&RunStatus::RequiresAction).unwrap();
        assert_eq!(json, r#""requires_action""#);
        let parsed: RunStatus = serde_json::from_str(r#""in_progress""#).unwrap();
        assert_eq!(parsed, RunStatus::InProgress);
        assert_eq!(RunStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn tool_call_flattens_kind() {
        let call = ToolCall::function(
            ToolCallId::from_raw("call_1"),
            "sales_data_insights",
            r#"{"question":"revenue by month"}"#,
        );
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["id"], "call_1");
        assert_eq!(json["type"], "function");
        assert_eq!(json["name"], "sales_data_insights");
        let parsed: ToolCall = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, call);
        assert_eq!(parsed.type_name(), "function");
    }

    #[test]
    fn error_info_display() {
        let info = RunErrorInfo {
            code: "rate_limit_exceeded".into(),
            message: "rate limited".into(),
        };
        assert_eq!(info.to_string(), "rate_limit_exceeded: rate limited");
    }
}
