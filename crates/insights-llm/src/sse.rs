use serde::Deserialize;

use insights_core::errors::RemoteError;
use insights_core::events::{
    CodeOutput, MessageContent, RunErrorInfo, RunEvent, RunSnapshot, RunStatus, ToolCall,
    ToolCallDelta, ToolCallKind,
};
use insights_core::ids::{FileId, RunId, ToolCallId};
use insights_core::usage::RunUsage;

/// State machine for parsing Assistants API run stream events.
///
/// Tool calls arrive as indexed deltas inside a run step. A call is reported
/// done when the next index starts and again when the step completes, so
/// consumers see the same `ToolCallDone` more than once.
#[derive(Default)]
pub struct AssistantSseParser {
    current_step: Option<String>,
    step_calls: Vec<PartialToolCall>,
    current_call: Option<u32>,
    current_message: Option<String>,
    text_indices: Vec<u32>,
    done: bool,
}

struct PartialToolCall {
    index: u32,
    id: String,
    call_type: String,
    name: String,
    arguments: String,
    input: String,
    outputs: Vec<CodeOutput>,
}

impl PartialToolCall {
    fn snapshot(&self) -> Option<ToolCall> {
        let kind = match self.call_type.as_str() {
            "function" => ToolCallKind::Function {
                name: self.name.clone(),
                arguments: self.arguments.clone(),
            },
            "code_interpreter" => ToolCallKind::CodeInterpreter {
                input: self.input.clone(),
                outputs: self.outputs.clone(),
            },
            "file_search" => ToolCallKind::FileSearch,
            _ => return None,
        };
        Some(ToolCall {
            id: ToolCallId::from_raw(&self.id),
            kind,
        })
    }
}

impl AssistantSseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// The service sent its `done` marker.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Parse one SSE event and return zero or more RunEvents.
    pub fn parse_event(&mut self, event_type: &str, data: &str) -> Vec<RunEvent> {
        let mut events = Vec::new();

        match event_type {
            "thread.run.step.created" => {
                if let Ok(step) = serde_json::from_str::<StepPayload>(data) {
                    self.start_step(step.id);
                }
            }

            "thread.run.step.delta" => {
                let Ok(delta) = serde_json::from_str::<StepDeltaEvent>(data) else {
                    tracing::debug!(event_type, "unparseable step delta");
                    return events;
                };
                if self.current_step.as_deref() != Some(delta.id.as_str()) {
                    self.start_step(delta.id);
                }
                let calls = delta
                    .delta
                    .step_details
                    .map(|details| details.tool_calls)
                    .unwrap_or_default();
                for call in calls {
                    self.apply_tool_call_delta(call, &mut events);
                }
            }

            "thread.run.step.completed" => {
                if let Ok(step) = serde_json::from_str::<StepPayload>(data) {
                    let calls = step
                        .step_details
                        .map(|details| details.tool_calls)
                        .unwrap_or_default();
                    for call in calls {
                        if let Some(tool_call) = call.into_tool_call() {
                            events.push(RunEvent::ToolCallDone { tool_call });
                        }
                    }
                }
                self.current_step = None;
                self.step_calls.clear();
                self.current_call = None;
            }

            t if t.starts_with("thread.run.step.") => {}

            t if t.starts_with("thread.run.") => match serde_json::from_str::<RunPayload>(data) {
                Ok(run) => events.push(RunEvent::RunUpdated {
                    run: run.into_snapshot(),
                }),
                Err(e) => tracing::warn!(event_type = t, error = %e, "unparseable run event"),
            },

            "thread.message.created" => {
                if let Ok(message) = serde_json::from_str::<MessagePayload>(data) {
                    self.current_message = Some(message.id);
                    self.text_indices.clear();
                }
            }

            "thread.message.delta" => {
                let Ok(delta) = serde_json::from_str::<MessageDeltaEvent>(data) else {
                    return events;
                };
                if self.current_message.as_deref() != Some(delta.id.as_str()) {
                    self.current_message = Some(delta.id);
                    self.text_indices.clear();
                }
                for part in delta.delta.content {
                    match part.content_type.as_str() {
                        "text" => {
                            if !self.text_indices.contains(&part.index) {
                                self.text_indices.push(part.index);
                                events.push(RunEvent::TextCreated);
                            }
                            let value = part.text.and_then(|t| t.value).unwrap_or_default();
                            if !value.is_empty() {
                                events.push(RunEvent::TextDelta { delta: value });
                            }
                        }
                        "image_file" => {
                            if let Some(image) = part.image_file {
                                events.push(RunEvent::ImageFileDone {
                                    file_id: FileId::from_raw(image.file_id),
                                });
                            }
                        }
                        _ => {}
                    }
                }
            }

            "thread.message.completed" => {
                if let Ok(message) = serde_json::from_str::<MessagePayload>(data) {
                    let content = message
                        .content
                        .into_iter()
                        .filter_map(ContentPayload::into_content)
                        .collect();
                    events.push(RunEvent::MessageDone { content });
                }
            }

            "error" => {
                let error = serde_json::from_str::<ErrorEvent>(data)
                    .map(|e| classify_error(e.into_payload()))
                    .unwrap_or_else(|_| RemoteError::StreamInterrupted(data.to_string()));
                events.push(RunEvent::Error { error });
            }

            "done" => self.done = true,

            _ => {} // thread.created, message in_progress, ping, etc.
        }

        events
    }

    fn start_step(&mut self, step_id: String) {
        self.current_step = Some(step_id);
        self.step_calls.clear();
        self.current_call = None;
    }

    fn apply_tool_call_delta(&mut self, delta: ToolCallDeltaPayload, events: &mut Vec<RunEvent>) {
        let known = self.step_calls.iter().position(|c| c.index == delta.index);
        let position = match known {
            Some(position) => position,
            None => {
                // A new index means the previous call finished generating.
                if let Some(previous) = self.current_call {
                    if let Some(tool_call) = self
                        .step_calls
                        .iter()
                        .find(|c| c.index == previous)
                        .and_then(PartialToolCall::snapshot)
                    {
                        events.push(RunEvent::ToolCallDone { tool_call });
                    }
                }
                self.step_calls.push(PartialToolCall {
                    index: delta.index,
                    id: delta.id.clone().unwrap_or_default(),
                    call_type: delta.call_type.clone().unwrap_or_default(),
                    name: String::new(),
                    arguments: String::new(),
                    input: String::new(),
                    outputs: Vec::new(),
                });
                self.step_calls.len() - 1
            }
        };
        self.current_call = Some(delta.index);

        let call = &mut self.step_calls[position];
        let mut deltas = Vec::new();
        if let Some(function) = delta.function {
            if let Some(name) = function.name {
                call.name.push_str(&name);
            }
            if let Some(arguments) = function.arguments.filter(|a| !a.is_empty()) {
                call.arguments.push_str(&arguments);
                deltas.push(ToolCallDelta::FunctionArguments(arguments));
            }
        }
        if let Some(code) = delta.code_interpreter {
            if let Some(input) = code.input.filter(|i| !i.is_empty()) {
                call.input.push_str(&input);
                deltas.push(ToolCallDelta::CodeInput(input));
            }
            let outputs: Vec<CodeOutput> = code
                .outputs
                .into_iter()
                .filter_map(CodeOutputPayload::into_output)
                .collect();
            if !outputs.is_empty() {
                call.outputs.extend(outputs.iter().cloned());
                deltas.push(ToolCallDelta::CodeOutputs(outputs));
            }
        }

        if known.is_none() {
            if let Some(tool_call) = call.snapshot() {
                events.push(RunEvent::ToolCallCreated { tool_call });
            }
        }
        let tool_call_id = ToolCallId::from_raw(&call.id);
        events.extend(deltas.into_iter().map(|delta| RunEvent::ToolCallDelta {
            tool_call_id: tool_call_id.clone(),
            delta,
        }));
    }
}

fn classify_error(err: ErrorPayload) -> RemoteError {
    let code = err.code.or(err.error_type).unwrap_or_default();
    match code.as_str() {
        c if c.starts_with("rate_limit") => RemoteError::RateLimited { retry_after: None },
        "invalid_api_key" | "authentication_error" => RemoteError::AuthenticationFailed(err.message),
        "server_error" => RemoteError::ServerError {
            status: 500,
            body: err.message,
        },
        _ => RemoteError::InvalidRequest(err.message),
    }
}

/// Parse raw SSE text into (event_type, data) pairs.
pub fn parse_sse_lines(raw: &str) -> Vec<(String, String)> {
    let mut events = Vec::new();
    let mut current_event = String::new();
    let mut current_data = String::new();

    for line in raw.lines() {
        if let Some(event) = line.strip_prefix("event:") {
            current_event = event.trim_start().to_string();
        } else if let Some(data) = line.strip_prefix("data:") {
            if !current_data.is_empty() {
                current_data.push('\n');
            }
            current_data.push_str(data.strip_prefix(' ').unwrap_or(data));
        } else if line.is_empty() && !current_event.is_empty() {
            events.push((current_event.clone(), current_data.clone()));
            current_event.clear();
            current_data.clear();
        }
    }

    // Handle trailing event without blank line
    if !current_event.is_empty() {
        events.push((current_event, current_data));
    }

    events
}

// --- Deserialization types for Assistants stream payloads ---

#[derive(Deserialize)]
pub(crate) struct RunPayload {
    id: String,
    status: RunStatus,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<RunUsage>,
    #[serde(default)]
    last_error: Option<RunErrorInfo>,
    #[serde(default)]
    required_action: Option<RequiredAction>,
}

impl RunPayload {
    pub(crate) fn into_snapshot(self) -> RunSnapshot {
        let required_tool_calls = self
            .required_action
            .and_then(|action| action.submit_tool_outputs)
            .map(|submit| {
                submit
                    .tool_calls
                    .into_iter()
                    .filter_map(ToolCallPayload::into_tool_call)
                    .collect()
            })
            .unwrap_or_default();
        RunSnapshot {
            id: RunId::from_raw(self.id),
            status: self.status,
            model: self.model,
            usage: self.usage,
            last_error: self.last_error,
            required_tool_calls,
        }
    }
}

#[derive(Deserialize)]
struct RequiredAction {
    #[serde(default)]
    submit_tool_outputs: Option<SubmitToolOutputs>,
}

#[derive(Deserialize)]
struct SubmitToolOutputs {
    #[serde(default)]
    tool_calls: Vec<ToolCallPayload>,
}

#[derive(Deserialize)]
struct ToolCallPayload {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    #[serde(default)]
    function: Option<FunctionPayload>,
    #[serde(default)]
    code_interpreter: Option<CodeInterpreterPayload>,
}

impl ToolCallPayload {
    fn into_tool_call(self) -> Option<ToolCall> {
        let kind = match self.call_type.as_str() {
            "function" => {
                let function = self.function?;
                ToolCallKind::Function {
                    name: function.name.unwrap_or_default(),
                    arguments: function.arguments.unwrap_or_default(),
                }
            }
            "code_interpreter" => {
                let code = self.code_interpreter.unwrap_or_default();
                ToolCallKind::CodeInterpreter {
                    input: code.input.unwrap_or_default(),
                    outputs: code
                        .outputs
                        .into_iter()
                        .filter_map(CodeOutputPayload::into_output)
                        .collect(),
                }
            }
            "file_search" => ToolCallKind::FileSearch,
            other => {
                tracing::debug!(call_type = other, "skipping unknown tool call type");
                return None;
            }
        };
        Some(ToolCall {
            id: ToolCallId::from_raw(self.id),
            kind,
        })
    }
}

#[derive(Deserialize)]
struct FunctionPayload {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Default, Deserialize)]
struct CodeInterpreterPayload {
    #[serde(default)]
    input: Option<String>,
    #[serde(default)]
    outputs: Vec<CodeOutputPayload>,
}

#[derive(Deserialize)]
struct CodeOutputPayload {
    #[serde(rename = "type")]
    output_type: String,
    #[serde(default)]
    logs: Option<String>,
    #[serde(default)]
    image: Option<FileRef>,
}

impl CodeOutputPayload {
    fn into_output(self) -> Option<CodeOutput> {
        match self.output_type.as_str() {
            "logs" => Some(CodeOutput::Logs {
                logs: self.logs.unwrap_or_default(),
            }),
            "image" => Some(CodeOutput::Image {
                file_id: FileId::from_raw(self.image?.file_id),
            }),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct FileRef {
    file_id: String,
}

#[derive(Deserialize)]
struct StepPayload {
    id: String,
    #[serde(default)]
    step_details: Option<StepDetails>,
}

#[derive(Deserialize)]
struct StepDetails {
    #[serde(default)]
    tool_calls: Vec<ToolCallPayload>,
}

#[derive(Deserialize)]
struct StepDeltaEvent {
    id: String,
    delta: StepDelta,
}

#[derive(Deserialize)]
struct StepDelta {
    #[serde(default)]
    step_details: Option<StepDeltaDetails>,
}

#[derive(Deserialize)]
struct StepDeltaDetails {
    #[serde(default)]
    tool_calls: Vec<ToolCallDeltaPayload>,
}

#[derive(Deserialize)]
struct ToolCallDeltaPayload {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "type")]
    call_type: Option<String>,
    #[serde(default)]
    function: Option<FunctionPayload>,
    #[serde(default)]
    code_interpreter: Option<CodeInterpreterPayload>,
}

#[derive(Deserialize)]
struct MessagePayload {
    id: String,
    #[serde(default)]
    content: Vec<ContentPayload>,
}

#[derive(Deserialize)]
struct ContentPayload {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: Option<TextPayload>,
    #[serde(default)]
    image_file: Option<FileRef>,
}

impl ContentPayload {
    fn into_content(self) -> Option<MessageContent> {
        match self.content_type.as_str() {
            "text" => Some(MessageContent::Text {
                value: self.text.and_then(|t| t.value).unwrap_or_default(),
            }),
            "image_file" => Some(MessageContent::ImageFile {
                file_id: FileId::from_raw(self.image_file?.file_id),
            }),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct TextPayload {
    #[serde(default)]
    value: Option<String>,
}

#[derive(Deserialize)]
struct MessageDeltaEvent {
    id: String,
    delta: MessageDelta,
}

#[derive(Deserialize)]
struct MessageDelta {
    #[serde(default)]
    content: Vec<ContentDeltaPayload>,
}

#[derive(Deserialize)]
struct ContentDeltaPayload {
    #[serde(default)]
    index: u32,
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: Option<TextPayload>,
    #[serde(default)]
    image_file: Option<FileRef>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorEvent {
    Wrapped { error: ErrorPayload },
    Bare(ErrorPayload),
}

impl ErrorEvent {
    fn into_payload(self) -> ErrorPayload {
        match self {
            Self::Wrapped { error } | Self::Bare(error) => error,
        }
    }
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    code: Option<String>,
    #[serde(default, rename = "type")]
    error_type: Option<String>,
    #[serde(default)]
    message: String,
}
