//! Drives one remote assistant run and renders its events onto a
//! [`StreamBridge`].
//!
//! `Submitting → Streaming → (ActionRequired → Streaming)* →
//! {Completed, Failed, TimedOut}`
//!
//! The driver runs on its own task; [`RunDriver::start`] returns as soon as
//! the thread is known, and the caller pulls tokens from the returned
//! stream. Every path ends the bridge, so the consumer never hangs.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument, Span};

use insights_core::artifact::ImageArtifact;
use insights_core::backend::{AssistantBackend, RunEventStream};
use insights_core::errors::RemoteError;
use insights_core::events::{
    CodeOutput, MessageContent, RunErrorInfo, RunEvent, RunSnapshot, RunStatus, ToolCall,
    ToolCallDelta, ToolCallKind,
};
use insights_core::ids::{AssistantId, FileId, RunId, ThreadId, ToolCallId};
use insights_core::tools::{parse_arguments, ToolError, ToolOutput};
use insights_core::usage::RunUsage;
use insights_telemetry::TraceContext;

use crate::batch::panic_message;
use crate::bridge::{StreamBridge, StreamOutcome, TokenStream};
use crate::error::EngineError;
use crate::registry::ToolRegistry;
use crate::truncate::{truncate_output, MAX_TOOL_OUTPUT};

const DEFAULT_MAX_WAITING_TIME: Duration = Duration::from_secs(120);
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);
const CANCEL_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the run driver.
#[derive(Clone, Debug)]
pub struct DriverConfig {
    pub assistant_id: AssistantId,
    /// Wall-clock budget for the whole run, tool calls included.
    pub max_waiting_time: Duration,
    pub tool_timeout: Duration,
    /// Tools the assistant is configured to call. Each must be registered.
    pub expected_tools: Vec<String>,
}

impl DriverConfig {
    pub fn new(assistant_id: AssistantId) -> Self {
        Self {
            assistant_id,
            max_waiting_time: DEFAULT_MAX_WAITING_TIME,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            expected_tools: Vec::new(),
        }
    }

    pub fn with_max_waiting_time(mut self, max_waiting_time: Duration) -> Self {
        self.max_waiting_time = max_waiting_time;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn expecting(mut self, tool: impl Into<String>) -> Self {
        self.expected_tools.push(tool.into());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Submitting,
    Streaming,
    ActionRequired,
    Completed,
    Failed,
    TimedOut,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }
}

/// What the driver knows about its run.
#[derive(Clone, Debug)]
pub struct RunState {
    pub run_id: Option<RunId>,
    pub status: Option<RunStatus>,
    pub phase: RunPhase,
    pub usage: RunUsage,
    pub model: Option<String>,
    pub last_error: Option<RunErrorInfo>,
    required_tool_calls: Vec<ToolCall>,
}

impl RunState {
    fn new() -> Self {
        Self {
            run_id: None,
            status: None,
            phase: RunPhase::Submitting,
            usage: RunUsage::default(),
            model: None,
            last_error: None,
            required_tool_calls: Vec::new(),
        }
    }

    fn apply(&mut self, run: &RunSnapshot) {
        self.run_id = Some(run.id.clone());
        self.status = Some(run.status);
        if let Some(usage) = run.usage {
            self.usage = usage;
        }
        if run.model.is_some() {
            self.model = run.model.clone();
        }
        if run.last_error.is_some() {
            self.last_error = run.last_error.clone();
        }
        self.required_tool_calls = run.required_tool_calls.clone();
    }
}

/// Opaque resumption token handed back to the caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub thread_id: ThreadId,
}

/// Result of [`RunDriver::start`].
pub struct ChatResponse {
    pub chat_output: TokenStream,
    pub session_state: SessionState,
    /// Trace context of the stream, for propagation.
    pub trace_carrier: HashMap<String, String>,
    /// Resolves with the final run state once the bridge has ended.
    pub driver: JoinHandle<RunState>,
}

/// Idempotency set for tool calls. The event source may redeliver
/// notifications for the same call id.
#[derive(Debug, Default)]
pub struct ToolCallLedger {
    announced: HashSet<ToolCallId>,
    outputs: HashMap<ToolCallId, ToolOutput>,
}

impl ToolCallLedger {
    /// True the first time a call id completes.
    pub fn mark_done(&mut self, id: &ToolCallId) -> bool {
        self.announced.insert(id.clone())
    }

    pub fn output_for(&self, id: &ToolCallId) -> Option<&ToolOutput> {
        self.outputs.get(id)
    }

    pub fn record_output(&mut self, output: ToolOutput) {
        self.outputs.insert(output.tool_call_id.clone(), output);
    }

    pub fn executed(&self) -> usize {
        self.outputs.len()
    }
}

/// Starts runs against an assistant backend with a frozen tool registry.
pub struct RunDriver {
    backend: Arc<dyn AssistantBackend>,
    tools: Arc<ToolRegistry>,
    config: DriverConfig,
}

impl RunDriver {
    /// Fails with [`EngineError::UnknownTool`] when an expected tool is not
    /// registered.
    pub fn new(
        backend: Arc<dyn AssistantBackend>,
        tools: ToolRegistry,
        config: DriverConfig,
    ) -> Result<Self, EngineError> {
        tools.ensure_all(&config.expected_tools)?;
        Ok(Self {
            backend,
            tools: Arc::new(tools),
            config,
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Start a run in a fresh trace.
    pub async fn start(
        &self,
        question: &str,
        session: Option<SessionState>,
    ) -> Result<ChatResponse, EngineError> {
        self.start_traced(question, session, TraceContext::new_root())
            .await
    }

    /// Resolve the thread, then spawn the run and return immediately.
    #[instrument(skip_all, fields(backend = self.backend.name(), trace_id = %trace.trace_id))]
    pub async fn start_traced(
        &self,
        question: &str,
        session: Option<SessionState>,
        trace: TraceContext,
    ) -> Result<ChatResponse, EngineError> {
        let thread_id = match session {
            Some(session) => {
                info!(thread_id = %session.thread_id, "using thread from session state");
                self.backend.retrieve_thread(&session.thread_id).await?
            }
            None => {
                let thread_id = self.backend.create_thread().await?;
                info!(thread_id = %thread_id, "created thread");
                thread_id
            }
        };

        let bridge = StreamBridge::with_trace(trace);
        let chat_output = bridge.iterate();
        let trace_carrier = bridge.carrier();

        let trace_span = bridge.trace_context().reactivate();
        let span = info_span!(
            parent: &trace_span,
            "assistant_run",
            thread_id = %thread_id,
            assistant_id = %self.config.assistant_id,
            run_id = tracing::field::Empty,
            model = tracing::field::Empty,
            prompt_tokens = tracing::field::Empty,
            completion_tokens = tracing::field::Empty,
            total_tokens = tracing::field::Empty,
        );

        let task = DriveTask {
            backend: Arc::clone(&self.backend),
            tools: Arc::clone(&self.tools),
            config: self.config.clone(),
            thread_id: thread_id.clone(),
            bridge,
            ledger: ToolCallLedger::default(),
            state: RunState::new(),
            span: span.clone(),
        };
        let question = question.to_string();
        let driver = tokio::spawn(task.drive(question).instrument(span));

        Ok(ChatResponse {
            chat_output,
            session_state: SessionState { thread_id },
            trace_carrier,
            driver,
        })
    }
}

struct DriveTask {
    backend: Arc<dyn AssistantBackend>,
    tools: Arc<ToolRegistry>,
    config: DriverConfig,
    thread_id: ThreadId,
    bridge: StreamBridge,
    ledger: ToolCallLedger,
    state: RunState,
    span: Span,
}

impl DriveTask {
    async fn drive(mut self, question: String) -> RunState {
        info!("run driver started");
        let result = AssertUnwindSafe(self.run(&question)).catch_unwind().await;
        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                error!(error = %e, "run driver failed");
                Some(e.to_string())
            }
            Err(panic) => {
                let msg = panic_message(&panic);
                error!(panic = %msg, "run driver panicked");
                Some(format!("driver panicked: {msg}"))
            }
        };
        if let Some(reason) = failure {
            self.state.phase = RunPhase::Failed;
            self.bridge.send(format!("Run failed with error: {reason}"));
            self.bridge.end_with(StreamOutcome::Failed { reason });
        }
        info!(phase = ?self.state.phase, "run driver ended");
        self.state
    }

    async fn run(&mut self, question: &str) -> Result<(), EngineError> {
        let deadline = Instant::now() + self.config.max_waiting_time;

        info!("submitting the message");
        let submitted = tokio::time::timeout_at(
            deadline,
            self.backend.add_user_message(&self.thread_id, question),
        )
        .await;
        match submitted {
            Ok(result) => result?,
            Err(_) => return self.time_out().await,
        }

        info!("streaming the run");
        let started = tokio::time::timeout_at(
            deadline,
            self.backend
                .stream_run(&self.thread_id, &self.config.assistant_id),
        )
        .await;
        let mut stream = match started {
            Ok(stream) => stream?,
            Err(_) => return self.time_out().await,
        };
        self.set_phase(RunPhase::Streaming);

        loop {
            if self.consume(stream, deadline).await? {
                return self.time_out().await;
            }

            match self.state.status {
                Some(RunStatus::RequiresAction) => {
                    self.set_phase(RunPhase::ActionRequired);
                    let calls = std::mem::take(&mut self.state.required_tool_calls);
                    let outputs = self.resolve_tool_calls(calls).await;
                    if Instant::now() >= deadline {
                        return self.time_out().await;
                    }

                    let run_id = self.run_id()?;
                    info!(outputs = outputs.len(), "resuming the run with tool outputs");
                    let resumed = tokio::time::timeout_at(
                        deadline,
                        self.backend
                            .submit_tool_outputs(&self.thread_id, &run_id, outputs),
                    )
                    .await;
                    stream = match resumed {
                        Ok(stream) => stream?,
                        Err(_) => return self.time_out().await,
                    };
                    self.set_phase(RunPhase::Streaming);
                }
                Some(RunStatus::Completed) => {
                    self.complete();
                    return Ok(());
                }
                Some(status) if status.is_failure() => {
                    self.fail(status);
                    return Ok(());
                }
                status => {
                    let status = status.map_or("unknown", RunStatus::as_str);
                    return Err(RemoteError::StreamInterrupted(format!(
                        "run stream ended with status {status}"
                    ))
                    .into());
                }
            }
        }
    }

    /// Drain one streamed segment. Returns `true` when the deadline passed.
    async fn consume(
        &mut self,
        mut stream: RunEventStream,
        deadline: Instant,
    ) -> Result<bool, EngineError> {
        loop {
            // Handling an event may itself use up the budget.
            if Instant::now() >= deadline {
                return Ok(true);
            }
            match tokio::time::timeout_at(deadline, stream.next()).await {
                Err(_) => return Ok(true),
                Ok(None) => return Ok(false),
                Ok(Some(event)) => self.handle_event(event, deadline).await?,
            }
        }
    }

    async fn handle_event(&mut self, event: RunEvent, deadline: Instant) -> Result<(), EngineError> {
        match event {
            RunEvent::RunUpdated { run } => {
                if self.state.run_id.as_ref() != Some(&run.id) {
                    self.span.record("run_id", tracing::field::display(&run.id));
                    info!(run_id = %run.id, "run created");
                }
                debug!(status = %run.status, "run updated");
                self.state.apply(&run);
            }
            RunEvent::TextCreated => {
                self.bridge.send("\n");
            }
            RunEvent::TextDelta { delta } => {
                self.bridge.send(delta);
            }
            RunEvent::ToolCallCreated { tool_call } => {
                self.bridge.send(render_tool_call_created(&tool_call));
            }
            RunEvent::ToolCallDelta { delta, .. } => {
                // Code interpreter input is not echoed.
                if let ToolCallDelta::FunctionArguments(arguments) = delta {
                    self.bridge.send(arguments);
                }
            }
            RunEvent::ToolCallDone { tool_call } => {
                if self.ledger.mark_done(&tool_call.id) {
                    self.bridge.send("\n");
                    trace_tool_call(&tool_call);
                } else {
                    debug!(tool_call_id = %tool_call.id, "duplicate tool call notification ignored");
                }
            }
            RunEvent::ImageFileDone { file_id } => {
                if let Some(image) = self.fetch_image(&file_id, deadline).await {
                    self.bridge.send(image);
                }
            }
            RunEvent::MessageDone { content } => {
                for item in &content {
                    trace_message_content(item);
                }
            }
            RunEvent::Error { error } => return Err(error.into()),
        }
        Ok(())
    }

    async fn fetch_image(&self, file_id: &FileId, deadline: Instant) -> Option<ImageArtifact> {
        match tokio::time::timeout_at(deadline, self.backend.file_content(file_id)).await {
            Ok(Ok(bytes)) => Some(ImageArtifact::from_bytes(bytes)),
            Ok(Err(e)) => {
                warn!(file_id = %file_id, error = %e, "failed to fetch image file");
                None
            }
            Err(_) => {
                warn!(file_id = %file_id, "image download ran past the run deadline");
                None
            }
        }
    }

    /// Run each required call once, in order. A call id seen before gets
    /// its earlier output again.
    async fn resolve_tool_calls(&mut self, calls: Vec<ToolCall>) -> Vec<ToolOutput> {
        let mut outputs = Vec::with_capacity(calls.len());
        for call in calls {
            if let Some(cached) = self.ledger.output_for(&call.id) {
                debug!(tool_call_id = %call.id, "tool call already executed, resubmitting output");
                outputs.push(cached.clone());
                continue;
            }
            let output = self.invoke_tool(&call).await;
            self.ledger.record_output(output.clone());
            outputs.push(output);
        }
        outputs
    }

    async fn invoke_tool(&self, call: &ToolCall) -> ToolOutput {
        let ToolCallKind::Function { name, arguments } = &call.kind else {
            let err = ToolError::UnsupportedType(call.type_name().to_string());
            warn!(tool_call_id = %call.id, error = %err, "cannot run tool call");
            return ToolOutput::error(call.id.clone(), &err);
        };

        match self.run_tool(name, arguments).await {
            Ok(value) => {
                let content = truncate_output(&value.to_string(), MAX_TOOL_OUTPUT);
                ToolOutput::new(call.id.clone(), content)
            }
            Err(e) => {
                warn!(tool = %name, tool_call_id = %call.id, error = %e, "tool call failed");
                ToolOutput::error(call.id.clone(), &e)
            }
        }
    }

    async fn run_tool(&self, name: &str, arguments: &str) -> Result<serde_json::Value, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        let args = parse_arguments(arguments)?;

        let start = Instant::now();
        let result = tokio::time::timeout(
            self.config.tool_timeout,
            AssertUnwindSafe(tool.invoke(args)).catch_unwind(),
        )
        .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(result)) => {
                info!(tool = %name, duration_ms, ok = result.is_ok(), "tool call finished");
                result
            }
            Ok(Err(panic)) => {
                let msg = panic_message(&panic);
                error!(tool = %name, panic = %msg, "tool panicked during execution");
                Err(ToolError::Panicked(msg))
            }
            Err(_) => Err(ToolError::Timeout(self.config.tool_timeout)),
        }
    }

    fn complete(&mut self) {
        self.set_phase(RunPhase::Completed);
        let usage = self.state.usage;
        if let Some(model) = &self.state.model {
            self.span.record("model", model.as_str());
        }
        self.span.record("prompt_tokens", usage.prompt_tokens);
        self.span.record("completion_tokens", usage.completion_tokens);
        self.span.record("total_tokens", usage.total_tokens);
        info!(
            model = self.state.model.as_deref().unwrap_or("unknown"),
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            total_tokens = usage.total_tokens,
            "run completed"
        );
        self.bridge.end();
    }

    fn fail(&mut self, status: RunStatus) {
        self.set_phase(RunPhase::Failed);
        let reason = match &self.state.last_error {
            Some(detail) => format!("Run failed with status: {status} ({detail})"),
            None => format!("Run failed with status: {status}"),
        };
        info!(status = %status, last_error = ?self.state.last_error, "run failed");
        self.bridge.send(reason.as_str());
        self.bridge.end_with(StreamOutcome::Failed { reason });
    }

    async fn time_out(&mut self) -> Result<(), EngineError> {
        self.set_phase(RunPhase::TimedOut);
        let after = self.config.max_waiting_time;
        info!(status = ?self.state.status, "the run has timed out");

        // The run may have finished in the meantime; cancelling is best effort.
        match &self.state.run_id {
            Some(run_id) => {
                let cancel = self.backend.cancel_run(&self.thread_id, run_id);
                match tokio::time::timeout(CANCEL_TIMEOUT, cancel).await {
                    Ok(Ok(run)) => info!(status = %run.status, "cancel requested"),
                    Ok(Err(e)) => error!(error = %e, "failed to cancel the run"),
                    Err(_) => error!("cancel request timed out"),
                }
            }
            None => warn!("run timed out before it was created, nothing to cancel"),
        }

        self.bridge
            .send(format!("The run has timed out after {} seconds.", after.as_secs()));
        self.bridge.end_with(StreamOutcome::TimedOut { after });
        Ok(())
    }

    fn run_id(&self) -> Result<RunId, EngineError> {
        self.state
            .run_id
            .clone()
            .ok_or_else(|| EngineError::Internal("run requires action but has no id".into()))
    }

    fn set_phase(&mut self, phase: RunPhase) {
        debug!(from = ?self.state.phase, to = ?phase, "run phase");
        self.state.phase = phase;
    }
}

fn render_tool_call_created(tool_call: &ToolCall) -> String {
    let mut out = format!("\n> tool_call: {}\n", tool_call.type_name());
    match &tool_call.kind {
        ToolCallKind::Function { name, .. } => {
            out.push_str(&format!("> id  : {}\n> name: {name}\n> arguments: ", tool_call.id));
        }
        ToolCallKind::CodeInterpreter { .. } => {
            out.push_str(&format!("> id  : {}\n\n", tool_call.id));
        }
        ToolCallKind::FileSearch => {}
    }
    out
}

fn trace_tool_call(tool_call: &ToolCall) {
    match &tool_call.kind {
        ToolCallKind::Function { name, arguments } => {
            let arguments = serde_json::from_str::<serde_json::Value>(arguments)
                .unwrap_or_else(|_| serde_json::Value::String(arguments.clone()));
            let inputs = serde_json::json!({
                "name": name,
                "arguments": arguments,
                "tool_call_id": tool_call.id,
            });
            info_span!("assistant.function_call").in_scope(|| {
                info!(inputs = %inputs, "function call");
            });
        }
        ToolCallKind::CodeInterpreter { input, outputs } => {
            let mut output = serde_json::Map::new();
            for item in outputs {
                match item {
                    CodeOutput::Logs { logs } => {
                        output.insert("logs".into(), serde_json::json!(logs.split('\n').collect::<Vec<_>>()));
                    }
                    CodeOutput::Image { file_id } => {
                        output.insert("image_file_id".into(), serde_json::json!(file_id));
                    }
                }
            }
            let inputs = serde_json::json!({
                "code": input.split('\n').collect::<Vec<_>>(),
                "tool_call_id": tool_call.id,
            });
            info_span!("code_interpreter_call").in_scope(|| {
                info!(inputs = %inputs, output = %serde_json::Value::Object(output), "code interpreter call");
            });
        }
        ToolCallKind::FileSearch => {
            info!(tool_call_id = %tool_call.id, kind = tool_call.type_name(), "tool call");
        }
    }
}

fn trace_message_content(content: &MessageContent) {
    match content {
        MessageContent::Text { value } => {
            let lines: Vec<&str> = value.split('\n').collect();
            info_span!("assistant.text_message").in_scope(|| {
                info!(inputs = %serde_json::json!(lines), "text message");
            });
        }
        MessageContent::ImageFile { file_id } => {
            info_span!("assistant.image_message").in_scope(|| {
                info!(file_id = %file_id, "image message");
            });
        }
    }
}
