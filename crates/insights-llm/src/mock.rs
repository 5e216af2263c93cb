use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;

use insights_core::backend::{AssistantBackend, RunEventStream};
use insights_core::chat::{ChatBatchBackend, ChatBatchResponse, ChatBatchRow};
use insights_core::errors::RemoteError;
use insights_core::events::{MessageContent, RunErrorInfo, RunEvent, RunSnapshot, RunStatus, ToolCall};
use insights_core::ids::{AssistantId, FileId, RunId, ThreadId};
use insights_core::planner::QueryPlanner;
use insights_core::tools::ToolOutput;
use insights_core::usage::RunUsage;

/// Pre-programmed run segments for deterministic testing without API calls.
pub enum MockResponse {
    /// Yield a sequence of RunEvents, then end.
    Stream(Vec<RunEvent>),
    /// Yield a sequence of RunEvents, then never end.
    Hang(Vec<RunEvent>),
    /// Return an error from the call itself.
    Error(RemoteError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }

    /// Text answer followed by a completed run.
    pub fn completed_text(run_id: &str, text: &str) -> Self {
        Self::Stream(vec![
            run_updated(run_id, RunStatus::Queued),
            RunEvent::TextCreated,
            RunEvent::TextDelta {
                delta: text.to_string(),
            },
            RunEvent::MessageDone {
                content: vec![MessageContent::Text {
                    value: text.to_string(),
                }],
            },
            completed(run_id),
        ])
    }

    /// Announces the calls (each `ToolCallDone` once) and then asks for
    /// their outputs.
    pub fn requires_action(run_id: &str, calls: Vec<ToolCall>) -> Self {
        let mut events = vec![run_updated(run_id, RunStatus::InProgress)];
        for call in &calls {
            events.push(RunEvent::ToolCallCreated {
                tool_call: call.clone(),
            });
            events.push(RunEvent::ToolCallDone {
                tool_call: call.clone(),
            });
        }
        let mut run = RunSnapshot::new(RunId::from_raw(run_id), RunStatus::RequiresAction);
        run.required_tool_calls = calls;
        events.push(RunEvent::RunUpdated { run });
        Self::Stream(events)
    }

    /// Run ends with a terminal failure status and error detail.
    pub fn failed(run_id: &str, status: RunStatus, code: &str, message: &str) -> Self {
        let mut run = RunSnapshot::new(RunId::from_raw(run_id), status);
        run.last_error = Some(RunErrorInfo {
            code: code.to_string(),
            message: message.to_string(),
        });
        Self::Stream(vec![
            run_updated(run_id, RunStatus::InProgress),
            RunEvent::RunUpdated { run },
        ])
    }
}

pub fn run_updated(run_id: &str, status: RunStatus) -> RunEvent {
    RunEvent::RunUpdated {
        run: RunSnapshot::new(RunId::from_raw(run_id), status),
    }
}

/// Completed snapshot with model and usage populated.
pub fn completed(run_id: &str) -> RunEvent {
    let mut run = RunSnapshot::new(RunId::from_raw(run_id), RunStatus::Completed);
    run.model = Some("mock-model".into());
    run.usage = Some(RunUsage {
        prompt_tokens: 100,
        completion_tokens: 20,
        total_tokens: 120,
    });
    RunEvent::RunUpdated { run }
}

/// Mock assistant service. `stream_run` and `submit_tool_outputs` consume
/// the scripted responses in order; every call is recorded.
pub struct MockBackend {
    responses: Mutex<VecDeque<MockResponse>>,
    call_count: AtomicUsize,
    threads_created: AtomicUsize,
    messages: Mutex<Vec<(ThreadId, String)>>,
    submissions: Mutex<Vec<(RunId, Vec<ToolOutput>)>>,
    cancellations: Mutex<Vec<RunId>>,
    cancel_error: Mutex<Option<RemoteError>>,
    files: HashMap<FileId, Vec<u8>>,
    message_delay: Option<Duration>,
    file_delay: Option<Duration>,
}

impl MockBackend {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            call_count: AtomicUsize::new(0),
            threads_created: AtomicUsize::new(0),
            messages: Mutex::new(Vec::new()),
            submissions: Mutex::new(Vec::new()),
            cancellations: Mutex::new(Vec::new()),
            cancel_error: Mutex::new(None),
            files: HashMap::new(),
            message_delay: None,
            file_delay: None,
        }
    }

    /// Make `add_user_message` take this long.
    pub fn with_message_delay(mut self, delay: Duration) -> Self {
        self.message_delay = Some(delay);
        self
    }

    /// Make `file_content` take this long.
    pub fn with_file_delay(mut self, delay: Duration) -> Self {
        self.file_delay = Some(delay);
        self
    }

    pub fn with_file(mut self, file_id: &str, bytes: Vec<u8>) -> Self {
        self.files.insert(FileId::from_raw(file_id), bytes);
        self
    }

    pub fn with_cancel_error(self, error: RemoteError) -> Self {
        *self.cancel_error.lock() = Some(error);
        self
    }

    /// Number of `stream_run` + `submit_tool_outputs` calls.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn threads_created(&self) -> usize {
        self.threads_created.load(Ordering::Relaxed)
    }

    pub fn messages(&self) -> Vec<(ThreadId, String)> {
        self.messages.lock().clone()
    }

    pub fn submissions(&self) -> Vec<(RunId, Vec<ToolOutput>)> {
        self.submissions.lock().clone()
    }

    pub fn cancellations(&self) -> Vec<RunId> {
        self.cancellations.lock().clone()
    }

    async fn next_response(&self) -> Result<RunEventStream, RemoteError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        let Some(response) = self.responses.lock().pop_front() else {
            return Err(RemoteError::InvalidRequest(format!(
                "MockBackend: no response configured for call {idx}"
            )));
        };
        resolve_response(response).await
    }
}

/// Resolve a MockResponse, handling Delay by sleeping first.
/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(response: MockResponse) -> Result<RunEventStream, RemoteError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Stream(events) => return Ok(Box::pin(stream::iter(events))),
            MockResponse::Hang(events) => {
                return Ok(Box::pin(stream::iter(events).chain(stream::pending())))
            }
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}

#[async_trait]
impl AssistantBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create_thread(&self) -> Result<ThreadId, RemoteError> {
        self.threads_created.fetch_add(1, Ordering::Relaxed);
        Ok(ThreadId::new())
    }

    async fn retrieve_thread(&self, thread_id: &ThreadId) -> Result<ThreadId, RemoteError> {
        Ok(thread_id.clone())
    }

    async fn add_user_message(&self, thread_id: &ThreadId, content: &str) -> Result<(), RemoteError> {
        if let Some(delay) = self.message_delay {
            tokio::time::sleep(delay).await;
        }
        self.messages
            .lock()
            .push((thread_id.clone(), content.to_string()));
        Ok(())
    }

    async fn stream_run(
        &self,
        _thread_id: &ThreadId,
        _assistant_id: &AssistantId,
    ) -> Result<RunEventStream, RemoteError> {
        self.next_response().await
    }

    async fn submit_tool_outputs(
        &self,
        _thread_id: &ThreadId,
        run_id: &RunId,
        outputs: Vec<ToolOutput>,
    ) -> Result<RunEventStream, RemoteError> {
        self.submissions.lock().push((run_id.clone(), outputs));
        self.next_response().await
    }

    async fn cancel_run(&self, _thread_id: &ThreadId, run_id: &RunId) -> Result<RunSnapshot, RemoteError> {
        self.cancellations.lock().push(run_id.clone());
        if let Some(error) = self.cancel_error.lock().clone() {
            return Err(error);
        }
        Ok(RunSnapshot::new(run_id.clone(), RunStatus::Cancelling))
    }

    async fn file_content(&self, file_id: &FileId) -> Result<Vec<u8>, RemoteError> {
        if let Some(delay) = self.file_delay {
            tokio::time::sleep(delay).await;
        }
        self.files
            .get(file_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(file_id.to_string()))
    }
}

/// Canned completion body, mirroring what the batch service returns per row.
pub fn canned_completion(content: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "model": "gpt-4",
        "choices": [{
            "index": 0,
            "finish_reason": "stop",
            "message": { "role": "assistant", "content": content }
        }],
        "usage": { "completion_tokens": 843, "prompt_tokens": 37, "total_tokens": 880 }
    })
}

/// Batch backend answering every row with the same canned completion, echoing
/// `custom_id`. Rows listed in `drop_ids` are left out of the response.
pub struct MockChatBatchBackend {
    content: String,
    drop_ids: Vec<String>,
    batches: Mutex<Vec<usize>>,
}

impl MockChatBatchBackend {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            drop_ids: Vec::new(),
            batches: Mutex::new(Vec::new()),
        }
    }

    pub fn dropping(mut self, custom_id: impl Into<String>) -> Self {
        self.drop_ids.push(custom_id.into());
        self
    }

    /// Row count of each batch seen so far.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().clone()
    }
}

#[async_trait]
impl ChatBatchBackend for MockChatBatchBackend {
    async fn run_batch(&self, rows: Vec<ChatBatchRow>) -> Result<Vec<ChatBatchResponse>, RemoteError> {
        tracing::info!(rows = rows.len(), "running mock batch");
        self.batches.lock().push(rows.len());
        Ok(rows
            .into_iter()
            .filter(|row| !self.drop_ids.contains(&row.custom_id))
            .map(|row| ChatBatchResponse {
                custom_id: row.custom_id,
                status_code: 200,
                body: canned_completion(&self.content),
            })
            .collect())
    }
}

/// Planner returning a fixed query and counting questions.
pub struct MockPlanner {
    query: String,
    questions: Mutex<Vec<String>>,
}

impl MockPlanner {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            questions: Mutex::new(Vec::new()),
        }
    }

    pub fn questions(&self) -> Vec<String> {
        self.questions.lock().clone()
    }
}

#[async_trait]
impl QueryPlanner for MockPlanner {
    async fn plan_query(&self, question: &str) -> Result<String, RemoteError> {
        self.questions.lock().push(question.to_string());
        Ok(self.query.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insights_core::ids::ToolCallId;

    #[tokio::test]
    async fn responses_consumed_in_order() {
        let backend = MockBackend::new(vec![
            MockResponse::completed_text("run_1", "hello"),
            MockResponse::Error(RemoteError::Cancelled),
        ]);
        let thread = backend.create_thread().await.unwrap();
        let assistant = AssistantId::from_raw("asst_1");

        let events: Vec<RunEvent> = backend
            .stream_run(&thread, &assistant)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.len(), 5);
        assert!(matches!(
            backend.stream_run(&thread, &assistant).await,
            Err(RemoteError::Cancelled)
        ));
        assert!(backend.stream_run(&thread, &assistant).await.is_err());
        assert_eq!(backend.call_count(), 3);
        assert_eq!(backend.threads_created(), 1);
    }

    #[tokio::test]
    async fn records_submissions_and_cancels() {
        let backend = MockBackend::new(vec![MockResponse::Stream(vec![completed("run_1")])])
            .with_cancel_error(RemoteError::NotFound("run_1".into()));
        let thread = ThreadId::from_raw("thread_1");
        let run = RunId::from_raw("run_1");
        let output = ToolOutput::new(ToolCallId::from_raw("call_1"), "[]");

        backend
            .submit_tool_outputs(&thread, &run, vec![output.clone()])
            .await
            .unwrap();
        assert_eq!(backend.submissions(), vec![(run.clone(), vec![output])]);

        assert!(backend.cancel_run(&thread, &run).await.is_err());
        assert_eq!(backend.cancellations(), vec![run]);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_response_waits() {
        let backend = MockBackend::new(vec![MockResponse::delayed(
            Duration::from_secs(3),
            MockResponse::Stream(vec![completed("run_1")]),
        )]);
        let start = tokio::time::Instant::now();
        let _ = backend
            .stream_run(&ThreadId::new(), &AssistantId::from_raw("a"))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn files_served_by_id() {
        let backend = MockBackend::new(Vec::new()).with_file("file_1", vec![1, 2]);
        assert_eq!(backend.file_content(&FileId::from_raw("file_1")).await.unwrap(), vec![1, 2]);
        assert!(matches!(
            backend.file_content(&FileId::from_raw("file_2")).await,
            Err(RemoteError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn batch_backend_echoes_custom_ids() {
        let backend = MockChatBatchBackend::new("SELECT 1").dropping("1");
        let rows = (0..3)
            .map(|i| ChatBatchRow {
                custom_id: i.to_string(),
                body: serde_json::json!({"messages": []}),
            })
            .collect();
        let responses = backend.run_batch(rows).await.unwrap();
        let ids: Vec<_> = responses.iter().map(|r| r.custom_id.as_str()).collect();
        assert_eq!(ids, ["0", "2"]);
        assert_eq!(backend.batch_sizes(), vec![3]);
        let completion = responses[0].clone().into_completion().unwrap();
        assert_eq!(completion.first_content(), Some("SELECT 1"));
    }
}
