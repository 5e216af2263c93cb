use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Future, Stream};
use reqwest::{Client, RequestBuilder};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;

use insights_core::backend::{AssistantBackend, RunEventStream};
use insights_core::errors::RemoteError;
use insights_core::events::{RunEvent, RunSnapshot};
use insights_core::ids::{AssistantId, FileId, RunId, ThreadId};
use insights_core::tools::ToolOutput;

use crate::config::AzureConfig;
use crate::sse::{self, AssistantSseParser, RunPayload};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Assistants v2 REST API on an Azure OpenAI resource.
pub struct AzureAssistantsBackend {
    client: Client,
    config: AzureConfig,
    idle_timeout: Duration,
}

impl AzureAssistantsBackend {
    pub fn new(config: AzureConfig) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| RemoteError::NetworkError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            config,
            idle_timeout: SSE_IDLE_TIMEOUT,
        })
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/openai/{}", self.config.api_base, path.trim_start_matches('/'))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.url(path))
            .query(&[("api-version", self.config.api_version.as_str())])
            .header("api-key", self.config.api_key.expose_secret())
            .header("OpenAI-Beta", "assistants=v2")
    }

    async fn send(&self, req: RequestBuilder) -> Result<reqwest::Response, RemoteError> {
        let resp = req
            .send()
            .await
            .map_err(|e| RemoteError::NetworkError(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(status, body));
        }
        Ok(resp)
    }

    async fn send_json<T: for<'de> Deserialize<'de>>(
        &self,
        req: RequestBuilder,
    ) -> Result<T, RemoteError> {
        let resp = self.send(req).await?;
        resp.json::<T>()
            .await
            .map_err(|e| RemoteError::InvalidRequest(format!("malformed response: {e}")))
    }

    async fn send_stream(&self, req: RequestBuilder) -> Result<RunEventStream, RemoteError> {
        let resp = self
            .send(req.header("accept", "text/event-stream"))
            .await?;
        Ok(Box::pin(SseStream::with_idle_timeout(
            resp.bytes_stream(),
            self.idle_timeout,
        )))
    }
}

#[derive(Deserialize)]
struct IdPayload {
    id: String,
}

#[async_trait]
impl AssistantBackend for AzureAssistantsBackend {
    fn name(&self) -> &str {
        "azure-assistants"
    }

    #[instrument(skip(self))]
    async fn create_thread(&self) -> Result<ThreadId, RemoteError> {
        let req = self.request(reqwest::Method::POST, "threads").json(&json!({}));
        let thread: IdPayload = self.send_json(req).await?;
        Ok(ThreadId::from_raw(thread.id))
    }

    #[instrument(skip(self), fields(thread_id = %thread_id))]
    async fn retrieve_thread(&self, thread_id: &ThreadId) -> Result<ThreadId, RemoteError> {
        let req = self.request(reqwest::Method::GET, &format!("threads/{thread_id}"));
        let thread: IdPayload = self.send_json(req).await?;
        Ok(ThreadId::from_raw(thread.id))
    }

    #[instrument(skip(self, content), fields(thread_id = %thread_id))]
    async fn add_user_message(&self, thread_id: &ThreadId, content: &str) -> Result<(), RemoteError> {
        let req = self
            .request(reqwest::Method::POST, &format!("threads/{thread_id}/messages"))
            .json(&json!({ "role": "user", "content": content }));
        let _: IdPayload = self.send_json(req).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(thread_id = %thread_id))]
    async fn stream_run(
        &self,
        thread_id: &ThreadId,
        assistant_id: &AssistantId,
    ) -> Result<RunEventStream, RemoteError> {
        let req = self
            .request(reqwest::Method::POST, &format!("threads/{thread_id}/runs"))
            .json(&json!({ "assistant_id": assistant_id.as_str(), "stream": true }));
        self.send_stream(req).await
    }

    #[instrument(skip(self, outputs), fields(thread_id = %thread_id, run_id = %run_id, count = outputs.len()))]
    async fn submit_tool_outputs(
        &self,
        thread_id: &ThreadId,
        run_id: &RunId,
        outputs: Vec<ToolOutput>,
    ) -> Result<RunEventStream, RemoteError> {
        let req = self
            .request(
                reqwest::Method::POST,
                &format!("threads/{thread_id}/runs/{run_id}/submit_tool_outputs"),
            )
            .json(&json!({ "tool_outputs": outputs, "stream": true }));
        self.send_stream(req).await
    }

    #[instrument(skip(self), fields(thread_id = %thread_id, run_id = %run_id))]
    async fn cancel_run(&self, thread_id: &ThreadId, run_id: &RunId) -> Result<RunSnapshot, RemoteError> {
        let req = self.request(
            reqwest::Method::POST,
            &format!("threads/{thread_id}/runs/{run_id}/cancel"),
        );
        let run: RunPayload = self.send_json(req).await?;
        Ok(run.into_snapshot())
    }

    #[instrument(skip(self), fields(file_id = %file_id))]
    async fn file_content(&self, file_id: &FileId) -> Result<Vec<u8>, RemoteError> {
        let req = self.request(reqwest::Method::GET, &format!("files/{file_id}/content"));
        let resp = self.send(req).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| RemoteError::StreamInterrupted(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Wraps a byte stream from reqwest and yields RunEvents.
/// Includes an idle timeout: if no data arrives within `idle_duration`, emits an error.
pub(crate) struct SseStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    parser: AssistantSseParser,
    /// Raw bytes of the event still being received. Decoded only once the
    /// event is complete, so a character split across chunks stays intact.
    buffer: Vec<u8>,
    pending: std::collections::VecDeque<RunEvent>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    finished: bool,
}

impl SseStream {
    pub(crate) fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            parser: AssistantSseParser::new(),
            buffer: Vec::new(),
            pending: std::collections::VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            finished: false,
        }
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        // SSE allows CRLF line endings. CR never occurs inside a multi-byte
        // UTF-8 sequence, so dropping it before decoding is safe.
        self.buffer.extend(bytes.iter().copied().filter(|&b| b != b'\r'));
        self.drain_buffer();
    }

    fn drain_buffer(&mut self) {
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let chunk: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            self.parse_chunk(&chunk);
        }
    }

    fn parse_chunk(&mut self, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        for (event_type, data) in sse::parse_sse_lines(&text) {
            let events = self.parser.parse_event(&event_type, &data);
            self.pending.extend(events);
        }
    }
}

impl Stream for SseStream {
    type Item = RunEvent;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;

        if let Some(event) = self.pending.pop_front() {
            return Poll::Ready(Some(event));
        }
        if self.finished {
            return Poll::Ready(None);
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    // Data received, reset idle timer
                    let new_deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(new_deadline);

                    self.push_bytes(&bytes);

                    if let Some(event) = self.pending.pop_front() {
                        return Poll::Ready(Some(event));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    return Poll::Ready(Some(RunEvent::Error {
                        error: RemoteError::StreamInterrupted(e.to_string()),
                    }));
                }
                Poll::Ready(None) => {
                    self.finished = true;
                    if !self.buffer.is_empty() {
                        let remaining = std::mem::take(&mut self.buffer);
                        self.parse_chunk(&remaining);
                    }
                    return Poll::Ready(self.pending.pop_front());
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.finished = true;
                        return Poll::Ready(Some(RunEvent::Error {
                            error: RemoteError::StreamInterrupted(format!(
                                "idle timeout after {}s",
                                self.idle_duration.as_secs()
                            )),
                        }));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}
