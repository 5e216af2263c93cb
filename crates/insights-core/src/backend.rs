use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::errors::RemoteError;
use crate::events::{RunEvent, RunSnapshot};
use crate::ids::{AssistantId, FileId, RunId, ThreadId};
use crate::tools::ToolOutput;

/// Events of one streamed run segment. Ends when the service closes the
/// stream (after a `requires_action` or terminal status) or on `Error`.
pub type RunEventStream = Pin<Box<dyn Stream<Item = RunEvent> + Send>>;

/// The remote assistant service: threads hold the conversation, runs execute
/// the assistant against a thread and stream their progress.
#[async_trait]
pub trait AssistantBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn create_thread(&self) -> Result<ThreadId, RemoteError>;

    /// Confirm a thread still exists and return its canonical id.
    async fn retrieve_thread(&self, thread_id: &ThreadId) -> Result<ThreadId, RemoteError>;

    async fn add_user_message(
        &self,
        thread_id: &ThreadId,
        content: &str,
    ) -> Result<(), RemoteError>;

    async fn stream_run(
        &self,
        thread_id: &ThreadId,
        assistant_id: &AssistantId,
    ) -> Result<RunEventStream, RemoteError>;

    async fn submit_tool_outputs(
        &self,
        thread_id: &ThreadId,
        run_id: &RunId,
        outputs: Vec<ToolOutput>,
    ) -> Result<RunEventStream, RemoteError>;

    async fn cancel_run(
        &self,
        thread_id: &ThreadId,
        run_id: &RunId,
    ) -> Result<RunSnapshot, RemoteError>;

    async fn file_content(&self, file_id: &FileId) -> Result<Vec<u8>, RemoteError>;
}
