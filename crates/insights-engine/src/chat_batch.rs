//! Chat-completion client that routes every request through a
//! [`BatchProcessor`], so concurrent callers share bulk batch jobs.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use insights_core::chat::{ChatBatchBackend, ChatBatchResponse, ChatBatchRow, ChatCompletion};
use insights_core::usage::UsageTotals;

use crate::batch::{BatchConfig, BatchProcessor, JobId};
use crate::error::EngineError;

pub struct BatchedChatClient {
    processor: BatchProcessor<Value, ChatBatchResponse>,
    usage: Mutex<UsageTotals>,
}

impl BatchedChatClient {
    /// Must be called inside a tokio runtime.
    pub fn new(backend: Arc<dyn ChatBatchBackend>, config: BatchConfig) -> Self {
        let executor = move |batch: Vec<(JobId, Value)>| {
            let backend = Arc::clone(&backend);
            async move { run_batch(backend, batch).await }
        };
        Self {
            processor: BatchProcessor::new(config, executor),
            usage: Mutex::new(UsageTotals::default()),
        }
    }

    /// Submit one chat-completion request body and wait for its row.
    pub async fn create(&self, request: Value) -> Result<ChatCompletion, EngineError> {
        let handle = self.processor.submit(request)?;
        let job = handle.id();
        let response = handle.await?;
        let completion = response.into_completion()?;
        debug!(job = %job, completion = %completion.id, "batched completion resolved");
        if let Some(usage) = &completion.usage {
            self.usage.lock().accumulate(usage);
        }
        Ok(completion)
    }

    /// Send whatever is pending now instead of waiting for the idle timeout.
    pub async fn flush(&self) {
        self.processor.flush().await;
    }

    pub async fn stop(&self) {
        self.processor.stop().await;
    }

    /// Usage summed over every completion returned so far.
    pub fn usage(&self) -> UsageTotals {
        self.usage.lock().clone()
    }
}

/// Tag each request with its job id as `custom_id`, run the batch, and map
/// response rows back by that id.
async fn run_batch(
    backend: Arc<dyn ChatBatchBackend>,
    batch: Vec<(JobId, Value)>,
) -> anyhow::Result<Vec<(JobId, ChatBatchResponse)>> {
    info!(jobs = batch.len(), "processing chat batch");
    let rows: Vec<ChatBatchRow> = batch
        .into_iter()
        .map(|(id, body)| ChatBatchRow {
            custom_id: id.to_string(),
            body,
        })
        .collect();

    let responses = backend.run_batch(rows).await?;
    Ok(responses
        .into_iter()
        .filter_map(|row| match row.custom_id.parse::<u64>() {
            Ok(id) => Some((JobId::new(id), row)),
            Err(_) => {
                warn!(custom_id = %row.custom_id, "response row with unrecognised custom_id");
                None
            }
        })
        .collect())
}
