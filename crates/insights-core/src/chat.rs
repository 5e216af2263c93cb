//! Chat-completion shapes used by the planner and by bulk (batched) requests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::RemoteError;
use crate::usage::RunUsage;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: Some(content.into()),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: Some(content.into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatChoice {
    #[serde(default)]
    pub index: u32,
    pub message: ChatMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Parsed chat-completion response body. Unknown fields are ignored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Option<RunUsage>,
}

impl ChatCompletion {
    /// Content of the first choice, if any.
    pub fn first_content(&self) -> Option<&str> {
        self.choices.first()?.message.content.as_deref()
    }
}

/// One request row of a batch: the request body tagged with a `custom_id`
/// that the backend echoes back on the matching response row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatBatchRow {
    pub custom_id: String,
    pub body: serde_json::Value,
}

/// One response row of a batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatBatchResponse {
    pub custom_id: String,
    #[serde(default = "default_status")]
    pub status_code: u16,
    pub body: serde_json::Value,
}

fn default_status() -> u16 {
    200
}

impl ChatBatchResponse {
    pub fn into_completion(self) -> Result<ChatCompletion, RemoteError> {
        if !(200..300).contains(&self.status_code) {
            return Err(RemoteError::from_status(
                self.status_code,
                self.body.to_string(),
            ));
        }
        serde_json::from_value(self.body)
            .map_err(|e| RemoteError::InvalidRequest(format!("malformed completion: {e}")))
    }
}

/// Executes many chat-completion requests as a single bulk job.
/// Response rows may come back in any order; rows may be missing.
#[async_trait]
pub trait ChatBatchBackend: Send + Sync {
    async fn run_batch(&self, rows: Vec<ChatBatchRow>) -> Result<Vec<ChatBatchResponse>, RemoteError>;
}
