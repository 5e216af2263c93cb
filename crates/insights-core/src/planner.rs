use async_trait::async_trait;

use crate::errors::RemoteError;

/// Turns a natural-language question into a single SQL query.
#[async_trait]
pub trait QueryPlanner: Send + Sync {
    async fn plan_query(&self, question: &str) -> Result<String, RemoteError>;
}
