use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde_json::json;
use tracing::{debug, instrument};

use insights_core::chat::{ChatCompletion, ChatMessage};
use insights_core::errors::RemoteError;
use insights_core::planner::QueryPlanner;

use crate::config::AzureConfig;

/// Asks a chat deployment to translate a question into SQL, guided by a
/// schema-describing system prompt.
pub struct AzureChatPlanner {
    client: Client,
    config: AzureConfig,
    deployment: String,
    system_prompt: String,
}

impl AzureChatPlanner {
    pub fn new(
        config: AzureConfig,
        deployment: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .build()
            .map_err(|e| RemoteError::NetworkError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            config,
            deployment: deployment.into(),
            system_prompt: system_prompt.into(),
        })
    }

    fn messages(&self, question: &str) -> Vec<ChatMessage> {
        vec![
            ChatMessage::system(self.system_prompt.clone()),
            ChatMessage::user(format!("{question}\nGive only the query in SQL format")),
        ]
    }
}

#[async_trait]
impl QueryPlanner for AzureChatPlanner {
    #[instrument(skip(self), fields(deployment = %self.deployment))]
    async fn plan_query(&self, question: &str) -> Result<String, RemoteError> {
        let url = format!(
            "{}/openai/deployments/{}/chat/completions",
            self.config.api_base, self.deployment
        );
        let resp = self
            .client
            .post(url)
            .query(&[("api-version", self.config.api_version.as_str())])
            .header("api-key", self.config.api_key.expose_secret())
            .json(&json!({ "messages": self.messages(question) }))
            .send()
            .await
            .map_err(|e| RemoteError::NetworkError(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(status, body));
        }

        let completion: ChatCompletion = resp
            .json()
            .await
            .map_err(|e| RemoteError::InvalidRequest(format!("malformed completion: {e}")))?;
        let query = extract_sql(completion.first_content().unwrap_or_default());
        debug!(query = %query, "planned query");
        Ok(query)
    }
}

/// Strip a markdown code fence if the model added one anyway.
pub fn extract_sql(content: &str) -> String {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    #[test]
    fn plain_sql_untouched() {
        assert_eq!(extract_sql("  SELECT 1  "), "SELECT 1");
    }

    #[test]
    fn fenced_sql_unwrapped() {
        assert_eq!(
            extract_sql("```sql\nSELECT Month FROM order_data\n```"),
            "SELECT Month FROM order_data"
        );
        assert_eq!(extract_sql("```\nSELECT 2\n```\n"), "SELECT 2");
    }

    #[test]
    fn user_message_asks_for_sql_only() {
        let config = AzureConfig {
            api_base: "https://x".into(),
            api_key: SecretString::from("k"),
            api_version: "v".into(),
            assistant_id: "asst".into(),
            analyst_chat_model: Some("gpt-4o".into()),
        };
        let planner = AzureChatPlanner::new(config, "gpt-4o", "schema").unwrap();
        let messages = planner.messages("top month");
        assert_eq!(messages[0].role, "system");
        assert_eq!(
            messages[1].content.as_deref(),
            Some("top month\nGive only the query in SQL format")
        );
    }
}
