use secrecy::SecretString;

pub const ENV_API_BASE: &str = "OPENAI_API_BASE";
pub const ENV_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_API_VERSION: &str = "OPENAI_API_VERSION";
pub const ENV_ASSISTANT_ID: &str = "OPENAI_ASSISTANT_ID";
pub const ENV_ANALYST_CHAT_MODEL: &str = "OPENAI_ANALYST_CHAT_MODEL";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing environment variables: {}", .0.join(", "))]
    MissingEnv(Vec<String>),
}

/// Connection settings for an Azure OpenAI resource.
#[derive(Clone, Debug)]
pub struct AzureConfig {
    /// Resource endpoint, e.g. `https://my-resource.openai.azure.com`.
    pub api_base: String,
    pub api_key: SecretString,
    pub api_version: String,
    pub assistant_id: String,
    /// Deployment used by the SQL planner. Only required when the sales
    /// data tool is registered.
    pub analyst_chat_model: Option<String>,
}

impl AzureConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Every missing required key is reported.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let required = [ENV_API_BASE, ENV_API_KEY, ENV_API_VERSION, ENV_ASSISTANT_ID];
        let missing: Vec<String> = required
            .iter()
            .filter(|key| get(**key).is_none())
            .map(|key| key.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::MissingEnv(missing));
        }

        let value = |key: &str| get(key).unwrap_or_default();
        Ok(Self {
            api_base: value(ENV_API_BASE).trim_end_matches('/').to_string(),
            api_key: SecretString::from(value(ENV_API_KEY)),
            api_version: value(ENV_API_VERSION),
            assistant_id: value(ENV_ASSISTANT_ID),
            analyst_chat_model: get(ENV_ANALYST_CHAT_MODEL),
        })
    }
}
