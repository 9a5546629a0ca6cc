use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::hints::parse_retry_after_header;
use super::{Completion, CompletionError, CompletionService, GenerationMode};

/// Connection settings for an OpenAI-compatible chat completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub base_url: String,
    pub model: String,
    pub reasoning_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
    /// Environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepseek.com".into(),
            model: "deepseek-chat".into(),
            reasoning_model: "deepseek-reasoner".into(),
            temperature: 0.5,
            max_tokens: 4000,
            request_timeout_secs: 120,
            api_key_env: "DEEPSEEK_API_KEY".into(),
        }
    }
}

pub struct OpenAiCompatibleClient {
    http: Client,
    config: ServiceConfig,
    api_key: String,
}

impl OpenAiCompatibleClient {
    pub fn new(config: ServiceConfig, api_key: impl Into<String>) -> Result<Self, CompletionError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .map_err(|err| CompletionError::permanent(format!("failed to build http client: {err}")))?;
        Ok(Self {
            http,
            config,
            api_key: api_key.into(),
        })
    }

    /// Reads the API key from the environment variable named in the config.
    pub fn from_env(config: ServiceConfig) -> Result<Self, CompletionError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            CompletionError::permanent(format!("{} is not set", config.api_key_env))
        })?;
        Self::new(config, api_key)
    }

    fn model_for(&self, mode: GenerationMode) -> &str {
        match mode {
            GenerationMode::Normal => &self.config.model,
            GenerationMode::Reasoning => &self.config.reasoning_model,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[async_trait]
impl CompletionService for OpenAiCompatibleClient {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn complete(
        &self,
        prompt: &str,
        content: &str,
        mode: GenerationMode,
    ) -> Result<Completion, CompletionError> {
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": self.model_for(mode),
                "messages": [
                    { "role": "system", "content": prompt },
                    { "role": "user", "content": content }
                ],
                "temperature": self.config.temperature,
                "max_tokens": self.config.max_tokens
            }))
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_hint = parse_retry_after_header(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, body, retry_hint));
        }

        let parsed = response
            .json::<ChatResponse>()
            .await
            .map_err(|err| CompletionError::permanent(format!("invalid response body: {err}")))?;
        let message = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| CompletionError::permanent("response contains no choices"))?;

        Ok(Completion {
            text: message.content.unwrap_or_default().trim().to_string(),
            reasoning: message
                .reasoning_content
                .filter(|reasoning| !reasoning.trim().is_empty()),
        })
    }
}

fn map_transport_error(err: reqwest::Error) -> CompletionError {
    if err.is_timeout() {
        CompletionError::Timeout {
            message: err.to_string(),
        }
    } else {
        CompletionError::permanent(err.to_string())
    }
}

fn map_status(status: StatusCode, body: String, retry_hint: Option<Duration>) -> CompletionError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => CompletionError::RateLimited {
            message: body,
            retry_hint,
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            CompletionError::Timeout { message: body }
        }
        _ => CompletionError::Permanent {
            status: Some(status.as_u16()),
            message: body,
        },
    }
}
