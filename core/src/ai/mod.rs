pub mod client;
pub mod hints;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub use client::{OpenAiCompatibleClient, ServiceConfig};
pub use retry::{complete_with_backoff, evaluate_retry, BackoffPolicy, RetryDecision};

/// Generation mode requested from the completion service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    Normal,
    /// Slower mode that returns an explicit reasoning trace before the answer.
    Reasoning,
}

impl GenerationMode {
    pub fn label(&self) -> &'static str {
        match self {
            GenerationMode::Normal => "normal",
            GenerationMode::Reasoning => "reasoning",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Completion {
    pub text: String,
    pub reasoning: Option<String>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            reasoning: None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompletionError {
    #[error("completion request timed out: {message}")]
    Timeout { message: String },
    #[error("completion service rate limit reached: {message}")]
    RateLimited {
        message: String,
        retry_hint: Option<Duration>,
    },
    #[error("completion service error{}: {message}", status_suffix(.status))]
    Permanent {
        status: Option<u16>,
        message: String,
    },
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|code| format!(" ({code})")).unwrap_or_default()
}

impl CompletionError {
    pub fn permanent(message: impl Into<String>) -> Self {
        CompletionError::Permanent {
            status: None,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CompletionError::Timeout { .. } | CompletionError::RateLimited { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CompletionError::Timeout { .. } => "timeout",
            CompletionError::RateLimited { .. } => "rate_limit",
            CompletionError::Permanent { .. } => "permanent",
        }
    }
}

/// Black-box `prompt + content -> text` boundary to the language model.
#[async_trait]
pub trait CompletionService: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(
        &self,
        prompt: &str,
        content: &str,
        mode: GenerationMode,
    ) -> Result<Completion, CompletionError>;
}
