use std::{sync::Arc, time::Duration};

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::{debug, warn};

use crate::error::AppError;

/// One chat turn. `role` is `system`, `user` or `assistant`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub response: String,
    pub metadata: Value,
}

/// Narrow inference contract. Production uses the OpenAI-compatible client;
/// tests substitute scripted implementations.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn infer(&self, messages: &[ChatMessage]) -> Result<LlmResponse, AppError>;

    /// Label used in persisted file names, sanitized to `[a-z0-9_]`.
    fn label(&self) -> String;
}

/// Bounded exponential backoff with jitter for transient external failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 250,
            max_delay_ms: 4_000,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    fn strategy(&self) -> impl Iterator<Item = Duration> {
        // from_millis(2) doubles per attempt; the factor rescales the series
        // to base_delay_ms, 2*base_delay_ms, ...
        ExponentialBackoff::from_millis(2)
            .factor(self.base_delay_ms / 2)
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .map(jitter)
            .take(self.max_attempts.saturating_sub(1))
    }
}

/// Chat-completions client over any OpenAI-compatible endpoint.
pub struct OpenAiChat {
    client: Arc<Client<OpenAIConfig>>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    retry: RetryPolicy,
}

impl OpenAiChat {
    pub fn new(
        client: Arc<Client<OpenAIConfig>>,
        model: String,
        temperature: f32,
        max_tokens: u32,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            model,
            temperature,
            max_tokens,
            retry,
        }
    }

    async fn infer_once(&self, messages: &[ChatMessage]) -> Result<LlmResponse, AppError> {
        let request_messages = messages
            .iter()
            .map(to_request_message)
            .collect::<Result<Vec<_>, _>>()?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .temperature(self.temperature)
            .max_tokens(self.max_tokens)
            .messages(request_messages)
            .build()?;

        let response = self.client.chat().create(request).await?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| AppError::LLMParsing("no content in chat completion".into()))?;

        let metadata = json!({
            "model": response.model,
            "finish_reason": response
                .choices
                .first()
                .and_then(|choice| choice.finish_reason.as_ref())
                .map(|reason| format!("{reason:?}")),
            "usage": response.usage.map(|usage| json!({
                "prompt_tokens": usage.prompt_tokens,
                "completion_tokens": usage.completion_tokens,
            })),
        });

        Ok(LlmResponse {
            response: content,
            metadata,
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAiChat {
    async fn infer(&self, messages: &[ChatMessage]) -> Result<LlmResponse, AppError> {
        let mut attempt = 0usize;
        Retry::spawn(self.retry.strategy(), || {
            attempt += 1;
            if attempt > 1 {
                warn!(attempt, model = %self.model, "retrying chat completion");
            }
            self.infer_once(messages)
        })
        .await
        .map(|response| {
            debug!(model = %self.model, chars = response.response.len(), "chat completion ok");
            response
        })
    }

    fn label(&self) -> String {
        sanitize_label(&self.model)
    }
}

/// Maps a role-tagged turn onto the API's typed message variants.
fn to_request_message(message: &ChatMessage) -> Result<ChatCompletionRequestMessage, AppError> {
    let content = message.content.clone();
    match message.role.as_str() {
        "system" => Ok(ChatCompletionRequestSystemMessage::from(content).into()),
        "user" => Ok(ChatCompletionRequestUserMessage::from(content).into()),
        "assistant" => Ok(ChatCompletionRequestAssistantMessageArgs::default()
            .content(content)
            .build()?
            .into()),
        other => Err(AppError::Validation(format!("unknown chat role '{other}'"))),
    }
}

/// File-name-safe label: lowercase alphanumerics, everything else `_`.
pub fn sanitize_label(code: &str) -> String {
    code.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}
