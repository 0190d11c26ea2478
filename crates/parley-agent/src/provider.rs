use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::stream::StreamEvent;

/// A single role-tagged entry of a completion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// Request to a chat-completion provider.
///
/// Serializes directly into the OpenAI `/v1/chat/completions` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub temperature: f32,
    pub top_p: f32,
    /// End-user identifier forwarded for abuse monitoring.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: Vec::new(),
            max_tokens: None,
            temperature: 0.7,
            top_p: 1.0,
            user: None,
            stream: false,
        }
    }

    /// The leading system entry, if any.
    pub fn system_message(&self) -> Option<&str> {
        self.messages
            .first()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
    }
}

/// Token accounting reported by the API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Response from a provider (non-streaming, or assembled from a stream).
#[derive(Debug, Clone, PartialEq)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub usage: Usage,
    pub finish_reason: String,
}

impl ChatResponse {
    /// The model stopped because it ran out of completion tokens.
    pub fn truncated(&self) -> bool {
        self.finish_reason == "length"
    }
}

/// Common interface for chat-completion backends.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    /// Send a non-streaming chat request, wait for full response.
    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Stream response events through a channel.
    /// Default: falls back to non-streaming send, emits TextDelta + Done.
    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let resp = self.send(req).await?;
        let _ = tx.send(StreamEvent::TextDelta { text: resp.content }).await;
        let _ = tx
            .send(StreamEvent::Done {
                model: resp.model,
                usage: resp.usage,
                finish_reason: resp.finish_reason,
            })
            .await;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Request timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Prompt of ~{estimated} tokens exceeds the {limit}-token context window")]
    ContextOverflow { estimated: u32, limit: u32 },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Nothing to send: the request has no messages")]
    EmptyRequest,
}

impl ProviderError {
    /// Short error code string used in log fields.
    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::Http(_) => "HTTP_ERROR",
            ProviderError::Api { .. } => "API_ERROR",
            ProviderError::Parse(_) => "PARSE_ERROR",
            ProviderError::RateLimited { .. } => "RATE_LIMITED",
            ProviderError::Timeout { .. } => "TIMEOUT",
            ProviderError::ContextOverflow { .. } => "CONTEXT_OVERFLOW",
            ProviderError::Stream(_) => "STREAM_ERROR",
            ProviderError::EmptyRequest => "EMPTY_REQUEST",
        }
    }

    /// Reason suitable for posting into a Discord thread.
    pub fn user_reason(&self) -> String {
        match self {
            ProviderError::RateLimited { retry_after_ms } => format!(
                "The completion API is rate limiting requests. Try again in {}s.",
                retry_after_ms.div_ceil(1000)
            ),
            ProviderError::Timeout { secs } => {
                format!("The completion API did not answer within {secs}s.")
            }
            ProviderError::Api { status, message } => {
                format!("The completion API rejected the request ({status}): {}", api_detail(message))
            }
            other => other.to_string(),
        }
    }
}

/// Pull `error.message` out of an OpenAI error body, falling back to the raw text.
fn api_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(500).collect())
}
