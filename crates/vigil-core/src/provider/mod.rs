//! Model provider seam: client traits, request types and error classification.
//!
//! A `ProviderClient` talks to one credential of an OpenAI-compatible chat endpoint. `ClientFactory`
//! builds clients for the key pool; the pool memoizes them per credential.

mod key_pool;
mod openrouter;

pub use key_pool::{KeyCursor, KeyPool, KeyPoolError};
pub use openrouter::{OpenRouterClient, OpenRouterFactory, SseDecoder, SseItem};

use async_trait::async_trait;
use futures_util::Stream;
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;

use crate::shared::Message;

/// Provider credential. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// One entry of the prompt sent to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

impl From<&Message> for ChatMessage {
    fn from(m: &Message) -> Self {
        Self { role: m.role.as_str().to_string(), content: m.content.clone() }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Fragments of one streamed completion. Ends with `Ok` items only if the provider signalled completion;
/// a truncated stream ends with an `Incomplete` error.
pub type ProviderStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn stream_chat(&self, request: &ChatRequest) -> Result<ProviderStream, ProviderError>;

    async fn complete(&self, request: &ChatRequest) -> Result<String, ProviderError>;
}

/// Builds a client bound to one credential. Construction must be idempotent.
pub trait ClientFactory: Send + Sync {
    fn build(&self, key: &ApiKey) -> Result<Arc<dyn ProviderClient>, ProviderError>;
}

// -----------------------------------------------------------------------------
// Error classification
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    RateLimited,
    QuotaExceeded,
    ResourceExhausted,
    Unavailable,
    Overloaded,
    Unauthorized,
    BadRequest,
    Transport,
    Malformed,
    Incomplete,
    Other,
}

impl ProviderErrorKind {
    /// Quota and capacity errors are retried on another credential; everything else is fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderErrorKind::RateLimited
                | ProviderErrorKind::QuotaExceeded
                | ProviderErrorKind::ResourceExhausted
                | ProviderErrorKind::Unavailable
                | ProviderErrorKind::Overloaded
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderErrorKind::RateLimited => "rate_limited",
            ProviderErrorKind::QuotaExceeded => "quota_exceeded",
            ProviderErrorKind::ResourceExhausted => "resource_exhausted",
            ProviderErrorKind::Unavailable => "unavailable",
            ProviderErrorKind::Overloaded => "overloaded",
            ProviderErrorKind::Unauthorized => "unauthorized",
            ProviderErrorKind::BadRequest => "bad_request",
            ProviderErrorKind::Transport => "transport",
            ProviderErrorKind::Malformed => "malformed",
            ProviderErrorKind::Incomplete => "incomplete",
            ProviderErrorKind::Other => "other",
        }
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("provider error [{kind}{}]: {message}", .status.map(|s| format!(", HTTP {}", s)).unwrap_or_default())]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self { kind, status: None, message: message.into() }
    }

    /// Classifies a non-success HTTP response from its status code and body.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        Self { kind: classify(Some(status), &body), status: Some(status), message: body }
    }

    /// Classifies an error reported inside an otherwise successful response (e.g. an SSE error payload).
    pub fn from_message(code: Option<u16>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self { kind: classify(code, &message), status: code, message }
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::new(ProviderErrorKind::Transport, err.to_string())
    }

    pub fn malformed(err: impl std::fmt::Display) -> Self {
        Self::new(ProviderErrorKind::Malformed, err.to_string())
    }

    pub fn incomplete() -> Self {
        Self::new(ProviderErrorKind::Incomplete, "stream ended before the provider signalled completion")
    }

    #[inline]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Status code wins when it is conclusive; otherwise the provider's error text decides.
pub fn classify(status: Option<u16>, text: &str) -> ProviderErrorKind {
    let lower = text.to_ascii_lowercase();
    match status {
        Some(401) | Some(403) => return ProviderErrorKind::Unauthorized,
        Some(429) => {
            return if lower.contains("resource_exhausted") {
                ProviderErrorKind::ResourceExhausted
            } else if lower.contains("quota") {
                ProviderErrorKind::QuotaExceeded
            } else {
                ProviderErrorKind::RateLimited
            };
        }
        Some(502) | Some(503) | Some(504) => return ProviderErrorKind::Unavailable,
        Some(529) => return ProviderErrorKind::Overloaded,
        _ => {}
    }

    if lower.contains("resource_exhausted") || lower.contains("resource exhausted") {
        ProviderErrorKind::ResourceExhausted
    } else if lower.contains("quota") {
        ProviderErrorKind::QuotaExceeded
    } else if lower.contains("rate limit") || lower.contains("rate_limit") || lower.contains("too many requests") {
        ProviderErrorKind::RateLimited
    } else if lower.contains("overloaded") {
        ProviderErrorKind::Overloaded
    } else if lower.contains("unavailable") {
        ProviderErrorKind::Unavailable
    } else {
        match status {
            Some(400) | Some(404) | Some(413) | Some(422) => ProviderErrorKind::BadRequest,
            _ => ProviderErrorKind::Other,
        }
    }
}
