//! Generation client: provider calls wrapped in per-call key rotation and bounded full-cycle backoff.
//!
//! Every call starts on the first credential. A retryable error rotates to the next credential at once;
//! when the pool is exhausted the call waits `backoff` and starts a new cycle, up to `max_full_cycles`.
//! So one call makes at most `max_full_cycles × pool_size` provider attempts.

use futures_util::{Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DEFAULT_TITLE_FALLBACK;
use crate::provider::{ChatMessage, ChatRequest, KeyPool, ProviderClient, ProviderError, ProviderStream};

const TITLE_SYSTEM_PROMPT: &str = "You write short chat titles. Reply with a title of at most six words. \
No quotes, no trailing punctuation, nothing else.";
const TITLE_INPUT_CHARS: usize = 500;
const TITLE_MAX_CHARS: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_full_cycles: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_full_cycles: 3, backoff: Duration::from_secs(5) }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("provider exhausted after {attempts} attempts")]
    ProviderExhausted { attempts: u32 },
    #[error("fatal provider error: {0}")]
    Fatal(ProviderError),
    /// The stream failed after fragments had already been delivered; it is not retried.
    #[error("generation interrupted: {0}")]
    Interrupted(ProviderError),
}

impl GenerationError {
    /// Text safe to show an end user.
    pub fn user_message(&self) -> &'static str {
        match self {
            GenerationError::ProviderExhausted { .. } => {
                "The assistant is busy right now. Please try again later."
            }
            GenerationError::Fatal(_) => "Something went wrong while generating a response.",
            GenerationError::Interrupted(_) => "The response was interrupted. Please try again.",
        }
    }
}

/// Lazy fragment stream for one chat turn. Nothing is sent to the provider until it is first polled;
/// dropping it closes the provider connection.
pub type GenerationStream = Pin<Box<dyn Stream<Item = Result<String, GenerationError>> + Send>>;

#[derive(Clone)]
pub struct GenerationClient {
    pool: Arc<KeyPool>,
    policy: RetryPolicy,
    model: String,
    title_model: Option<String>,
    title_fallback: String,
}

impl GenerationClient {
    pub fn new(pool: Arc<KeyPool>, policy: RetryPolicy, model: impl Into<String>) -> Self {
        Self {
            pool,
            policy,
            model: model.into(),
            title_model: None,
            title_fallback: DEFAULT_TITLE_FALLBACK.to_string(),
        }
    }

    pub fn with_title_model(mut self, model: Option<String>) -> Self {
        self.title_model = model;
        self
    }

    pub fn with_title_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.title_fallback = fallback.into();
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Streams one assistant turn. Rotation and backoff only apply until the first fragment arrives;
    /// after that a provider failure ends the stream with [`GenerationError::Interrupted`].
    pub fn generate_stream(&self, history: &[ChatMessage], system_prompt: &str) -> GenerationStream {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if !system_prompt.trim().is_empty() {
            messages.push(ChatMessage::system(system_prompt));
        }
        messages.extend(history.iter().cloned());
        let request = ChatRequest { model: self.model.clone(), messages, temperature: Some(0.7), max_tokens: None };
        let this = self.clone();

        Box::pin(async_stream::stream! {
            let opened = this
                .with_rotation("stream", |client| {
                    let request = request.clone();
                    async move { open_stream(client, request).await }
                })
                .await;
            let (first, mut rest) = match opened {
                Ok(parts) => parts,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            if let Some(first) = first {
                yield Ok(first);
            }
            while let Some(item) = rest.next().await {
                match item {
                    Ok(fragment) => yield Ok(fragment),
                    Err(e) => {
                        tracing::error!(target: "vigil::generation", error = %e, "Stream interrupted after first fragment");
                        yield Err(GenerationError::Interrupted(e));
                        return;
                    }
                }
            }
        })
    }

    /// Single-shot completion; returns the trimmed text.
    pub async fn complete(&self, system_prompt: &str, prompt: &str) -> Result<String, GenerationError> {
        self.complete_with_model(&self.model, system_prompt, prompt).await
    }

    /// Short title for a chat. Never fails: any error (including provider exhaustion) yields the fallback.
    pub async fn generate_title(&self, first_message: &str) -> String {
        let input: String = first_message.chars().take(TITLE_INPUT_CHARS).collect();
        let model = self.title_model.clone().unwrap_or_else(|| self.model.clone());
        match self.complete_with_model(&model, TITLE_SYSTEM_PROMPT, &input).await {
            Ok(raw) => clean_title(&raw).unwrap_or_else(|| self.title_fallback.clone()),
            Err(e) => {
                tracing::warn!(target: "vigil::generation", error = %e, "Title generation failed; using fallback");
                self.title_fallback.clone()
            }
        }
    }

    async fn complete_with_model(&self, model: &str, system_prompt: &str, prompt: &str) -> Result<String, GenerationError> {
        let request = ChatRequest {
            model: model.to_string(),
            messages: vec![ChatMessage::system(system_prompt), ChatMessage::user(prompt)],
            temperature: Some(0.2),
            max_tokens: None,
        };
        let text = self
            .with_rotation("complete", |client| {
                let request = request.clone();
                async move { client.complete(&request).await }
            })
            .await?;
        Ok(text.trim().to_string())
    }

    /// Runs `attempt` against the pool with a fresh cursor. Fatal errors return immediately.
    async fn with_rotation<T, F, Fut>(&self, op: &'static str, mut attempt: F) -> Result<T, GenerationError>
    where
        F: FnMut(Arc<dyn ProviderClient>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut cursor = self.pool.cursor();
        let mut cycle: u32 = 0;
        let mut attempts: u32 = 0;
        loop {
            let client = cursor.current_client().map_err(GenerationError::Fatal)?;
            attempts += 1;
            match attempt(client).await {
                Ok(value) => {
                    if attempts > 1 {
                        tracing::info!(target: "vigil::generation", op, attempts, key_index = cursor.index(), "Provider call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => {
                    tracing::error!(target: "vigil::generation", op, key_index = cursor.index(), error = %e, "Fatal provider error");
                    return Err(GenerationError::Fatal(e));
                }
                Err(e) => {
                    tracing::warn!(target: "vigil::generation", op, key_index = cursor.index(), cycle, kind = %e.kind, "Retryable provider error");
                    if cursor.rotate() {
                        continue;
                    }
                    cycle += 1;
                    if cycle >= self.policy.max_full_cycles {
                        tracing::error!(target: "vigil::generation", op, attempts, cycles = cycle, "Provider exhausted");
                        return Err(GenerationError::ProviderExhausted { attempts });
                    }
                    tracing::warn!(
                        target: "vigil::generation",
                        op,
                        cycle,
                        backoff_secs = self.policy.backoff.as_secs(),
                        "All provider keys exhausted; backing off before next cycle"
                    );
                    tokio::time::sleep(self.policy.backoff).await;
                    cursor.reset();
                }
            }
        }
    }
}

/// Opens a stream and waits for its first item, so errors the provider reports as the first SSE event
/// are still eligible for rotation.
async fn open_stream(
    client: Arc<dyn ProviderClient>,
    request: ChatRequest,
) -> Result<(Option<String>, ProviderStream), ProviderError> {
    let mut stream = client.stream_chat(&request).await?;
    match stream.next().await {
        Some(Ok(first)) => Ok((Some(first), stream)),
        Some(Err(e)) => Err(e),
        None => Ok((None, stream)),
    }
}

fn clean_title(raw: &str) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = line.trim_matches(|c: char| c == '"' || c == '\'' || c == '*' || c == '#' || c.is_whitespace());
    let line = line.strip_prefix("Title:").map(str::trim).unwrap_or(line);
    let line = line.trim_end_matches(|c: char| matches!(c, '.' | '!' | '?' | ':' | ';' | ','));
    if line.is_empty() {
        return None;
    }
    Some(line.chars().take(TITLE_MAX_CHARS).collect::<String>().trim_end().to_string())
}
