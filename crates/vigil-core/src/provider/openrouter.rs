//! OpenRouter (OpenAI-compatible) chat client over reqwest: SSE streaming and single-shot completion.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use super::{ApiKey, ChatRequest, ClientFactory, ProviderClient, ProviderError, ProviderStream};

const REFERER: &str = "https://vigil.local";
const APP_TITLE: &str = "Vigil";

#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

impl ApiError {
    fn into_provider_error(self) -> ProviderError {
        let code = self.code.as_ref().and_then(|c| match c {
            serde_json::Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        });
        ProviderError::from_message(code, self.message)
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

/// One decoded SSE event.
#[derive(Debug, PartialEq)]
pub enum SseItem {
    Fragment(String),
    Done,
    Error(ProviderError),
}

/// Incremental decoder for `data: {...}` / `data: [DONE]` lines. Buffers raw bytes so multi-byte
/// characters split across network chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseItem> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let Some(data) = line.strip_prefix("data:") else { continue };
            let data = data.trim();
            if data == "[DONE]" {
                out.push(SseItem::Done);
                continue;
            }
            match serde_json::from_str::<StreamChunk>(data) {
                Ok(chunk) => {
                    if let Some(err) = chunk.error {
                        out.push(SseItem::Error(err.into_provider_error()));
                        continue;
                    }
                    let mut finished = false;
                    for choice in chunk.choices {
                        if let Some(content) = choice.delta.and_then(|d| d.content) {
                            if !content.is_empty() {
                                out.push(SseItem::Fragment(content));
                            }
                        }
                        finished |= choice.finish_reason.is_some();
                    }
                    if finished {
                        out.push(SseItem::Done);
                    }
                }
                Err(e) => {
                    tracing::warn!(target: "vigil::generation", error = %e, "Skipping unparseable SSE chunk");
                }
            }
        }
        out
    }
}

pub struct OpenRouterClient {
    http: reqwest::Client,
    api_url: String,
    api_key: ApiKey,
}

impl OpenRouterClient {
    fn post(&self, body: serde_json::Value) -> reqwest::RequestBuilder {
        self.http
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key.expose()))
            .header("HTTP-Referer", REFERER)
            .header("X-Title", APP_TITLE)
            .json(&body)
    }

    async fn send(&self, request: &ChatRequest, stream: bool) -> Result<reqwest::Response, ProviderError> {
        let mut body = serde_json::to_value(request).map_err(ProviderError::malformed)?;
        body["stream"] = serde_json::Value::Bool(stream);
        let response = self.post(body).send().await.map_err(ProviderError::transport)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ProviderError::from_status(status.as_u16(), text));
        }
        Ok(response)
    }
}

#[async_trait]
impl ProviderClient for OpenRouterClient {
    async fn stream_chat(&self, request: &ChatRequest) -> Result<ProviderStream, ProviderError> {
        let response = self.send(request, true).await?;
        tracing::debug!(target: "vigil::generation", model = %request.model, "SSE stream established");

        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut decoder = SseDecoder::default();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(ProviderError::transport(e));
                        return;
                    }
                };
                for item in decoder.push(&chunk) {
                    match item {
                        SseItem::Fragment(text) => yield Ok(text),
                        SseItem::Done => return,
                        SseItem::Error(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
            yield Err(ProviderError::incomplete());
        };
        Ok(Box::pin(stream))
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String, ProviderError> {
        let response = self.send(request, false).await?;
        let parsed: ChatResponse = response.json().await.map_err(ProviderError::malformed)?;
        if let Some(err) = parsed.error {
            return Err(err.into_provider_error());
        }
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::malformed("response contained no choices"))
    }
}

/// Builds [`OpenRouterClient`]s sharing one endpoint and timeout.
pub struct OpenRouterFactory {
    api_url: String,
    timeout: Duration,
}

impl OpenRouterFactory {
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> Self {
        Self { api_url: api_url.into(), timeout }
    }
}

impl ClientFactory for OpenRouterFactory {
    fn build(&self, key: &ApiKey) -> Result<Arc<dyn ProviderClient>, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(ProviderError::transport)?;
        Ok(Arc::new(OpenRouterClient { http, api_url: self.api_url.clone(), api_key: key.clone() }))
    }
}
