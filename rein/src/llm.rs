//! LLM transport capability and an OpenAI-compatible streaming implementation.

use std::pin::Pin;

use eventsource_stream::{EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use serde_json::{Value, json};

use crate::context::ChatMessage;
use crate::provider::Provider;

/// Text deltas of one streamed completion.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// Transport failures, classified from status codes and provider payloads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LlmError {
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited: {0}")]
    RateLimit(String),
    #[error("context length exceeded: {0}")]
    ContextLength(String),
    #[error("model error: {0}")]
    Model(String),
    #[error("quota exceeded: {0}")]
    Quota(String),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("LLM error: {0}")]
    Unknown(String),
}

impl LlmError {
    /// Map an HTTP status (if any) and error text onto the taxonomy.
    pub fn classify(status: Option<u16>, body: &str) -> Self {
        let lower = body.to_lowercase();
        let msg = match status {
            Some(code) => format!("HTTP {code}: {}", body.trim()),
            None => body.trim().to_string(),
        };
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if status == Some(413)
            || has(&[
                "context length",
                "context_length",
                "maximum context",
                "too many tokens",
                "context window",
            ])
        {
            LlmError::ContextLength(msg)
        } else if status == Some(429) || has(&["rate limit", "rate_limit", "too many requests"]) {
            LlmError::RateLimit(msg)
        } else if status == Some(402) || has(&["quota", "insufficient", "credits"]) {
            LlmError::Quota(msg)
        } else if status == Some(404) || (lower.contains("model") && has(&["not found", "invalid", "does not exist"])) {
            LlmError::Model(msg)
        } else if status.is_some_and(|s| (500..600).contains(&s))
            || has(&[
                "connection reset",
                "connection refused",
                "timed out",
                "timeout",
                "overloaded",
                "temporarily",
            ])
        {
            LlmError::Network(msg)
        } else {
            LlmError::Unknown(msg)
        }
    }

    /// Network and rate-limit failures are worth a fixed-delay retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::Network(_) | LlmError::RateLimit(_))
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        let text = error_chain(&e);
        // A body error is the connection failing mid-response.
        if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
            LlmError::Network(text)
        } else if e.is_decode() {
            match LlmError::classify(None, &text) {
                err @ LlmError::Network(_) => err,
                _ => LlmError::Stream(text),
            }
        } else {
            LlmError::classify(e.status().map(|s| s.as_u16()), &text)
        }
    }
}

/// `reqwest` hides the io cause (reset, broken pipe) in its source chain.
fn error_chain(e: &dyn std::error::Error) -> String {
    let mut text = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

/// What the core needs from a model provider.
#[async_trait::async_trait]
pub trait LlmTransport: Send + Sync {
    /// One complete, non-streamed reply.
    async fn send_message(&self, model: &str, messages: &[ChatMessage])
    -> Result<String, LlmError>;

    /// A stream of text deltas. Errors may arrive mid-stream.
    async fn stream_message(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<ChunkStream, LlmError>;

    /// Whether the provider knows `model`.
    async fn validate_model(&self, model: &str) -> Result<bool, LlmError>;

    /// Context window of `model`, in tokens.
    fn context_length(&self, model: &str) -> usize {
        model_context_length(model)
    }
}

const DEFAULT_CONTEXT_LENGTH: usize = 32_000;

/// Known context windows, matched by substring of the model id. First match wins.
const CONTEXT_WINDOWS: &[(&str, usize)] = &[
    ("claude", 200_000),
    ("gpt-4.1", 1_000_000),
    ("gpt-5", 400_000),
    ("gpt-4o", 128_000),
    ("o3", 200_000),
    ("o4-mini", 200_000),
    ("gemini", 1_000_000),
    ("deepseek", 64_000),
    ("glm", 128_000),
    ("minimax", 200_000),
    ("llama", 128_000),
    ("qwen", 32_768),
    ("mistral", 32_000),
];

pub fn model_context_length(model: &str) -> usize {
    let lower = model.to_lowercase();
    CONTEXT_WINDOWS
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map_or(DEFAULT_CONTEXT_LENGTH, |(_, n)| *n)
}

// ─── OpenAI-compatible HTTP ───

/// `/chat/completions` over HTTP with SSE streaming. No request timeout: generation
/// may run arbitrarily long.
pub struct OpenAiCompatible {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    context_override: Option<usize>,
}

impl OpenAiCompatible {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder().build().unwrap_or_default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            context_override: None,
        }
    }

    pub fn from_provider(provider: &Provider) -> Self {
        Self::new(provider.base_url(), provider.api_key().map(str::to_string))
    }

    pub fn with_context_length(mut self, tokens: usize) -> Self {
        self.context_override = Some(tokens);
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, format!("{}{path}", self.base_url))
            .header("X-Title", "rein");
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        req
    }

    fn body(model: &str, messages: &[ChatMessage], stream: bool) -> Value {
        json!({
            "model": model,
            "messages": messages,
            "stream": stream,
            "temperature": 0,
        })
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, LlmError> {
        let resp = self
            .request(reqwest::Method::POST, "/chat/completions")
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        let err = LlmError::classify(Some(status.as_u16()), &error_message(&text));
        tracing::warn!(status = status.as_u16(), error = %err, "LLM request failed");
        Err(err)
    }
}

/// Prefer the provider's `error.message` over the raw body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

#[async_trait::async_trait]
impl LlmTransport for OpenAiCompatible {
    async fn send_message(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<String, LlmError> {
        let resp = self.post(&Self::body(model, messages, false)).await?;
        let value: Value = resp.json().await?;
        value["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| LlmError::Unknown("response has no message content".into()))
    }

    async fn stream_message(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<ChunkStream, LlmError> {
        tracing::debug!(model, messages = messages.len(), "streaming completion");
        let resp = self.post(&Self::body(model, messages, true)).await?;
        Ok(sse_stream(resp.bytes_stream()))
    }

    async fn validate_model(&self, model: &str) -> Result<bool, LlmError> {
        let resp = self.request(reqwest::Method::GET, "/models").send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::classify(Some(status.as_u16()), &error_message(&text)));
        }
        let value: Value = resp.json().await?;
        let known = value["data"]
            .as_array()
            .is_some_and(|models| models.iter().any(|m| m["id"].as_str() == Some(model)));
        Ok(known)
    }

    fn context_length(&self, model: &str) -> usize {
        self.context_override
            .unwrap_or_else(|| model_context_length(model))
    }
}

// ─── SSE decoding ───

/// Text delta carried by one SSE payload, or the error it reports.
fn parse_delta(payload: &str) -> Result<Option<String>, LlmError> {
    let value: Value = serde_json::from_str(payload)
        .map_err(|e| LlmError::Stream(format!("invalid chunk: {e}")))?;
    if let Some(err) = value.get("error") {
        let msg = err["message"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        let code = err["code"].as_u64().and_then(|c| u16::try_from(c).ok());
        return Err(LlmError::classify(code, &msg));
    }
    Ok(value["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string))
}

/// Text deltas of an SSE body. Ends at `[DONE]`, the first error, or end of input.
fn sse_stream<S, B, E>(bytes: S) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<LlmError> + Send + 'static,
{
    let events = Box::pin(bytes).eventsource();
    Box::pin(futures::stream::unfold(Some(events), |state| async move {
        let mut events = state?;
        loop {
            let item = match events.next().await? {
                Ok(event) => {
                    let payload = event.data.trim();
                    if payload.is_empty() {
                        continue;
                    }
                    if payload == "[DONE]" {
                        return None;
                    }
                    match parse_delta(payload) {
                        Ok(Some(text)) => Ok(text),
                        Ok(None) => continue,
                        Err(e) => Err(e),
                    }
                }
                Err(EventStreamError::Transport(e)) => Err(e.into()),
                Err(EventStreamError::Utf8(e)) => Err(LlmError::Stream(e.to_string())),
                Err(EventStreamError::Parser(e)) => Err(LlmError::Stream(e.to_string())),
            };
            return match item {
                Ok(text) => Some((Ok(text), Some(events))),
                Err(e) => Some((Err(e), None)),
            };
        }
    }))
}
