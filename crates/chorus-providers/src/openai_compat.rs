//! Provider for vendors that speak the chat-completions protocol.
//!
//! Streaming responses arrive as server-sent events; each `data:` line carries
//! a JSON chunk whose `choices[0].delta.content` is the next piece of text.

use core::fmt::Display;
use core::result::Result as CoreResult;
use core::time::Duration;

use async_trait::async_trait;
use chorus_core::{CompletionRequest, CompletionStream, LlmProvider, ProviderError, ProviderKind};
use futures::stream::{self, Stream, StreamExt as _};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Error as ReqwestError, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Request payload sent to the chat completion API.
#[derive(Debug, Serialize)]
struct ChatRequest<'req> {
    /// Model identifier
    model: &'req str,
    /// Conversation messages
    messages: Vec<ChatMessage<'req>>,
    /// Maximum number of tokens in the completion
    max_tokens: usize,
    /// Sampling temperature
    temperature: f32,
    /// Nucleus sampling parameter
    top_p: f32,
    /// Stop sequences
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'req [String]>,
    /// Whether to stream
    stream: bool,
}

/// Message delivered to the API.
#[derive(Debug, Serialize)]
struct ChatMessage<'req> {
    /// Author role
    role: &'req str,
    /// Text content
    content: &'req str,
}

/// Non-streaming response.
#[derive(Debug, Deserialize)]
struct ChatResponse {
    /// Candidate completions
    choices: Vec<ChatChoice>,
}

/// A single non-streaming choice.
#[derive(Debug, Deserialize)]
struct ChatChoice {
    /// Generated message
    message: ChatContent,
}

/// One streamed chunk.
#[derive(Debug, Deserialize)]
struct ChatChunk {
    /// Candidate deltas
    choices: Vec<ChunkChoice>,
}

/// A single streamed choice.
#[derive(Debug, Deserialize)]
struct ChunkChoice {
    /// Incremental content
    delta: ChatContent,
}

/// Message or delta content.
#[derive(Debug, Deserialize)]
struct ChatContent {
    /// Text, absent on role-only or final deltas
    #[serde(default)]
    content: Option<String>,
}

/// Classified SSE line.
#[derive(Debug, PartialEq, Eq)]
enum SseLine {
    /// A `data:` payload
    Data(String),
    /// The `[DONE]` terminator
    Done,
    /// Comments, blank lines, and other fields
    Skip,
}

/// Chat-completions provider for one vendor.
pub struct OpenAiCompatibleProvider {
    /// HTTP client for API requests
    client: Client,
    /// Vendor served by this instance
    kind: ProviderKind,
    /// API base URL without the `/chat/completions` suffix
    base_url: String,
    /// Bearer token, if the vendor requires one
    api_key: Option<String>,
}

impl OpenAiCompatibleProvider {
    /// Creates a provider for `kind` at its default base URL.
    ///
    /// Returns `None` for vendors without a known chat-completions endpoint.
    #[must_use]
    pub fn new(kind: ProviderKind, api_key: Option<String>) -> Option<Self> {
        Self::default_base_url(kind).map(|base_url| Self {
            client: Client::default(),
            kind,
            base_url: base_url.to_owned(),
            api_key,
        })
    }

    /// Overrides the base URL (for proxies or self-hosted gateways).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Chat-completions base URL for a vendor.
    #[must_use]
    pub const fn default_base_url(kind: ProviderKind) -> Option<&'static str> {
        match kind {
            ProviderKind::OpenAi => Some("https://api.openai.com/v1"),
            ProviderKind::Anthropic => Some("https://api.anthropic.com/v1"),
            ProviderKind::Google => Some("https://generativelanguage.googleapis.com/v1beta/openai"),
            ProviderKind::Groq => Some("https://api.groq.com/openai/v1"),
            ProviderKind::DeepSeek => Some("https://api.deepseek.com/v1"),
            ProviderKind::Xai => Some("https://api.x.ai/v1"),
            ProviderKind::OpenRouter => Some("https://openrouter.ai/api/v1"),
            ProviderKind::Ollama => Some("http://localhost:11434/v1"),
            ProviderKind::Mock => None,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    async fn send(&self, request: &CompletionRequest) -> CoreResult<Response, ProviderError> {
        let body = ChatRequest {
            model: &request.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stop: (!request.stop.is_empty()).then_some(request.stop.as_slice()),
            stream: request.stream,
        };

        let mut builder = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|error| request_error(&error))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_owned());

        let error = match ProviderError::from_status(status.as_u16(), message) {
            ProviderError::RateLimited { message, .. } => ProviderError::RateLimited {
                message,
                retry_after,
            },
            other => other,
        };
        warn!(provider = %self.kind, status = status.as_u16(), "Provider rejected request: {error}");
        Err(error)
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> CoreResult<CompletionStream, ProviderError> {
        debug!(provider = %self.kind, model = %request.model, max_tokens = request.max_tokens, "Sending completion request");
        let response = self.send(request).await?;

        if request.stream {
            return Ok(sse_text_stream(response.bytes_stream()));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|error| ProviderError::Stream(format!("invalid response body: {error}")))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        Ok(Box::pin(stream::once(async move { Ok(text) })))
    }
}

/// Maps transport failures onto the provider taxonomy.
fn request_error(error: &ReqwestError) -> ProviderError {
    if error.is_timeout() {
        ProviderError::Timeout(error.to_string())
    } else if error.is_connect() {
        ProviderError::ConnectionFailure(error.to_string())
    } else {
        ProviderError::ConnectionFailure(format!("request failed: {error}"))
    }
}

fn parse_sse_line(line: &str) -> SseLine {
    let trimmed = line.trim();
    let Some(payload) = trimmed.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        SseLine::Done
    } else if payload.is_empty() {
        SseLine::Skip
    } else {
        SseLine::Data(payload.to_owned())
    }
}

/// Text carried by one streamed JSON chunk, if any.
fn delta_content(payload: &str) -> Option<String> {
    match serde_json::from_str::<ChatChunk>(payload) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .filter(|content| !content.is_empty()),
        Err(error) => {
            warn!("Skipping unparseable stream chunk: {error}");
            None
        }
    }
}

/// Parser state carried between polls of the byte stream.
struct SseState<S> {
    /// Underlying byte stream
    bytes: S,
    /// Bytes received but not yet split into lines
    buffer: Vec<u8>,
    /// The byte stream has ended
    exhausted: bool,
    /// A read error was surfaced
    finished: bool,
}

/// Turns an SSE byte stream into a stream of text deltas.
fn sse_text_stream<S, B, E>(bytes: S) -> CompletionStream
where
    S: Stream<Item = CoreResult<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = SseState {
        bytes,
        buffer: Vec::new(),
        exhausted: false,
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }

            if let Some(position) = state.buffer.iter().position(|byte| *byte == b'\n') {
                let line_bytes: Vec<u8> = state.buffer.drain(..=position).collect();
                let line = String::from_utf8_lossy(&line_bytes);
                match parse_sse_line(&line) {
                    SseLine::Done => return None,
                    SseLine::Data(payload) => {
                        if let Some(text) = delta_content(&payload) {
                            return Some((Ok(text), state));
                        }
                    }
                    SseLine::Skip => {}
                }
                continue;
            }

            if state.exhausted {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(error)) => {
                    state.finished = true;
                    return Some((Err(ProviderError::Stream(error.to_string())), state));
                }
                None => {
                    state.exhausted = true;
                    if !state.buffer.is_empty() {
                        state.buffer.push(b'\n');
                    }
                }
            }
        }
    }))
}
