//! Capabilities the pipeline consumes but does not implement.

use core::pin::Pin;
use core::result::Result as CoreResult;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::{ProviderError, ToolError};
use crate::provider::ProviderKind;
use crate::types::ExchangeRecord;
use crate::Result;

/// Incremental text produced by one provider call.
pub type CompletionStream = Pin<Box<dyn Stream<Item = CoreResult<String, ProviderError>> + Send>>;

/// Parameters for a single completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Model identifier
    pub model: String,
    /// Fully assembled prompt
    pub prompt: String,
    /// Output allowance
    pub max_tokens: usize,
    /// Sampling temperature
    pub temperature: f32,
    /// Nucleus sampling parameter
    pub top_p: f32,
    /// Stop sequences
    pub stop: Vec<String>,
    /// Whether the provider should stream; non-streaming providers yield a single chunk
    pub stream: bool,
}

/// Trait for LLM vendors that can complete a prompt.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Vendor this implementation speaks to.
    fn kind(&self) -> ProviderKind;

    /// Starts a completion and returns its chunk stream.
    ///
    /// # Errors
    ///
    /// Returns a typed [`ProviderError`] if the call cannot be started. Errors
    /// after the first chunk arrive as stream items.
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> CoreResult<CompletionStream, ProviderError>;
}

/// Token count together with whether it came from a real tokenizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenCount {
    /// Number of tokens
    pub count: usize,
    /// `false` when the count is a heuristic estimate
    pub is_precise: bool,
}

/// Counts tokens for a model.
pub trait Tokenizer: Send + Sync {
    /// Counts the tokens `text` occupies for `model`. Must be deterministic.
    fn count_tokens(&self, text: &str, model: &str) -> TokenCount;
}

/// Description of a tool the gateway can invoke.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name used in directives
    pub name: String,
    /// Free-form capability tags
    pub capabilities: Vec<String>,
    /// Human-readable description
    pub description: String,
}

/// Access to external tools referenced by `[TOOL:Name:request]` directives.
#[async_trait]
pub trait ToolGateway: Send + Sync {
    /// Tools currently enabled.
    async fn list_enabled_tools(&self) -> Vec<ToolDescriptor>;

    /// Invokes a tool and returns its rendered result.
    ///
    /// # Errors
    /// Returns a [`ToolError`] if the tool is unknown or fails.
    async fn invoke(&self, name: &str, request: &str) -> CoreResult<String, ToolError>;
}

/// Receiver of per-call accounting records.
pub trait Ledger: Send + Sync {
    /// Stores one exchange.
    fn record(&self, exchange: ExchangeRecord);
}

/// Web search and retrieval collaborators feeding optional prompt sections.
#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    /// Rendered web-search results for `query`.
    ///
    /// # Errors
    /// Returns an error if the search backend fails.
    async fn web_search(&self, query: &str) -> Result<String>;

    /// Rendered retrieval chunks relevant to `query`.
    ///
    /// # Errors
    /// Returns an error if the chunk store fails.
    async fn retrieve(&self, query: &str) -> Result<String>;
}
