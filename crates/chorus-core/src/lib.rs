//! Core types and traits for the chorus agent pipeline.
//!
//! This crate provides the data model, error taxonomy, capability traits,
//! provider catalog, configuration, and observer interface shared by every
//! other chorus crate.
#![cfg_attr(
    test,
    allow(
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::missing_panics_doc,
        clippy::missing_errors_doc,
        reason = "Test allows"
    )
)]

/// Configuration loading and defaults.
pub mod config;
/// Error types and result definitions.
pub mod error;
/// Observer interface and channel-backed implementation.
pub mod observer;
/// Provider identities and the model catalog.
pub mod provider;
/// Lock helpers that tolerate poisoning.
pub mod sync;
/// Capability traits implemented outside the pipeline.
pub mod traits;
/// Data model for agents, outcomes, and exchanges.
pub mod types;

pub use config::{
    BudgetConfig, ChorusConfig, ExecutionConfig, ExecutionMode, RelayConfig, WatchdogConfig,
};
pub use error::{Error, ProviderError, Result, ToolError};
pub use observer::{ChannelObserver, NullObserver, Observer, PipelineEvent};
pub use provider::{DEFAULT_CONTEXT_WINDOW, ModelCatalog, ModelEntry, ModelInfo, ProviderKind};
pub use sync::IgnoreLock;
pub use traits::{
    CompletionRequest, CompletionStream, KnowledgeSource, Ledger, LlmProvider, TokenCount,
    Tokenizer, ToolDescriptor, ToolGateway,
};
pub use types::{
    AgentOutcome, AgentSpec, ConversationTurn, ExchangeRecord, OUTPUT_TOKEN_FLOOR, OutcomeMap,
    OutcomeStatus, PipelineRun, Role, TokenMode,
};
