//! Multi-agent pipeline execution for chorus.
//!
//! This crate drives a roster of LLM agents over one prompt:
//!
//! - **Scheduling**: sequential or dependency-level execution with a bounded worker pool
//! - **Supervision**: per-call inactivity and overall deadlines with transient-error retry
//! - **Streaming**: adaptive batching of streamed text before it reaches the observer
//! - **Tools**: in-place resolution of `[TOOL:Name:request]` directives with one follow-up call
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use chorus_agent::AgentPipeline;
//! use chorus_core::{AgentSpec, ChorusConfig, NullObserver, PipelineRun, ProviderKind};
//! use chorus_providers::{MockProvider, ProviderRegistry};
//!
//! # async fn example() -> chorus_core::Result<()> {
//! let registry = ProviderRegistry::new().with_provider(Arc::new(MockProvider::new()));
//! let pipeline = AgentPipeline::new(ChorusConfig::default(), registry, Arc::new(NullObserver));
//! let specs = vec![
//!     AgentSpec::new(1, ProviderKind::Mock, "draft"),
//!     AgentSpec::new(2, ProviderKind::Mock, "review"),
//! ];
//! let report = pipeline.run(PipelineRun::new(specs, "Explain lifetimes", Vec::new())?).await?;
//! println!("{}", report.final_text);
//! # Ok(())
//! # }
//! ```
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

/// Run-wide cancellation flag.
pub mod cancel;
/// Dependency levels between agents.
pub mod graph;
/// In-memory exchange ledger.
pub mod ledger;
/// Pipeline scheduling and per-agent turns.
pub mod pipeline;
/// Adaptive batching of streamed text.
pub mod relay;
/// Tool directive resolution.
pub mod tools;
/// Timeouts and retries around one provider call.
pub mod watchdog;

pub use cancel::CancellationFlag;
pub use graph::DependencyGraph;
pub use ledger::{InMemoryLedger, LedgerTotals};
pub use pipeline::{AgentPipeline, PipelineHandle, PipelineReport};
pub use relay::{
    CodeBoundaryPredicate, RelayChunk, StreamState, StreamingRelay, looks_like_code_boundary,
};
pub use tools::{
    AUTO_TOOL, Expansion, SEARCH_TOOL, ToolDirective, ToolInvocationExpander, ToolResult,
    find_directives, follow_up_prompt, score_tool, select_auto_tool,
};
pub use watchdog::{
    CallOutcome, CallStatus, RetryWatchdog, TIMEOUT_PLACEHOLDER, TimeoutKind, WatchdogSettings,
};
