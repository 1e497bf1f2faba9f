//! Provider strategies for the chorus agent pipeline.
//!
//! Each vendor is reached through an [`LlmProvider`](chorus_core::LlmProvider)
//! implementation registered under its [`ProviderKind`](chorus_core::ProviderKind).
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

/// Scripted provider for tests and offline runs.
pub mod mock;
/// Chat-completions streaming provider.
pub mod openai_compat;
/// Typed provider lookup.
pub mod registry;

pub use mock::{MockCall, MockProvider, MockReply, MockStep};
pub use openai_compat::OpenAiCompatibleProvider;
pub use registry::ProviderRegistry;
