//! Token budgeting and prompt assembly for chorus agents.
//!
//! [`TokenBudgetCalculator`] sizes each call's output allowance against the
//! target model's context window; [`ContextAssembler`] builds each agent's
//! input and keeps prior agent outputs inside their share of that window.
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

/// Per-agent prompt assembly.
pub mod assembler;
/// Output allowance computation.
pub mod budget;
/// Truncation and extractive summarization.
pub mod condense;
/// Heuristic token estimation.
pub mod tokenizer;

pub use assembler::{
    AssembledPrompt, ContextAssembler, Inclusion, PreviousOutputs, PriorOutput, Supplements,
};
pub use budget::{TokenBudget, TokenBudgetCalculator};
pub use condense::{Condenser, SUMMARY_PREFIX, TRUNCATION_MARKER, split_sentences};
pub use tokenizer::{WordCountTokenizer, estimate_tokens};
