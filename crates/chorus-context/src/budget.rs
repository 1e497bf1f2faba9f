//! Output-token budgeting against a shrinking context window.
//!
//! The calculator is pure: the same input text, provider, model, and cap always
//! produce the same budget.

use std::sync::Arc;

use chorus_core::{BudgetConfig, ModelCatalog, ProviderKind, Tokenizer};

/// Base margin: `max(1024, 10%)` of the window.
const BASE_MARGIN: (usize, usize) = (1_024, 10);
/// Margin for providers that run close to their stated limit.
const TIGHT_MARGIN: (usize, usize) = (4_096, 20);
/// Margin for model families that reject near-limit requests.
const STRICT_MARGIN: (usize, usize) = (6_144, 25);

/// Breakdown of one output allowance.
///
/// `safety_margin` is the margin actually reserved. When the nominal margin
/// would leave less than the output floor, it shrinks so that input, output,
/// and margin still fit the window; it is zero once the input alone leaves no
/// room for the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    /// Context window of the target model
    pub total_context_window: usize,
    /// Estimated size of the assembled input
    pub estimated_input_tokens: usize,
    /// Reserved headroom
    pub safety_margin: usize,
    /// Cap requested by the agent's token mode
    pub user_cap: usize,
    /// Allowance sent to the provider
    pub effective_output_tokens: usize,
    /// Whether the input estimate came from a precise tokenizer
    pub is_precise: bool,
}

/// Computes effective output caps per call.
#[derive(Clone)]
pub struct TokenBudgetCalculator {
    /// Window and pricing lookup
    catalog: ModelCatalog,
    /// Floors, caps, and margin tiers
    config: BudgetConfig,
    /// Token counting primitive shared with the assembler
    tokenizer: Arc<dyn Tokenizer>,
}

impl TokenBudgetCalculator {
    /// Creates a calculator.
    pub fn new(catalog: ModelCatalog, config: BudgetConfig, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            catalog,
            config,
            tokenizer,
        }
    }

    /// Token counting primitive.
    #[must_use]
    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    /// Window and pricing lookup.
    #[must_use]
    pub const fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Floors, caps, and margin tiers.
    #[must_use]
    pub const fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Smallest allowance ever returned.
    #[must_use]
    pub const fn floor(&self) -> usize {
        self.config.output_floor
    }

    /// Total context window for a model.
    #[must_use]
    pub fn context_window(&self, provider: ProviderKind, model: &str) -> usize {
        self.catalog.context_window(provider, model)
    }

    /// Nominal headroom reserved for a model's window.
    #[must_use]
    pub fn safety_margin(&self, provider: ProviderKind, model: &str, window: usize) -> usize {
        let (minimum, percent) = if self
            .config
            .strict_model_prefixes
            .iter()
            .any(|prefix| model_matches_prefix(model, prefix))
        {
            STRICT_MARGIN
        } else if self.config.tight_providers.contains(&provider) {
            TIGHT_MARGIN
        } else {
            BASE_MARGIN
        };
        minimum.max(window * percent / 100)
    }

    /// Effective output cap for one call.
    #[must_use]
    pub fn compute(
        &self,
        input_text: &str,
        provider: ProviderKind,
        model: &str,
        user_cap: usize,
    ) -> usize {
        self.budget(input_text, provider, model, user_cap)
            .effective_output_tokens
    }

    /// Full budget breakdown for one call.
    #[must_use]
    pub fn budget(
        &self,
        input_text: &str,
        provider: ProviderKind,
        model: &str,
        user_cap: usize,
    ) -> TokenBudget {
        let estimate = self.tokenizer.count_tokens(input_text, model);
        let window = self.context_window(provider, model);
        self.budget_for(estimate.count, window, provider, model, user_cap)
            .with_precision(estimate.is_precise)
    }

    /// Budget for an already-estimated input against a known window.
    #[must_use]
    pub fn budget_for(
        &self,
        estimated_input_tokens: usize,
        total_context_window: usize,
        provider: ProviderKind,
        model: &str,
        user_cap: usize,
    ) -> TokenBudget {
        let floor = self.floor();
        let cap = user_cap.max(floor);
        let nominal_margin = self.safety_margin(provider, model, total_context_window);

        let available = total_context_window
            .saturating_sub(estimated_input_tokens)
            .saturating_sub(nominal_margin);

        let effective_output_tokens = cap.min(available).max(floor);
        let safety_margin = nominal_margin.min(
            total_context_window
                .saturating_sub(estimated_input_tokens)
                .saturating_sub(effective_output_tokens),
        );

        TokenBudget {
            total_context_window,
            estimated_input_tokens,
            safety_margin,
            user_cap: cap,
            effective_output_tokens,
            is_precise: false,
        }
    }
}

impl TokenBudget {
    const fn with_precision(mut self, is_precise: bool) -> Self {
        self.is_precise = is_precise;
        self
    }
}

fn model_matches_prefix(model: &str, prefix: &str) -> bool {
    let bare = model.rsplit('/').next().unwrap_or(model);
    bare.to_ascii_lowercase()
        .starts_with(&prefix.to_ascii_lowercase())
}
