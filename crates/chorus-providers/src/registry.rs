//! Typed lookup from [`ProviderKind`] to a provider strategy.

use std::collections::HashMap;
use std::sync::Arc;

use chorus_core::{ChorusConfig, Error, LlmProvider, ProviderKind, Result};
use tracing::{debug, info};

use crate::openai_compat::OpenAiCompatibleProvider;

/// Providers available to a pipeline, one per vendor.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    /// Registered strategies
    providers: HashMap<ProviderKind, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry with a chat-completions provider for every vendor
    /// that has an API key configured. Ollama needs no key and is always added.
    #[must_use]
    pub fn from_config(config: &ChorusConfig) -> Self {
        let mut registry = Self::new();
        for kind in ProviderKind::all() {
            let api_key = config.get_api_key(kind);
            let needs_key = kind.api_key_env().is_some();
            if needs_key && api_key.is_none() {
                debug!(provider = %kind, "No API key configured; provider not registered");
                continue;
            }
            if let Some(provider) = OpenAiCompatibleProvider::new(kind, api_key) {
                registry.register(Arc::new(provider));
            }
        }
        info!(providers = registry.providers.len(), "Provider registry initialized");
        registry
    }

    /// Registers `provider` under its own kind, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) -> Option<Arc<dyn LlmProvider>> {
        self.providers.insert(provider.kind(), provider)
    }

    /// Registers `provider` under `kind`, regardless of what it reports.
    pub fn register_as(
        &mut self,
        kind: ProviderKind,
        provider: Arc<dyn LlmProvider>,
    ) -> Option<Arc<dyn LlmProvider>> {
        self.providers.insert(kind, provider)
    }

    /// Builder form of [`Self::register`].
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Provider for `kind`.
    ///
    /// # Errors
    /// Returns `Error::Config` if nothing is registered for `kind`.
    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn LlmProvider>> {
        self.providers
            .get(&kind)
            .map(Arc::clone)
            .ok_or_else(|| Error::Config(format!("no provider registered for '{kind}'")))
    }

    /// Whether `kind` has a provider.
    #[must_use]
    pub fn contains(&self, kind: ProviderKind) -> bool {
        self.providers.contains_key(&kind)
    }

    /// Registered kinds in declaration order.
    #[must_use]
    pub fn kinds(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<ProviderKind> = self.providers.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }
}
