//! Provider identities and the model catalog.
//!
//! Provider names are parsed once into [`ProviderKind`] so that dispatch and
//! budget rules match on a typed key instead of ad hoc strings.
use core::fmt::{Display, Formatter, Result as FmtResult};
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Context window assumed for models the catalog does not know.
pub const DEFAULT_CONTEXT_WINDOW: usize = 20_000;

/// All supported LLM vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// `OpenAI` chat completions
    OpenAi,
    /// Anthropic messages API
    Anthropic,
    /// Google Gemini
    Google,
    /// Groq hosted inference
    Groq,
    /// `DeepSeek` API
    DeepSeek,
    /// xAI Grok
    Xai,
    /// `OpenRouter` multi-vendor gateway
    OpenRouter,
    /// Local Ollama server
    Ollama,
    /// Scripted provider used in tests and dry runs
    Mock,
}

impl ProviderKind {
    /// Lowercase identifier used in configuration files.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
            Self::Groq => "groq",
            Self::DeepSeek => "deepseek",
            Self::Xai => "xai",
            Self::OpenRouter => "openrouter",
            Self::Ollama => "ollama",
            Self::Mock => "mock",
        }
    }

    /// Environment variable holding the API key for this provider.
    #[must_use]
    pub const fn api_key_env(&self) -> Option<&'static str> {
        match self {
            Self::OpenAi => Some("OPENAI_API_KEY"),
            Self::Anthropic => Some("ANTHROPIC_API_KEY"),
            Self::Google => Some("GEMINI_API_KEY"),
            Self::Groq => Some("GROQ_API_KEY"),
            Self::DeepSeek => Some("DEEPSEEK_API_KEY"),
            Self::Xai => Some("XAI_API_KEY"),
            Self::OpenRouter => Some("OPENROUTER_API_KEY"),
            Self::Ollama | Self::Mock => None,
        }
    }

    /// Get all supported providers.
    #[must_use]
    pub const fn all() -> [Self; 9] {
        [
            Self::OpenAi,
            Self::Anthropic,
            Self::Google,
            Self::Groq,
            Self::DeepSeek,
            Self::Xai,
            Self::OpenRouter,
            Self::Ollama,
            Self::Mock,
        ]
    }
}

impl Display for ProviderKind {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> FmtResult {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        let lowered = name.trim().to_ascii_lowercase();
        Self::all()
            .into_iter()
            .find(|kind| kind.as_str() == lowered)
            .ok_or_else(|| Error::Validation(format!("unknown provider: {name}")))
    }
}

/// Capacity and pricing for one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Total context window in tokens
    pub context_window: usize,
    /// USD per million input tokens
    pub input_cost_per_million: f64,
    /// USD per million output tokens
    pub output_cost_per_million: f64,
}

impl ModelInfo {
    /// Cost in USD of one exchange.
    #[must_use]
    pub fn cost(&self, input_tokens: usize, output_tokens: usize) -> f64 {
        (input_tokens as f64 * self.input_cost_per_million
            + output_tokens as f64 * self.output_cost_per_million)
            / 1_000_000.0
    }
}

/// One catalog row, also the shape of `[[models]]` overrides in config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Vendor serving the model
    pub provider: ProviderKind,
    /// Model identifier or identifier prefix
    pub model: String,
    /// Total context window in tokens
    pub context_window: usize,
    /// USD per million input tokens
    #[serde(default)]
    pub input_cost_per_million: f64,
    /// USD per million output tokens
    #[serde(default)]
    pub output_cost_per_million: f64,
}

impl ModelEntry {
    fn new(provider: ProviderKind, model: &str, context_window: usize, costs: (f64, f64)) -> Self {
        Self {
            provider,
            model: model.to_owned(),
            context_window,
            input_cost_per_million: costs.0,
            output_cost_per_million: costs.1,
        }
    }

    const fn info(&self) -> ModelInfo {
        ModelInfo {
            context_window: self.context_window,
            input_cost_per_million: self.input_cost_per_million,
            output_cost_per_million: self.output_cost_per_million,
        }
    }
}

/// Lookup table from `(provider, model)` to [`ModelInfo`].
///
/// Resolution order: exact id for the provider, longest id prefix for the
/// provider, longest prefix of the bare model name (the part after the last
/// `/`) across all providers, then the conservative default window at zero
/// cost.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    entries: Vec<ModelEntry>,
    default_window: usize,
}

impl ModelCatalog {
    /// Creates a catalog containing only the given entries.
    #[must_use]
    pub fn new(entries: Vec<ModelEntry>, default_window: usize) -> Self {
        Self {
            entries,
            default_window,
        }
    }

    /// Creates the built-in catalog with `overrides` taking precedence.
    #[must_use]
    pub fn with_overrides(overrides: &[ModelEntry], default_window: usize) -> Self {
        let mut entries = overrides.to_vec();
        entries.extend(builtin_entries());
        Self::new(entries, default_window)
    }

    /// Window used when no entry matches.
    #[must_use]
    pub const fn default_window(&self) -> usize {
        self.default_window
    }

    /// Resolves capacity and pricing for a model.
    #[must_use]
    pub fn lookup(&self, provider: ProviderKind, model: &str) -> ModelInfo {
        self.find(provider, model).map_or(
            ModelInfo {
                context_window: self.default_window,
                input_cost_per_million: 0.0,
                output_cost_per_million: 0.0,
            },
            ModelEntry::info,
        )
    }

    /// Total context window for a model.
    #[must_use]
    pub fn context_window(&self, provider: ProviderKind, model: &str) -> usize {
        self.lookup(provider, model).context_window
    }

    fn find(&self, provider: ProviderKind, model: &str) -> Option<&ModelEntry> {
        let model = model.trim();
        if let Some(exact) = self
            .entries
            .iter()
            .find(|entry| entry.provider == provider && entry.model == model)
        {
            return Some(exact);
        }

        if let Some(prefixed) = Self::longest_prefix(
            self.entries.iter().filter(|entry| entry.provider == provider),
            model,
        ) {
            return Some(prefixed);
        }

        let bare = model.rsplit('/').next().unwrap_or(model);
        Self::longest_prefix(self.entries.iter(), bare)
    }

    fn longest_prefix<'entry>(
        entries: impl Iterator<Item = &'entry ModelEntry>,
        model: &str,
    ) -> Option<&'entry ModelEntry> {
        entries
            .filter(|entry| model.starts_with(entry.model.as_str()))
            .max_by_key(|entry| entry.model.len())
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::with_overrides(&[], DEFAULT_CONTEXT_WINDOW)
    }
}

fn builtin_entries() -> Vec<ModelEntry> {
    use ProviderKind::{Anthropic, DeepSeek, Google, Groq, Ollama, OpenAi, Xai};

    vec![
        ModelEntry::new(OpenAi, "gpt-4o-mini", 128_000, (0.15, 0.6)),
        ModelEntry::new(OpenAi, "gpt-4o", 128_000, (2.5, 10.0)),
        ModelEntry::new(OpenAi, "gpt-4.1", 1_047_576, (2.0, 8.0)),
        ModelEntry::new(OpenAi, "gpt-3.5-turbo", 16_385, (0.5, 1.5)),
        ModelEntry::new(OpenAi, "o3", 200_000, (2.0, 8.0)),
        ModelEntry::new(Anthropic, "claude-3-5-haiku", 200_000, (0.8, 4.0)),
        ModelEntry::new(Anthropic, "claude-3-5-sonnet", 200_000, (3.0, 15.0)),
        ModelEntry::new(Anthropic, "claude-sonnet-4", 200_000, (3.0, 15.0)),
        ModelEntry::new(Anthropic, "claude-opus-4", 200_000, (15.0, 75.0)),
        ModelEntry::new(Google, "gemini-1.5-pro", 2_000_000, (1.25, 5.0)),
        ModelEntry::new(Google, "gemini-2.0-flash", 1_048_576, (0.1, 0.4)),
        ModelEntry::new(Google, "gemma", 8_192, (0.0, 0.0)),
        ModelEntry::new(Groq, "llama-3.1-8b-instant", 131_072, (0.05, 0.08)),
        ModelEntry::new(Groq, "llama-3.3-70b-versatile", 131_072, (0.59, 0.79)),
        ModelEntry::new(Groq, "mixtral-8x7b", 32_768, (0.24, 0.24)),
        ModelEntry::new(DeepSeek, "deepseek-chat", 64_000, (0.27, 1.1)),
        ModelEntry::new(DeepSeek, "deepseek-reasoner", 64_000, (0.55, 2.19)),
        ModelEntry::new(Xai, "grok-2", 131_072, (2.0, 10.0)),
        ModelEntry::new(Xai, "grok-beta", 131_072, (5.0, 15.0)),
        ModelEntry::new(Ollama, "llama3", 8_192, (0.0, 0.0)),
        ModelEntry::new(Ollama, "qwen2.5-coder", 32_768, (0.0, 0.0)),
    ]
}
