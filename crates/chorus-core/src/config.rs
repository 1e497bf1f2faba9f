//! Configuration for execution, timeouts, budgeting, relay batching, and models.

use core::time::Duration;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::available_parallelism;

use dirs::home_dir;
use serde::{Deserialize, Serialize};
use toml::{from_str, to_string_pretty};
use tracing::debug;

use crate::provider::{DEFAULT_CONTEXT_WINDOW, ModelCatalog, ModelEntry, ProviderKind};
use crate::types::OUTPUT_TOKEN_FLOOR;
use crate::{Error, Result};

/// Upper bound on the per-level worker pool.
const MAX_WORKERS: usize = 8;

/// Complete pipeline configuration.
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChorusConfig {
    /// Scheduling configuration
    pub execution: ExecutionConfig,
    /// Timeout and retry configuration
    pub watchdog: WatchdogConfig,
    /// Token budget configuration
    pub budget: BudgetConfig,
    /// Streaming relay configuration
    pub relay: RelayConfig,
    /// Catalog overrides
    pub models: Vec<ModelEntry>,
    /// API keys keyed by provider name
    pub api_keys: BTreeMap<String, String>,
}

/// How agents are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One agent at a time, in agent-number order
    #[default]
    Sequential,
    /// Agents grouped into dependency levels, each level run concurrently
    DependencyLevels,
}

/// Scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Scheduling mode
    pub mode: ExecutionMode,
    /// Worker pool size for one dependency level
    pub max_workers: usize,
    /// Whether a resolved tool directive triggers one follow-up call
    pub tool_follow_up: bool,
    /// Whether an observed cancellation aborts the in-flight call
    pub abort_in_flight_on_cancel: bool,
    /// Number of most recent history turns rendered into each prompt
    pub history_turns: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Sequential,
            max_workers: default_max_workers(),
            tool_follow_up: true,
            abort_in_flight_on_cancel: false,
            history_turns: 10,
        }
    }
}

/// `min(available parallelism, 8)`.
#[must_use]
pub fn default_max_workers() -> usize {
    available_parallelism()
        .map_or(1, |count| count.get())
        .min(MAX_WORKERS)
}

/// Timeout and retry configuration for one provider call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Seconds without a chunk before the call is abandoned
    pub inactivity_timeout_secs: u64,
    /// Seconds since dispatch before the call is abandoned
    pub overall_timeout_secs: u64,
    /// Interval at which the watchdog re-checks its deadlines
    pub poll_interval_ms: u64,
    /// Retries for transient provider errors
    pub max_retries: u32,
    /// Base backoff delay; attempt `n` waits `base * 2^n`
    pub base_delay_ms: u64,
    /// Sampling temperature sent with every call
    pub temperature: f32,
    /// Nucleus sampling parameter sent with every call
    pub top_p: f32,
}

impl WatchdogConfig {
    /// Inactivity timeout as a duration.
    #[must_use]
    pub const fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    /// Overall timeout as a duration.
    #[must_use]
    pub const fn overall_timeout(&self) -> Duration {
        Duration::from_secs(self.overall_timeout_secs)
    }

    /// Poll interval as a duration.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Base retry delay as a duration.
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: 60,
            overall_timeout_secs: 600,
            poll_interval_ms: 1_000,
            max_retries: 2,
            base_delay_ms: 1_000,
            temperature: 0.7,
            top_p: 1.0,
        }
    }
}

/// Token budget configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Window assumed for unknown models
    pub default_context_window: usize,
    /// Smallest output allowance
    pub output_floor: usize,
    /// Output cap for agents in dynamic token mode
    pub dynamic_output_cap: usize,
    /// Providers that run close to their stated limit
    pub tight_providers: Vec<ProviderKind>,
    /// Model id prefixes known to reject near-limit requests
    pub strict_model_prefixes: Vec<String>,
    /// Share of the window available to previous agent outputs
    pub previous_outputs_share: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_context_window: DEFAULT_CONTEXT_WINDOW,
            output_floor: OUTPUT_TOKEN_FLOOR,
            dynamic_output_cap: 8_192,
            tight_providers: vec![ProviderKind::Groq, ProviderKind::DeepSeek],
            strict_model_prefixes: vec!["deepseek-reasoner".to_owned(), "gemma".to_owned()],
            previous_outputs_share: 0.6,
        }
    }
}

/// Flush policy for the streaming relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Buffer length that always triggers a flush
    pub max_buffer_chars: usize,
    /// Minimum buffer length for an interval-driven flush
    pub size_trigger_chars: usize,
    /// Minimum buffer length for an interval-driven flush in high-speed mode
    pub high_speed_size_trigger_chars: usize,
    /// Minimum time between interval-driven flushes
    pub min_flush_interval_ms: u64,
    /// Minimum time between interval-driven flushes in high-speed mode
    pub high_speed_min_flush_interval_ms: u64,
    /// Length of the rolling throughput window
    pub rate_window_secs: u64,
    /// Emits per second above which high-speed mode starts
    pub high_speed_enter_rate: f64,
    /// Emits per second below which high-speed mode ends
    pub high_speed_exit_rate: f64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_buffer_chars: 50,
            size_trigger_chars: 10,
            high_speed_size_trigger_chars: 20,
            min_flush_interval_ms: 100,
            high_speed_min_flush_interval_ms: 50,
            rate_window_secs: 5,
            high_speed_enter_rate: 50.0,
            high_speed_exit_rate: 40.0,
        }
    }
}

impl ChorusConfig {
    /// Get the configuration directory path (`~/.chorus`)
    ///
    /// # Errors
    /// Returns an error if the home directory cannot be determined
    pub fn config_dir() -> Result<PathBuf> {
        let home = home_dir()
            .ok_or_else(|| Error::Config("Could not determine home directory".to_owned()))?;
        Ok(home.join(".chorus"))
    }

    /// Get the default config file path (`~/.chorus/config.toml`)
    ///
    /// # Errors
    /// Returns an error if the home directory cannot be determined
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from the default location, creating it with defaults if missing
    ///
    /// # Errors
    /// Returns an error if the config cannot be read or created
    pub fn load_or_create() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            let config = Self::default();
            config.save_to_file(&config_path)?;
            Ok(config)
        }
    }

    /// Load config from a specific file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed, or fails validation
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = from_str(&contents)?;
        config.validate()?;

        debug!(
            "Loaded config from {:?}: mode={:?}, {} model overrides, {} api keys",
            path,
            config.execution.mode,
            config.models.len(),
            config.api_keys.len()
        );

        Ok(config)
    }

    /// Save config to a specific file
    ///
    /// # Errors
    /// Returns an error if the file cannot be written
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = to_string_pretty(self)?;
        let header = "# Chorus Configuration File\n\
                      # This file is automatically generated on first run\n\
                      # Edit this file to customize your settings\n\n";

        fs::write(path, format!("{header}{contents}"))?;
        Ok(())
    }

    /// Rejects settings the pipeline cannot honour.
    ///
    /// # Errors
    /// Returns `Error::Config` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.execution.max_workers == 0 {
            return Err(Error::Config("execution.max_workers must be at least 1".to_owned()));
        }
        if self.watchdog.poll_interval_ms == 0 {
            return Err(Error::Config("watchdog.poll_interval_ms must be positive".to_owned()));
        }
        if self.budget.output_floor == 0 || self.budget.dynamic_output_cap < self.budget.output_floor
        {
            return Err(Error::Config(
                "budget.dynamic_output_cap must be at least budget.output_floor".to_owned(),
            ));
        }
        if !(0.0..=1.0).contains(&self.budget.previous_outputs_share) {
            return Err(Error::Config(
                "budget.previous_outputs_share must be between 0 and 1".to_owned(),
            ));
        }
        Ok(())
    }

    /// Builds the model catalog with this config's overrides.
    #[must_use]
    pub fn catalog(&self) -> ModelCatalog {
        ModelCatalog::with_overrides(&self.models, self.budget.default_context_window)
    }

    /// Get API key for a provider, checking config first, then environment variables
    pub fn get_api_key(&self, provider: ProviderKind) -> Option<String> {
        self.api_keys
            .get(provider.as_str())
            .cloned()
            .or_else(|| provider.api_key_env().and_then(|var| env::var(var).ok()))
    }
}
