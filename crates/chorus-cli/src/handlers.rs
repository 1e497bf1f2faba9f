//! Command handlers for CLI operations

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use chorus_agent::{AgentPipeline, InMemoryLedger};
use chorus_core::{ChorusConfig, Error as CoreError, ExecutionMode, Observer as _, PipelineRun};
use chorus_providers::{MockProvider, ProviderRegistry};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{
    EnvFilter, Registry, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

use crate::console::TerminalObserver;
use crate::roster::load_roster;

/// Filter used when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "chorus_agent=info,chorus_context=info,chorus_providers=info";

/// Installs the tracing subscriber. Diagnostics go to `log_file` when given,
/// stderr otherwise.
///
/// # Errors
/// Returns an error if the log file cannot be opened.
pub fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false)
                    .with_target(true)
                    .with_level(true),
            )
        }
        None => None,
    };
    let stderr_layer = file_layer
        .is_none()
        .then(|| fmt::layer().with_writer(io::stderr).with_target(false));

    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()))
        .with(file_layer)
        .with(stderr_layer)
        .init();
    Ok(())
}

/// Loads the config at `path`, or the default location when `path` is `None`.
///
/// # Errors
/// Returns an error if an explicitly given file cannot be loaded.
pub fn load_config(path: Option<&Path>) -> Result<ChorusConfig> {
    if let Some(path) = path {
        return Ok(ChorusConfig::load_from_file(path)?);
    }
    Ok(ChorusConfig::load_or_create().unwrap_or_else(|error| {
        warn!("Failed to load config from ~/.chorus/config.toml: {error}");
        warn!("Using default configuration");
        ChorusConfig::default()
    }))
}

/// Providers for every configured vendor plus the offline mock.
fn build_registry(config: &ChorusConfig) -> ProviderRegistry {
    ProviderRegistry::from_config(config).with_provider(Arc::new(MockProvider::new()))
}

/// Runs one roster over `prompt`, streaming to the terminal.
///
/// # Errors
/// Returns an error if the config or roster cannot be loaded, the run fails
/// fatally, or the run is interrupted.
pub async fn handle_run(
    roster: &Path,
    prompt: String,
    mode: Option<ExecutionMode>,
    config_path: Option<&Path>,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(mode) = mode {
        config.execution.mode = mode;
    }
    let specs = load_roster(roster).await?;
    info!(agents = specs.len(), mode = ?config.execution.mode, "Loaded roster");

    let registry = build_registry(&config);
    let ledger = Arc::new(InMemoryLedger::new());
    let observer = Arc::new(TerminalObserver::terminal());
    let pipeline = AgentPipeline::new(config, registry, observer)
        .with_ledger(Arc::<InMemoryLedger>::clone(&ledger));

    let cancel = pipeline.cancel_flag();
    let interrupt = tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping after the current agent");
            cancel.cancel();
        }
    });

    let run = PipelineRun::new(specs, prompt, Vec::new())?;
    let result = pipeline.spawn(run).join().await;
    interrupt.abort();
    let report = result?;

    let totals = ledger.totals();
    let summary = format!(
        "{} agent(s), {} call(s), {} input / {} output tokens, ${:.4}",
        report.outcomes.len(),
        totals.calls,
        totals.input_tokens,
        totals.output_tokens,
        totals.cost
    );
    info!("{summary}");
    TerminalObserver::terminal().on_log(&summary);

    if report.cancelled {
        return Err(CoreError::Cancelled.into());
    }
    Ok(())
}

/// Prints the effective configuration as TOML.
///
/// # Errors
/// Returns an error if the config cannot be loaded or serialized.
pub fn handle_config(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let rendered = toml::to_string_pretty(&config)?;
    TerminalObserver::terminal().print(&rendered);
    Ok(())
}
