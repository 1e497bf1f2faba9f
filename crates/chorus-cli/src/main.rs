//! Chorus CLI - run a roster of LLM agents over one prompt
#![cfg_attr(
    test,
    allow(
        dead_code,
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::missing_panics_doc,
        clippy::missing_errors_doc,
        reason = "Allow for tests"
    )
)]

use anyhow::Result;
use clap::Parser as _;
use cli::{Cli, Commands};

mod cli;
mod console;
mod handlers;
mod roster;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            roster,
            prompt,
            mode,
            config,
            log_file,
        } => {
            handlers::init_logging(log_file.as_deref())?;
            handlers::handle_run(&roster, prompt, mode.map(Into::into), config.as_deref()).await?;
        }
        Commands::Config { config } => {
            handlers::handle_config(config.as_deref())?;
        }
    }

    Ok(())
}
