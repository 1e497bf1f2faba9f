use std::path::PathBuf;

use chorus_core::ExecutionMode;
use clap::{Parser, Subcommand, ValueEnum};

/// Command-line arguments for the chorus binary
#[derive(Debug, Parser)]
#[command(name = "chorus")]
#[command(about = "Run a roster of LLM agents over one prompt", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Run every agent in a roster file over a prompt")]
    Run {
        #[arg(short, long, help = "Roster file with [[agents]] tables")]
        roster: PathBuf,

        #[arg(short, long, help = "The user message sent to the pipeline")]
        prompt: String,

        #[arg(short, long, value_enum, help = "Scheduling mode (overrides config)")]
        mode: Option<ModeArg>,

        #[arg(short, long, help = "Config file [default: ~/.chorus/config.toml]")]
        config: Option<PathBuf>,

        #[arg(long, help = "Write diagnostics to this file instead of stderr")]
        log_file: Option<PathBuf>,
    },

    #[command(about = "Print the effective configuration as TOML")]
    Config {
        #[arg(short, long, help = "Config file [default: ~/.chorus/config.toml]")]
        config: Option<PathBuf>,
    },
}

/// Scheduling mode as spelled on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// One agent at a time
    Sequential,
    /// Dependency levels run concurrently
    Levels,
}

impl From<ModeArg> for ExecutionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Sequential => Self::Sequential,
            ModeArg::Levels => Self::DependencyLevels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory as _;

    #[test]
    fn test_command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_arguments() {
        let cli = Cli::parse_from([
            "chorus", "run", "--roster", "agents.toml", "--prompt", "hello", "--mode", "levels",
        ]);
        let Commands::Run {
            roster,
            prompt,
            mode,
            config,
            log_file,
        } = cli.command
        else {
            panic!("expected the run command");
        };
        assert_eq!(roster, PathBuf::from("agents.toml"));
        assert_eq!(prompt, "hello");
        assert_eq!(mode.map(ExecutionMode::from), Some(ExecutionMode::DependencyLevels));
        assert!(config.is_none());
        assert!(log_file.is_none());
    }
}
