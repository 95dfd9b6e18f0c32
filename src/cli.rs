// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, Subcommand, ValueEnum};

/// Command-line arguments for `conductor`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "conductor",
    version,
    about = "Run a dependency graph of workers with shared state, checkpoints and resume.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    #[arg(long, global = true, value_name = "PATH", default_value = "Conductor.toml")]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `CONDUCTOR_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Start a new run. Ctrl-C cancels it.
    Run {
        /// What the run is about; handed to every worker.
        #[arg(value_name = "DESCRIPTION")]
        description: String,

        /// Initial context as a JSON document.
        #[arg(long, value_name = "JSON")]
        context: Option<String>,

        /// Parse + validate, print the graph, but don't execute anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Continue a run from its latest checkpoint.
    Resume {
        #[arg(value_name = "THREAD")]
        thread: String,
    },

    /// Show the checkpointed status of a run, or list runs.
    Status {
        #[arg(value_name = "THREAD")]
        thread: Option<String>,
    },
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
