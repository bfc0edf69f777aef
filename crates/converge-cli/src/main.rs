//! converge CLI
//!
//! Loads a promise file and a run configuration, reconciles every promise
//! and prints what happened.

mod cli;
mod commands;
mod error;

use clap::Parser;
use colored::Colorize;

use cli::{Cli, Commands};
use error::{CliError, Result};

fn main() {
    if let Err(e) = run() {
        eprintln!("{}: {}", "error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    converge_core::logging::init(cli.verbose).map_err(|e| CliError::user(e.to_string()))?;
    tracing::debug!("Verbose mode enabled");

    match cli.command {
        Commands::Run {
            promises,
            config,
            sandbox,
            json,
        } => commands::run_promises(&promises, config.as_deref(), sandbox.as_deref(), json),
        Commands::Check { promises } => commands::run_check(&promises),
    }
}
