//! CLI argument parsing using clap derive

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// converge - bring files in line with declarative promises
#[derive(Parser, Debug)]
#[command(name = "converge")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// The command to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Reconcile every promise in a promise file
    ///
    /// Examples:
    ///   converge run promises.toml
    ///   converge run promises.toml --sandbox /tmp/stage   # stage, do not touch the live tree
    ///   converge run promises.yaml --config run.toml --json
    Run {
        /// Promise file (TOML, JSON or YAML)
        promises: PathBuf,

        /// Run configuration file
        #[arg(short, long, env = "CONVERGE_CONFIG")]
        config: Option<PathBuf>,

        /// Stage every change under this directory instead of the live tree
        #[arg(long)]
        sandbox: Option<PathBuf>,

        /// Output the report as JSON for scripting
        #[arg(long)]
        json: bool,
    },

    /// Validate a promise file without touching the filesystem
    Check {
        /// Promise file (TOML, JSON or YAML)
        promises: PathBuf,
    },
}
