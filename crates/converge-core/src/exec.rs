//! Boundary to the external command layer
//!
//! The engine only needs one primitive: run a command, capture its output
//! lines and exit status. Selection (`exec_regex`, `exec_program`) and
//! transformers go through [`CommandRunner`].

use crate::{Error, Result};
use std::path::Path;
use std::process::{Command, Stdio};

/// Captured result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub lines: Vec<String>,
    /// Exit code; `None` when the process was killed by a signal.
    pub status: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &str) -> Result<CommandOutput>;
}

/// Runs commands through `sh -c` with stdin closed.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, command: &str) -> Result<CommandOutput> {
        tracing::debug!(command, "Running command");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|source| Error::Exec {
                command: command.to_string(),
                source,
            })?;

        Ok(CommandOutput {
            lines: String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(str::to_string)
                .collect(),
            status: output.status.code(),
        })
    }
}

/// Substitute `$(this.promiser)` / `${this.promiser}` with `path`.
pub fn expand_promiser(command: &str, path: &Path) -> String {
    let path = path.to_string_lossy();
    command
        .replace("$(this.promiser)", &path)
        .replace("${this.promiser}", &path)
}
