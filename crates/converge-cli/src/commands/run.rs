//! Run command implementation

use std::path::{Path, PathBuf};
use std::sync::Arc;

use colored::{ColoredString, Colorize};
use converge_core::{MemoryReporter, Outcome, ReportEntry, RunConfig, RunContext, RunSummary, reconcile_all};
use converge_fs::{ConfigStore, StagedChange};
use serde::Serialize;

use super::load_promises;
use crate::error::{CliError, Result};

/// Everything a run produced, in the shape printed by `--json`.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub outcome: Outcome,
    pub summary: RunSummary,
    pub entries: Vec<ReportEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<PathBuf>,
    pub staged: Vec<StagedChange>,
}

fn load_config(config: Option<&Path>, sandbox: Option<&Path>) -> Result<RunConfig> {
    let mut run_config = match config {
        Some(path) => ConfigStore::new().load(path)?,
        None => RunConfig::default(),
    };
    if let Some(root) = sandbox {
        run_config.sandbox_root = Some(root.to_path_buf());
    }
    Ok(run_config)
}

/// Reconcile every promise in `promises` and print the report.
///
/// Fails when any promise ended `failed`, `denied` or `interrupted`.
pub fn run_promises(promises: &Path, config: Option<&Path>, sandbox: Option<&Path>, json: bool) -> Result<()> {
    let file = load_promises(promises)?;
    let run_config = load_config(config, sandbox)?;

    let reporter = Arc::new(MemoryReporter::new());
    let ctx = RunContext::from_config(&run_config)?.with_reporter(reporter.clone());

    tracing::debug!(count = file.promises.len(), "Reconciling promises");
    let outcome = reconcile_all(&ctx, &file.promises);
    ctx.finish()?;

    let entries = reporter.entries();
    let report = RunReport {
        outcome,
        summary: RunSummary::from_entries(&entries),
        entries,
        sandbox: run_config.sandbox_root.clone(),
        staged: ctx.fs.journal(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    let not_kept = report.entries.iter().filter(|e| e.outcome.is_failure()).count();
    if not_kept > 0 {
        return Err(CliError::NotKept { count: not_kept });
    }
    Ok(())
}

fn colored_label(outcome: Outcome) -> ColoredString {
    let label = outcome.label();
    match outcome {
        Outcome::NoChange => label.dimmed(),
        Outcome::Changed => label.green(),
        Outcome::Warned | Outcome::Interrupted => label.yellow(),
        Outcome::Denied | Outcome::Failed => label.red(),
    }
}

fn print_report(report: &RunReport) {
    for entry in &report.entries {
        if entry.outcome == Outcome::NoChange {
            continue;
        }
        println!(
            "  {} {}: {}",
            colored_label(entry.outcome),
            entry.path.display(),
            entry.message
        );
    }

    if let Some(root) = &report.sandbox {
        println!();
        println!("{} (under {}):", "Staged changes".bold(), root.display());
        if report.staged.is_empty() {
            println!("  {}", "None".dimmed());
        }
        for change in &report.staged {
            println!("  {} {}", "~".yellow(), change);
        }
    }

    println!();
    let counts: Vec<String> = [
        Outcome::NoChange,
        Outcome::Changed,
        Outcome::Warned,
        Outcome::Interrupted,
        Outcome::Denied,
        Outcome::Failed,
    ]
    .into_iter()
    .filter(|o| report.summary.count(*o) > 0)
    .map(|o| format!("{} {}", report.summary.count(o), colored_label(o)))
    .collect();

    let headline = if report.outcome.is_failure() {
        "Not kept".red().bold()
    } else {
        "Converged".green().bold()
    };
    if counts.is_empty() {
        println!("{headline}: nothing to do");
    } else {
        println!("{headline}: {}", counts.join(", "));
    }
}
