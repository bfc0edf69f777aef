//! Per-path outcome reporting
//!
//! Every operation hands its outcome and a message to a [`Reporter`].
//! [`TracingReporter`] writes them to the log; [`MemoryReporter`] keeps them
//! for the CLI summary and for tests.

use crate::outcome::Outcome;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// One reported outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub path: PathBuf,
    pub outcome: Outcome,
    pub message: String,
}

pub trait Reporter: Send + Sync {
    fn report(&self, path: &Path, outcome: Outcome, message: &str);
}

/// Logs each outcome at a level matching its severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, path: &Path, outcome: Outcome, message: &str) {
        let path = path.display();
        match outcome {
            Outcome::NoChange => tracing::debug!(%path, outcome = outcome.label(), "{message}"),
            Outcome::Changed => tracing::info!(%path, outcome = outcome.label(), "{message}"),
            Outcome::Warned | Outcome::Interrupted => {
                tracing::warn!(%path, outcome = outcome.label(), "{message}")
            }
            Outcome::Denied | Outcome::Failed => {
                tracing::error!(%path, outcome = outcome.label(), "{message}")
            }
        }
    }
}

/// Collects entries in memory and forwards them to the log.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    entries: Mutex<Vec<ReportEntry>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ReportEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Entries for `path`, in report order.
    pub fn entries_for(&self, path: &Path) -> Vec<ReportEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.path == path)
            .collect()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary::from_entries(&self.entries())
    }
}

impl Reporter for MemoryReporter {
    fn report(&self, path: &Path, outcome: Outcome, message: &str) {
        TracingReporter.report(path, outcome, message);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ReportEntry {
                path: path.to_path_buf(),
                outcome,
                message: message.to_string(),
            });
    }
}

/// Outcome counts over a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub counts: BTreeMap<Outcome, usize>,
    pub worst: Outcome,
}

impl RunSummary {
    pub fn from_entries(entries: &[ReportEntry]) -> Self {
        let mut summary = Self::default();
        for entry in entries {
            summary.add(entry.outcome);
        }
        summary
    }

    pub fn add(&mut self, outcome: Outcome) {
        *self.counts.entry(outcome).or_default() += 1;
        self.worst = self.worst.combine(outcome);
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.counts.get(&outcome).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn memory_reporter_keeps_order_and_summarizes() {
        let reporter = MemoryReporter::new();
        reporter.report(Path::new("/a"), Outcome::Changed, "copied");
        reporter.report(Path::new("/b"), Outcome::NoChange, "up to date");
        reporter.report(Path::new("/a"), Outcome::Warned, "mode differs");

        let for_a = reporter.entries_for(Path::new("/a"));
        assert_eq!(for_a.len(), 2);
        assert_eq!(for_a[1].message, "mode differs");

        let summary = reporter.summary();
        assert_eq!(summary.count(Outcome::Changed), 1);
        assert_eq!(summary.count(Outcome::Failed), 0);
        assert_eq!(summary.worst, Outcome::Warned);
    }

    #[test]
    fn entries_serialize_with_snake_case_outcomes() {
        let entry = ReportEntry {
            path: "/etc/motd".into(),
            outcome: Outcome::NoChange,
            message: "kept".into(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["outcome"], "no_change");
    }
}
