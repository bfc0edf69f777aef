//! Run configuration and run-scoped state
//!
//! A [`RunContext`] owns everything that lives for exactly one agent run:
//! the filesystem facade (live or sandboxed), the hard-link registry, the
//! setuid audit, the change tracker, the connection cache and the
//! single-copy cache. Nothing here is process-global, so several runs can
//! coexist in one process (tests do this constantly).

use crate::audit::SetuidAudit;
use crate::changes::ChangeTracker;
use crate::exec::{CommandRunner, ShellRunner};
use crate::hardlink::HardLinkRegistry;
use crate::outcome::Outcome;
use crate::report::{Reporter, TracingReporter};
use crate::select::anchored;
use crate::transport::{ConnectionCache, Connector, NoRemote};
use crate::{Error, Result};
use chrono::{DateTime, Local};
use converge_fs::{DescentGuard, StagedFs, StatDescentGuard};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Hard ceiling on directory nesting for any walk.
pub const DEFAULT_RECURSION_LIMIT: usize = 100;

/// Agent-level settings that apply to every promise of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Stage every mutation under this directory instead of the live tree.
    pub sandbox_root: Option<PathBuf>,
    /// Newline-delimited list of known setuid/setgid root files.
    pub setuid_log: Option<PathBuf>,
    /// TOML digest database used by change tracking.
    pub change_db: Option<PathBuf>,
    /// Default archive directory for copy backups.
    pub repository: Option<PathBuf>,
    /// Destinations matching these patterns are copied at most once per run.
    pub single_copy: Vec<String>,
    pub recursion_limit: usize,
    /// Override the uid-0 check that decides whether ownership is enforced.
    pub privileged: Option<bool>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            sandbox_root: None,
            setuid_log: None,
            change_db: None,
            repository: None,
            single_copy: Vec::new(),
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            privileged: None,
        }
    }
}

/// State shared by every operation of one run.
pub struct RunContext {
    pub fs: StagedFs,
    pub reporter: Arc<dyn Reporter>,
    pub runner: Arc<dyn CommandRunner>,
    pub connector: Arc<dyn Connector>,
    pub connections: ConnectionCache,
    pub hardlinks: HardLinkRegistry,
    pub setuid: SetuidAudit,
    pub changes: ChangeTracker,
    pub guard: Arc<dyn DescentGuard>,
    pub repository: Option<PathBuf>,
    pub recursion_limit: usize,
    pub privileged: bool,
    pub started: DateTime<Local>,
    single_copy: Vec<Regex>,
    copied_once: Mutex<HashSet<PathBuf>>,
    aborted: AtomicBool,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("fs", &self.fs)
            .field("connections", &self.connections)
            .field("recursion_limit", &self.recursion_limit)
            .field("privileged", &self.privileged)
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    /// A context acting on the live filesystem with in-memory persistence.
    pub fn new() -> Self {
        Self {
            fs: StagedFs::direct(),
            reporter: Arc::new(TracingReporter),
            runner: Arc::new(ShellRunner),
            connector: Arc::new(NoRemote),
            connections: ConnectionCache::new(),
            hardlinks: HardLinkRegistry::new(),
            setuid: SetuidAudit::in_memory(),
            changes: ChangeTracker::in_memory(),
            guard: Arc::new(StatDescentGuard),
            repository: None,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            privileged: nix::unistd::geteuid().is_root(),
            started: Local::now(),
            single_copy: Vec::new(),
            copied_once: Mutex::new(HashSet::new()),
            aborted: AtomicBool::new(false),
        }
    }

    /// Build a context from `config`, opening the sandbox and loading the
    /// persisted audit list and change database.
    pub fn from_config(config: &RunConfig) -> Result<Self> {
        let mut ctx = Self::new();

        if let Some(root) = &config.sandbox_root {
            ctx.fs = StagedFs::sandboxed(root)?;
            tracing::info!(root = %root.display(), "Staging changes in sandbox");
        }
        if let Some(log) = &config.setuid_log {
            ctx.setuid = SetuidAudit::load(log)?;
        }
        if let Some(db) = &config.change_db {
            ctx.changes = ChangeTracker::load(db)?;
        }
        if let Some(privileged) = config.privileged {
            ctx.privileged = privileged;
        }

        ctx.repository = config.repository.clone();
        ctx.recursion_limit = config.recursion_limit;
        ctx.single_copy = config
            .single_copy
            .iter()
            .map(|p| anchored(p))
            .collect::<Result<_>>()?;

        Ok(ctx)
    }

    pub fn with_fs(mut self, fs: StagedFs) -> Self {
        self.fs = fs;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_guard(mut self, guard: Arc<dyn DescentGuard>) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    pub fn with_single_copy(mut self, patterns: &[&str]) -> Result<Self> {
        self.single_copy = patterns
            .iter()
            .map(|p| anchored(p))
            .collect::<Result<_>>()?;
        Ok(self)
    }

    /// Report `outcome` for `path` and hand it back for folding.
    pub fn record(&self, path: &Path, outcome: Outcome, message: impl AsRef<str>) -> Outcome {
        self.reporter.report(path, outcome, message.as_ref());
        outcome
    }

    /// Report an error for `path` and map it to an outcome. Fatal errors
    /// also mark the run aborted.
    pub fn record_error(&self, path: &Path, err: &Error) -> Outcome {
        if err.is_fatal() {
            self.abort();
        }
        let outcome = match err {
            Error::Transport(e) if e.is_disconnect() => Outcome::Interrupted,
            _ => Outcome::Failed,
        };
        self.record(path, outcome, err.to_string())
    }

    pub fn abort(&self) {
        if !self.aborted.swap(true, Ordering::SeqCst) {
            tracing::error!("Security failure, aborting the remainder of the run");
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Whether `dest` is single-copy and was already copied this run.
    pub fn already_copied(&self, dest: &Path) -> bool {
        self.copied_once
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(dest)
    }

    /// Remember `dest` if it matches a single-copy pattern.
    pub fn note_copied(&self, dest: &Path) {
        let text = dest.to_string_lossy();
        if self.single_copy.iter().any(|re| re.is_match(&text)) {
            self.copied_once
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(dest.to_path_buf());
        }
    }

    /// Persist audit and change state, drop run-scoped caches and close
    /// connections.
    pub fn finish(&self) -> Result<()> {
        self.hardlinks.clear();
        self.connections.close_all();
        self.setuid.save()?;
        self.changes.save()?;
        Ok(())
    }
}
