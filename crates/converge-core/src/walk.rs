//! Recursive reconciliation
//!
//! Two walks live here. [`CopyJob::copy_tree`] mirrors a source tree read
//! through a transport into a destination directory, purging untracked
//! entries when asked. [`depth_search`] visits every object below a local
//! base directory so leaf directives (delete, rename, permissions, change
//! tracking) can be applied to each.
//!
//! Both descend by explicit recursion. Every directory's identity is
//! captured before entering it and re-checked through the run's
//! [`converge_fs::DescentGuard`] on entry and again after each child
//! returns; a mismatch aborts the whole run.

use crate::context::RunContext;
use crate::copy::CopyJob;
use crate::links::kill_ghost_link;
use crate::outcome::Outcome;
use crate::purge::purge_untracked;
use crate::select::anchored;
use crate::spec::{AttributeSpec, RecursionPolicy};
use crate::{Error, Result};
use crate::attrs::verify_copied_attributes;
use converge_fs::path::leaf_name;
use converge_fs::security::{crosses_device, link_owner_trusted};
use converge_fs::{DirIdentity, FileMetadata};
use regex::Regex;
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::Path;

/// Whether the directory `name` passes the include/exclude filters.
fn dir_allowed(name: &str, include: &[Regex], exclude: &[Regex]) -> bool {
    if exclude.iter().any(|re| re.is_match(name)) {
        return false;
    }
    include.is_empty() || include.iter().any(|re| re.is_match(name))
}

fn check_limit(ctx: &RunContext, path: &Path, level: usize) -> Result<()> {
    if level > ctx.recursion_limit {
        tracing::error!(path = %path.display(), level, "Recursion limit exceeded");
        return Err(Error::RecursionLimit {
            path: path.to_path_buf(),
            limit: ctx.recursion_limit,
        });
    }
    Ok(())
}

/// What a copy walk produced below one directory.
#[derive(Debug, Clone, Copy)]
struct Copied {
    outcome: Outcome,
    /// The connection dropped before every entry was enumerated, so the
    /// set of source names is incomplete.
    interrupted: bool,
}

impl Copied {
    fn new() -> Self {
        Self {
            outcome: Outcome::NoChange,
            interrupted: false,
        }
    }

    fn add(&mut self, outcome: Outcome) {
        self.outcome = self.outcome.combine(outcome);
    }

    fn absorb(&mut self, other: Copied) {
        self.add(other.outcome);
        self.interrupted |= other.interrupted;
    }
}

impl CopyJob<'_> {
    /// Copy the entries of source directory `from` into the existing
    /// directory `to`, whose identity was captured as `dest_id`.
    ///
    /// `remaining` is the number of levels still to copy (`None` is
    /// unbounded); `root` identifies the source root for device checks.
    pub(crate) fn copy_tree(
        &self,
        from: &Path,
        to: &Path,
        dest_id: DirIdentity,
        remaining: Option<usize>,
        level: usize,
        root: DirIdentity,
    ) -> Result<Outcome> {
        Ok(self.copy_subtree(from, to, dest_id, remaining, level, root)?.outcome)
    }

    fn copy_subtree(
        &self,
        from: &Path,
        to: &Path,
        dest_id: DirIdentity,
        remaining: Option<usize>,
        level: usize,
        root: DirIdentity,
    ) -> Result<Copied> {
        if remaining == Some(0) {
            return Ok(Copied::new());
        }
        check_limit(self.ctx, from, level)?;

        let mut seen = HashSet::new();
        let mut copied = self.copy_level(from, to, dest_id, remaining, level, root, &mut seen)?;

        if self.policy.purge {
            if copied.interrupted {
                tracing::warn!(dest = %to.display(), "Source listing incomplete; not purging");
            } else {
                copied.add(purge_untracked(self.ctx, self.transport, to, &seen, self.spec));
            }
        }
        Ok(copied)
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_level(
        &self,
        from: &Path,
        to: &Path,
        dest_id: DirIdentity,
        remaining: Option<usize>,
        level: usize,
        root: DirIdentity,
        seen: &mut HashSet<OsString>,
    ) -> Result<Copied> {
        let ctx = self.ctx;
        let recursion = self.spec.recursion().cloned().unwrap_or_default();
        let mut copied = Copied::new();

        ctx.guard.verify(&ctx.fs, to, dest_id)?;

        if !self.transport.is_established() {
            copied.interrupted = true;
            copied.add(ctx.record(
                from,
                Outcome::Interrupted,
                format!("connection to {} lost; not descending", self.transport.server()),
            ));
            return Ok(copied);
        }

        for name in self.transport.read_dir(from)? {
            if !self.transport.is_established() {
                copied.interrupted = true;
                copied.add(ctx.record(
                    from,
                    Outcome::Interrupted,
                    format!("connection to {} lost mid-walk", self.transport.server()),
                ));
                break;
            }
            seen.insert(name.clone());

            let source_path = from.join(&name);
            let dest_path = to.join(&name);

            let entry = match self.stat_entry(&source_path, &recursion) {
                Ok(entry) => entry,
                Err(e) => {
                    copied.add(ctx.record_error(&source_path, &e));
                    continue;
                }
            };
            let (meta, via_link) = entry;

            if !recursion.cross_device && crosses_device(root, &meta) {
                tracing::debug!(path = %source_path.display(), "Skipping entry on another device");
                continue;
            }

            if !meta.is_dir() {
                copied.add(self.copy_entry(&meta, &dest_path));
                continue;
            }

            if via_link {
                tracing::warn!(path = %source_path.display(), "Pruning directory reached through a symbolic link");
                continue;
            }
            if !dir_allowed(&name.to_string_lossy(), &self.include_dirs, &self.exclude_dirs) {
                tracing::debug!(path = %source_path.display(), "Directory filtered out");
                continue;
            }

            let next = remaining.map(|r| r - 1);
            if self.policy.collapse {
                copied.absorb(self.copy_level_nested(&source_path, to, dest_id, next, level + 1, root, seen)?);
                continue;
            }

            let (made, proceed) = self.ensure_dest_dir(&dest_path, meta.mode)?;
            copied.add(made);
            if !proceed {
                continue;
            }
            if let Ok(fresh) = ctx.fs.stat(&dest_path, false) {
                copied.add(verify_copied_attributes(ctx, &fresh, &meta, self.spec));
            }
            let child_id = ctx.fs.dir_identity(&dest_path)?;
            copied.absorb(self.copy_subtree(&source_path, &dest_path, child_id, next, level + 1, root)?);
            ctx.guard.verify(&ctx.fs, to, dest_id)?;
        }

        Ok(copied)
    }

    /// Collapse mode: copy a nested source directory's entries into the same
    /// destination, sharing the name set of the enclosing level.
    #[allow(clippy::too_many_arguments)]
    fn copy_level_nested(
        &self,
        from: &Path,
        to: &Path,
        dest_id: DirIdentity,
        remaining: Option<usize>,
        level: usize,
        root: DirIdentity,
        seen: &mut HashSet<OsString>,
    ) -> Result<Copied> {
        if remaining == Some(0) {
            return Ok(Copied::new());
        }
        check_limit(self.ctx, from, level)?;
        self.copy_level(from, to, dest_id, remaining, level, root, seen)
    }

    /// Stat a source entry, following the link when traversal or the
    /// `copy_links` patterns ask for it. Also reports whether the entry
    /// itself is a symbolic link.
    fn stat_entry(&self, path: &Path, recursion: &RecursionPolicy) -> Result<(FileMetadata, bool)> {
        let lstat = self.transport.stat(path, false)?;
        if !lstat.is_symlink() {
            return Ok((lstat, false));
        }
        if recursion.traverse_links || self.follows_link(path) {
            return Ok((self.transport.stat(path, true)?, true));
        }
        Ok((lstat, true))
    }
}

/// Visit every object below `base`, depth first, calling `visit` on each.
///
/// Directories are visited after their contents. The base itself is not
/// visited. Returns the folded outcome of all visits.
pub fn depth_search(
    ctx: &RunContext,
    base: &Path,
    spec: &AttributeSpec,
    visit: &mut dyn FnMut(&FileMetadata) -> Outcome,
) -> Result<Outcome> {
    let recursion = spec.recursion().cloned().unwrap_or_default();
    let include = recursion
        .include_dirs
        .iter()
        .map(|p| anchored(p))
        .collect::<Result<Vec<_>>>()?;
    let exclude = recursion
        .exclude_dirs
        .iter()
        .map(|p| anchored(p))
        .collect::<Result<Vec<_>>>()?;

    let base_meta = ctx.fs.stat(base, true)?;
    let identity = DirIdentity::of(&base_meta);
    let walker = DepthSearch {
        ctx,
        spec,
        recursion: &recursion,
        include,
        exclude,
        root: identity,
    };
    walker.walk(base, identity, 1, visit)
}

struct DepthSearch<'a> {
    ctx: &'a RunContext,
    spec: &'a AttributeSpec,
    recursion: &'a RecursionPolicy,
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    root: DirIdentity,
}

impl DepthSearch<'_> {
    fn walk(
        &self,
        dir: &Path,
        identity: DirIdentity,
        level: usize,
        visit: &mut dyn FnMut(&FileMetadata) -> Outcome,
    ) -> Result<Outcome> {
        let ctx = self.ctx;
        check_limit(ctx, dir, level)?;
        ctx.guard.verify(&ctx.fs, dir, identity)?;

        let mut outcome = Outcome::NoChange;
        for name in ctx.fs.read_dir_names(dir)? {
            if ctx.is_aborted() {
                return Err(Error::Aborted { path: dir.to_path_buf() });
            }

            let path = dir.join(&name);
            let meta = match ctx.fs.stat(&path, false) {
                Ok(meta) => meta,
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    outcome = outcome.combine(ctx.record_error(&path, &e.into()));
                    continue;
                }
            };

            let target = if meta.is_symlink() {
                match self.resolve_link(&meta) {
                    LinkStep::Visit => {
                        outcome = outcome.combine(visit(&meta));
                        continue;
                    }
                    LinkStep::Done(o) => {
                        outcome = outcome.combine(o);
                        continue;
                    }
                    LinkStep::Descend(target) => target,
                }
            } else if meta.is_dir() {
                meta.clone()
            } else {
                outcome = outcome.combine(visit(&meta));
                continue;
            };

            if !self.recursion.cross_device && crosses_device(self.root, &target) {
                tracing::debug!(path = %path.display(), "Not crossing device boundary");
                continue;
            }
            if !dir_allowed(&leaf_name(&path), &self.include, &self.exclude) {
                tracing::debug!(path = %path.display(), "Directory filtered out");
                continue;
            }

            if self.recursion.depth.is_none_or(|d| level < d) {
                outcome = outcome.combine(self.walk(&path, DirIdentity::of(&target), level + 1, visit)?);
                ctx.guard.verify(&ctx.fs, dir, identity)?;
            } else {
                tracing::debug!(path = %path.display(), level, "Depth reached, not descending");
            }

            outcome = outcome.combine(visit(&meta));
        }

        Ok(outcome)
    }

    fn resolve_link(&self, meta: &FileMetadata) -> LinkStep {
        let ctx = self.ctx;
        let path = &meta.path;

        let target = match ctx.fs.stat(path, true) {
            Ok(target) => target,
            Err(_) if self.recursion.rmdeadlinks => {
                return LinkStep::Done(kill_ghost_link(ctx, self.spec, path));
            }
            Err(_) => return LinkStep::Visit,
        };

        if !self.recursion.traverse_links || !target.is_dir() {
            return LinkStep::Visit;
        }
        if !link_owner_trusted(meta.uid) {
            return LinkStep::Done(ctx.record(
                path,
                Outcome::Warned,
                format!("symbolic link owned by uid {} is not trusted; not traversing", meta.uid),
            ));
        }
        LinkStep::Descend(target)
    }
}

enum LinkStep {
    Visit,
    Done(Outcome),
    Descend(FileMetadata),
}
