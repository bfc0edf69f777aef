//! Copy reconciliation
//!
//! [`reconcile_copy`] brings a destination in line with a copy source. A
//! [`CopyJob`] carries everything one copy promise needs (the leased
//! transport, the compiled selection and link patterns) and is driven once
//! per source entry, either directly for a single file or by the tree walk
//! in [`crate::walk`].

pub mod atomic;
pub mod compare;

use crate::attrs::verify_copied_attributes;
use crate::context::RunContext;
use crate::hardlink::DevIno;
use crate::links;
use crate::outcome::Outcome;
use crate::select::{Probe, Selector, anchored};
use crate::spec::{AttributeSpec, CopyPolicy, LinkPolicy, WhenNoFile};
use crate::transport::Transport;
use crate::{Error, Result};
use converge_fs::path::{canonical_or_lexical, leaf_name};
use converge_fs::{DirIdentity, FileMetadata, FileType};
use filetime::FileTime;
use regex::Regex;
use std::path::{Path, PathBuf};

pub use atomic::{NEW_SUFFIX, SAVED_SUFFIX, transfer};
pub use compare::needs_update;

/// One copy promise bound to its source transport.
pub struct CopyJob<'a> {
    pub(crate) ctx: &'a RunContext,
    pub(crate) transport: &'a dyn Transport,
    pub(crate) spec: &'a AttributeSpec,
    pub(crate) policy: &'a CopyPolicy,
    selector: Option<Selector>,
    link_instead: Vec<Regex>,
    copy_links: Vec<Regex>,
    pub(crate) include_dirs: Vec<Regex>,
    pub(crate) exclude_dirs: Vec<Regex>,
}

impl std::fmt::Debug for CopyJob<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyJob")
            .field("server", &self.transport.server())
            .field("policy", self.policy)
            .finish_non_exhaustive()
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns.iter().map(|p| anchored(p)).collect()
}

impl<'a> CopyJob<'a> {
    pub fn new(ctx: &'a RunContext, transport: &'a dyn Transport, spec: &'a AttributeSpec) -> Result<Self> {
        let policy = spec
            .copy
            .as_ref()
            .ok_or_else(|| Error::invalid_spec("", "copy job without a copy policy"))?;
        let (include_dirs, exclude_dirs) = match spec.recursion() {
            Some(r) => (compile_all(&r.include_dirs)?, compile_all(&r.exclude_dirs)?),
            None => (Vec::new(), Vec::new()),
        };

        Ok(Self {
            ctx,
            transport,
            spec,
            policy,
            selector: spec.select.as_ref().map(Selector::compile).transpose()?,
            link_instead: compile_all(&policy.link_instead)?,
            copy_links: compile_all(&policy.copy_links)?,
            include_dirs,
            exclude_dirs,
        })
    }

    fn selected(&self, source: &FileMetadata) -> bool {
        let Some(selector) = &self.selector else {
            return true;
        };
        let read_link = |p: &Path| self.transport.read_link(p).ok();
        let probe = Probe {
            read_link: &read_link,
            runner: self.ctx.runner.as_ref(),
        };
        selector.matches(&source.path, source, &probe)
    }

    /// Whether the leaf name of `path` asks for its symlink to be followed.
    pub(crate) fn follows_link(&self, path: &Path) -> bool {
        let leaf = leaf_name(path);
        self.copy_links.iter().any(|re| re.is_match(&leaf))
    }

    /// The first destination of a hard-linked source other than `dest`.
    fn linked_twin(&self, source: &FileMetadata, dest: &Path) -> Option<PathBuf> {
        if !source.is_regular() || source.nlink < 2 {
            return None;
        }
        self.ctx
            .hardlinks
            .existing(DevIno::new(source.dev, source.ino))
            .filter(|first| first != dest)
    }

    /// Reconcile one non-directory source entry onto `dest`.
    pub fn copy_entry(&self, source: &FileMetadata, dest: &Path) -> Outcome {
        match self.try_copy_entry(source, dest) {
            Ok(outcome) => outcome,
            Err(e) => self.ctx.record_error(dest, &e),
        }
    }

    fn try_copy_entry(&self, source: &FileMetadata, dest: &Path) -> Result<Outcome> {
        let ctx = self.ctx;

        if self.transport.is_local() && canonical_or_lexical(&source.path) == canonical_or_lexical(dest) {
            return Ok(ctx.record(
                dest,
                Outcome::Failed,
                "source and destination are the same file; refusing to copy onto itself",
            ));
        }

        if !self.selected(source) {
            tracing::debug!(source = %source.path.display(), "Source not selected");
            return Ok(Outcome::NoChange);
        }

        if ctx.already_copied(dest) {
            tracing::debug!(dest = %dest.display(), "Already copied once this run");
            return Ok(Outcome::NoChange);
        }

        let leaf = leaf_name(&source.path);
        if self.link_instead.iter().any(|re| re.is_match(&leaf)) {
            if self.follows_link(&source.path) {
                return Ok(ctx.record(
                    dest,
                    Outcome::Warned,
                    format!("{leaf} matches both link_instead and copy_links; skipping promise loop"),
                ));
            }
            return self.link_copy(source, dest);
        }

        let mut current = match ctx.fs.stat(dest, false) {
            Ok(meta) => Some(meta),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        if let Some(found) = &current
            && found.is_symlink()
            && !source.is_symlink()
        {
            if self.policy.type_check {
                return Ok(ctx.record(
                    dest,
                    Outcome::Failed,
                    format!("is a symbolic link but the source is a {}", source.file_type),
                ));
            }
            if self.spec.is_warn_only() {
                return Ok(ctx.record(dest, Outcome::Warned, "symbolic link should be replaced by a copy"));
            }
            ctx.fs.remove_file(dest)?;
            tracing::info!(dest = %dest.display(), "Removed symbolic link in the way of a copy");
            current = None;
        }

        if source.is_regular() && !self.size_permitted(source.size) {
            return Ok(ctx.record(
                dest,
                Outcome::NoChange,
                format!(
                    "source size {} is outside the permitted range; not copying",
                    source.size
                ),
            ));
        }

        match current {
            None => self.create_missing(source, dest),
            Some(found) => self.refresh_existing(source, &found),
        }
    }

    fn size_permitted(&self, size: u64) -> bool {
        self.policy.min_size.is_none_or(|min| size >= min) && self.policy.max_size.is_none_or(|max| size <= max)
    }

    fn create_missing(&self, source: &FileMetadata, dest: &Path) -> Result<Outcome> {
        let ctx = self.ctx;

        if self.spec.is_warn_only() {
            return Ok(ctx.record(
                dest,
                Outcome::Warned,
                format!("missing; should be copied from {}", source.path.display()),
            ));
        }

        if let Some(parent) = dest.parent()
            && !parent.as_os_str().is_empty()
        {
            ctx.fs.create_dir_all(parent, 0o755)?;
        }

        match source.file_type {
            FileType::Regular => {
                let outcome = self.copy_regular(source, dest)?;
                Ok(outcome.combine(self.after_copy(source, dest)?))
            }
            FileType::Symlink => self.link_copy(source, dest),
            FileType::Fifo | FileType::Socket | FileType::CharDevice | FileType::BlockDevice => {
                self.make_special(source, dest)
            }
            FileType::Directory | FileType::Door => Ok(ctx.record(
                dest,
                Outcome::Failed,
                format!("cannot copy a {} as a single entry", source.file_type),
            )),
        }
    }

    fn refresh_existing(&self, source: &FileMetadata, found: &FileMetadata) -> Result<Outcome> {
        let ctx = self.ctx;
        let dest = found.path.as_path();

        if self.policy.type_check && !source.is_symlink() && found.file_type != source.file_type {
            return Ok(ctx.record(
                dest,
                Outcome::Failed,
                format!(
                    "is a {} but the source is a {}",
                    found.file_type, source.file_type
                ),
            ));
        }

        let out_of_date = self.policy.force_update
            || self.breaks_hardlink(source, found)
            || needs_update(ctx, self.transport, source, found, self.policy.compare)?;

        if out_of_date && !source.is_symlink() {
            if self.spec.is_warn_only() {
                return Ok(ctx.record(
                    dest,
                    Outcome::Warned,
                    format!("out of date; should be copied from {}", source.path.display()),
                ));
            }
            return match source.file_type {
                FileType::Regular => {
                    let outcome = self.copy_regular(source, dest)?;
                    Ok(outcome.combine(self.after_copy(source, dest)?))
                }
                FileType::Fifo | FileType::Socket | FileType::CharDevice | FileType::BlockDevice => {
                    ctx.fs.remove_file(dest)?;
                    self.make_special(source, dest)
                }
                FileType::Directory | FileType::Door | FileType::Symlink => Ok(ctx.record(
                    dest,
                    Outcome::Failed,
                    format!("cannot refresh a {} as a single entry", source.file_type),
                )),
            };
        }

        if source.is_symlink() {
            return self.link_copy(source, dest);
        }

        let outcome = verify_copied_attributes(ctx, found, source, self.spec);
        if found.is_regular() {
            self.remember_twin(source, dest);
        }
        ctx.note_copied(dest);
        Ok(outcome.combine(ctx.record(dest, Outcome::NoChange, "up to date with its source")))
    }

    /// Whether `found` should be a hard link to an earlier destination but
    /// is a separate file.
    fn breaks_hardlink(&self, source: &FileMetadata, found: &FileMetadata) -> bool {
        let Some(first) = self.linked_twin(source, &found.path) else {
            return false;
        };
        match self.ctx.fs.stat(&first, false) {
            Ok(twin) => (twin.dev, twin.ino) != (found.dev, found.ino),
            Err(_) => false,
        }
    }

    /// Make `dest` the link target for later names of a multiply-linked
    /// source. Only called once `dest` holds the source content.
    fn remember_twin(&self, source: &FileMetadata, dest: &Path) {
        if !source.is_regular() || source.nlink < 2 {
            return;
        }
        let key = DevIno::new(source.dev, source.ino);
        if self.ctx.hardlinks.existing(key).is_none() {
            self.ctx.hardlinks.record(key, dest);
        }
    }

    /// Materialize a regular file: hard link to an already copied twin, or
    /// a full transaction.
    fn copy_regular(&self, source: &FileMetadata, dest: &Path) -> Result<Outcome> {
        let ctx = self.ctx;

        if let Some(first) = self.linked_twin(source, dest) {
            if ctx.fs.exists(dest) {
                ctx.fs.remove_file(dest)?;
            }
            ctx.fs.hard_link(&first, dest)?;
            return Ok(ctx.record(
                dest,
                Outcome::Changed,
                format!("hard-linked to {}, which shares the source inode", first.display()),
            ));
        }

        let outcome = transfer(ctx, self.transport, source, dest, self.policy)?;
        self.remember_twin(source, dest);
        if self.policy.preserve {
            ctx.fs.set_times(
                dest,
                FileTime::from_unix_time(source.atime, 0),
                FileTime::from_unix_time(source.mtime, 0),
            )?;
        }
        Ok(outcome.combine(ctx.record(
            dest,
            Outcome::Changed,
            format!("copied from {}:{}", self.transport.server(), source.path.display()),
        )))
    }

    fn after_copy(&self, source: &FileMetadata, dest: &Path) -> Result<Outcome> {
        let fresh = self.ctx.fs.stat(dest, false)?;
        self.ctx.note_copied(dest);
        Ok(verify_copied_attributes(self.ctx, &fresh, source, self.spec))
    }

    fn make_special(&self, source: &FileMetadata, dest: &Path) -> Result<Outcome> {
        let ctx = self.ctx;
        match source.file_type {
            FileType::Fifo => ctx.fs.mkfifo(dest, source.mode)?,
            other => ctx.fs.mknod(dest, other, source.mode, source.rdev)?,
        }
        Ok(ctx.record(dest, Outcome::Changed, format!("created {}", source.file_type)))
    }

    /// Reproduce `source` at `dest` as a link instead of a copy. A symlink
    /// source is reproduced with its own target.
    fn link_copy(&self, source: &FileMetadata, dest: &Path) -> Result<Outcome> {
        let target = if source.is_symlink() {
            self.transport.read_link(&source.path)?
        } else {
            source.path.clone()
        };
        let policy = LinkPolicy {
            source: target,
            link_type: self.policy.link_type,
            when_no_file: WhenNoFile::Force,
            ..LinkPolicy::default()
        };
        links::verify_link_kind(self.ctx, dest, &policy, self.spec)
    }

    /// Make sure `to` is a directory that can receive copied entries.
    ///
    /// Returns the outcome so far and whether the walk may go on.
    pub(crate) fn ensure_dest_dir(&self, to: &Path, mode: u32) -> Result<(Outcome, bool)> {
        let ctx = self.ctx;
        match ctx.fs.stat(to, false) {
            Ok(meta) if meta.is_dir() => Ok((Outcome::NoChange, true)),
            Ok(meta) => {
                if !self.spec.move_obstructions {
                    let outcome = ctx.record(
                        to,
                        Outcome::Failed,
                        format!("a {} stands where a directory should be", meta.file_type),
                    );
                    return Ok((outcome, false));
                }
                let moved = links::move_obstruction(ctx, &meta, self.spec)?;
                if moved != Outcome::Changed {
                    return Ok((moved, false));
                }
                ctx.fs.create_dir(to, mode)?;
                Ok((
                    moved.combine(ctx.record(to, Outcome::Changed, "created directory")),
                    true,
                ))
            }
            Err(e) if e.is_not_found() => {
                if self.spec.is_warn_only() {
                    return Ok((ctx.record(to, Outcome::Warned, "directory missing; should be created"), false));
                }
                if let Some(parent) = to.parent()
                    && !parent.as_os_str().is_empty()
                {
                    ctx.fs.create_dir_all(parent, 0o755)?;
                }
                ctx.fs.create_dir(to, mode)?;
                Ok((ctx.record(to, Outcome::Changed, "created directory"), true))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Reconcile `dest` against the copy policy of `spec`.
pub fn reconcile_copy(ctx: &RunContext, dest: &Path, spec: &AttributeSpec) -> Result<Outcome> {
    let Some(policy) = &spec.copy else {
        return Ok(Outcome::NoChange);
    };

    let lease = ctx
        .connections
        .acquire(ctx.connector.as_ref(), &policy.servers, policy.background)?;

    if policy.purge && !lease.is_authenticated() {
        return Ok(ctx.record(
            dest,
            Outcome::Denied,
            format!(
                "source {} is not authenticated; refusing a purging copy",
                lease.server()
            ),
        ));
    }

    let source = match lease.stat(&policy.source, true) {
        Ok(meta) => meta,
        Err(e) if e.is_not_found() => {
            return Ok(ctx.record(
                dest,
                Outcome::Failed,
                format!("copy source {} does not exist on {}", policy.source.display(), lease.server()),
            ));
        }
        Err(e) => return Err(e.into()),
    };

    let job = CopyJob::new(ctx, &*lease, spec)?;

    if !source.is_dir() {
        return Ok(job.copy_entry(&source, dest));
    }

    let (mut outcome, proceed) = job.ensure_dest_dir(dest, source.mode)?;
    if !proceed {
        return Ok(outcome);
    }

    let remaining = spec.recursion().map_or(Some(0), |r| r.depth);
    let dest_id = ctx.fs.dir_identity(dest)?;
    outcome = outcome.combine(job.copy_tree(&source.path, dest, dest_id, remaining, 1, DirIdentity::of(&source))?);

    let fresh = ctx.fs.stat(dest, false)?;
    Ok(outcome.combine(verify_copied_attributes(ctx, &fresh, &source, spec)))
}
