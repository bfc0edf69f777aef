//! Purging destination entries that have no counterpart at the source

use crate::context::RunContext;
use crate::copy::SAVED_SUFFIX;
use crate::outcome::Outcome;
use crate::spec::AttributeSpec;
use crate::transport::Transport;
use crate::Result;
use converge_fs::{DirIdentity, FileType};
use converge_fs::path::is_suspiciously_short;
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::Path;

/// Remove every entry of `dir` whose name is not in `keep`.
///
/// Refused outright for suspiciously short roots and for sources that did
/// not authenticate. Copy backups are never purged.
pub fn purge_untracked(
    ctx: &RunContext,
    transport: &dyn Transport,
    dir: &Path,
    keep: &HashSet<OsString>,
    spec: &AttributeSpec,
) -> Outcome {
    if is_suspiciously_short(dir) {
        return ctx.record(dir, Outcome::Denied, "refusing to purge a suspiciously short path");
    }
    if !transport.is_authenticated() {
        return ctx.record(
            dir,
            Outcome::Denied,
            format!("source {} is not authenticated; not purging", transport.server()),
        );
    }
    if spec.recursion().is_none() {
        tracing::debug!(dir = %dir.display(), "Purge needs a recursive copy; skipping");
        return Outcome::NoChange;
    }

    let names = match ctx.fs.read_dir_names(dir) {
        Ok(names) => names,
        Err(e) => return ctx.record_error(dir, &e.into()),
    };

    let mut outcome = Outcome::NoChange;
    for name in names {
        if keep.contains(&name) || name.to_string_lossy().ends_with(SAVED_SUFFIX) {
            continue;
        }
        let path = dir.join(&name);

        if spec.is_warn_only() {
            outcome = outcome.combine(ctx.record(&path, Outcome::Warned, "not in the source; should be purged"));
            continue;
        }

        outcome = outcome.combine(match remove_entry(ctx, &path) {
            Ok(file_type) => ctx.record(&path, Outcome::Changed, format!("purged untracked {file_type}")),
            Err(e) => ctx.record_error(&path, &e),
        });
    }
    outcome
}

fn remove_entry(ctx: &RunContext, path: &Path) -> Result<FileType> {
    let meta = ctx.fs.stat(path, false)?;
    if meta.is_dir() {
        remove_guarded(ctx, path, DirIdentity::of(&meta))?;
    } else {
        ctx.fs.remove_file(path)?;
    }
    Ok(meta.file_type)
}

/// Empty and remove a directory, re-checking its identity around each
/// nested removal.
fn remove_guarded(ctx: &RunContext, dir: &Path, identity: DirIdentity) -> Result<()> {
    ctx.guard.verify(&ctx.fs, dir, identity)?;
    for name in ctx.fs.read_dir_names(dir)? {
        let path = dir.join(name);
        let meta = ctx.fs.stat(&path, false)?;
        if meta.is_dir() {
            remove_guarded(ctx, &path, DirIdentity::of(&meta))?;
            ctx.guard.verify(&ctx.fs, dir, identity)?;
        } else {
            ctx.fs.remove_file(&path)?;
        }
    }
    ctx.fs.remove_dir(dir)?;
    Ok(())
}
