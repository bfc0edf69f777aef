//! Directives applied to one existing object
//!
//! A transformer command replaces rename, delete and touch. Otherwise those
//! run in that order, and each later one is skipped once the object is gone.
//! Attribute fixing always comes last.

use crate::attrs::verify_file_attributes;
use crate::context::RunContext;
use crate::copy::atomic::archive_to_repository;
use crate::exec::expand_promiser;
use crate::mode::ModeMask;
use crate::outcome::Outcome;
use crate::select::{Probe, Selector};
use crate::spec::{AttributeSpec, RenameSpec};
use crate::Result;
use converge_fs::FileMetadata;
use converge_fs::path::with_suffix;
use filetime::FileTime;

/// Apply the leaf directives of `spec` to `meta`.
///
/// `protect` marks the base directory of a depth search, which is never
/// deleted.
pub fn verify_leaf(
    ctx: &RunContext,
    meta: &FileMetadata,
    spec: &AttributeSpec,
    selector: Option<&Selector>,
    protect: bool,
) -> Outcome {
    if let Some(selector) = selector {
        let read_link = |p: &std::path::Path| ctx.fs.read_link(p).ok();
        let probe = Probe {
            read_link: &read_link,
            runner: ctx.runner.as_ref(),
        };
        if !selector.matches(&meta.path, meta, &probe) {
            tracing::debug!(path = %meta.path.display(), "Not selected");
            return Outcome::NoChange;
        }
    }

    let path = &meta.path;
    let mut outcome = Outcome::NoChange;

    if let Some(command) = &spec.transformer {
        outcome = outcome.combine(transform(ctx, meta, command, spec));
    } else {
        let mut present = true;

        if let Some(rename) = &spec.rename {
            let (o, gone) = verify_name(ctx, meta, rename, spec).unwrap_or_else(|e| (ctx.record_error(path, &e), false));
            outcome = outcome.combine(o);
            present = !gone;
        }
        if present && let Some(delete) = &spec.delete {
            let (o, gone) = verify_delete(ctx, meta, delete.rmdirs, protect, spec);
            outcome = outcome.combine(o);
            present = !gone;
        }
        if present && spec.touch {
            outcome = outcome.combine(touch(ctx, meta, spec));
        }
        if !present {
            return outcome;
        }
    }

    if spec.perms.is_some() || spec.changes.is_some() {
        let fresh = match ctx.fs.stat(path, false) {
            Ok(fresh) => fresh,
            Err(e) if e.is_not_found() => return outcome,
            Err(e) => return outcome.combine(ctx.record_error(path, &e.into())),
        };
        outcome = outcome.combine(verify_file_attributes(ctx, &fresh, spec));
    }
    outcome
}

fn transform(ctx: &RunContext, meta: &FileMetadata, command: &str, spec: &AttributeSpec) -> Outcome {
    let path = &meta.path;
    let command = expand_promiser(command, path);

    if spec.is_warn_only() {
        return ctx.record(path, Outcome::Warned, format!("should be transformed with '{command}'"));
    }

    match ctx.runner.run(&command) {
        Ok(output) if output.success() => ctx.record(path, Outcome::Changed, format!("transformed with '{command}'")),
        Ok(output) => ctx.record(
            path,
            Outcome::Failed,
            match output.status {
                Some(code) => format!("transformer '{command}' exited with status {code}"),
                None => format!("transformer '{command}' was killed by a signal"),
            },
        ),
        Err(e) => ctx.record_error(path, &e),
    }
}

/// Rename, disable or rotate. Returns the outcome and whether the object
/// is gone from its original name.
fn verify_name(
    ctx: &RunContext,
    meta: &FileMetadata,
    rename: &RenameSpec,
    spec: &AttributeSpec,
) -> Result<(Outcome, bool)> {
    let path = &meta.path;

    if let Some(newname) = &rename.newname {
        let target = match path.parent() {
            Some(parent) if newname.is_relative() => parent.join(newname),
            _ => newname.clone(),
        };
        if ctx.fs.exists(&target) {
            return Ok((
                ctx.record(
                    path,
                    Outcome::Warned,
                    format!("{} exists; would overwrite saved copy", target.display()),
                ),
                false,
            ));
        }
        if spec.is_warn_only() {
            return Ok((
                ctx.record(path, Outcome::Warned, format!("should be renamed to {}", target.display())),
                false,
            ));
        }
        ctx.fs.rename(path, &target)?;
        return Ok((
            ctx.record(path, Outcome::Changed, format!("renamed to {}", target.display())),
            true,
        ));
    }

    if rename.disable {
        return disable(ctx, meta, rename, spec);
    }

    match rename.rotate {
        Some(0) => truncate(ctx, meta, spec).map(|o| (o, false)),
        Some(keep) => rotate(ctx, meta, keep, spec).map(|o| (o, false)),
        None => Ok((Outcome::NoChange, false)),
    }
}

fn disable(
    ctx: &RunContext,
    meta: &FileMetadata,
    rename: &RenameSpec,
    spec: &AttributeSpec,
) -> Result<(Outcome, bool)> {
    let path = &meta.path;

    if meta.is_symlink() {
        if spec.is_warn_only() {
            return Ok((ctx.record(path, Outcome::Warned, "symbolic link should be disabled"), false));
        }
        ctx.fs.remove_file(path)?;
        return Ok((ctx.record(path, Outcome::Changed, "disabled symbolic link by removing it"), true));
    }
    if meta.is_dir() {
        return Ok((ctx.record(path, Outcome::Failed, "cannot disable a directory"), false));
    }

    let target = with_suffix(path, &rename.disable_suffix);
    if ctx.fs.exists(&target) {
        return Ok((
            ctx.record(
                path,
                Outcome::Warned,
                format!("{} exists; would overwrite saved copy", target.display()),
            ),
            false,
        ));
    }
    if spec.is_warn_only() {
        return Ok((ctx.record(path, Outcome::Warned, "should be disabled"), false));
    }

    let mode = ModeMask::parse(&rename.disable_mode)?.apply(meta.mode);
    ctx.fs.set_permissions(path, mode)?;
    ctx.fs.rename(path, &target)?;
    if let Some(repository) = &ctx.repository {
        archive_to_repository(ctx, &target, repository)?;
    }
    Ok((
        ctx.record(
            path,
            Outcome::Changed,
            format!("disabled as {} with mode {mode:04o}", target.display()),
        ),
        true,
    ))
}

fn truncate(ctx: &RunContext, meta: &FileMetadata, spec: &AttributeSpec) -> Result<Outcome> {
    let path = &meta.path;
    if !meta.is_regular() || meta.size == 0 {
        return Ok(Outcome::NoChange);
    }
    if spec.is_warn_only() {
        return Ok(ctx.record(path, Outcome::Warned, "should be truncated"));
    }
    ctx.fs.create_file(path, meta.mode)?;
    Ok(ctx.record(path, Outcome::Changed, format!("truncated {} bytes", meta.size)))
}

/// Shift `path.1 .. path.(keep-1)` up by one, move the live file to
/// `path.1` and start a fresh empty file with the same mode.
fn rotate(ctx: &RunContext, meta: &FileMetadata, keep: u32, spec: &AttributeSpec) -> Result<Outcome> {
    let path = &meta.path;
    if !meta.is_regular() {
        return Ok(Outcome::NoChange);
    }
    if spec.is_warn_only() {
        return Ok(ctx.record(path, Outcome::Warned, format!("should be rotated, keeping {keep}")));
    }

    for i in (1..keep).rev() {
        let older = with_suffix(path, &format!(".{i}"));
        if ctx.fs.exists(&older) {
            ctx.fs.rename(&older, &with_suffix(path, &format!(".{}", i + 1)))?;
        }
    }
    ctx.fs.rename(path, &with_suffix(path, ".1"))?;
    ctx.fs.create_file(path, meta.mode)?;
    Ok(ctx.record(path, Outcome::Changed, format!("rotated, keeping {keep}")))
}

/// Returns the outcome and whether the object was removed.
fn verify_delete(
    ctx: &RunContext,
    meta: &FileMetadata,
    rmdirs: bool,
    protect: bool,
    spec: &AttributeSpec,
) -> (Outcome, bool) {
    let path = &meta.path;

    if meta.is_dir() {
        if protect {
            tracing::debug!(path = %path.display(), "Not deleting the base of a depth search");
            return (Outcome::NoChange, false);
        }
        if !rmdirs {
            tracing::debug!(path = %path.display(), "Keeping directory; rmdirs is off");
            return (Outcome::NoChange, false);
        }
    }

    if spec.is_warn_only() {
        return (ctx.record(path, Outcome::Warned, format!("{} should be deleted", meta.file_type)), false);
    }

    let removed = if meta.is_dir() {
        ctx.fs.remove_dir(path)
    } else {
        ctx.fs.remove_file(path)
    };
    match removed {
        Ok(()) => (ctx.record(path, Outcome::Changed, format!("deleted {}", meta.file_type)), true),
        Err(e) => (ctx.record_error(path, &e.into()), false),
    }
}

fn touch(ctx: &RunContext, meta: &FileMetadata, spec: &AttributeSpec) -> Outcome {
    let path = &meta.path;
    if spec.is_warn_only() {
        return ctx.record(path, Outcome::Warned, "should be touched");
    }
    let now = FileTime::now();
    match ctx.fs.set_times(path, now, now) {
        Ok(()) => ctx.record(path, Outcome::Changed, "touched"),
        Err(e) => ctx.record_error(path, &e.into()),
    }
}
