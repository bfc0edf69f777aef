//! Link reconciliation
//!
//! Symbolic, relative, absolute and hard links are created or repaired
//! idempotently. A correct link is left alone; a wrong link or any other
//! object in the way is replaced only when the promise allows moving
//! obstructions.

use crate::context::RunContext;
use crate::copy::reconcile_copy;
use crate::outcome::Outcome;
use crate::select::anchored;
use crate::spec::{AttributeSpec, CopyPolicy, LinkPolicy, LinkType, WhenNoFile};
use crate::{Error, Result};
use converge_fs::FileMetadata;
use converge_fs::path::{
    canonical_or_lexical, compress_path, relative_link_target, resolve_link_target, with_suffix,
};
use regex::Regex;
use std::path::{Path, PathBuf};

/// Suffix given to objects moved out of a link's way.
pub const MOVED_SUFFIX: &str = ".converge-moved";

/// Reconcile the link policy of `spec` at `dest`.
pub fn reconcile_link(ctx: &RunContext, dest: &Path, spec: &AttributeSpec) -> Result<Outcome> {
    let Some(policy) = &spec.link else {
        return Ok(Outcome::NoChange);
    };

    if policy.link_children {
        let copy_patterns = policy
            .copy_patterns
            .iter()
            .map(|p| anchored(p))
            .collect::<Result<Vec<_>>>()?;
        return link_children(ctx, dest, &policy.source, policy, spec, &copy_patterns, 1);
    }
    verify_link_kind(ctx, dest, policy, spec)
}

/// Create or repair the link at `dest` described by `policy`.
pub fn verify_link_kind(ctx: &RunContext, dest: &Path, policy: &LinkPolicy, spec: &AttributeSpec) -> Result<Outcome> {
    let source = policy.source.as_path();
    match policy.link_type {
        LinkType::Symlink => verify_symlink(ctx, dest, source, policy.when_no_file, spec),
        LinkType::Relative => {
            let absolute = resolve_link_target(dest, source);
            if absolute == compress_path(dest) {
                return Ok(ctx.record(dest, Outcome::Failed, "a relative link may not point at itself"));
            }
            let target = relative_link_target(dest, &absolute);
            verify_symlink(ctx, dest, &target, policy.when_no_file, spec)
        }
        LinkType::Absolute => {
            let absolute = canonical_or_lexical(&resolve_link_target(dest, source));
            verify_symlink(ctx, dest, &absolute, policy.when_no_file, spec)
        }
        LinkType::Hard => verify_hardlink(ctx, dest, &resolve_link_target(dest, source), spec),
    }
}

/// Make `dest` a symlink whose stored target is exactly `target`.
pub fn verify_symlink(
    ctx: &RunContext,
    dest: &Path,
    target: &Path,
    when_no_file: WhenNoFile,
    spec: &AttributeSpec,
) -> Result<Outcome> {
    let resolved = resolve_link_target(dest, target);
    if ctx.fs.stat(&resolved, true).is_err() {
        match when_no_file {
            WhenNoFile::Force => {}
            WhenNoFile::Nop => {
                return Ok(ctx.record(
                    dest,
                    Outcome::Warned,
                    format!("link source {} does not exist; not linking", resolved.display()),
                ));
            }
            WhenNoFile::Delete => {
                return Ok(match ctx.fs.stat(dest, false) {
                    Ok(meta) if meta.is_symlink() => kill_ghost_link(ctx, spec, dest),
                    _ => Outcome::NoChange,
                });
            }
        }
    }

    let existing = match ctx.fs.stat(dest, false) {
        Ok(meta) => Some(meta),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e.into()),
    };

    let Some(existing) = existing else {
        if spec.is_warn_only() {
            return Ok(ctx.record(
                dest,
                Outcome::Warned,
                format!("missing; should link to {}", target.display()),
            ));
        }
        make_parent(ctx, dest)?;
        ctx.fs.symlink(target, dest)?;
        return Ok(ctx.record(dest, Outcome::Changed, format!("linked to {}", target.display())));
    };

    if !existing.is_symlink() {
        if !spec.move_obstructions {
            return Ok(ctx.record(
                dest,
                Outcome::Failed,
                format!(
                    "a {} is in the way of the link to {}; move_obstructions is off",
                    existing.file_type,
                    target.display()
                ),
            ));
        }
        let moved = move_obstruction(ctx, &existing, spec)?;
        if moved != Outcome::Changed {
            return Ok(moved);
        }
        ctx.fs.symlink(target, dest)?;
        return Ok(moved.combine(ctx.record(dest, Outcome::Changed, format!("linked to {}", target.display()))));
    }

    let current = ctx.fs.read_link(dest)?;
    if current == target {
        return Ok(ctx.record(
            dest,
            Outcome::NoChange,
            format!("link to {} as promised", target.display()),
        ));
    }

    if !spec.move_obstructions {
        return Ok(ctx.record(
            dest,
            Outcome::Failed,
            format!(
                "links to {} instead of {}; move_obstructions is off",
                current.display(),
                target.display()
            ),
        ));
    }
    if spec.is_warn_only() {
        return Ok(ctx.record(
            dest,
            Outcome::Warned,
            format!("links to {}; should link to {}", current.display(), target.display()),
        ));
    }
    ctx.fs.remove_file(dest)?;
    ctx.fs.symlink(target, dest)?;
    Ok(ctx.record(
        dest,
        Outcome::Changed,
        format!("relinked from {} to {}", current.display(), target.display()),
    ))
}

/// Make `dest` another name for the inode of `source`.
pub fn verify_hardlink(ctx: &RunContext, dest: &Path, source: &Path, spec: &AttributeSpec) -> Result<Outcome> {
    let source_meta = match ctx.fs.stat(source, false) {
        Ok(meta) => meta,
        Err(e) if e.is_not_found() => {
            return Ok(ctx.record(
                dest,
                Outcome::Warned,
                format!("hard link source {} does not exist", source.display()),
            ));
        }
        Err(e) => return Err(e.into()),
    };
    if !source_meta.is_regular() {
        return Ok(ctx.record(
            dest,
            Outcome::Warned,
            format!("cannot hard link to a {}", source_meta.file_type),
        ));
    }

    let existing = match ctx.fs.stat(dest, false) {
        Ok(meta) => Some(meta),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e.into()),
    };

    match existing {
        None => {
            if spec.is_warn_only() {
                return Ok(ctx.record(
                    dest,
                    Outcome::Warned,
                    format!("missing; should be a hard link to {}", source.display()),
                ));
            }
            make_parent(ctx, dest)?;
            ctx.fs.hard_link(source, dest)?;
            Ok(ctx.record(dest, Outcome::Changed, format!("hard-linked to {}", source.display())))
        }
        Some(meta) if (meta.dev, meta.ino) == (source_meta.dev, source_meta.ino) => Ok(ctx.record(
            dest,
            Outcome::NoChange,
            format!("hard link to {} as promised", source.display()),
        )),
        Some(meta) => {
            if !spec.move_obstructions {
                return Ok(ctx.record(
                    dest,
                    Outcome::Failed,
                    format!("is not a hard link to {}; move_obstructions is off", source.display()),
                ));
            }
            let moved = move_obstruction(ctx, &meta, spec)?;
            if moved != Outcome::Changed {
                return Ok(moved);
            }
            ctx.fs.hard_link(source, dest)?;
            Ok(moved.combine(ctx.record(dest, Outcome::Changed, format!("hard-linked to {}", source.display()))))
        }
    }
}

/// Move the object described by `meta` aside so something else can take
/// its name. Symlinks are simply removed.
pub fn move_obstruction(ctx: &RunContext, meta: &FileMetadata, spec: &AttributeSpec) -> Result<Outcome> {
    let path = &meta.path;
    if spec.is_warn_only() {
        return Ok(ctx.record(
            path,
            Outcome::Warned,
            format!("{} is in the way and should be moved", meta.file_type),
        ));
    }

    if meta.is_symlink() {
        ctx.fs.remove_file(path)?;
        return Ok(ctx.record(path, Outcome::Changed, "removed symbolic link in the way"));
    }

    let moved = with_suffix(path, MOVED_SUFFIX);
    if ctx.fs.exists(&moved) {
        ctx.fs.remove_tree(&moved)?;
    }
    ctx.fs.rename(path, &moved)?;
    Ok(ctx.record(
        path,
        Outcome::Changed,
        format!("moved {} in the way to {}", meta.file_type, moved.display()),
    ))
}

/// Remove `path` if it is a symlink whose target no longer exists.
pub fn kill_ghost_link(ctx: &RunContext, spec: &AttributeSpec, path: &Path) -> Outcome {
    let target = match ctx.fs.read_link(path) {
        Ok(target) => target,
        Err(e) => return ctx.record_error(path, &e.into()),
    };
    if ctx.fs.stat(path, true).is_ok() {
        return Outcome::NoChange;
    }
    if spec.is_warn_only() {
        return ctx.record(
            path,
            Outcome::Warned,
            format!("dead link to {} should be removed", target.display()),
        );
    }
    match ctx.fs.remove_file(path) {
        Ok(()) => ctx.record(
            path,
            Outcome::Changed,
            format!("removed dead link to {}", target.display()),
        ),
        Err(e) => ctx.record_error(path, &e.into()),
    }
}

fn make_parent(ctx: &RunContext, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        ctx.fs.create_dir_all(parent, 0o755)?;
    }
    Ok(())
}

/// Link every child of `source` into the directory `dest`.
fn link_children(
    ctx: &RunContext,
    dest: &Path,
    source: &Path,
    policy: &LinkPolicy,
    spec: &AttributeSpec,
    copy_patterns: &[Regex],
    level: usize,
) -> Result<Outcome> {
    if level > ctx.recursion_limit {
        return Err(Error::RecursionLimit {
            path: dest.to_path_buf(),
            limit: ctx.recursion_limit,
        });
    }

    let source_meta = ctx.fs.stat(source, true)?;
    if !source_meta.is_dir() {
        return Ok(ctx.record(
            dest,
            Outcome::Failed,
            format!("cannot link the children of {}: not a directory", source.display()),
        ));
    }

    let mut outcome = Outcome::NoChange;
    match ctx.fs.stat(dest, false) {
        Ok(meta) if meta.is_dir() => {}
        Ok(meta) if meta.is_symlink() && spec.move_obstructions => {
            outcome = move_obstruction(ctx, &meta, spec)?;
            if outcome != Outcome::Changed {
                return Ok(outcome);
            }
            ctx.fs.create_dir(dest, 0o755)?;
        }
        Ok(meta) => {
            return Ok(ctx.record(
                dest,
                Outcome::Failed,
                format!("cannot link children into a {}", meta.file_type),
            ));
        }
        Err(e) if e.is_not_found() => {
            if spec.is_warn_only() {
                return Ok(ctx.record(dest, Outcome::Warned, "directory missing; should be created"));
            }
            ctx.fs.create_dir_all(dest, 0o755)?;
            outcome = ctx.record(dest, Outcome::Changed, "created directory for linked children");
        }
        Err(e) => return Err(e.into()),
    }

    let depth = spec.recursion().and_then(|r| r.depth);
    for name in ctx.fs.read_dir_names(source)? {
        let child_source = source.join(&name);
        let child_dest = dest.join(&name);
        let leaf = name.to_string_lossy();

        if copy_patterns.iter().any(|re| re.is_match(&leaf)) {
            let derived = AttributeSpec {
                copy: Some(CopyPolicy {
                    source: child_source.clone(),
                    ..CopyPolicy::default()
                }),
                action: spec.action,
                move_obstructions: spec.move_obstructions,
                ..AttributeSpec::default()
            };
            let copied = reconcile_copy(ctx, &child_dest, &derived).unwrap_or_else(|e| ctx.record_error(&child_dest, &e));
            outcome = outcome.combine(copied);
            continue;
        }

        if let Ok(meta) = ctx.fs.stat(&child_dest, false)
            && !meta.is_symlink()
            && !meta.is_dir()
            && !spec.move_obstructions
        {
            outcome = outcome.combine(ctx.record(
                &child_dest,
                Outcome::Warned,
                "a file is in the way of a linked child; move_obstructions is off",
            ));
            continue;
        }

        let child_is_dir = ctx.fs.stat(&child_source, true).is_ok_and(|m| m.is_dir());
        let child = if child_is_dir && depth.is_some_and(|d| d > level) {
            link_children(ctx, &child_dest, &child_source, policy, spec, copy_patterns, level + 1)
        } else {
            let child_policy = LinkPolicy {
                source: PathBuf::from(&child_source),
                link_children: false,
                ..policy.clone()
            };
            verify_link_kind(ctx, &child_dest, &child_policy, spec)
        };

        match child {
            Ok(o) => outcome = outcome.combine(o),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => outcome = outcome.combine(ctx.record_error(&child_dest, &e)),
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::os::unix::fs::{MetadataExt, symlink};

    fn link_spec(source: &Path, link_type: LinkType) -> AttributeSpec {
        AttributeSpec {
            link: Some(LinkPolicy {
                source: source.to_path_buf(),
                link_type,
                ..LinkPolicy::default()
            }),
            ..AttributeSpec::default()
        }
    }

    #[test]
    fn creates_symlink_then_keeps_it() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        let link = dir.path().join("sub/link");
        fs::write(&target, "x").unwrap();

        let ctx = RunContext::new();
        let spec = link_spec(&target, LinkType::Symlink);

        assert_eq!(reconcile_link(&ctx, &link, &spec).unwrap(), Outcome::Changed);
        assert_eq!(fs::read_link(&link).unwrap(), target);
        assert_eq!(reconcile_link(&ctx, &link, &spec).unwrap(), Outcome::NoChange);
    }

    #[test]
    fn relative_link_stores_relative_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/target");
        let link = dir.path().join("b/link");
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, "x").unwrap();

        let ctx = RunContext::new();
        reconcile_link(&ctx, &link, &link_spec(&target, LinkType::Relative)).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("../a/target"));
        assert_eq!(fs::read_to_string(&link).unwrap(), "x");
    }

    #[test]
    fn missing_source_with_nop_warns() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = RunContext::new();
        let spec = link_spec(&dir.path().join("absent"), LinkType::Symlink);
        let link = dir.path().join("link");

        assert_eq!(reconcile_link(&ctx, &link, &spec).unwrap(), Outcome::Warned);
        assert!(fs::symlink_metadata(&link).is_err());
    }

    #[test]
    fn wrong_link_needs_move_obstructions() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        let other = dir.path().join("other");
        let link = dir.path().join("link");
        fs::write(&target, "x").unwrap();
        fs::write(&other, "y").unwrap();
        symlink(&other, &link).unwrap();

        let ctx = RunContext::new();
        let mut spec = link_spec(&target, LinkType::Symlink);
        assert_eq!(reconcile_link(&ctx, &link, &spec).unwrap(), Outcome::Failed);

        spec.move_obstructions = true;
        assert_eq!(reconcile_link(&ctx, &link, &spec).unwrap(), Outcome::Changed);
        assert_eq!(fs::read_link(&link).unwrap(), target);
    }

    #[test]
    fn file_obstruction_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        let link = dir.path().join("link");
        fs::write(&target, "x").unwrap();
        fs::write(&link, "in the way").unwrap();

        let ctx = RunContext::new();
        let mut spec = link_spec(&target, LinkType::Symlink);
        spec.move_obstructions = true;

        assert_eq!(reconcile_link(&ctx, &link, &spec).unwrap(), Outcome::Changed);
        assert_eq!(
            fs::read_to_string(with_suffix(&link, MOVED_SUFFIX)).unwrap(),
            "in the way"
        );
    }

    #[test]
    fn hard_link_shares_inode() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        let link = dir.path().join("link");
        fs::write(&target, "x").unwrap();

        let ctx = RunContext::new();
        let spec = link_spec(&target, LinkType::Hard);
        assert_eq!(reconcile_link(&ctx, &link, &spec).unwrap(), Outcome::Changed);
        assert_eq!(
            fs::metadata(&link).unwrap().ino(),
            fs::metadata(&target).unwrap().ino()
        );
        assert_eq!(reconcile_link(&ctx, &link, &spec).unwrap(), Outcome::NoChange);
    }

    #[test]
    fn dead_link_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("ghost");
        symlink(dir.path().join("gone"), &link).unwrap();

        let ctx = RunContext::new();
        assert_eq!(
            kill_ghost_link(&ctx, &AttributeSpec::default(), &link),
            Outcome::Changed
        );
        assert!(fs::symlink_metadata(&link).is_err());
    }

    #[test]
    fn link_children_links_each_entry_and_copies_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        let dest = dir.path().join("dst");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("a"), "a").unwrap();
        fs::write(source.join("b.conf"), "b").unwrap();

        let ctx = RunContext::new();
        let spec = AttributeSpec {
            link: Some(LinkPolicy {
                source: source.clone(),
                link_children: true,
                copy_patterns: vec![r".*\.conf".into()],
                ..LinkPolicy::default()
            }),
            ..AttributeSpec::default()
        };

        assert_eq!(reconcile_link(&ctx, &dest, &spec).unwrap(), Outcome::Changed);
        assert_eq!(fs::read_link(dest.join("a")).unwrap(), source.join("a"));
        let copied = fs::symlink_metadata(dest.join("b.conf")).unwrap();
        assert!(copied.file_type().is_file());
    }
}
