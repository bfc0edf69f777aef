//! Promise dispatcher
//!
//! Turns one [`FilePromise`] into filesystem work: existence handling first,
//! then the per-file pass (rename, delete, touch, transformer, permissions,
//! change tracking), then copy or link reconciliation. Every error ends up
//! as an [`Outcome`] here; nothing past this point returns `Err`.

use crate::context::RunContext;
use crate::copy::reconcile_copy;
use crate::leaf::verify_leaf;
use crate::links::reconcile_link;
use crate::outcome::Outcome;
use crate::select::Selector;
use crate::spec::{AttributeSpec, FilePromise};
use crate::walk::depth_search;
use crate::{Error, Result};
use converge_fs::FileMetadata;
use std::borrow::Cow;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Reconcile one promise and return its combined outcome.
pub fn reconcile(ctx: &RunContext, promise: &FilePromise) -> Outcome {
    let path = promise.path.as_path();
    let _span = tracing::info_span!("promise", path = %path.display()).entered();

    if ctx.is_aborted() {
        return ctx.record_error(
            path,
            &Error::Aborted {
                path: path.to_path_buf(),
            },
        );
    }

    match try_reconcile(ctx, path, &promise.spec) {
        Ok(outcome) => outcome,
        Err(e) => ctx.record_error(path, &e),
    }
}

/// Reconcile every promise in order. Once the run is aborted the remaining
/// promises fail without touching the filesystem.
pub fn reconcile_all<'a>(ctx: &RunContext, promises: impl IntoIterator<Item = &'a FilePromise>) -> Outcome {
    promises.into_iter().map(|promise| reconcile(ctx, promise)).collect()
}

/// Strip a trailing `/`, which marks a promise about a directory.
fn split_dir_intent(raw: &Path) -> (PathBuf, bool) {
    let bytes = raw.as_os_str().as_bytes();
    if bytes.len() > 1 && bytes.ends_with(b"/") {
        let trimmed = raw.to_string_lossy().trim_end_matches('/').to_string();
        (PathBuf::from(trimmed), true)
    } else {
        (raw.to_path_buf(), false)
    }
}

fn lookup(ctx: &RunContext, path: &Path) -> Result<Option<FileMetadata>> {
    match ctx.fs.stat(path, false) {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn try_reconcile(ctx: &RunContext, raw: &Path, spec: &AttributeSpec) -> Result<Outcome> {
    spec.validate(raw)?;

    let (path, wants_dir) = split_dir_intent(raw);
    let selector = spec.select.as_ref().map(Selector::compile).transpose()?;
    let mirrors = spec.copy.is_some() || spec.link.is_some();
    let mut outcome = Outcome::NoChange;
    let mut leaf_spec = Cow::Borrowed(spec);

    let mut meta = lookup(ctx, &path)?;
    if meta.is_none() && !mirrors {
        if spec.create || spec.touch {
            outcome = create_missing(ctx, &path, wants_dir, spec)?;
            if outcome != Outcome::Changed {
                return Ok(outcome);
            }
            leaf_spec.to_mut().touch = false;
            meta = lookup(ctx, &path)?;
        } else if spec.delete.is_some() || spec.rename.is_some() {
            return Ok(ctx.record(&path, Outcome::NoChange, "does not exist as promised"));
        } else {
            return Ok(ctx.record(&path, Outcome::Failed, "promised file does not exist"));
        }
    }

    if let Some(existing) = &meta
        && (leaf_spec.wants_leaf_pass() || leaf_spec.touch)
    {
        outcome = outcome.combine(leaf_pass(ctx, existing, &leaf_spec, selector.as_ref())?);
    }

    if spec.copy.is_some() {
        let copied = reconcile_copy(ctx, &path, spec).unwrap_or_else(|e| ctx.record_error(&path, &e));
        outcome = outcome.combine(copied);
    }
    if spec.link.is_some() {
        let linked = reconcile_link(ctx, &path, spec).unwrap_or_else(|e| ctx.record_error(&path, &e));
        outcome = outcome.combine(linked);
    }

    if meta.is_some() && !spec.has_action() && !spec.create {
        return Ok(ctx.record(&path, Outcome::NoChange, "exists as promised"));
    }
    Ok(outcome)
}

/// Apply the per-file directives to `base`, or to every file below it when
/// the promise recurses into a directory.
fn leaf_pass(
    ctx: &RunContext,
    base: &FileMetadata,
    spec: &AttributeSpec,
    selector: Option<&Selector>,
) -> Result<Outcome> {
    let Some(recursion) = spec.recursion() else {
        return Ok(verify_leaf(ctx, base, spec, selector, false));
    };

    let is_dir = base.is_dir() || (base.is_symlink() && ctx.fs.stat(&base.path, true).is_ok_and(|m| m.is_dir()));
    if !is_dir {
        let warned = ctx.record(
            &base.path,
            Outcome::Warned,
            format!("recursion promised but {} is not a directory", base.file_type),
        );
        return Ok(warned.combine(verify_leaf(ctx, base, spec, selector, false)));
    }

    let mut outcome = depth_search(ctx, &base.path, spec, &mut |entry| {
        verify_leaf(ctx, entry, spec, selector, false)
    })?;

    if recursion.include_basedir {
        let fresh = ctx.fs.stat(&base.path, false)?;
        outcome = outcome.combine(verify_leaf(ctx, &fresh, spec, selector, true));
    }
    Ok(outcome)
}

fn create_missing(ctx: &RunContext, path: &Path, wants_dir: bool, spec: &AttributeSpec) -> Result<Outcome> {
    let what = if wants_dir { "directory" } else { "file" };

    if spec.is_warn_only() {
        return Ok(ctx.record(path, Outcome::Warned, format!("{what} is missing and should be created")));
    }

    if wants_dir {
        ctx.fs.create_dir_all(path, 0o755)?;
    } else {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            ctx.fs.create_dir_all(parent, 0o755)?;
        }
        ctx.fs.create_file(path, 0o600)?;
    }
    Ok(ctx.record(path, Outcome::Changed, format!("created {what}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::MemoryReporter;
    use crate::spec::{Action, ChangesSpec, DeleteSpec, PermsSpec, RecursionPolicy};
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;

    fn mode_of(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o7777
    }

    #[rstest]
    #[case("/a/b/", PathBuf::from("/a/b"), true)]
    #[case("/a/b", PathBuf::from("/a/b"), false)]
    #[case("/", PathBuf::from("/"), false)]
    fn trailing_slash_means_directory(#[case] raw: &str, #[case] path: PathBuf, #[case] dir: bool) {
        assert_eq!(split_dir_intent(Path::new(raw)), (path, dir));
    }

    #[test]
    fn create_makes_file_with_parents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("x/y/file");
        let ctx = RunContext::new();
        let promise = FilePromise::new(
            &target,
            AttributeSpec {
                create: true,
                ..AttributeSpec::default()
            },
        );

        assert_eq!(reconcile(&ctx, &promise), Outcome::Changed);
        assert!(target.is_file());
        assert_eq!(mode_of(&target), 0o600);
        assert_eq!(reconcile(&ctx, &promise), Outcome::NoChange);
    }

    #[test]
    fn create_with_trailing_slash_makes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("made");
        let ctx = RunContext::new();
        let promise = FilePromise::new(
            format!("{}/", target.display()),
            AttributeSpec {
                create: true,
                ..AttributeSpec::default()
            },
        );

        assert_eq!(reconcile(&ctx, &promise), Outcome::Changed);
        assert!(target.is_dir());
    }

    #[test]
    fn warn_only_create_leaves_disk_alone() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("missing");
        let ctx = RunContext::new();
        let promise = FilePromise::new(
            &target,
            AttributeSpec {
                create: true,
                action: Action::Warn,
                ..AttributeSpec::default()
            },
        );

        assert_eq!(reconcile(&ctx, &promise), Outcome::Warned);
        assert!(!target.exists());
    }

    #[test]
    fn missing_file_is_kept_for_delete_and_failed_otherwise() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("gone");
        let ctx = RunContext::new();

        let delete = FilePromise::new(
            &target,
            AttributeSpec {
                delete: Some(DeleteSpec::default()),
                ..AttributeSpec::default()
            },
        );
        assert_eq!(reconcile(&ctx, &delete), Outcome::NoChange);

        let exists = FilePromise::new(&target, AttributeSpec::default());
        assert_eq!(reconcile(&ctx, &exists), Outcome::Failed);

        let tracked = FilePromise::new(
            &target,
            AttributeSpec {
                changes: Some(ChangesSpec::default()),
                ..AttributeSpec::default()
            },
        );
        assert_eq!(reconcile(&ctx, &tracked), Outcome::Failed);
    }

    #[test]
    fn existing_file_without_directives_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("here");
        fs::write(&target, "x").unwrap();
        let reporter = Arc::new(MemoryReporter::new());
        let ctx = RunContext::new().with_reporter(reporter.clone());

        assert_eq!(
            reconcile(&ctx, &FilePromise::new(&target, AttributeSpec::default())),
            Outcome::NoChange
        );
        assert_eq!(reporter.entries_for(&target)[0].message, "exists as promised");
    }

    #[test]
    fn invalid_spec_fails_without_touching_disk() {
        let ctx = RunContext::new();
        let promise = FilePromise::new(
            "/tmp/converge-invalid",
            AttributeSpec {
                perms: Some(PermsSpec {
                    mode: Some("u+banana".into()),
                    ..PermsSpec::default()
                }),
                create: true,
                ..AttributeSpec::default()
            },
        );
        assert_eq!(reconcile(&ctx, &promise), Outcome::Failed);
        assert!(!Path::new("/tmp/converge-invalid").exists());
    }

    #[test]
    fn aborted_run_refuses_further_promises() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("later");
        let ctx = RunContext::new();
        ctx.abort();

        let promise = FilePromise::new(
            &target,
            AttributeSpec {
                create: true,
                ..AttributeSpec::default()
            },
        );
        assert_eq!(reconcile(&ctx, &promise), Outcome::Failed);
        assert!(!target.exists());
    }

    #[test]
    fn recursive_perms_reach_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("tree");
        fs::create_dir_all(base.join("sub")).unwrap();
        fs::write(base.join("a"), "a").unwrap();
        fs::write(base.join("sub/b"), "b").unwrap();
        fs::set_permissions(base.join("a"), fs::Permissions::from_mode(0o600)).unwrap();
        fs::set_permissions(base.join("sub/b"), fs::Permissions::from_mode(0o600)).unwrap();

        let ctx = RunContext::new();
        let promise = FilePromise::new(
            &base,
            AttributeSpec {
                perms: Some(PermsSpec {
                    mode: Some("go+r".into()),
                    ..PermsSpec::default()
                }),
                recursion: Some(RecursionPolicy::default()),
                ..AttributeSpec::default()
            },
        );

        assert_eq!(reconcile(&ctx, &promise), Outcome::Changed);
        assert_eq!(mode_of(&base.join("a")), 0o644);
        assert_eq!(mode_of(&base.join("sub/b")), 0o644);
        assert_eq!(reconcile(&ctx, &promise), Outcome::NoChange);
    }

    #[test]
    fn recursion_on_a_plain_file_warns_and_still_applies() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        fs::write(&file, "x").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o600)).unwrap();

        let ctx = RunContext::new();
        let promise = FilePromise::new(
            &file,
            AttributeSpec {
                perms: Some(PermsSpec {
                    mode: Some("0640".into()),
                    ..PermsSpec::default()
                }),
                recursion: Some(RecursionPolicy::default()),
                ..AttributeSpec::default()
            },
        );

        assert_eq!(reconcile(&ctx, &promise), Outcome::Warned);
        assert_eq!(mode_of(&file), 0o640);
    }

    #[test]
    fn touch_creates_once_then_refreshes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("stamp");
        let ctx = RunContext::new();
        let promise = FilePromise::new(
            &file,
            AttributeSpec {
                touch: true,
                ..AttributeSpec::default()
            },
        );

        assert_eq!(reconcile(&ctx, &promise), Outcome::Changed);
        assert!(file.exists());
        assert_eq!(reconcile(&ctx, &promise), Outcome::Changed);
    }

    #[test]
    fn all_promises_fold_to_the_worst_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = RunContext::new();
        let promises = [
            FilePromise::new(
                dir.path().join("new"),
                AttributeSpec {
                    create: true,
                    ..AttributeSpec::default()
                },
            ),
            FilePromise::new(dir.path().join("absent"), AttributeSpec::default()),
        ];

        assert_eq!(reconcile_all(&ctx, &promises), Outcome::Failed);
        assert!(dir.path().join("new").exists());
    }
}
