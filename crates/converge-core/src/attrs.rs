//! Attribute fixing: permissions, ownership, setuid audit, change tracking

use crate::changes::{ChangeVerdict, FileRecord};
use crate::context::RunContext;
use crate::mode::{ModeMask, with_rx_for_dirs};
use crate::outcome::Outcome;
use crate::principal::{resolve_gid, resolve_uid};
use crate::spec::AttributeSpec;
use crate::{Error, Result};
use converge_fs::FileMetadata;
use converge_fs::checksum::compute_reader_checksum;

/// Desired ownership: any listed id is acceptable, the first is enforced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct OwnerTarget {
    uids: Vec<u32>,
    gids: Vec<u32>,
}

impl OwnerTarget {
    fn from_spec(spec: &AttributeSpec) -> Result<Self> {
        let Some(perms) = &spec.perms else {
            return Ok(Self::default());
        };
        let uids = perms
            .owners
            .iter()
            .map(|name| {
                resolve_uid(name).ok_or_else(|| Error::UnknownPrincipal {
                    kind: "user",
                    name: name.clone(),
                })
            })
            .collect::<Result<_>>()?;
        let gids = perms
            .groups
            .iter()
            .map(|name| {
                resolve_gid(name).ok_or_else(|| Error::UnknownPrincipal {
                    kind: "group",
                    name: name.clone(),
                })
            })
            .collect::<Result<_>>()?;
        Ok(Self { uids, gids })
    }

    fn wanted_uid(&self, current: u32) -> Option<u32> {
        match self.uids.first() {
            Some(&first) if !self.uids.contains(&current) => Some(first),
            _ => None,
        }
    }

    fn wanted_gid(&self, current: u32) -> Option<u32> {
        match self.gids.first() {
            Some(&first) if !self.gids.contains(&current) => Some(first),
            _ => None,
        }
    }
}

fn spec_mask(spec: &AttributeSpec) -> Result<Option<ModeMask>> {
    spec.perms
        .as_ref()
        .and_then(|p| p.mode.as_deref())
        .map(ModeMask::parse)
        .transpose()
}

/// Bring permissions, ownership and change records of `meta` in line with
/// `spec`.
pub fn verify_file_attributes(ctx: &RunContext, meta: &FileMetadata, spec: &AttributeSpec) -> Outcome {
    let prepared = spec_mask(spec).and_then(|mask| Ok((mask, OwnerTarget::from_spec(spec)?)));
    match prepared {
        Ok((mask, owners)) => apply(ctx, meta, spec, mask, &owners),
        Err(e) => ctx.record_error(&meta.path, &e),
    }
}

/// Attribute fixing for a freshly copied or linked destination.
///
/// With `preserve` the source mode is enforced exactly and, when running
/// privileged, the source ownership too. Otherwise the promise's own
/// permissions are applied on top of whatever the destination has.
pub fn verify_copied_attributes(
    ctx: &RunContext,
    dest: &FileMetadata,
    source: &FileMetadata,
    spec: &AttributeSpec,
) -> Outcome {
    let preserve = spec.copy.as_ref().is_some_and(|c| c.preserve);
    if !preserve {
        return verify_file_attributes(ctx, dest, spec);
    }

    tracing::debug!(
        path = %dest.path.display(),
        mode = format_args!("{:04o}", source.mode),
        "Preserving source permissions"
    );
    let mut owners = match OwnerTarget::from_spec(spec) {
        Ok(owners) => owners,
        Err(e) => return ctx.record_error(&dest.path, &e),
    };
    if ctx.privileged {
        if owners.uids.is_empty() {
            owners.uids.push(source.uid);
        }
        if owners.gids.is_empty() {
            owners.gids.push(source.gid);
        }
    }
    apply(ctx, dest, spec, Some(ModeMask::exact(source.mode)), &owners)
}

fn apply(
    ctx: &RunContext,
    meta: &FileMetadata,
    spec: &AttributeSpec,
    mask: Option<ModeMask>,
    owners: &OwnerTarget,
) -> Outcome {
    let path = &meta.path;

    if meta.is_symlink() {
        // Permissions of a link are meaningless; its target is handled on its own.
        tracing::debug!(path = %path.display(), "Skipping attributes of symbolic link");
        return Outcome::NoChange;
    }

    let rxdirs = spec.perms.as_ref().is_some_and(|p| p.rxdirs);
    let mut target = mask.map_or(meta.mode, |m| m.apply(meta.mode));
    if rxdirs && meta.is_dir() {
        target = with_rx_for_dirs(target);
    }

    let mut outcome = Outcome::NoChange;

    let audited = FileMetadata {
        mode: target,
        ..meta.clone()
    };
    if ctx.setuid.observe(&audited) {
        tracing::warn!(path = %path.display(), mode = format_args!("{target:04o}"), "New setuid/setgid root program");
    }

    outcome = outcome.combine(verify_owner(ctx, meta, spec, owners));

    if target != meta.mode {
        outcome = outcome.combine(if spec.is_warn_only() {
            ctx.record(
                path,
                Outcome::Warned,
                format!("has permission {:04o}, should be {target:04o}", meta.mode),
            )
        } else {
            match ctx.fs.set_permissions(path, target) {
                Ok(()) => ctx.record(
                    path,
                    Outcome::Changed,
                    format!("permissions {:04o} -> {target:04o}", meta.mode),
                ),
                Err(e) => ctx.record_error(path, &e.into()),
            }
        });
    }

    if spec.changes.is_some() {
        outcome = outcome.combine(verify_changes(ctx, meta, spec));
    }

    outcome
}

fn verify_owner(
    ctx: &RunContext,
    meta: &FileMetadata,
    spec: &AttributeSpec,
    owners: &OwnerTarget,
) -> Outcome {
    let uid = owners.wanted_uid(meta.uid);
    let gid = owners.wanted_gid(meta.gid);
    if uid.is_none() && gid.is_none() {
        return Outcome::NoChange;
    }

    let path = &meta.path;
    let describe = format!(
        "owner {}:{} should be {}:{}",
        meta.uid,
        meta.gid,
        uid.unwrap_or(meta.uid),
        gid.unwrap_or(meta.gid)
    );

    if spec.is_warn_only() {
        return ctx.record(path, Outcome::Warned, describe);
    }
    if !ctx.privileged {
        return ctx.record(
            path,
            Outcome::Warned,
            format!("{describe}; not privileged to change it"),
        );
    }
    match ctx.fs.chown(path, uid, gid) {
        Ok(()) => ctx.record(path, Outcome::Changed, format!("fixed {describe}")),
        Err(e) => ctx.record_error(path, &e.into()),
    }
}

fn verify_changes(ctx: &RunContext, meta: &FileMetadata, spec: &AttributeSpec) -> Outcome {
    let Some(changes) = &spec.changes else {
        return Outcome::NoChange;
    };
    let path = &meta.path;

    let digest = if changes.hash && meta.is_regular() {
        let digest = ctx
            .fs
            .open(path)
            .map_err(Error::from)
            .and_then(|file| {
                compute_reader_checksum(file).map_err(|e| converge_fs::Error::io(path, e).into())
            });
        match digest {
            Ok(d) => Some(d),
            Err(e) => return ctx.record_error(path, &e),
        }
    } else {
        None
    };

    match ctx.changes.check(path, FileRecord::new(meta, digest), changes) {
        ChangeVerdict::New => ctx.record(path, Outcome::NoChange, "recorded change-tracking baseline"),
        ChangeVerdict::Unchanged => Outcome::NoChange,
        ChangeVerdict::Changed(diffs) => {
            ctx.record(path, Outcome::Warned, format!("changed: {}", diffs.join(", ")))
        }
    }
}
