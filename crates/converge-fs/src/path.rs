//! Lexical path helpers used by link and copy reconciliation

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

/// Normalize a path lexically: drop `.` components, fold `..` into the
/// preceding component and collapse repeated separators.
///
/// No filesystem access happens here; symlinks are not resolved. A `..`
/// that would climb above the root of an absolute path is discarded, one
/// that climbs above the start of a relative path is kept.
pub fn compress_path(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }

    if out.is_empty() {
        return PathBuf::from(".");
    }
    out.iter().collect()
}

/// Resolve `target` the way the kernel would when it is stored in a
/// symlink located at `link`: relative targets are taken relative to the
/// link's directory.
pub fn resolve_link_target(link: &Path, target: &Path) -> PathBuf {
    if target.is_absolute() {
        compress_path(target)
    } else {
        let base = link.parent().unwrap_or_else(|| Path::new("/"));
        compress_path(&base.join(target))
    }
}

/// Compute the shortest relative path that, stored in a symlink at `link`,
/// points at `target`. Both paths should be absolute.
pub fn relative_link_target(link: &Path, target: &Path) -> PathBuf {
    let from = compress_path(link.parent().unwrap_or_else(|| Path::new("/")));
    let to = compress_path(target);

    let from_parts: Vec<_> = from.components().collect();
    let to_parts: Vec<_> = to.components().collect();

    let common = from_parts
        .iter()
        .zip(to_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..from_parts.len() {
        relative.push("..");
    }
    for part in &to_parts[common..] {
        relative.push(part.as_os_str());
    }
    if relative.as_os_str().is_empty() {
        relative.push(".");
    }
    relative
}

/// Final path component as a lossy string, or an empty string for `/`.
pub fn leaf_name(path: &Path) -> String {
    path.file_name()
        .map(OsStr::to_string_lossy)
        .map(|s| s.into_owned())
        .unwrap_or_default()
}

/// Append `suffix` to the final component of `path` (`a/b` + `.1` = `a/b.1`).
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(suffix);
    PathBuf::from(raw)
}

/// Flatten a path into a single file name by replacing separators.
///
/// Used to name repository archive entries.
pub fn canonify_name(path: &Path) -> String {
    path.to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

/// Whether a destination root is too short to be purged safely.
///
/// Paths like `/`, `.` or the empty string would turn a purge into a wipe.
pub fn is_suspiciously_short(path: &Path) -> bool {
    path.as_os_str().len() < 2
}

/// Canonicalize `path` if it exists, otherwise return its lexical form.
pub fn canonical_or_lexical(path: &Path) -> PathBuf {
    dunce::canonicalize(path).unwrap_or_else(|_| compress_path(path))
}
