//! Descent safety checks
//!
//! Directory walks capture the device and inode of each directory before
//! entering it and re-check them on entry and on return. A mismatch means
//! the directory was swapped underneath the walker and the whole run must
//! stop.

use crate::metadata::FileMetadata;
use crate::staged::StagedFs;
use crate::{Error, Result};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Device and inode pair identifying a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirIdentity {
    pub dev: u64,
    pub ino: u64,
}

impl DirIdentity {
    pub fn from_std(meta: &fs::Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }

    pub fn of(meta: &FileMetadata) -> Self {
        Self {
            dev: meta.dev,
            ino: meta.ino,
        }
    }
}

impl std::fmt::Display for DirIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dev {} ino {}", self.dev, self.ino)
    }
}

/// Verifies that a directory is still the one that was captured.
///
/// Called when a walker enters a directory and again on the parent after
/// returning from a child.
pub trait DescentGuard: Send + Sync {
    fn verify(&self, fs: &StagedFs, dir: &Path, expected: DirIdentity) -> Result<()>;
}

/// Default guard: re-stats the directory and compares device and inode.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatDescentGuard;

impl DescentGuard for StatDescentGuard {
    fn verify(&self, fs: &StagedFs, dir: &Path, expected: DirIdentity) -> Result<()> {
        let found = fs.dir_identity(dir)?;
        if found != expected {
            tracing::error!(
                path = %dir.display(),
                %expected,
                %found,
                "Directory changed during descent"
            );
            return Err(Error::PathRace {
                path: dir.to_path_buf(),
                expected: expected.to_string(),
                found: found.to_string(),
            });
        }
        Ok(())
    }
}

/// Whether a symlink owned by `uid` may be traversed: only links owned by
/// root or by the invoking user are trusted.
pub fn link_owner_trusted(uid: u32) -> bool {
    uid == 0 || uid == nix::unistd::getuid().as_raw()
}

/// Whether `meta` lives on a different device than the walk root.
pub fn crosses_device(root: DirIdentity, meta: &FileMetadata) -> bool {
    root.dev != meta.dev
}
