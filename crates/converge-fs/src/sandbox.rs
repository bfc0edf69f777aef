//! Path translation for the changes sandbox
//!
//! A [`PathTranslator`] decides where a mutation of a real path actually
//! lands. [`DirectPaths`] writes in place; [`ChangesSandbox`] redirects every
//! write under a staging root so a run can be previewed without touching
//! the live tree.

use crate::{Error, Result};
use std::fmt;
use std::fs;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

/// Maps real paths to the location where mutations are applied.
pub trait PathTranslator: fmt::Debug + Send + Sync {
    /// Location that receives writes aimed at `real`.
    fn real_to_staged(&self, real: &Path) -> PathBuf;

    /// Create the staged directories leading up to `real`, mirroring the
    /// permissions of their real counterparts.
    fn ensure_staged_ancestors(&self, real: &Path) -> Result<()>;

    /// Whether writes are redirected away from the real tree.
    fn is_staging(&self) -> bool;
}

/// Identity translation: mutations hit the real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectPaths;

impl PathTranslator for DirectPaths {
    fn real_to_staged(&self, real: &Path) -> PathBuf {
        real.to_path_buf()
    }

    fn ensure_staged_ancestors(&self, _real: &Path) -> Result<()> {
        Ok(())
    }

    fn is_staging(&self) -> bool {
        false
    }
}

/// Redirects writes under `root` by prefix substitution.
///
/// `/etc/motd` staged under `/var/sandbox` becomes `/var/sandbox/etc/motd`.
#[derive(Debug, Clone)]
pub struct ChangesSandbox {
    root: PathBuf,
}

impl ChangesSandbox {
    /// Create a sandbox rooted at `root`, creating the root if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if root.as_os_str().len() < 2 {
            return Err(Error::Sandbox {
                path: root,
                message: "sandbox root must not be the filesystem root".into(),
            });
        }
        fs::create_dir_all(&root).map_err(|e| Error::io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl PathTranslator for ChangesSandbox {
    fn real_to_staged(&self, real: &Path) -> PathBuf {
        let mut staged = self.root.clone();
        for component in real.components() {
            match component {
                Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
                other => staged.push(other.as_os_str()),
            }
        }
        staged
    }

    fn ensure_staged_ancestors(&self, real: &Path) -> Result<()> {
        let Some(parent) = real.parent() else {
            return Ok(());
        };

        let mut ancestors: Vec<&Path> = parent.ancestors().collect();
        ancestors.reverse();

        for ancestor in ancestors {
            let staged = self.real_to_staged(ancestor);
            if staged.symlink_metadata().is_ok() {
                continue;
            }
            let mode = fs::metadata(ancestor)
                .map(|m| m.mode() & 0o7777)
                .unwrap_or(0o755);
            fs::DirBuilder::new()
                .mode(mode)
                .create(&staged)
                .map_err(|e| Error::io(&staged, e))?;
            fs::set_permissions(&staged, fs::Permissions::from_mode(mode))
                .map_err(|e| Error::io(&staged, e))?;
        }
        Ok(())
    }

    fn is_staging(&self) -> bool {
        true
    }
}
