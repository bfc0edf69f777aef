//! Read-real-or-staged, write-staged-only filesystem facade
//!
//! Every mutation the reconciliation engine performs goes through
//! [`StagedFs`]. With a [`DirectPaths`] translator the calls hit the live
//! tree; with a [`ChangesSandbox`] they land under the staging root and the
//! facade keeps a journal plus tombstones so later reads in the same run see
//! the staged state.

use crate::metadata::{FileMetadata, FileType};
use crate::sandbox::{ChangesSandbox, DirectPaths, PathTranslator};
use crate::security::DirIdentity;
use crate::{Error, Result};
use filetime::FileTime;
use nix::errno::Errno;
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::{Gid, Uid};
use serde::Serialize;
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt, symlink};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One mutation recorded while staging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedChange {
    #[serde(flatten)]
    pub kind: ChangeKind,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeKind {
    CreateDir,
    CreateFile,
    Rename { to: PathBuf },
    Remove,
    Symlink { target: PathBuf },
    HardLink { existing: PathBuf },
    Permissions { mode: u32 },
    Ownership,
    Times,
    Special { file_type: FileType },
}

impl std::fmt::Display for StagedChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let path = self.path.display();
        match &self.kind {
            ChangeKind::CreateDir => write!(f, "mkdir {path}"),
            ChangeKind::CreateFile => write!(f, "create {path}"),
            ChangeKind::Rename { to } => write!(f, "rename {path} -> {}", to.display()),
            ChangeKind::Remove => write!(f, "remove {path}"),
            ChangeKind::Symlink { target } => write!(f, "symlink {path} -> {}", target.display()),
            ChangeKind::HardLink { existing } => {
                write!(f, "hardlink {path} => {}", existing.display())
            }
            ChangeKind::Permissions { mode } => write!(f, "chmod {mode:04o} {path}"),
            ChangeKind::Ownership => write!(f, "chown {path}"),
            ChangeKind::Times => write!(f, "touch {path}"),
            ChangeKind::Special { file_type } => write!(f, "mknod {file_type} {path}"),
        }
    }
}

#[derive(Debug, Default)]
struct Journal {
    tombstones: BTreeSet<PathBuf>,
    changes: Vec<StagedChange>,
}

/// Filesystem facade that routes every write through a [`PathTranslator`].
#[derive(Debug)]
pub struct StagedFs {
    translator: Box<dyn PathTranslator>,
    journal: Mutex<Journal>,
}

impl Default for StagedFs {
    fn default() -> Self {
        Self::direct()
    }
}

impl StagedFs {
    pub fn new(translator: Box<dyn PathTranslator>) -> Self {
        Self {
            translator,
            journal: Mutex::new(Journal::default()),
        }
    }

    /// Mutate the live filesystem.
    pub fn direct() -> Self {
        Self::new(Box::new(DirectPaths))
    }

    /// Stage every mutation under `root`.
    pub fn sandboxed(root: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::new(Box::new(ChangesSandbox::new(root)?)))
    }

    pub fn is_staging(&self) -> bool {
        self.translator.is_staging()
    }

    /// Where writes aimed at `real` end up.
    pub fn staged_path(&self, real: &Path) -> PathBuf {
        self.translator.real_to_staged(real)
    }

    /// Mutations recorded so far, in order.
    pub fn journal(&self) -> Vec<StagedChange> {
        self.lock().changes.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Journal> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, kind: ChangeKind, path: &Path) {
        if self.is_staging() {
            tracing::debug!(path = %path.display(), ?kind, "Staged change");
            self.lock().changes.push(StagedChange {
                kind,
                path: path.to_path_buf(),
            });
        }
    }

    /// Whether `real` or one of its ancestors was removed in this run.
    fn is_hidden(&self, real: &Path) -> bool {
        if !self.is_staging() {
            return false;
        }
        let journal = self.lock();
        real.ancestors().any(|a| journal.tombstones.contains(a))
    }

    fn bury(&self, real: &Path) {
        self.lock().tombstones.insert(real.to_path_buf());
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Path that currently holds the object for `real`: the staged copy if
    /// one exists, otherwise the real path. `None` when removed this run.
    pub fn resolve(&self, real: &Path) -> Option<PathBuf> {
        if !self.is_staging() {
            return Some(real.to_path_buf());
        }
        if self.is_hidden(real) {
            return None;
        }
        let staged = self.staged_path(real);
        if staged.symlink_metadata().is_ok() {
            Some(staged)
        } else {
            Some(real.to_path_buf())
        }
    }

    fn resolve_or_missing(&self, real: &Path) -> Result<PathBuf> {
        self.resolve(real)
            .ok_or_else(|| Error::io(real, io::Error::from(io::ErrorKind::NotFound)))
    }

    /// Stat `real` in the merged view. The returned metadata carries the
    /// real path even when served from the staging area.
    pub fn stat(&self, real: &Path, follow: bool) -> Result<FileMetadata> {
        let path = self.resolve_or_missing(real)?;
        let meta = if follow {
            fs::metadata(&path)
        } else {
            fs::symlink_metadata(&path)
        }
        .map_err(|e| Error::io(real, e))?;
        Ok(FileMetadata::from_std(real, &meta))
    }

    /// Whether anything (including a dangling symlink) exists at `real`.
    pub fn exists(&self, real: &Path) -> bool {
        self.stat(real, false).is_ok()
    }

    pub fn read_link(&self, real: &Path) -> Result<PathBuf> {
        let path = self.resolve_or_missing(real)?;
        fs::read_link(&path).map_err(|e| Error::io(real, e))
    }

    pub fn open(&self, real: &Path) -> Result<File> {
        let path = self.resolve_or_missing(real)?;
        File::open(&path).map_err(|e| Error::io(real, e))
    }

    /// Entry names of directory `real`, sorted. While staging this is the
    /// union of real and staged entries minus anything removed this run.
    pub fn read_dir_names(&self, real: &Path) -> Result<Vec<OsString>> {
        if self.is_hidden(real) {
            return Err(Error::io(real, io::Error::from(io::ErrorKind::NotFound)));
        }

        let mut names = BTreeSet::new();
        let real_listing = list_dir(real);
        let staged_listing = if self.is_staging() {
            list_dir(&self.staged_path(real)).ok()
        } else {
            None
        };

        match (real_listing, staged_listing) {
            (Err(e), None) => return Err(Error::io(real, e)),
            (real_names, staged_names) => {
                names.extend(real_names.unwrap_or_default());
                names.extend(staged_names.unwrap_or_default());
            }
        }

        Ok(names
            .into_iter()
            .filter(|name| !self.is_hidden(&real.join(name)))
            .collect())
    }

    /// Device and inode of directory `real`.
    ///
    /// Prefers the real object so the identity captured before descending
    /// stays stable when the directory is materialized into the sandbox
    /// mid-walk.
    pub fn dir_identity(&self, real: &Path) -> Result<DirIdentity> {
        if !self.is_hidden(real)
            && let Ok(meta) = fs::symlink_metadata(real)
        {
            return Ok(DirIdentity::from_std(&meta));
        }
        let staged = self.staged_path(real);
        let meta = fs::symlink_metadata(&staged).map_err(|e| Error::io(real, e))?;
        Ok(DirIdentity::from_std(&meta))
    }

    // ---------------------------------------------------------------------
    // Mutations
    // ---------------------------------------------------------------------

    /// Prepare the staged location for a new object at `real`.
    fn prepare_target(&self, real: &Path) -> Result<PathBuf> {
        if !self.is_staging() {
            return Ok(real.to_path_buf());
        }
        self.translator.ensure_staged_ancestors(real)?;

        let revived = self.lock().tombstones.remove(real);
        if revived && let Ok(children) = list_dir(real) {
            // A recreated directory must not resurrect its old contents.
            let mut journal = self.lock();
            for name in children {
                journal.tombstones.insert(real.join(name));
            }
        }
        Ok(self.staged_path(real))
    }

    /// Make sure the existing object at `real` is present at its staged
    /// location, copying it from the live tree on first touch.
    fn materialize(&self, real: &Path) -> Result<PathBuf> {
        if !self.is_staging() {
            return Ok(real.to_path_buf());
        }
        let staged = self.staged_path(real);
        if staged.symlink_metadata().is_ok() {
            return Ok(staged);
        }
        if self.is_hidden(real) {
            return Err(Error::io(real, io::Error::from(io::ErrorKind::NotFound)));
        }
        self.translator.ensure_staged_ancestors(real)?;
        self.copy_object(real, &staged)?;
        Ok(staged)
    }

    fn copy_object(&self, real: &Path, staged: &Path) -> Result<()> {
        let meta = fs::symlink_metadata(real).map_err(|e| Error::io(real, e))?;
        let file_type = FileMetadata::from_std(real, &meta).file_type;

        match file_type {
            FileType::Regular => {
                fs::copy(real, staged).map_err(|e| Error::io(staged, e))?;
            }
            FileType::Directory => {
                fs::DirBuilder::new()
                    .mode(meta.permissions().mode())
                    .create(staged)
                    .map_err(|e| Error::io(staged, e))?;
                for name in list_dir(real).map_err(|e| Error::io(real, e))? {
                    let child = real.join(&name);
                    if !self.is_hidden(&child) {
                        self.copy_object(&child, &staged.join(&name))?;
                    }
                }
                fs::set_permissions(staged, meta.permissions())
                    .map_err(|e| Error::io(staged, e))?;
            }
            FileType::Symlink => {
                let target = fs::read_link(real).map_err(|e| Error::io(real, e))?;
                symlink(&target, staged).map_err(|e| Error::io(staged, e))?;
                return Ok(());
            }
            FileType::Fifo => {
                nix::unistd::mkfifo(staged, Mode::from_bits_truncate(meta.permissions().mode()))
                    .map_err(|e| Error::io(staged, e.into()))?;
            }
            FileType::Socket | FileType::CharDevice | FileType::BlockDevice | FileType::Door => {
                return Err(Error::Sandbox {
                    path: real.to_path_buf(),
                    message: format!("cannot stage a {file_type}"),
                });
            }
        }

        let atime = FileTime::from_last_access_time(&meta);
        let mtime = FileTime::from_last_modification_time(&meta);
        filetime::set_file_times(staged, atime, mtime).map_err(|e| Error::io(staged, e))
    }

    pub fn create_dir(&self, real: &Path, mode: u32) -> Result<()> {
        let target = self.prepare_target(real)?;
        fs::DirBuilder::new()
            .mode(mode)
            .create(&target)
            .map_err(|e| Error::io(real, e))?;
        self.record(ChangeKind::CreateDir, real);
        Ok(())
    }

    /// Create `real` and any missing ancestors with `mode`.
    pub fn create_dir_all(&self, real: &Path, mode: u32) -> Result<()> {
        let mut missing = Vec::new();
        for ancestor in real.ancestors() {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            match self.stat(ancestor, true) {
                Ok(meta) if meta.is_dir() => break,
                Ok(meta) => {
                    return Err(Error::io(
                        ancestor,
                        io::Error::new(
                            io::ErrorKind::AlreadyExists,
                            format!("{} is in the way", meta.file_type),
                        ),
                    ));
                }
                Err(_) => missing.push(ancestor.to_path_buf()),
            }
        }
        for dir in missing.into_iter().rev() {
            self.create_dir(&dir, mode)?;
        }
        Ok(())
    }

    /// Create (or truncate) a regular file with `mode` and return it for
    /// writing.
    pub fn create_file(&self, real: &Path, mode: u32) -> Result<File> {
        let target = self.prepare_target(real)?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&target)
            .map_err(|e| Error::io(real, e))?;
        self.record(ChangeKind::CreateFile, real);
        Ok(file)
    }

    pub fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let source = self.materialize(from)?;
        let target = self.prepare_target(to)?;
        fs::rename(&source, &target).map_err(|e| Error::io(from, e))?;
        if self.is_staging() {
            self.bury(from);
        }
        self.record(
            ChangeKind::Rename {
                to: to.to_path_buf(),
            },
            from,
        );
        Ok(())
    }

    pub fn remove_file(&self, real: &Path) -> Result<()> {
        if !self.is_staging() {
            fs::remove_file(real).map_err(|e| Error::io(real, e))?;
            return Ok(());
        }
        if !self.exists(real) {
            return Err(Error::io(real, io::Error::from(io::ErrorKind::NotFound)));
        }
        let staged = self.staged_path(real);
        if staged.symlink_metadata().is_ok() {
            fs::remove_file(&staged).map_err(|e| Error::io(real, e))?;
        }
        self.bury(real);
        self.record(ChangeKind::Remove, real);
        Ok(())
    }

    /// Remove an empty directory.
    pub fn remove_dir(&self, real: &Path) -> Result<()> {
        if !self.is_staging() {
            fs::remove_dir(real).map_err(|e| Error::io(real, e))?;
            return Ok(());
        }
        if !self.read_dir_names(real)?.is_empty() {
            return Err(Error::io(real, io::Error::from(Errno::ENOTEMPTY)));
        }
        let staged = self.staged_path(real);
        if staged.symlink_metadata().is_ok() {
            fs::remove_dir_all(&staged).map_err(|e| Error::io(real, e))?;
        }
        self.bury(real);
        self.record(ChangeKind::Remove, real);
        Ok(())
    }

    /// Remove `real` and, for directories, everything beneath it.
    pub fn remove_tree(&self, real: &Path) -> Result<()> {
        let meta = self.stat(real, false)?;
        if meta.is_dir() {
            for name in self.read_dir_names(real)? {
                self.remove_tree(&real.join(name))?;
            }
            self.remove_dir(real)
        } else {
            self.remove_file(real)
        }
    }

    pub fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        let staged = self.prepare_target(link)?;
        symlink(target, &staged).map_err(|e| Error::io(link, e))?;
        self.record(
            ChangeKind::Symlink {
                target: target.to_path_buf(),
            },
            link,
        );
        Ok(())
    }

    pub fn hard_link(&self, existing: &Path, new: &Path) -> Result<()> {
        let source = self.materialize(existing)?;
        let target = self.prepare_target(new)?;
        fs::hard_link(&source, &target).map_err(|e| Error::io(new, e))?;
        self.record(
            ChangeKind::HardLink {
                existing: existing.to_path_buf(),
            },
            new,
        );
        Ok(())
    }

    pub fn set_permissions(&self, real: &Path, mode: u32) -> Result<()> {
        let target = self.materialize(real)?;
        fs::set_permissions(&target, fs::Permissions::from_mode(mode))
            .map_err(|e| Error::io(real, e))?;
        self.record(ChangeKind::Permissions { mode }, real);
        Ok(())
    }

    pub fn chown(&self, real: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let target = self.materialize(real)?;
        nix::unistd::chown(&target, uid.map(Uid::from_raw), gid.map(Gid::from_raw))
            .map_err(|e| Error::io(real, e.into()))?;
        self.record(ChangeKind::Ownership, real);
        Ok(())
    }

    pub fn set_times(&self, real: &Path, atime: FileTime, mtime: FileTime) -> Result<()> {
        let target = self.materialize(real)?;
        filetime::set_file_times(&target, atime, mtime).map_err(|e| Error::io(real, e))?;
        self.record(ChangeKind::Times, real);
        Ok(())
    }

    pub fn mkfifo(&self, real: &Path, mode: u32) -> Result<()> {
        let target = self.prepare_target(real)?;
        nix::unistd::mkfifo(&target, Mode::from_bits_truncate(mode))
            .map_err(|e| Error::io(real, e.into()))?;
        self.record(
            ChangeKind::Special {
                file_type: FileType::Fifo,
            },
            real,
        );
        Ok(())
    }

    /// Create a device node or socket placeholder with `mknod`.
    pub fn mknod(&self, real: &Path, file_type: FileType, mode: u32, rdev: u64) -> Result<()> {
        let kind = match file_type {
            FileType::CharDevice => SFlag::S_IFCHR,
            FileType::BlockDevice => SFlag::S_IFBLK,
            FileType::Socket => SFlag::S_IFSOCK,
            FileType::Fifo => SFlag::S_IFIFO,
            FileType::Regular | FileType::Directory | FileType::Symlink | FileType::Door => {
                return Err(Error::io(
                    real,
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("mknod cannot create a {file_type}"),
                    ),
                ));
            }
        };
        let target = self.prepare_target(real)?;
        nix::sys::stat::mknod(
            &target,
            kind,
            Mode::from_bits_truncate(mode),
            rdev as nix::libc::dev_t,
        )
        .map_err(|e| Error::io(real, e.into()))?;
        self.record(ChangeKind::Special { file_type }, real);
        Ok(())
    }
}

fn list_dir(path: &Path) -> io::Result<Vec<OsString>> {
    fs::read_dir(path)?
        .map(|entry| entry.map(|e| e.file_name()))
        .collect()
}
