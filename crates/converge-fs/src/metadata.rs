//! File metadata snapshots

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

/// Kind of filesystem object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    Fifo,
    Socket,
    CharDevice,
    BlockDevice,
    /// Solaris doors. Never produced by a local stat on other systems.
    Door,
}

impl FileType {
    /// Names accepted in selection `types` lists.
    pub fn matches_name(self, name: &str) -> bool {
        match self {
            Self::Regular => matches!(name, "reg" | "plain"),
            Self::Directory => name == "dir",
            Self::Symlink => name == "symlink",
            Self::Fifo => name == "fifo",
            Self::Socket => name == "socket",
            Self::CharDevice => name == "char",
            Self::BlockDevice => name == "block",
            Self::Door => name == "door",
        }
    }

    /// Whether objects of this type carry byte content that can be streamed.
    pub fn has_content(self) -> bool {
        matches!(self, Self::Regular)
    }

    /// Whether this type is created with `mkfifo`/`mknod` rather than copied.
    pub fn is_special(self) -> bool {
        matches!(
            self,
            Self::Fifo | Self::Socket | Self::CharDevice | Self::BlockDevice
        )
    }

    fn from_std(ft: fs::FileType) -> Self {
        if ft.is_symlink() {
            Self::Symlink
        } else if ft.is_dir() {
            Self::Directory
        } else if ft.is_fifo() {
            Self::Fifo
        } else if ft.is_socket() {
            Self::Socket
        } else if ft.is_char_device() {
            Self::CharDevice
        } else if ft.is_block_device() {
            Self::BlockDevice
        } else {
            Self::Regular
        }
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Regular => "regular file",
            Self::Directory => "directory",
            Self::Symlink => "symlink",
            Self::Fifo => "fifo",
            Self::Socket => "socket",
            Self::CharDevice => "character device",
            Self::BlockDevice => "block device",
            Self::Door => "door",
        };
        f.write_str(name)
    }
}

/// A read-only snapshot of one `stat`/`lstat` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub path: PathBuf,
    pub file_type: FileType,
    /// Permission bits including setuid/setgid/sticky (`mode & 07777`).
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// Seconds since the epoch.
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub dev: u64,
    pub ino: u64,
    pub nlink: u64,
    pub rdev: u64,
}

impl FileMetadata {
    /// Build a snapshot from std metadata.
    pub fn from_std(path: &Path, meta: &fs::Metadata) -> Self {
        Self {
            path: path.to_path_buf(),
            file_type: FileType::from_std(meta.file_type()),
            mode: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.size(),
            atime: meta.atime(),
            mtime: meta.mtime(),
            ctime: meta.ctime(),
            dev: meta.dev(),
            ino: meta.ino(),
            nlink: meta.nlink(),
            rdev: meta.rdev(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type == FileType::Symlink
    }

    pub fn is_regular(&self) -> bool {
        self.file_type == FileType::Regular
    }

    /// Setuid or setgid bit set on a root-owned object.
    pub fn is_setuid_root(&self) -> bool {
        (self.uid == 0 && self.mode & 0o4000 != 0) || (self.gid == 0 && self.mode & 0o2000 != 0)
    }
}

/// Stat a local path, following symlinks when `follow` is set.
pub fn local_stat(path: &Path, follow: bool) -> Result<FileMetadata> {
    let meta = if follow {
        fs::metadata(path)
    } else {
        fs::symlink_metadata(path)
    }
    .map_err(|e| Error::io(path, e))?;
    Ok(FileMetadata::from_std(path, &meta))
}
