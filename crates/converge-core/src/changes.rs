//! Change tracking
//!
//! Files promised with `changes` are fingerprinted (content digest plus a
//! few stat fields) and compared with the baseline stored in a TOML
//! database. The database is persisted with an exclusive lock and a
//! temp-then-rename write.

use crate::Result;
use crate::spec::{ChangesSpec, ReportChanges};
use converge_fs::FileMetadata;
use converge_fs::io::write_atomic;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// The database holds content digests; only the owner may read it.
const DB_MODE: u32 = 0o600;

/// Fingerprint of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: i64,
}

impl FileRecord {
    pub fn new(meta: &FileMetadata, digest: Option<String>) -> Self {
        Self {
            digest,
            mode: meta.mode,
            uid: meta.uid,
            gid: meta.gid,
            size: meta.size,
            mtime: meta.mtime,
        }
    }

    /// Human-readable differences from `old`, limited to what `report`
    /// asks for.
    fn differences(&self, old: &FileRecord, report: ReportChanges) -> Vec<String> {
        let mut diffs = Vec::new();
        let content = matches!(report, ReportChanges::Content | ReportChanges::All);
        let stats = matches!(report, ReportChanges::Stats | ReportChanges::All);

        if content && self.digest.is_some() && old.digest.is_some() && self.digest != old.digest {
            diffs.push("content digest changed".to_string());
        }
        if stats {
            if self.mode != old.mode {
                diffs.push(format!("mode {:04o} -> {:04o}", old.mode, self.mode));
            }
            if self.uid != old.uid {
                diffs.push(format!("owner {} -> {}", old.uid, self.uid));
            }
            if self.gid != old.gid {
                diffs.push(format!("group {} -> {}", old.gid, self.gid));
            }
            if self.size != old.size {
                diffs.push(format!("size {} -> {}", old.size, self.size));
            }
            if self.mtime != old.mtime {
                diffs.push("modification time changed".to_string());
            }
        }
        diffs
    }
}

/// What the tracker concluded for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeVerdict {
    /// First sighting; the fingerprint became the baseline.
    New,
    Unchanged,
    Changed(Vec<String>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ChangeDb {
    version: String,
    #[serde(default)]
    files: BTreeMap<String, FileRecord>,
}

#[derive(Debug, Default)]
struct TrackerState {
    db: ChangeDb,
    dirty: bool,
}

#[derive(Debug, Default)]
pub struct ChangeTracker {
    location: Option<PathBuf>,
    state: Mutex<TrackerState>,
}

impl ChangeTracker {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the database at `location` with a shared lock. A missing file
    /// starts an empty database.
    pub fn load(location: &Path) -> Result<Self> {
        let db = match File::open(location) {
            Ok(file) => {
                file.lock_shared()
                    .map_err(|e| converge_fs::Error::io(location, e))?;
                let mut content = String::new();
                (&file)
                    .read_to_string(&mut content)
                    .map_err(|e| converge_fs::Error::io(location, e))?;
                toml::from_str(&content).map_err(|e| converge_fs::Error::ConfigParse {
                    path: location.to_path_buf(),
                    format: "TOML".into(),
                    message: e.to_string(),
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ChangeDb {
                version: "1.0".into(),
                files: BTreeMap::new(),
            },
            Err(e) => return Err(converge_fs::Error::io(location, e).into()),
        };

        Ok(Self {
            location: Some(location.to_path_buf()),
            state: Mutex::new(TrackerState { db, dirty: false }),
        })
    }

    /// Compare `record` for `path` with the stored baseline.
    pub fn check(&self, path: &Path, record: FileRecord, spec: &ChangesSpec) -> ChangeVerdict {
        let key = path.to_string_lossy().into_owned();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(old) = state.db.files.get(&key).cloned() else {
            state.db.files.insert(key, record);
            state.dirty = true;
            return ChangeVerdict::New;
        };

        if old == record {
            return ChangeVerdict::Unchanged;
        }

        let diffs = record.differences(&old, spec.report_changes);
        if spec.update {
            state.db.files.insert(key, record);
            state.dirty = true;
        }

        if diffs.is_empty() || spec.report_changes == ReportChanges::None {
            ChangeVerdict::Unchanged
        } else {
            ChangeVerdict::Changed(diffs)
        }
    }

    /// Persist the database atomically under an exclusive lock.
    pub fn save(&self) -> Result<()> {
        let Some(location) = &self.location else {
            return Ok(());
        };
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.dirty {
            return Ok(());
        }
        if state.db.version.is_empty() {
            state.db.version = "1.0".into();
        }

        let content = toml::to_string_pretty(&state.db).map_err(|e| {
            converge_fs::Error::ConfigSerialize {
                path: location.clone(),
                format: "TOML".into(),
                message: e.to_string(),
            }
        })?;

        if let Some(parent) = location.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| converge_fs::Error::io(parent, e))?;
        }

        // Lock the target itself so concurrent agents serialize their saves.
        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(location)
            .map_err(|e| converge_fs::Error::io(location, e))?;
        lock_file
            .lock_exclusive()
            .map_err(|_| converge_fs::Error::LockFailed {
                path: location.clone(),
            })?;

        write_atomic(location, content.as_bytes(), Some(DB_MODE))?;

        state.dirty = false;
        Ok(())
    }
}
