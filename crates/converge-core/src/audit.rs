//! Setuid/setgid audit list
//!
//! Root-owned files carrying a setuid or setgid bit are reported the first
//! time they are seen. The list of known files is kept in a newline
//! delimited file between runs and rewritten only when it changed.

use crate::Result;
use converge_fs::FileMetadata;
use converge_fs::io::{read_text_locked, write_atomic};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

const AUDIT_MODE: u32 = 0o600;

#[derive(Debug, Default)]
struct AuditState {
    known: BTreeSet<PathBuf>,
    dirty: bool,
}

#[derive(Debug, Default)]
pub struct SetuidAudit {
    location: Option<PathBuf>,
    state: Mutex<AuditState>,
}

impl SetuidAudit {
    /// An audit list that is never persisted.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the list stored at `location`. A missing file is an empty list.
    pub fn load(location: &Path) -> Result<Self> {
        let known = read_text_locked(location)?
            .unwrap_or_default()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .collect();

        Ok(Self {
            location: Some(location.to_path_buf()),
            state: Mutex::new(AuditState {
                known,
                dirty: false,
            }),
        })
    }

    /// Record `meta` if it is a setuid/setgid root file. Returns `true`
    /// the first time such a file is seen.
    pub fn observe(&self, meta: &FileMetadata) -> bool {
        if !meta.is_setuid_root() {
            return false;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let fresh = state.known.insert(meta.path.clone());
        if fresh {
            state.dirty = true;
        }
        fresh
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .known
            .contains(path)
    }

    /// Persist the list if it changed since it was loaded.
    pub fn save(&self) -> Result<()> {
        let Some(location) = &self.location else {
            return Ok(());
        };
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.dirty {
            return Ok(());
        }

        let mut content = String::new();
        for path in &state.known {
            content.push_str(&path.to_string_lossy());
            content.push('\n');
        }
        write_atomic(location, content.as_bytes(), Some(AUDIT_MODE))?;
        state.dirty = false;
        tracing::debug!(path = %location.display(), entries = state.known.len(), "Saved setuid audit list");
        Ok(())
    }
}
