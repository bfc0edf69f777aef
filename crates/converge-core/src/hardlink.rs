//! Run-scoped hard-link registry
//!
//! Files that share an inode at the source are materialized once; every
//! further name for the same source inode becomes a hard link to the first
//! destination written in this run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Device and inode pair of a source file.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct DevIno {
    pub dev: u64,
    pub ino: u64,
}

impl DevIno {
    pub const fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }
}

/// Maps source inodes to the first destination materialized for them.
#[derive(Debug, Default)]
pub struct HardLinkRegistry {
    first: Mutex<HashMap<DevIno, PathBuf>>,
}

impl HardLinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Destination already written for `key` in this run, if any.
    pub fn existing(&self, key: DevIno) -> Option<PathBuf> {
        self.first
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    /// Remember `destination` as the first name for `key`. Later records for
    /// the same key are ignored.
    pub fn record(&self, key: DevIno, destination: &Path) {
        self.first
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_insert_with(|| destination.to_path_buf());
    }

    pub fn len(&self) -> usize {
        self.first
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every entry. Links never span two runs.
    pub fn clear(&self) {
        self.first
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_destination_wins() {
        let registry = HardLinkRegistry::new();
        let key = DevIno::new(1, 42);

        assert_eq!(registry.existing(key), None);
        registry.record(key, Path::new("/dst/b.txt"));
        registry.record(key, Path::new("/dst/c.txt"));

        assert_eq!(registry.existing(key), Some(PathBuf::from("/dst/b.txt")));
        assert_eq!(registry.existing(DevIno::new(2, 42)), None);
    }

    #[test]
    fn clear_forgets_everything() {
        let registry = HardLinkRegistry::new();
        registry.record(DevIno::new(1, 1), Path::new("/a"));
        registry.clear();
        assert!(registry.is_empty());
    }
}
