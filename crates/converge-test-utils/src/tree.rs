//! [`TestTree`] builder for reconciliation scenarios.

use filetime::FileTime;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt, symlink};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A temporary directory tree with helpers for setup and assertion.
///
/// Paths given to the helpers are relative to [`TestTree::root`]; missing
/// parent directories are created on the way.
///
/// # Example
///
/// ```rust,no_run
/// use converge_test_utils::TestTree;
///
/// let tree = TestTree::new()
///     .file("src/a.txt", "alpha")
///     .file_with_mode("src/secret", "s", 0o600)
///     .hard_link("src/a.txt", "src/b.txt")
///     .symlink("src/a.txt", "src/link");
/// tree.assert_contents("src/a.txt", "alpha");
/// ```
pub struct TestTree {
    temp_dir: TempDir,
}

impl Default for TestTree {
    fn default() -> Self {
        Self::new()
    }
}

impl TestTree {
    /// Create an empty temporary directory.
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Absolute path of `rel`.
    pub fn path(&self, rel: &str) -> PathBuf {
        self.root().join(rel)
    }

    fn parent_of(&self, rel: &str) {
        if let Some(parent) = self.path(rel).parent() {
            fs::create_dir_all(parent).unwrap();
        }
    }

    pub fn dir(self, rel: &str) -> Self {
        fs::create_dir_all(self.path(rel)).unwrap();
        self
    }

    pub fn file(self, rel: &str, contents: &str) -> Self {
        self.parent_of(rel);
        fs::write(self.path(rel), contents).unwrap();
        self
    }

    pub fn file_with_mode(self, rel: &str, contents: &str, mode: u32) -> Self {
        let tree = self.file(rel, contents);
        tree.chmod(rel, mode);
        tree
    }

    /// `rel` becomes a second name for `existing`.
    pub fn hard_link(self, existing: &str, rel: &str) -> Self {
        self.parent_of(rel);
        fs::hard_link(self.path(existing), self.path(rel)).unwrap();
        self
    }

    /// `rel` becomes a symbolic link whose text is `target`, verbatim.
    pub fn symlink(self, target: &str, rel: &str) -> Self {
        self.parent_of(rel);
        symlink(target, self.path(rel)).unwrap();
        self
    }

    /// Set both atime and mtime of `rel` to `unix_seconds`.
    pub fn aged(self, rel: &str, unix_seconds: i64) -> Self {
        let time = FileTime::from_unix_time(unix_seconds, 0);
        filetime::set_symlink_file_times(self.path(rel), time, time).unwrap();
        self
    }

    pub fn chmod(&self, rel: &str, mode: u32) {
        fs::set_permissions(self.path(rel), fs::Permissions::from_mode(mode)).unwrap();
    }

    /// Permission bits of `rel`, without the file type.
    pub fn mode(&self, rel: &str) -> u32 {
        fs::symlink_metadata(self.path(rel)).unwrap().permissions().mode() & 0o7777
    }

    pub fn inode(&self, rel: &str) -> u64 {
        fs::symlink_metadata(self.path(rel)).unwrap().ino()
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path(rel))
            .unwrap_or_else(|_| panic!("Could not read file: {}", self.path(rel).display()))
    }

    /// Sorted entry names of directory `rel`.
    pub fn names(&self, rel: &str) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.path(rel))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    /// Assert that `rel` exists (a dangling symlink counts).
    ///
    /// # Panics
    /// Panics with a descriptive message if nothing is at `rel`.
    pub fn assert_exists(&self, rel: &str) {
        let full_path = self.path(rel);
        assert!(
            fs::symlink_metadata(&full_path).is_ok(),
            "Expected path to exist: {}",
            full_path.display()
        );
    }

    /// Assert that nothing, not even a dangling symlink, is at `rel`.
    pub fn assert_missing(&self, rel: &str) {
        let full_path = self.path(rel);
        assert!(
            fs::symlink_metadata(&full_path).is_err(),
            "Expected path NOT to exist: {}",
            full_path.display()
        );
    }

    pub fn assert_contents(&self, rel: &str, expected: &str) {
        let actual = self.read(rel);
        assert_eq!(
            actual,
            expected,
            "File {} has unexpected contents",
            self.path(rel).display()
        );
    }

    pub fn assert_same_inode(&self, a: &str, b: &str) {
        assert_eq!(
            self.inode(a),
            self.inode(b),
            "{a} and {b} should be hard links to one inode"
        );
    }
}
