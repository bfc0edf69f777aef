//! Attribute specification: the resolved description of a file promise
//!
//! Produced upstream (here: loaded from TOML/JSON/YAML through
//! [`converge_fs::ConfigStore`]) and read-only for the engine.

use crate::mode::ModeMask;
use crate::select::Selector;
use crate::{Error, Result};
use converge_fs::path::is_suspiciously_short;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One promise: a path plus the attributes it must satisfy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilePromise {
    pub path: PathBuf,
    #[serde(flatten)]
    pub spec: AttributeSpec,
}

impl FilePromise {
    pub fn new(path: impl Into<PathBuf>, spec: AttributeSpec) -> Self {
        Self {
            path: path.into(),
            spec,
        }
    }
}

/// A promise file: `promises = [ { path = "...", ... } ]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PromiseFile {
    #[serde(default)]
    pub promises: Vec<FilePromise>,
}

/// Whether mutations are performed or only reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    #[default]
    Fix,
    Warn,
}

/// Every directive the engine recognizes for one path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributeSpec {
    pub select: Option<SelectionCriteria>,
    pub copy: Option<CopyPolicy>,
    pub link: Option<LinkPolicy>,
    pub perms: Option<PermsSpec>,
    pub recursion: Option<RecursionPolicy>,
    pub rename: Option<RenameSpec>,
    pub delete: Option<DeleteSpec>,
    pub changes: Option<ChangesSpec>,
    /// Command run on the file; `$(this.promiser)` expands to its path.
    pub transformer: Option<String>,
    pub touch: bool,
    /// Create the file (or directory, when the path ends in `/`) if missing.
    pub create: bool,
    pub action: Action,
    /// Allow replacing objects of the wrong type that stand in the way.
    pub move_obstructions: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    #[default]
    Symlink,
    Relative,
    Absolute,
    Hard,
}

/// How source and destination are compared to decide whether to copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Mtime,
    #[default]
    Ctime,
    Atime,
    #[serde(alias = "hash", alias = "digest")]
    Checksum,
    Binary,
    Exists,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupMode {
    #[default]
    Plain,
    Timestamp,
    #[serde(alias = "false")]
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CopyPolicy {
    pub source: PathBuf,
    /// Servers tried in order; empty or `localhost` means the local tree.
    pub servers: Vec<String>,
    /// Link flavour used for `link_instead` matches.
    pub link_type: LinkType,
    pub compare: Comparator,
    pub backup: BackupMode,
    pub purge: bool,
    pub preserve: bool,
    pub verify: bool,
    pub force_update: bool,
    pub type_check: bool,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    /// Leaf-name patterns to link instead of copying.
    pub link_instead: Vec<String>,
    /// Leaf-name patterns whose symlinks are followed and copied.
    pub copy_links: Vec<String>,
    /// Copy every file of the source tree into the destination directory.
    pub collapse: bool,
    /// Directory receiving backups after a successful commit.
    pub repository: Option<PathBuf>,
    /// Connections are closed after use instead of returned to the cache.
    pub background: bool,
}

impl Default for CopyPolicy {
    fn default() -> Self {
        Self {
            source: PathBuf::new(),
            servers: Vec::new(),
            link_type: LinkType::Symlink,
            compare: Comparator::Ctime,
            backup: BackupMode::Plain,
            purge: false,
            preserve: false,
            verify: false,
            force_update: false,
            type_check: true,
            min_size: None,
            max_size: None,
            link_instead: Vec::new(),
            copy_links: Vec::new(),
            collapse: false,
            repository: None,
            background: false,
        }
    }
}

/// What to do when a link's source does not exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhenNoFile {
    #[default]
    Nop,
    Force,
    Delete,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkPolicy {
    pub source: PathBuf,
    pub link_type: LinkType,
    pub when_no_file: WhenNoFile,
    /// Link each child of the source directory into the destination.
    pub link_children: bool,
    /// Leaf-name patterns copied rather than linked.
    pub copy_patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecursionPolicy {
    /// Maximum depth below the base directory; `None` is unbounded.
    pub depth: Option<usize>,
    pub cross_device: bool,
    pub include_dirs: Vec<String>,
    pub exclude_dirs: Vec<String>,
    pub traverse_links: bool,
    pub rmdeadlinks: bool,
    pub include_basedir: bool,
}

impl Default for RecursionPolicy {
    fn default() -> Self {
        Self {
            depth: None,
            cross_device: true,
            include_dirs: Vec::new(),
            exclude_dirs: Vec::new(),
            traverse_links: false,
            rmdeadlinks: false,
            include_basedir: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RenameSpec {
    pub newname: Option<PathBuf>,
    pub disable: bool,
    pub disable_suffix: String,
    pub disable_mode: String,
    /// Keep this many rotated copies; `0` truncates in place.
    pub rotate: Option<u32>,
}

impl Default for RenameSpec {
    fn default() -> Self {
        Self {
            newname: None,
            disable: false,
            disable_suffix: ".cfdisabled".into(),
            disable_mode: "0600".into(),
            rotate: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeleteSpec {
    pub rmdirs: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PermsSpec {
    /// Octal (`0644`) or symbolic (`u+rw,go-w`) mode string.
    pub mode: Option<String>,
    pub owners: Vec<String>,
    pub groups: Vec<String>,
    /// Grant search permission on directories wherever read is granted.
    pub rxdirs: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportChanges {
    Content,
    Stats,
    #[default]
    All,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChangesSpec {
    pub hash: bool,
    pub report_changes: ReportChanges,
    /// Accept a detected change as the new baseline.
    pub update: bool,
}

impl Default for ChangesSpec {
    fn default() -> Self {
        Self {
            hash: true,
            report_changes: ReportChanges::All,
            update: true,
        }
    }
}

/// Open interval `from < t < to`, seconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeWindow {
    pub from: i64,
    pub to: i64,
}

impl TimeWindow {
    pub fn contains(&self, t: i64) -> bool {
        self.from < t && t < self.to
    }
}

/// Closed interval `min <= size <= max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SizeWindow {
    pub min: u64,
    pub max: u64,
}

impl SizeWindow {
    pub fn contains(&self, size: u64) -> bool {
        self.min <= size && size <= self.max
    }
}

/// Predicates deciding whether a file is in scope.
///
/// Each non-empty field sets one named flag; `result` combines the flags
/// (`all`, `any`, `none` or an expression such as `leaf_name.!owner`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SelectionCriteria {
    pub names: Vec<String>,
    pub paths: Vec<String>,
    pub types: Vec<String>,
    pub owners: Vec<String>,
    pub groups: Vec<String>,
    pub perms: Vec<String>,
    pub mtime: Option<TimeWindow>,
    pub atime: Option<TimeWindow>,
    pub ctime: Option<TimeWindow>,
    pub size: Option<SizeWindow>,
    pub issymlinkto: Vec<String>,
    pub exec_regex: Option<String>,
    pub exec_program: Option<String>,
    pub result: Option<String>,
}

impl AttributeSpec {
    pub fn is_warn_only(&self) -> bool {
        self.action == Action::Warn
    }

    /// Depth-search settings, if the promise asks for one.
    pub fn recursion(&self) -> Option<&RecursionPolicy> {
        self.recursion.as_ref()
    }

    /// Whether the promise carries directives applied to each existing file
    /// (and, with recursion, to every file below a directory).
    pub fn wants_leaf_pass(&self) -> bool {
        self.delete.is_some()
            || self.rename.is_some()
            || self.perms.is_some()
            || self.changes.is_some()
            || self.transformer.is_some()
    }

    /// Whether any directive at all asks for something beyond existence.
    pub fn has_action(&self) -> bool {
        self.wants_leaf_pass() || self.copy.is_some() || self.link.is_some() || self.touch
    }

    /// Reject conflicting or incomplete directives before anything on disk
    /// is touched.
    pub fn validate(&self, path: &Path) -> Result<()> {
        if path.as_os_str().is_empty() {
            return Err(Error::invalid_spec(path, "promise has no path"));
        }

        if let Some(copy) = &self.copy {
            if copy.source.as_os_str().is_empty() {
                return Err(Error::invalid_spec(path, "copy has no source"));
            }
            if copy.purge && is_suspiciously_short(path) {
                return Err(Error::invalid_spec(
                    path,
                    "refusing to purge a destination root shorter than two characters",
                ));
            }
            if let (Some(min), Some(max)) = (copy.min_size, copy.max_size)
                && min > max
            {
                return Err(Error::invalid_spec(
                    path,
                    format!("min_size {min} exceeds max_size {max}"),
                ));
            }
        }

        if let Some(link) = &self.link
            && link.source.as_os_str().is_empty()
        {
            return Err(Error::invalid_spec(path, "link has no source"));
        }

        if self.copy.is_some() && self.link.is_some() {
            return Err(Error::invalid_spec(
                path,
                "copy and link cannot both be promised",
            ));
        }

        if self.transformer.is_some() && (self.copy.is_some() || self.link.is_some()) {
            return Err(Error::invalid_spec(
                path,
                "transformer cannot be combined with copy or link",
            ));
        }

        if let Some(rename) = &self.rename {
            let directives = usize::from(rename.newname.is_some())
                + usize::from(rename.disable)
                + usize::from(rename.rotate.is_some());
            if directives > 1 {
                return Err(Error::invalid_spec(
                    path,
                    "rename accepts only one of newname, disable or rotate",
                ));
            }
            ModeMask::parse(&rename.disable_mode)?;
        }

        if let Some(mode) = self.perms.as_ref().and_then(|p| p.mode.as_deref()) {
            ModeMask::parse(mode)?;
        }

        if let Some(select) = &self.select {
            if select.exec_regex.is_some() && select.exec_program.is_none() {
                return Err(Error::invalid_spec(
                    path,
                    "exec_regex needs exec_program to produce output",
                ));
            }
            Selector::compile(select)?;
        }

        Ok(())
    }
}
