//! Filesystem layer for converge
//!
//! Provides file metadata snapshots, checksums, atomic I/O with advisory
//! locks, a format-agnostic config store and the changes sandbox through
//! which every mutation of the reconciliation engine is routed.

pub mod checksum;
pub mod config;
pub mod error;
pub mod io;
pub mod metadata;
pub mod path;
pub mod sandbox;
pub mod security;
pub mod staged;

pub use config::{ConfigFormat, ConfigStore};
pub use error::{Error, Result};
pub use metadata::{FileMetadata, FileType, local_stat};
pub use sandbox::{ChangesSandbox, DirectPaths, PathTranslator};
pub use security::{DescentGuard, DirIdentity, StatDescentGuard};
pub use staged::{ChangeKind, StagedChange, StagedFs};
