//! Error types for converge-core

use std::path::PathBuf;

/// Result type for converge-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in converge-core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Conflicting or missing directives in an attribute specification
    #[error("Invalid promise for {path}: {message}")]
    InvalidSpec { path: PathBuf, message: String },

    /// Selection result expression could not be parsed
    #[error("Invalid selection expression '{expression}': {message}")]
    InvalidExpression { expression: String, message: String },

    /// Permission string could not be parsed
    #[error("Invalid mode string: {mode}")]
    InvalidMode { mode: String },

    /// A selection or copy pattern is not a valid regex
    #[error("Invalid pattern '{pattern}': {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// A directory changed identity while the walker was inside it
    #[error("Path race at {path}: {message}")]
    PathRace { path: PathBuf, message: String },

    /// The walk went deeper than the configured hard ceiling
    #[error("Recursion limit of {limit} exceeded at {path}")]
    RecursionLimit { path: PathBuf, limit: usize },

    /// The run was aborted by an earlier security failure
    #[error("Run aborted after a security failure; refusing {path}")]
    Aborted { path: PathBuf },

    /// A copied file did not survive its integrity checks
    #[error("Copy to {path} failed verification: {message}")]
    Verification { path: PathBuf, message: String },

    /// Copy source or remote connection failure
    #[error(transparent)]
    Transport(#[from] crate::transport::TransportError),

    /// External command could not be run
    #[error("Failed to run '{command}': {source}")]
    Exec {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Unknown user or group name
    #[error("Unknown {kind} '{name}'")]
    UnknownPrincipal { kind: &'static str, name: String },

    /// Filesystem error from converge-fs
    #[error(transparent)]
    Fs(converge_fs::Error),
}

impl From<converge_fs::Error> for Error {
    fn from(err: converge_fs::Error) -> Self {
        match err {
            converge_fs::Error::PathRace {
                path,
                expected,
                found,
            } => Self::PathRace {
                path,
                message: format!("expected {expected}, found {found}"),
            },
            other => Self::Fs(other),
        }
    }
}

impl Error {
    pub fn invalid_spec(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::InvalidSpec {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Security failures stop the whole run, not just the current promise.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::PathRace { .. } | Self::RecursionLimit { .. } | Self::Aborted { .. }
        )
    }

    /// Whether this wraps a filesystem `NotFound`.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Fs(e) => e.is_not_found(),
            Self::Transport(e) => e.is_not_found(),
            _ => false,
        }
    }
}
