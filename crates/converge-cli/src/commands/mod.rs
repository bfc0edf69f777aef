//! Command implementations for converge-cli

pub mod check;
pub mod run;

pub use check::run_check;
pub use run::run_promises;

use converge_core::PromiseFile;
use converge_fs::ConfigStore;
use std::path::Path;

use crate::error::{CliError, Result};

/// Load a promise file, naming the file when it cannot be parsed.
pub(crate) fn load_promises(path: &Path) -> Result<PromiseFile> {
    if !path.exists() {
        return Err(CliError::user(format!("promise file {} not found", path.display())));
    }
    Ok(ConfigStore::new().load(path)?)
}
