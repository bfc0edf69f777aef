//! Check command implementation

use std::path::Path;

use colored::Colorize;

use super::load_promises;
use crate::error::{CliError, Result};

/// Validate every promise in `path` without reading or writing the files
/// they describe.
pub fn run_check(path: &Path) -> Result<()> {
    let file = load_promises(path)?;

    let mut invalid = 0;
    for promise in &file.promises {
        match promise.spec.validate(&promise.path) {
            Ok(()) => println!("  {} {}", "ok".green(), promise.path.display()),
            Err(e) => {
                invalid += 1;
                println!("  {} {}: {}", "invalid".red(), promise.path.display(), e);
            }
        }
    }

    println!();
    if invalid > 0 {
        return Err(CliError::user(format!(
            "{invalid} of {} promise(s) are invalid",
            file.promises.len()
        )));
    }
    println!("{} {} promise(s) valid", "OK".green().bold(), file.promises.len());
    Ok(())
}
