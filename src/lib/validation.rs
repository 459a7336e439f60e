//! Input validation utilities shared by the CLI commands.

use std::path::Path;

use anyhow::{Result, bail};

/// Validates that a file exists, with a clear error naming what it was.
pub fn validate_file_exists<P: AsRef<Path>>(path: P, file_type: &str) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        bail!("{file_type} file does not exist: {}", path.display());
    }
    if !path.is_file() {
        bail!("{file_type} path is not a file: {}", path.display());
    }
    Ok(())
}
