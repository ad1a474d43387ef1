pub mod paths;
pub mod setting;

use std::path::PathBuf;

use which::which;

use crate::errors::{EngineError, Result};

/// Finds a database client executable (`pg_dump`, `mysqldump`, ...) in the system PATH.
pub fn find_executable(name: &str) -> Result<PathBuf> {
    which(name).map_err(|e| {
        EngineError::dump_failed(
            name,
            format!(
                "{} executable not found in PATH ({}). Please ensure the database client tools are installed and in your PATH.",
                name, e
            ),
        )
    })
}
