// projectbackup/src/storage.rs
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::errors::{EngineError, Result};
use crate::records::CreatedBackup;

/// Named storage locations ("disks"), each a local root directory.
#[derive(Debug, Clone, Default)]
pub struct DiskRegistry {
    roots: HashMap<String, PathBuf>,
}

impl DiskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_disk(mut self, name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        self.insert(name, root);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, root: impl Into<PathBuf>) {
        self.roots.insert(name.into(), root.into());
    }

    pub fn root(&self, disk: &str) -> Result<&Path> {
        self.roots
            .get(disk)
            .map(PathBuf::as_path)
            .ok_or_else(|| EngineError::UnknownDisk(disk.to_string()))
    }

    /// Absolute location of `relative` on `disk`.
    pub fn resolve(&self, disk: &str, relative: &str) -> Result<PathBuf> {
        Ok(self.root(disk)?.join(relative.trim_start_matches('/')))
    }

    pub fn artifact_path(&self, record: &CreatedBackup) -> Result<PathBuf> {
        self.resolve(&record.storage_disk, &record.file_path)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.roots.keys().map(String::as_str)
    }
}
