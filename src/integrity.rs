// projectbackup/src/integrity.rs
//! SHA-256 checksums of finished archives.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::errors::{EngineError, Result};
use crate::records::CreatedBackup;
use crate::storage::DiskRegistry;

const CHUNK_SIZE: usize = 64 * 1024;

/// Hex SHA-256 of the full file contents.
pub fn checksum(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(CHUNK_SIZE, file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Recomputes the checksum of `path` and compares it with `expected`.
pub fn verify(path: &Path, expected: &str) -> Result<bool> {
    Ok(checksum(path)?.eq_ignore_ascii_case(expected.trim()))
}

/// Checks the artifact of one created backup.
///
/// A mismatch is logged as corruption and returned as an error; the artifact is
/// left where it is. Records without a checksum only need their file to exist.
pub fn verify_created_backup(record: &CreatedBackup, disks: &DiskRegistry) -> Result<()> {
    let path = disks.artifact_path(record)?;
    if !path.is_file() {
        return Err(EngineError::ArtifactNotFound { path });
    }

    let Some(expected) = record.checksum.as_deref() else {
        tracing::debug!(backup = %record.id, "no checksum recorded, skipping comparison");
        return Ok(());
    };

    let actual = checksum(&path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        tracing::warn!(
            backup = %record.id,
            path = %path.display(),
            expected,
            actual = %actual,
            "backup artifact is corrupted"
        );
        Err(EngineError::IntegrityMismatch {
            path,
            expected: expected.to_string(),
            actual,
        })
    }
}

#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub verified: usize,
    pub unchecked: usize,
    pub missing: Vec<PathBuf>,
    pub corrupted: Vec<PathBuf>,
    pub errors: Vec<String>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.corrupted.is_empty() && self.errors.is_empty()
    }
}

/// Verifies every record, collecting problems instead of stopping at the first.
pub fn verify_all<'a>(
    records: impl IntoIterator<Item = &'a CreatedBackup>,
    disks: &DiskRegistry,
) -> IntegrityReport {
    let mut report = IntegrityReport::default();
    for record in records {
        match verify_created_backup(record, disks) {
            Ok(()) if record.checksum.is_some() => report.verified += 1,
            Ok(()) => report.unchecked += 1,
            Err(EngineError::ArtifactNotFound { path }) => report.missing.push(path),
            Err(EngineError::IntegrityMismatch { path, .. }) => report.corrupted.push(path),
            Err(e) => report.errors.push(format!("{}: {}", record.id, e)),
        }
    }
    report
}
