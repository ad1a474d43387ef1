// projectbackup/src/errors.rs
use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Source directory not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    #[error("Unable to create archive at {}: {source}", path.display())]
    ArchiveOpenFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to extract archive {}: {reason}", path.display())]
    ExtractFailed { path: PathBuf, reason: String },

    #[error("Database {target} is unreachable: {reason}")]
    DatabaseUnreachable { target: String, reason: String },

    #[error("Database dump failed ({command}): {reason}")]
    DumpFailed { command: String, reason: String },

    #[error("Backup artifact not found: {}", path.display())]
    ArtifactNotFound { path: PathBuf },

    #[error("Checksum mismatch for {}: expected {expected}, found {actual}", path.display())]
    IntegrityMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Database replay failed at statement {statement}: {reason}")]
    RestoreReplayFailed { statement: usize, reason: String },

    #[error("Credential error: {0}")]
    Credentials(String),

    #[error("A backup run is already in progress for configuration {0}")]
    RunInProgress(Uuid),

    #[error("Concurrent update detected for {entity} {id}")]
    Conflict { entity: &'static str, id: Uuid },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Notification could not be delivered: {0}")]
    Notification(String),

    #[error("Background worker has stopped")]
    WorkerStopped,

    #[error("Unknown storage disk: {0}")]
    UnknownDisk(String),

    #[error("Repository error: {0}")]
    Repository(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl EngineError {
    pub fn archive_open(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::ArchiveOpenFailed {
            path: path.into(),
            source,
        }
    }

    pub fn dump_failed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::DumpFailed {
            command: command.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
