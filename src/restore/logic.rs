// projectbackup/src/restore/logic.rs
use std::path::{Path, PathBuf};

use serde::Serialize;
use uuid::Uuid;

use super::db_restore::replay_dump_file;
use crate::backup::archive::{self, DATABASE_DUMP_ENTRY, ExtractStats};
use crate::backup::credentials;
use crate::engine::Engine;
use crate::errors::{EngineError, Result};
use crate::integrity;
use crate::records::{BackupConfig, CreatedBackup};
use crate::storage::DiskRegistry;
use crate::utils::paths::resolve_project_path;

/// What happened to the SQL dump carried by the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DatabaseRestore {
    NotPresent,
    Replayed { statements: usize },
    /// The dump was present but no credentials could be resolved.
    Skipped { reason: String },
    /// Extracted files stay in place.
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreOutcome {
    pub created_backup_id: Uuid,
    pub destination: PathBuf,
    pub files_written: u64,
    /// Entries refused during extraction.
    pub skipped_entries: Vec<String>,
    pub database: DatabaseRestore,
}

/// Unpacks a created backup over its project directory (or `target_override`)
/// and replays the embedded SQL dump when the record says one was embedded.
///
/// Nothing on disk is touched unless the artifact exists, matches its recorded
/// checksum and opens as a zip archive. Existing files with the same relative
/// path are overwritten; other files are left alone.
pub async fn restore(engine: &Engine, created_backup_id: Uuid, target_override: Option<&str>) -> Result<RestoreOutcome> {
    let record = engine.repo.created_backup(created_backup_id).await?;
    let config = engine.repo.backup_config(record.backup_id).await?;
    let project = engine.repo.project(config.project_id).await?;

    let destination = match target_override {
        Some(raw) => resolve_project_path(raw, &engine.config.projects_base_dir),
        None => engine.project_dir(&project),
    };
    let artifact = engine.config.disks.artifact_path(&record)?;
    if !artifact.is_file() {
        tracing::error!(
            created_backup = %record.id,
            path = %artifact.display(),
            "backup file not found for restore"
        );
        return Err(EngineError::ArtifactNotFound { path: artifact });
    }

    tracing::info!(
        created_backup = %record.id,
        archive = %artifact.display(),
        destination = %destination.display(),
        "🔄 starting restore"
    );

    let (stats, has_dump) = unpack(record.clone(), engine.config.disks.clone(), artifact, destination.clone()).await?;

    let database = if has_dump {
        replay_embedded_dump(engine, &config, &destination).await
    } else {
        DatabaseRestore::NotPresent
    };

    tracing::info!(
        created_backup = %record.id,
        files = stats.files_written,
        database = ?database,
        "✓ restore finished"
    );

    Ok(RestoreOutcome {
        created_backup_id: record.id,
        destination,
        files_written: stats.files_written,
        skipped_entries: stats.skipped,
        database,
    })
}

/// Verifies, opens and extracts on the blocking pool.
async fn unpack(
    record: CreatedBackup,
    disks: DiskRegistry,
    artifact: PathBuf,
    destination: PathBuf,
) -> Result<(ExtractStats, bool)> {
    tokio::task::spawn_blocking(move || -> Result<(ExtractStats, bool)> {
        integrity::verify_created_backup(&record, &disks)?;
        let mut zip = archive::open_archive(&artifact)?;
        // A project file that happens to carry the dump's name is restored as a plain file.
        let has_dump = record.database_included && zip.index_for_name(DATABASE_DUMP_ENTRY).is_some();
        let stats = archive::extract(&mut zip, &artifact, &destination)?;
        Ok((stats, has_dump))
    })
    .await?
}

/// Replays `<destination>/__database_dump.sql` and removes it afterwards,
/// whatever the replay outcome.
async fn replay_embedded_dump(engine: &Engine, config: &BackupConfig, destination: &Path) -> DatabaseRestore {
    let dump_path = destination.join(DATABASE_DUMP_ENTRY);
    let outcome = replay_with_config(engine, config, destination, &dump_path).await;

    if let Err(e) = tokio::fs::remove_file(&dump_path).await {
        tracing::warn!(path = %dump_path.display(), error = %e, "failed to remove restored dump file");
    }
    outcome
}

async fn replay_with_config(
    engine: &Engine,
    config: &BackupConfig,
    project_dir: &Path,
    dump_path: &Path,
) -> DatabaseRestore {
    let credentials = match credentials::resolve(&config.database_source, project_dir, engine.cipher()) {
        Ok(Some(credentials)) => credentials,
        Ok(None) => {
            tracing::warn!(backup = %config.id, "archive carries a database dump but no credentials are available");
            return DatabaseRestore::Skipped {
                reason: "no database credentials available".to_string(),
            };
        }
        Err(e) => {
            tracing::error!(backup = %config.id, error = %e, "database import skipped during restore");
            return DatabaseRestore::Failed { reason: e.to_string() };
        }
    };

    match replay_dump_file(dump_path, &credentials, engine.config.db_connect_timeout).await {
        Ok(statements) => DatabaseRestore::Replayed { statements },
        Err(e) => {
            tracing::error!(backup = %config.id, error = %e, "database import failed during restore");
            DatabaseRestore::Failed { reason: e.to_string() }
        }
    }
}
