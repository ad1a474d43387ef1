// projectbackup/src/backup/logic.rs
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::archive::{self, ArchiveStats, DATABASE_DUMP_ENTRY, ExtraEntry, WalkOptions};
use super::credentials;
use super::db_dump;
use crate::engine::Engine;
use crate::errors::{EngineError, Result};
use crate::integrity;
use crate::notify::{BackupEvent, Recipient};
use crate::records::{BackupConfig, CreatedBackup, Project, RunRecord, RunStatus};

/// Folder on every disk under which archives are grouped per project.
pub const BACKUPS_FOLDER: &str = "backups";

/// What happened to the database part of a run. Never affects the run status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DatabaseDump {
    NotRequested,
    /// No credentials could be resolved.
    Skipped { reason: String },
    Dumped { bytes: u64, tables: Option<usize> },
    Failed { reason: String },
}

impl DatabaseDump {
    pub fn is_embedded(&self) -> bool {
        matches!(self, DatabaseDump::Dumped { .. })
    }
}

/// Terminal result of one backup run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub config_id: Uuid,
    pub status: RunStatus,
    pub created_backup: Option<CreatedBackup>,
    pub database: DatabaseDump,
    /// Human readable reason when `status` is `failed`.
    pub error_message: Option<String>,
    /// `false` when the final status write lost a version race.
    pub status_recorded: bool,
}

struct Artifact {
    stats: ArchiveStats,
    size: u64,
    checksum: String,
}

/// Suffixes tried after the plain timestamped name is taken.
const MAX_NAME_ATTEMPTS: u32 = 100;

/// `{base}_{YYYY_MM_DD_HH_MM_SS}`. Any extension on the configured name is dropped.
pub fn artifact_stem(file_name: &str, at: DateTime<Local>) -> String {
    let base = Path::new(file_name.trim())
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("backup");
    format!("{}_{}", base, at.format("%Y_%m_%d_%H_%M_%S"))
}

/// `stem` for the first attempt, `stem_1`, `stem_2`, ... afterwards.
fn disambiguated_stem(stem: &str, attempt: u32) -> String {
    if attempt == 0 {
        stem.to_string()
    } else {
        format!("{}_{}", stem, attempt)
    }
}

/// Path of the archive relative to the disk root.
pub fn artifact_relative_path(project_id: Uuid, stem: &str) -> String {
    format!("{}/{}/{}.zip", BACKUPS_FOLDER, project_id, stem)
}

/// Runs one backup of `config_id`: optional database dump, archive, checksum,
/// record, final status and notification.
///
/// `Err` is only returned when the run could not start (unknown configuration,
/// a run already in flight, a lost version race). Once the configuration is
/// marked `pending` the caller always gets a terminal [`RunOutcome`].
pub async fn run_backup(engine: &Engine, config_id: Uuid, recipient: Option<Recipient>) -> Result<RunOutcome> {
    let config = engine.repo.backup_config(config_id).await?;
    let project = engine.repo.project(config.project_id).await?;

    let _ticket = engine.runs().acquire(config.id)?;
    let pending = engine.repo.mark_pending(config.id, config.version).await?;

    tracing::info!(backup = %config.id, project = %project.name, "🚀 starting backup run");

    let started = Local::now();
    let (result, database) = execute_run(engine, &pending, &project, started).await;

    let (run, created_backup, error_message) = match result {
        Ok(created) => (
            RunRecord {
                status: RunStatus::Success,
                error_message: None,
                last_backup_at: Some(created.created_at),
                last_created_backup_id: Some(created.id),
            },
            Some(created),
            None,
        ),
        Err(e) => {
            let message = e.to_string();
            tracing::error!(backup = %config.id, error = %message, "❌ backup run failed");
            (
                RunRecord {
                    status: RunStatus::Failed,
                    error_message: Some(message.clone()),
                    last_backup_at: None,
                    last_created_backup_id: None,
                },
                None,
                Some(message),
            )
        }
    };

    let (final_config, status_recorded) = match engine.repo.record_run(config.id, pending.version, &run).await {
        Ok(updated) => (updated, true),
        Err(e) => {
            tracing::warn!(backup = %config.id, error = %e, "final status write rejected");
            (pending.clone(), false)
        }
    };

    let outcome = RunOutcome {
        config_id: config.id,
        status: run.status,
        created_backup,
        database,
        error_message,
        status_recorded,
    };

    let event = BackupEvent {
        config: final_config,
        status: outcome.status,
        created_backup: outcome.created_backup.clone(),
        database: outcome.database.clone(),
        error_message: outcome.error_message.clone(),
        recipient,
    };
    if let Err(e) = engine.notifier.notify(&event).await {
        tracing::warn!(backup = %config.id, error = %e, "notification failed");
    }

    if outcome.status == RunStatus::Success {
        tracing::info!(backup = %config.id, "🎉 backup run completed");
    }
    Ok(outcome)
}

async fn execute_run(
    engine: &Engine,
    config: &BackupConfig,
    project: &Project,
    started: DateTime<Local>,
) -> (Result<CreatedBackup>, DatabaseDump) {
    let source = engine.project_dir(project);
    if !source.is_dir() {
        return (
            Err(EngineError::SourceNotFound { path: source }),
            skipped_database(config, "source directory is missing"),
        );
    }

    if let Err(e) = engine.config.disks.root(&config.storage_disk) {
        return (Err(e), skipped_database(config, "storage disk is not configured"));
    }

    // Removed when dropped, whichever way the run ends.
    let work_dir = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(e) => return (Err(e.into()), skipped_database(config, "no temporary directory")),
    };

    let (database, dump_file) = if config.include_database {
        dump_database(engine, config, &source, work_dir.path()).await
    } else {
        (DatabaseDump::NotRequested, None)
    };

    let options = WalkOptions {
        follow_symlinks: engine.config.follow_symlinks,
    };
    let base_stem = artifact_stem(&config.file_name, started);
    let mut attempt = 0;
    let (stem, relative, destination, built) = loop {
        let stem = disambiguated_stem(&base_stem, attempt);
        let relative = artifact_relative_path(project.id, &stem);
        let destination = match engine.config.disks.resolve(&config.storage_disk, &relative) {
            Ok(path) => path,
            Err(e) => break (stem, relative, PathBuf::new(), Err(e)),
        };
        if destination.exists() && attempt < MAX_NAME_ATTEMPTS {
            attempt += 1;
            continue;
        }

        let built = build_artifact(source.clone(), destination.clone(), options, dump_file.clone()).await;
        match built {
            // Lost a race for the name to another writer.
            Err(EngineError::ArchiveOpenFailed { source: ref cause, .. })
                if cause.kind() == io::ErrorKind::AlreadyExists && attempt < MAX_NAME_ATTEMPTS =>
            {
                attempt += 1;
            }
            built => break (stem, relative, destination, built),
        }
    };

    if let Err(e) = work_dir.close() {
        tracing::warn!(error = %e, "failed to remove temporary dump directory");
    }

    let artifact = match built {
        Ok(artifact) => artifact,
        Err(e) => return (Err(e), database),
    };

    let created_at = Utc::now();
    let created = CreatedBackup {
        id: Uuid::new_v4(),
        backup_id: config.id,
        file_name: stem,
        file_path: relative,
        size: artifact.size,
        storage_disk: config.storage_disk.clone(),
        checksum: Some(artifact.checksum),
        file_count: artifact.stats.file_count,
        database_included: artifact.stats.extra_entries > 0,
        expires_at: config.expiry_from(created_at),
        created_at,
    };

    if let Err(e) = engine.repo.insert_created_backup(&created).await {
        // An artifact without a record cannot be found again.
        if let Err(remove_err) = tokio::fs::remove_file(&destination).await {
            tracing::warn!(path = %destination.display(), error = %remove_err, "failed to remove unrecorded archive");
        }
        return (Err(e), database);
    }

    tracing::info!(
        backup = %config.id,
        created_backup = %created.id,
        path = %destination.display(),
        files = created.file_count,
        size = created.size,
        "✓ archive recorded"
    );
    (Ok(created), database)
}

fn skipped_database(config: &BackupConfig, reason: &str) -> DatabaseDump {
    if config.include_database {
        DatabaseDump::Skipped {
            reason: reason.to_string(),
        }
    } else {
        DatabaseDump::NotRequested
    }
}

/// Resolves credentials and dumps into `work_dir`. Failures are reported, not raised.
async fn dump_database(
    engine: &Engine,
    config: &BackupConfig,
    project_dir: &Path,
    work_dir: &Path,
) -> (DatabaseDump, Option<PathBuf>) {
    let credentials = match credentials::resolve(&config.database_source, project_dir, engine.cipher()) {
        Ok(Some(credentials)) => credentials,
        Ok(None) => {
            return (
                DatabaseDump::Skipped {
                    reason: "no database credentials available".to_string(),
                },
                None,
            );
        }
        Err(e) => {
            tracing::warn!(backup = %config.id, error = %e, "database credentials unavailable, archiving files only");
            return (DatabaseDump::Failed { reason: e.to_string() }, None);
        }
    };

    let output = work_dir.join(DATABASE_DUMP_ENTRY);
    match db_dump::dump(&credentials, &output, &config.table_scope, engine.config.db_connect_timeout).await {
        Ok(stats) => (
            DatabaseDump::Dumped {
                bytes: stats.bytes,
                tables: stats.tables,
            },
            Some(output),
        ),
        Err(e) => {
            tracing::warn!(backup = %config.id, error = %e, "database dump failed, archiving files only");
            (DatabaseDump::Failed { reason: e.to_string() }, None)
        }
    }
}

/// Builds and checksums the archive on the blocking pool.
async fn build_artifact(
    source: PathBuf,
    destination: PathBuf,
    options: WalkOptions,
    dump_file: Option<PathBuf>,
) -> Result<Artifact> {
    tokio::task::spawn_blocking(move || -> Result<Artifact> {
        let extras: Vec<ExtraEntry<'_>> = dump_file
            .as_deref()
            .map(|path| ExtraEntry {
                name: DATABASE_DUMP_ENTRY,
                path,
            })
            .into_iter()
            .collect();

        let stats = archive::build_with(&source, &destination, options, &extras)?;
        let (size, checksum) = measure_or_discard(&destination, |path| {
            let size = std::fs::metadata(path)?.len();
            Ok((size, integrity::checksum(path)?))
        })?;
        Ok(Artifact { stats, size, checksum })
    })
    .await?
}

/// Runs `measure` on a freshly persisted archive, removing the archive when it fails.
fn measure_or_discard<T>(destination: &Path, measure: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
    measure(destination).inspect_err(|_| {
        if let Err(e) = std::fs::remove_file(destination) {
            tracing::warn!(path = %destination.display(), error = %e, "failed to remove unmeasured archive");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn artifact_names_carry_the_run_timestamp() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 4, 5, 6).unwrap();
        assert_eq!(artifact_stem("site", at), "site_2024_03_09_04_05_06");
        assert_eq!(artifact_stem("site.zip", at), "site_2024_03_09_04_05_06");
        assert_eq!(artifact_stem("", at), "backup_2024_03_09_04_05_06");

        let project = Uuid::nil();
        assert_eq!(
            artifact_relative_path(project, "site_2024_03_09_04_05_06"),
            "backups/00000000-0000-0000-0000-000000000000/site_2024_03_09_04_05_06.zip"
        );
    }

    #[test]
    fn taken_names_get_a_numeric_suffix() {
        assert_eq!(disambiguated_stem("site_2024_03_09_04_05_06", 0), "site_2024_03_09_04_05_06");
        assert_eq!(disambiguated_stem("site_2024_03_09_04_05_06", 2), "site_2024_03_09_04_05_06_2");
    }

    #[test]
    fn failed_measurement_removes_the_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("site.zip");
        std::fs::write(&archive, b"zip").unwrap();

        let err = measure_or_discard(&archive, |_| -> Result<u64> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "unreadable").into())
        })
        .unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
        assert!(!archive.exists());

        std::fs::write(&archive, b"zip").unwrap();
        let size = measure_or_discard(&archive, |path| Ok(std::fs::metadata(path)?.len())).unwrap();
        assert_eq!(size, 3);
        assert!(archive.exists());
    }

    #[test]
    fn database_outcome_serializes_with_state_tag() {
        let json = serde_json::to_value(DatabaseDump::Dumped {
            bytes: 10,
            tables: None,
        })
        .unwrap();
        assert_eq!(json["state"], "dumped");
        assert!(!DatabaseDump::NotRequested.is_embedded());
    }
}
