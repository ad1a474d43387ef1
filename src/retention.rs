// projectbackup/src/retention.rs
//! Removal of created backups: expiry sweep and cascading deletes.
//!
//! Files are removed before their records so a failure never leaves a record
//! pointing at nothing it claims to own. A file that is already gone counts
//! as removed, which makes every operation here safe to repeat.

use std::io;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::Result;
use crate::records::CreatedBackup;
use crate::storage::DiskRegistry;
use crate::store::BackupRepository;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub removed: Vec<Uuid>,
    /// Expired records whose file had already disappeared.
    pub missing_files: usize,
    pub errors: Vec<(Uuid, String)>,
}

/// Whether the artifact file existed before removal.
async fn remove_artifact(record: &CreatedBackup, disks: &DiskRegistry) -> Result<bool> {
    let path = disks.artifact_path(record)?;
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {
            tracing::debug!(created_backup = %record.id, path = %path.display(), "artifact removed");
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Deletes one created backup: its file, then its record.
pub async fn delete_created_backup(repo: &dyn BackupRepository, disks: &DiskRegistry, record: &CreatedBackup) -> Result<bool> {
    let existed = remove_artifact(record, disks).await?;
    repo.delete_created_backup(record.id).await?;
    Ok(existed)
}

/// Removes every created backup whose `expires_at` is at or before `now`.
/// Records without an expiry are kept forever.
pub async fn sweep_expired(repo: &dyn BackupRepository, disks: &DiskRegistry, now: DateTime<Utc>) -> Result<SweepReport> {
    let expired = repo.expired_created_backups(now).await?;
    let mut report = SweepReport {
        examined: expired.len(),
        ..SweepReport::default()
    };

    for record in &expired {
        match delete_created_backup(repo, disks, record).await {
            Ok(existed) => {
                if !existed {
                    report.missing_files += 1;
                }
                report.removed.push(record.id);
            }
            Err(e) => {
                tracing::error!(created_backup = %record.id, error = %e, "failed to remove expired backup");
                report.errors.push((record.id, e.to_string()));
            }
        }
    }

    if report.removed.is_empty() {
        tracing::debug!("expiry sweep: nothing to remove");
    } else {
        tracing::info!(removed = report.removed.len(), "expiry sweep: removed expired backups");
    }
    Ok(report)
}

/// Deletes a backup configuration together with every artifact it produced.
/// Returns the number of created backups removed.
pub async fn delete_backup_config(repo: &dyn BackupRepository, disks: &DiskRegistry, config_id: Uuid) -> Result<usize> {
    let records = repo.created_backups_for(config_id).await?;
    for record in &records {
        remove_artifact(record, disks).await?;
    }
    repo.delete_backup_config(config_id).await?;
    tracing::info!(backup = %config_id, artifacts = records.len(), "backup configuration deleted");
    Ok(records.len())
}

/// Deletes a project, its configurations and all of their artifacts.
pub async fn delete_project(repo: &dyn BackupRepository, disks: &DiskRegistry, project_id: Uuid) -> Result<usize> {
    let mut removed = 0;
    for config in repo.backup_configs_for(project_id).await? {
        removed += delete_backup_config(repo, disks, config.id).await?;
    }
    repo.delete_project(project_id).await?;
    Ok(removed)
}
