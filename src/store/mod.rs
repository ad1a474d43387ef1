// projectbackup/src/store/mod.rs
//! Persistence boundary for projects, backup configurations and created backups.

mod memory;
mod postgres;

pub use memory::MemoryRepository;
pub use postgres::PgRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::Result;
use crate::records::{BackupConfig, CreatedBackup, Project, RunRecord};

/// Everything the engine reads and writes about projects and their backups.
///
/// Status writes (`mark_pending`, `record_run`) are version-checked: they only
/// apply when the stored `version` equals `expected_version`, bump it by one,
/// and fail with `EngineError::Conflict` otherwise.
#[async_trait]
pub trait BackupRepository: Send + Sync {
    async fn project(&self, id: Uuid) -> Result<Project>;
    async fn insert_project(&self, project: &Project) -> Result<()>;
    /// Deletes the project and, by cascade, its configurations and their records.
    async fn delete_project(&self, id: Uuid) -> Result<bool>;

    async fn backup_config(&self, id: Uuid) -> Result<BackupConfig>;
    async fn backup_configs_for(&self, project_id: Uuid) -> Result<Vec<BackupConfig>>;
    async fn insert_backup_config(&self, config: &BackupConfig) -> Result<()>;
    /// Deletes the configuration and, by cascade, its created backup records.
    async fn delete_backup_config(&self, id: Uuid) -> Result<bool>;

    async fn mark_pending(&self, id: Uuid, expected_version: i64) -> Result<BackupConfig>;
    async fn record_run(&self, id: Uuid, expected_version: i64, run: &RunRecord) -> Result<BackupConfig>;

    /// Recurring configurations whose next run is on or before `cutoff`.
    async fn due_configs(&self, cutoff: DateTime<Utc>) -> Result<Vec<BackupConfig>>;
    async fn set_next_backup_at(&self, id: Uuid, next: Option<DateTime<Utc>>) -> Result<()>;

    async fn created_backup(&self, id: Uuid) -> Result<CreatedBackup>;
    async fn insert_created_backup(&self, backup: &CreatedBackup) -> Result<()>;
    async fn created_backups(&self) -> Result<Vec<CreatedBackup>>;
    async fn created_backups_for(&self, backup_id: Uuid) -> Result<Vec<CreatedBackup>>;
    async fn expired_created_backups(&self, now: DateTime<Utc>) -> Result<Vec<CreatedBackup>>;
    /// `false` when the record was already gone.
    async fn delete_created_backup(&self, id: Uuid) -> Result<bool>;
}
