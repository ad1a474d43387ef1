// projectbackup/src/store/postgres.rs
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use uuid::Uuid;

use super::BackupRepository;
use crate::errors::{EngineError, Result};
use crate::records::{
    BackupConfig, CreatedBackup, CredentialSource, Frequency, Project, RunRecord, RunStatus,
    TableScope,
};

const CONFIG_COLUMNS: &str = "id, project_id, file_name, storage_disk, backup_frequency, backup_time, \
     include_database, database_source, table_scope, retention_days, last_backup_at, next_backup_at, \
     status, error_message, last_created_backup_id, version, created_at, updated_at";

const CREATED_COLUMNS: &str = "id, backup_id, file_name, file_path, size, storage_disk, checksum, \
     file_count, database_included, expires_at, created_at";

/// PostgreSQL-backed repository (schema in `migrations/`).
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub async fn connect(database_url: &str, acquire_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the bundled schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(sqlx::Error::from)?;
        Ok(())
    }

    /// Tells a lost version race apart from a missing row.
    async fn conflict_or_missing(&self, id: Uuid) -> EngineError {
        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM backups WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await;
        match exists {
            Ok(true) => EngineError::Conflict {
                entity: "backup configuration",
                id,
            },
            Ok(false) => EngineError::NotFound {
                entity: "backup configuration",
                id,
            },
            Err(e) => e.into(),
        }
    }

    async fn fetch_created(&self, sql: &str, bind: Option<Uuid>, at: Option<DateTime<Utc>>) -> Result<Vec<CreatedBackup>> {
        let mut query = sqlx::query(sql);
        if let Some(id) = bind {
            query = query.bind(id);
        }
        if let Some(at) = at {
            query = query.bind(at);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(created_from_row).collect()
    }
}

fn decode_error(message: String) -> EngineError {
    EngineError::Repository(sqlx::Error::Decode(message.into()))
}

fn to_db_size(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn project_from_row(row: &PgRow) -> Result<Project> {
    Ok(Project {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        path: row.try_get("path")?,
        description: row.try_get("description")?,
    })
}

fn config_from_row(row: &PgRow) -> Result<BackupConfig> {
    let frequency: Option<String> = row.try_get("backup_frequency")?;
    let frequency = match frequency {
        Some(raw) => Frequency::parse(&raw).map_err(decode_error)?,
        None => None,
    };
    let status: String = row.try_get("status")?;
    let retention_days: i32 = row.try_get("retention_days")?;
    let database_source: Json<CredentialSource> = row.try_get("database_source")?;
    let table_scope: Json<TableScope> = row.try_get("table_scope")?;

    Ok(BackupConfig {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        file_name: row.try_get("file_name")?,
        storage_disk: row.try_get("storage_disk")?,
        frequency,
        backup_time: row.try_get("backup_time")?,
        include_database: row.try_get("include_database")?,
        database_source: database_source.0,
        table_scope: table_scope.0,
        retention_days: u32::try_from(retention_days).unwrap_or(0),
        last_backup_at: row.try_get("last_backup_at")?,
        next_backup_at: row.try_get("next_backup_at")?,
        status: RunStatus::parse(&status).map_err(decode_error)?,
        error_message: row.try_get("error_message")?,
        last_created_backup_id: row.try_get("last_created_backup_id")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn created_from_row(row: &PgRow) -> Result<CreatedBackup> {
    let size: i64 = row.try_get("size")?;
    let file_count: i64 = row.try_get("file_count")?;
    Ok(CreatedBackup {
        id: row.try_get("id")?,
        backup_id: row.try_get("backup_id")?,
        file_name: row.try_get("file_name")?,
        file_path: row.try_get("file_path")?,
        size: u64::try_from(size).unwrap_or(0),
        storage_disk: row.try_get("storage_disk")?,
        checksum: row.try_get("checksum")?,
        file_count: u64::try_from(file_count).unwrap_or(0),
        database_included: row.try_get("database_included")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl BackupRepository for PgRepository {
    async fn project(&self, id: Uuid) -> Result<Project> {
        let row = sqlx::query("SELECT id, name, path, description FROM projects WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(EngineError::NotFound { entity: "project", id })?;
        project_from_row(&row)
    }

    async fn insert_project(&self, project: &Project) -> Result<()> {
        sqlx::query("INSERT INTO projects (id, name, path, description) VALUES ($1, $2, $3, $4)")
            .bind(project.id)
            .bind(&project.name)
            .bind(&project.path)
            .bind(&project.description)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_project(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn backup_config(&self, id: Uuid) -> Result<BackupConfig> {
        let row = sqlx::query(&format!("SELECT {CONFIG_COLUMNS} FROM backups WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(EngineError::NotFound {
                entity: "backup configuration",
                id,
            })?;
        config_from_row(&row)
    }

    async fn backup_configs_for(&self, project_id: Uuid) -> Result<Vec<BackupConfig>> {
        let rows = sqlx::query(&format!(
            "SELECT {CONFIG_COLUMNS} FROM backups WHERE project_id = $1 ORDER BY created_at, id"
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(config_from_row).collect()
    }

    async fn insert_backup_config(&self, config: &BackupConfig) -> Result<()> {
        sqlx::query(
            "INSERT INTO backups (id, project_id, file_name, storage_disk, backup_frequency, backup_time, \
             include_database, database_source, table_scope, retention_days, last_backup_at, next_backup_at, \
             status, error_message, last_created_backup_id, version, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
        )
        .bind(config.id)
        .bind(config.project_id)
        .bind(&config.file_name)
        .bind(&config.storage_disk)
        .bind(config.frequency.map(|f| f.as_str()))
        .bind(config.backup_time)
        .bind(config.include_database)
        .bind(Json(&config.database_source))
        .bind(Json(&config.table_scope))
        .bind(i32::try_from(config.retention_days).unwrap_or(i32::MAX))
        .bind(config.last_backup_at)
        .bind(config.next_backup_at)
        .bind(config.status.as_str())
        .bind(&config.error_message)
        .bind(config.last_created_backup_id)
        .bind(config.version)
        .bind(config.created_at)
        .bind(config.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_backup_config(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM backups WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_pending(&self, id: Uuid, expected_version: i64) -> Result<BackupConfig> {
        let row = sqlx::query(&format!(
            "UPDATE backups SET status = 'pending', error_message = NULL, version = version + 1, \
             updated_at = now() WHERE id = $1 AND version = $2 RETURNING {CONFIG_COLUMNS}"
        ))
        .bind(id)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => config_from_row(&row),
            None => Err(self.conflict_or_missing(id).await),
        }
    }

    async fn record_run(&self, id: Uuid, expected_version: i64, run: &RunRecord) -> Result<BackupConfig> {
        let row = sqlx::query(&format!(
            "UPDATE backups SET status = $3, error_message = $4, \
             last_backup_at = COALESCE($5, last_backup_at), \
             last_created_backup_id = COALESCE($6, last_created_backup_id), \
             version = version + 1, updated_at = now() \
             WHERE id = $1 AND version = $2 RETURNING {CONFIG_COLUMNS}"
        ))
        .bind(id)
        .bind(expected_version)
        .bind(run.status.as_str())
        .bind(&run.error_message)
        .bind(run.last_backup_at)
        .bind(run.last_created_backup_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => config_from_row(&row),
            None => Err(self.conflict_or_missing(id).await),
        }
    }

    async fn due_configs(&self, cutoff: DateTime<Utc>) -> Result<Vec<BackupConfig>> {
        let rows = sqlx::query(&format!(
            "SELECT {CONFIG_COLUMNS} FROM backups \
             WHERE backup_frequency IS NOT NULL AND next_backup_at <= $1 \
             ORDER BY next_backup_at, id"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(config_from_row).collect()
    }

    async fn set_next_backup_at(&self, id: Uuid, next: Option<DateTime<Utc>>) -> Result<()> {
        let result = sqlx::query("UPDATE backups SET next_backup_at = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(next)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound {
                entity: "backup configuration",
                id,
            });
        }
        Ok(())
    }

    async fn created_backup(&self, id: Uuid) -> Result<CreatedBackup> {
        let row = sqlx::query(&format!("SELECT {CREATED_COLUMNS} FROM created_backups WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(EngineError::NotFound {
                entity: "created backup",
                id,
            })?;
        created_from_row(&row)
    }

    async fn insert_created_backup(&self, backup: &CreatedBackup) -> Result<()> {
        sqlx::query(
            "INSERT INTO created_backups (id, backup_id, file_name, file_path, size, storage_disk, checksum, \
             file_count, database_included, expires_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(backup.id)
        .bind(backup.backup_id)
        .bind(&backup.file_name)
        .bind(&backup.file_path)
        .bind(to_db_size(backup.size))
        .bind(&backup.storage_disk)
        .bind(&backup.checksum)
        .bind(to_db_size(backup.file_count))
        .bind(backup.database_included)
        .bind(backup.expires_at)
        .bind(backup.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn created_backups(&self) -> Result<Vec<CreatedBackup>> {
        self.fetch_created(
            &format!("SELECT {CREATED_COLUMNS} FROM created_backups ORDER BY created_at, id"),
            None,
            None,
        )
        .await
    }

    async fn created_backups_for(&self, backup_id: Uuid) -> Result<Vec<CreatedBackup>> {
        self.fetch_created(
            &format!("SELECT {CREATED_COLUMNS} FROM created_backups WHERE backup_id = $1 ORDER BY created_at, id"),
            Some(backup_id),
            None,
        )
        .await
    }

    async fn expired_created_backups(&self, now: DateTime<Utc>) -> Result<Vec<CreatedBackup>> {
        self.fetch_created(
            &format!(
                "SELECT {CREATED_COLUMNS} FROM created_backups \
                 WHERE expires_at IS NOT NULL AND expires_at <= $1 ORDER BY created_at, id"
            ),
            None,
            Some(now),
        )
        .await
    }

    async fn delete_created_backup(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM created_backups WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
