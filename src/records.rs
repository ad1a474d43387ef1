// projectbackup/src/records.rs
//! Records the engine reads and writes: projects, backup configurations and
//! the artifacts produced by each run.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backup::credentials::SealedCredentials;

/// Name of the disk used when a configuration does not pick one.
pub const DEFAULT_DISK: &str = "local";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    /// `~/...`, `/...`, or relative to the configured projects base directory.
    pub path: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
        }
    }

    /// Parses a stored recurrence rule. `none` and the empty string mean no recurrence.
    pub fn parse(value: &str) -> Result<Option<Self>, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(None),
            "daily" => Ok(Some(Frequency::Daily)),
            "weekly" => Ok(Some(Frequency::Weekly)),
            "monthly" => Ok(Some(Frequency::Monthly)),
            other => Err(format!("Unknown backup frequency: '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value {
            "pending" => Ok(RunStatus::Pending),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("Unknown run status: '{}'", other)),
        }
    }
}

/// Where the credentials of a project's database come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialSource {
    /// The project's own `.env` file.
    Env,
    /// Explicit connection details, sealed at rest.
    Custom { sealed: SealedCredentials },
    /// Reserved; never yields credentials.
    ProjectConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", content = "tables", rename_all = "lowercase")]
pub enum TableScope {
    #[default]
    All,
    Selected(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupConfig {
    pub id: Uuid,
    pub project_id: Uuid,
    /// Base name of the produced archives.
    pub file_name: String,
    pub storage_disk: String,
    pub frequency: Option<Frequency>,
    pub backup_time: NaiveTime,
    pub include_database: bool,
    pub database_source: CredentialSource,
    pub table_scope: TableScope,
    /// Zero keeps artifacts forever.
    pub retention_days: u32,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub next_backup_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub error_message: Option<String>,
    pub last_created_backup_id: Option<Uuid>,
    /// Bumped on every status write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BackupConfig {
    /// A pending, non-recurring, file-only configuration with 30 days retention.
    pub fn new(project_id: Uuid, file_name: impl Into<String>) -> Self {
        let now = Utc::now();
        BackupConfig {
            id: Uuid::new_v4(),
            project_id,
            file_name: file_name.into(),
            storage_disk: DEFAULT_DISK.to_string(),
            frequency: None,
            backup_time: NaiveTime::from_hms_opt(2, 0, 0).unwrap_or(NaiveTime::MIN),
            include_database: false,
            database_source: CredentialSource::Env,
            table_scope: TableScope::All,
            retention_days: 30,
            last_backup_at: None,
            next_backup_at: None,
            status: RunStatus::Pending,
            error_message: None,
            last_created_backup_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// `None` keeps the artifact forever. A retention reaching past the
    /// representable calendar is treated the same way.
    pub fn expiry_from(&self, created_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.retention_days == 0 {
            return None;
        }
        Duration::try_days(i64::from(self.retention_days)).and_then(|retention| created_at.checked_add_signed(retention))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedBackup {
    pub id: Uuid,
    pub backup_id: Uuid,
    pub file_name: String,
    /// Relative to the root of `storage_disk`.
    pub file_path: String,
    pub size: u64,
    pub storage_disk: String,
    pub checksum: Option<String>,
    pub file_count: u64,
    pub database_included: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CreatedBackup {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

/// The fields written when a run reaches a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub status: RunStatus,
    pub error_message: Option<String>,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub last_created_backup_id: Option<Uuid>,
}
