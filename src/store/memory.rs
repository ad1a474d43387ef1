// projectbackup/src/store/memory.rs
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::BackupRepository;
use crate::errors::{EngineError, Result};
use crate::records::{BackupConfig, CreatedBackup, Project, RunRecord, RunStatus};

#[derive(Default)]
struct State {
    projects: HashMap<Uuid, Project>,
    configs: HashMap<Uuid, BackupConfig>,
    created: HashMap<Uuid, CreatedBackup>,
}

impl State {
    fn config_mut(&mut self, id: Uuid, expected_version: i64) -> Result<&mut BackupConfig> {
        let config = self.configs.get_mut(&id).ok_or(EngineError::NotFound {
            entity: "backup configuration",
            id,
        })?;
        if config.version != expected_version {
            return Err(EngineError::Conflict {
                entity: "backup configuration",
                id,
            });
        }
        Ok(config)
    }

    fn cascade_config(&mut self, id: Uuid) -> bool {
        self.created.retain(|_, backup| backup.backup_id != id);
        self.configs.remove(&id).is_some()
    }
}

/// Repository kept in process memory. Used by tests and dry runs.
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_by_creation(mut backups: Vec<CreatedBackup>) -> Vec<CreatedBackup> {
    backups.sort_by_key(|b| (b.created_at, b.id));
    backups
}

#[async_trait]
impl BackupRepository for MemoryRepository {
    async fn project(&self, id: Uuid) -> Result<Project> {
        let state = self.state.lock().await;
        state
            .projects
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound { entity: "project", id })
    }

    async fn insert_project(&self, project: &Project) -> Result<()> {
        let mut state = self.state.lock().await;
        state.projects.insert(project.id, project.clone());
        Ok(())
    }

    async fn delete_project(&self, id: Uuid) -> Result<bool> {
        let mut state = self.state.lock().await;
        let owned: Vec<Uuid> = state
            .configs
            .values()
            .filter(|c| c.project_id == id)
            .map(|c| c.id)
            .collect();
        for config_id in owned {
            state.cascade_config(config_id);
        }
        Ok(state.projects.remove(&id).is_some())
    }

    async fn backup_config(&self, id: Uuid) -> Result<BackupConfig> {
        let state = self.state.lock().await;
        state.configs.get(&id).cloned().ok_or(EngineError::NotFound {
            entity: "backup configuration",
            id,
        })
    }

    async fn backup_configs_for(&self, project_id: Uuid) -> Result<Vec<BackupConfig>> {
        let state = self.state.lock().await;
        let mut configs: Vec<BackupConfig> = state
            .configs
            .values()
            .filter(|c| c.project_id == project_id)
            .cloned()
            .collect();
        configs.sort_by_key(|c| (c.created_at, c.id));
        Ok(configs)
    }

    async fn insert_backup_config(&self, config: &BackupConfig) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.projects.contains_key(&config.project_id) {
            return Err(EngineError::NotFound {
                entity: "project",
                id: config.project_id,
            });
        }
        state.configs.insert(config.id, config.clone());
        Ok(())
    }

    async fn delete_backup_config(&self, id: Uuid) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state.cascade_config(id))
    }

    async fn mark_pending(&self, id: Uuid, expected_version: i64) -> Result<BackupConfig> {
        let mut state = self.state.lock().await;
        let config = state.config_mut(id, expected_version)?;
        config.status = RunStatus::Pending;
        config.error_message = None;
        config.version += 1;
        config.updated_at = Utc::now();
        Ok(config.clone())
    }

    async fn record_run(&self, id: Uuid, expected_version: i64, run: &RunRecord) -> Result<BackupConfig> {
        let mut state = self.state.lock().await;
        let config = state.config_mut(id, expected_version)?;
        config.status = run.status;
        config.error_message = run.error_message.clone();
        if run.last_backup_at.is_some() {
            config.last_backup_at = run.last_backup_at;
        }
        if run.last_created_backup_id.is_some() {
            config.last_created_backup_id = run.last_created_backup_id;
        }
        config.version += 1;
        config.updated_at = Utc::now();
        Ok(config.clone())
    }

    async fn due_configs(&self, cutoff: DateTime<Utc>) -> Result<Vec<BackupConfig>> {
        let state = self.state.lock().await;
        let mut due: Vec<BackupConfig> = state
            .configs
            .values()
            .filter(|c| c.frequency.is_some())
            .filter(|c| c.next_backup_at.is_some_and(|at| at <= cutoff))
            .cloned()
            .collect();
        due.sort_by_key(|c| (c.next_backup_at, c.id));
        Ok(due)
    }

    async fn set_next_backup_at(&self, id: Uuid, next: Option<DateTime<Utc>>) -> Result<()> {
        let mut state = self.state.lock().await;
        let config = state.configs.get_mut(&id).ok_or(EngineError::NotFound {
            entity: "backup configuration",
            id,
        })?;
        config.next_backup_at = next;
        config.updated_at = Utc::now();
        Ok(())
    }

    async fn created_backup(&self, id: Uuid) -> Result<CreatedBackup> {
        let state = self.state.lock().await;
        state.created.get(&id).cloned().ok_or(EngineError::NotFound {
            entity: "created backup",
            id,
        })
    }

    async fn insert_created_backup(&self, backup: &CreatedBackup) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.configs.contains_key(&backup.backup_id) {
            return Err(EngineError::NotFound {
                entity: "backup configuration",
                id: backup.backup_id,
            });
        }
        state.created.insert(backup.id, backup.clone());
        Ok(())
    }

    async fn created_backups(&self) -> Result<Vec<CreatedBackup>> {
        let state = self.state.lock().await;
        Ok(sorted_by_creation(state.created.values().cloned().collect()))
    }

    async fn created_backups_for(&self, backup_id: Uuid) -> Result<Vec<CreatedBackup>> {
        let state = self.state.lock().await;
        Ok(sorted_by_creation(
            state
                .created
                .values()
                .filter(|b| b.backup_id == backup_id)
                .cloned()
                .collect(),
        ))
    }

    async fn expired_created_backups(&self, now: DateTime<Utc>) -> Result<Vec<CreatedBackup>> {
        let state = self.state.lock().await;
        Ok(sorted_by_creation(
            state
                .created
                .values()
                .filter(|b| b.is_expired(now))
                .cloned()
                .collect(),
        ))
    }

    async fn delete_created_backup(&self, id: Uuid) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state.created.remove(&id).is_some())
    }
}
