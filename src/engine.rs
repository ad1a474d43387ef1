// projectbackup/src/engine.rs
use std::path::PathBuf;
use std::sync::Arc;

use crate::backup::credentials::CredentialCipher;
use crate::backup::guard::RunGuard;
use crate::config::AppConfig;
use crate::errors::Result;
use crate::notify::Notifier;
use crate::records::Project;
use crate::store::BackupRepository;
use crate::utils::paths::resolve_project_path;

/// Shared state of every backup, restore and sweep in this process.
pub struct Engine {
    pub config: AppConfig,
    pub repo: Arc<dyn BackupRepository>,
    pub notifier: Arc<dyn Notifier>,
    cipher: Option<CredentialCipher>,
    runs: RunGuard,
}

impl Engine {
    /// Fails when `APP_KEY` is set but unusable.
    pub fn new(config: AppConfig, repo: Arc<dyn BackupRepository>, notifier: Arc<dyn Notifier>) -> Result<Self> {
        let cipher = match config.app_key.as_deref() {
            Some(key) => Some(CredentialCipher::from_app_key(key)?),
            None => {
                tracing::debug!("APP_KEY not set, custom database credentials cannot be opened");
                None
            }
        };
        Ok(Self {
            config,
            repo,
            notifier,
            cipher,
            runs: RunGuard::new(),
        })
    }

    pub fn cipher(&self) -> Option<&CredentialCipher> {
        self.cipher.as_ref()
    }

    pub fn runs(&self) -> &RunGuard {
        &self.runs
    }

    pub fn project_dir(&self, project: &Project) -> PathBuf {
        resolve_project_path(&project.path, &self.config.projects_base_dir)
    }
}
