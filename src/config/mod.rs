// projectbackup/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::records::DEFAULT_DISK;
use crate::storage::DiskRegistry;

const DEFAULT_WORKER_CONCURRENCY: usize = 2;
const DEFAULT_DB_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3600;

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub database_url: Option<String>,
    pub projects_base_dir: Option<PathBuf>,
    pub disks: Option<HashMap<String, PathBuf>>,
    pub follow_symlinks: Option<bool>,
    pub worker_concurrency: Option<usize>,
    pub db_connect_timeout_secs: Option<u64>,
    pub app_key: Option<String>,
    /// Zero disables the worker's periodic sweeps.
    pub sweep_interval_secs: Option<u64>,
    pub notify_recipient: Option<String>,
}

// Application's internal configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Connection URL of the database holding projects and backup records.
    pub database_url: Option<String>,
    pub projects_base_dir: PathBuf,
    pub disks: DiskRegistry,
    pub follow_symlinks: bool,
    pub worker_concurrency: usize,
    pub db_connect_timeout: Duration,
    /// Key used to unseal custom database credentials.
    pub app_key: Option<String>,
    pub sweep_interval: Option<Duration>,
    /// Recipient of notifications for scheduled runs.
    pub notify_recipient: Option<String>,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;

        let mut config = Self::from_raw(raw_json_config)?;
        // Secrets are usually kept out of config.json.
        if config.database_url.is_none() {
            config.database_url = env::var("DATABASE_URL").ok().filter(|s| !s.is_empty());
        }
        if config.app_key.is_none() {
            config.app_key = env::var("APP_KEY").ok().filter(|s| !s.is_empty());
        }
        Ok(config)
    }

    pub fn from_raw(raw: RawJsonConfig) -> Result<Self> {
        let projects_base_dir = raw
            .projects_base_dir
            .context("projects_base_dir must be set in config.json")?;
        if projects_base_dir.as_os_str().is_empty() {
            return Err(anyhow::anyhow!(
                "projects_base_dir cannot be empty in config.json."
            ));
        }

        let disks = parse_disks(raw.disks)?;

        let worker_concurrency = raw.worker_concurrency.unwrap_or(DEFAULT_WORKER_CONCURRENCY);
        if worker_concurrency == 0 {
            return Err(anyhow::anyhow!(
                "worker_concurrency must be at least 1 in config.json."
            ));
        }

        Ok(AppConfig {
            database_url: raw.database_url.filter(|s| !s.is_empty()),
            projects_base_dir,
            disks,
            follow_symlinks: raw.follow_symlinks.unwrap_or(false),
            worker_concurrency,
            db_connect_timeout: Duration::from_secs(
                raw.db_connect_timeout_secs
                    .unwrap_or(DEFAULT_DB_CONNECT_TIMEOUT_SECS),
            ),
            app_key: raw.app_key.filter(|s| !s.is_empty()),
            sweep_interval: match raw.sweep_interval_secs.unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS) {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            notify_recipient: raw.notify_recipient.filter(|s| !s.trim().is_empty()),
        })
    }
}

/// Builds the disk registry. The `local` disk must always be present.
fn parse_disks(disks: Option<HashMap<String, PathBuf>>) -> Result<DiskRegistry> {
    let disks = disks.context("disks must be defined in config.json")?;
    if !disks.contains_key(DEFAULT_DISK) {
        return Err(anyhow::anyhow!(
            "disks in config.json must define a '{}' disk",
            DEFAULT_DISK
        ));
    }

    let mut registry = DiskRegistry::new();
    for (name, root) in disks {
        if root.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("Root of disk '{}' cannot be empty in config.json.", name));
        }
        registry.insert(name, root);
    }
    Ok(registry)
}
