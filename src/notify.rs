// projectbackup/src/notify.rs
//! Completion events for backup runs.
//!
//! The engine only produces [`BackupEvent`]s; turning them into mail or chat
//! messages is left to whoever implements [`Notifier`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::backup::DatabaseDump;
use crate::errors::{EngineError, Result};
use crate::records::{BackupConfig, CreatedBackup, RunStatus};

/// Who should hear about a run. Always supplied by the caller that triggered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Recipient(pub String);

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupEvent {
    /// Configuration as stored after the run's final status write.
    pub config: BackupConfig,
    pub status: RunStatus,
    pub created_backup: Option<CreatedBackup>,
    pub database: DatabaseDump,
    pub error_message: Option<String>,
    pub recipient: Option<Recipient>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &BackupEvent) -> Result<()>;
}

/// Writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &BackupEvent) -> Result<()> {
        let recipient = event
            .recipient
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "-".to_string());
        match event.status {
            RunStatus::Success => tracing::info!(
                backup = %event.config.id,
                created_backup = ?event.created_backup.as_ref().map(|b| b.id),
                database = ?event.database,
                %recipient,
                "backup completed"
            ),
            _ => tracing::warn!(
                backup = %event.config.id,
                status = event.status.as_str(),
                error = event.error_message.as_deref().unwrap_or(""),
                %recipient,
                "backup did not complete"
            ),
        }
        Ok(())
    }
}

/// Forwards events to an in-process consumer (a mailer task, tests, ...).
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<BackupEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BackupEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, event: &BackupEvent) -> Result<()> {
        self.sender
            .send(event.clone())
            .map_err(|_| EngineError::Notification("event receiver has been dropped".to_string()))
    }
}
