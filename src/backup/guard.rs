// projectbackup/src/backup/guard.rs
use std::collections::HashSet;
use std::sync::Mutex;

use uuid::Uuid;

use crate::errors::{EngineError, Result};

/// Configurations with a run in flight in this process.
#[derive(Debug, Default)]
pub struct RunGuard {
    active: Mutex<HashSet<Uuid>>,
}

/// Held for the duration of one run; releases the configuration on drop.
#[derive(Debug)]
pub struct RunTicket<'a> {
    guard: &'a RunGuard,
    config_id: Uuid,
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `config_id`, or fails with `RunInProgress` if it is already claimed.
    pub fn acquire(&self, config_id: Uuid) -> Result<RunTicket<'_>> {
        let mut active = self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !active.insert(config_id) {
            return Err(EngineError::RunInProgress(config_id));
        }
        Ok(RunTicket {
            guard: self,
            config_id,
        })
    }

    pub fn is_running(&self, config_id: Uuid) -> bool {
        let active = self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        active.contains(&config_id)
    }
}

impl Drop for RunTicket<'_> {
    fn drop(&mut self) {
        let mut active = self.guard.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        active.remove(&self.config_id);
    }
}
