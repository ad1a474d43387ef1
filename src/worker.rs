// projectbackup/src/worker.rs
//! Background execution of backup and restore jobs.
//!
//! Jobs are queued through a [`WorkerHandle`] and executed off the caller's
//! task. Backup and restore jobs each hold one of `concurrency` slots until
//! they reach a terminal state; sweeps do not take a slot.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backup::run_backup;
use crate::engine::Engine;
use crate::errors::{EngineError, Result};
use crate::notify::Recipient;
use crate::restore::restore;
use crate::retention::sweep_expired;
use crate::schedule::collect_due;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    Backup {
        config_id: Uuid,
        recipient: Option<Recipient>,
    },
    Restore {
        created_backup_id: Uuid,
        target: Option<String>,
    },
    /// Queues a backup for every configuration due today or earlier.
    DispatchDue { recipient: Option<Recipient> },
    SweepExpired,
}

impl Job {
    fn name(&self) -> &'static str {
        match self {
            Job::Backup { .. } => "backup",
            Job::Restore { .. } => "restore",
            Job::DispatchDue { .. } => "dispatch-due",
            Job::SweepExpired => "sweep-expired",
        }
    }

    fn needs_slot(&self) -> bool {
        matches!(self, Job::Backup { .. } | Job::Restore { .. })
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    /// Period of the automatic due-backup and expiry sweeps. `None` disables them.
    pub sweep_interval: Option<Duration>,
    /// Recipient of scheduled runs.
    pub recipient: Option<Recipient>,
}

/// Handle for queueing jobs and stopping the worker.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::UnboundedSender<Job>,
    cancel: CancellationToken,
}

impl WorkerHandle {
    pub fn submit(&self, job: Job) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::WorkerStopped);
        }
        self.tx.send(job).map_err(|_| EngineError::WorkerStopped)
    }

    /// Stops taking jobs. Jobs already running are awaited by the worker task;
    /// queued ones are dropped and logged.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

pub struct Worker;

impl Worker {
    /// Spawns the worker loop. The returned task finishes after `shutdown`
    /// once every running job has completed.
    pub fn spawn(engine: Arc<Engine>, settings: WorkerSettings) -> (WorkerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = WorkerHandle {
            tx: tx.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(Self::run(engine, settings, tx, rx, cancel));
        (handle, task)
    }

    async fn run(
        engine: Arc<Engine>,
        settings: WorkerSettings,
        tx: mpsc::UnboundedSender<Job>,
        mut rx: mpsc::UnboundedReceiver<Job>,
        cancel: CancellationToken,
    ) {
        let slots = Arc::new(Semaphore::new(settings.concurrency.max(1)));
        let mut running = JoinSet::new();
        let mut sweep = settings.sweep_interval.map(tokio::time::interval);

        tracing::info!(
            concurrency = settings.concurrency,
            sweep_interval_secs = settings.sweep_interval.map(|d| d.as_secs()),
            "backup worker started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("backup worker shutting down");
                    break;
                }
                Some(job) = rx.recv() => {
                    let permit = if job.needs_slot() {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                abandon(&job);
                                tracing::info!("backup worker shutting down");
                                break;
                            }
                            permit = slots.clone().acquire_owned() => match permit {
                                Ok(permit) => Some(permit),
                                Err(_) => {
                                    abandon(&job);
                                    break;
                                }
                            },
                        }
                    } else {
                        None
                    };
                    let engine = engine.clone();
                    let tx = tx.clone();
                    running.spawn(async move {
                        execute(&engine, job, &tx).await;
                        drop(permit);
                    });
                }
                _ = tick(&mut sweep) => {
                    let _ = tx.send(Job::DispatchDue { recipient: settings.recipient.clone() });
                    let _ = tx.send(Job::SweepExpired);
                }
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "worker job panicked");
                    }
                }
            }
        }

        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "worker job panicked");
            }
        }
        // Includes backups queued by a due sweep that finished during the drain.
        let abandoned = drain_queue(&mut rx);
        for job in &abandoned {
            abandon(job);
        }
        tracing::info!(abandoned = abandoned.len(), "backup worker stopped");
    }
}

/// Takes every job still waiting in the queue without blocking.
fn drain_queue(rx: &mut mpsc::UnboundedReceiver<Job>) -> Vec<Job> {
    let mut jobs = Vec::new();
    while let Ok(job) = rx.try_recv() {
        jobs.push(job);
    }
    jobs
}

fn abandon(job: &Job) {
    tracing::warn!(job = job.name(), detail = ?job, "job abandoned at shutdown");
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn execute(engine: &Engine, job: Job, tx: &mpsc::UnboundedSender<Job>) {
    let name = job.name();
    tracing::debug!(job = name, "job started");

    let result: Result<()> = match job {
        Job::Backup { config_id, recipient } => run_backup(engine, config_id, recipient).await.map(|outcome| {
            tracing::info!(
                backup = %config_id,
                status = outcome.status.as_str(),
                database = ?outcome.database,
                "backup job finished"
            );
        }),
        Job::Restore {
            created_backup_id,
            target,
        } => restore(engine, created_backup_id, target.as_deref()).await.map(|outcome| {
            tracing::info!(
                created_backup = %created_backup_id,
                files = outcome.files_written,
                database = ?outcome.database,
                "restore job finished"
            );
        }),
        Job::DispatchDue { recipient } => match collect_due(engine.repo.as_ref(), Utc::now()).await {
            Ok(due) => {
                for run in due {
                    let _ = tx.send(Job::Backup {
                        config_id: run.config_id,
                        recipient: recipient.clone(),
                    });
                }
                Ok(())
            }
            Err(e) => Err(e),
        },
        Job::SweepExpired => sweep_expired(engine.repo.as_ref(), &engine.config.disks, Utc::now())
            .await
            .map(|report| {
                if !report.errors.is_empty() {
                    tracing::warn!(failures = report.errors.len(), "expiry sweep left records behind");
                }
            }),
    };

    if let Err(e) = result {
        tracing::error!(job = name, error = %e, "job failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draining_returns_queued_jobs_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        tx.send(Job::Backup {
            config_id: id,
            recipient: None,
        })
        .unwrap();
        tx.send(Job::SweepExpired).unwrap();

        assert_eq!(
            drain_queue(&mut rx),
            vec![
                Job::Backup {
                    config_id: id,
                    recipient: None
                },
                Job::SweepExpired
            ]
        );
        assert!(drain_queue(&mut rx).is_empty());
    }

    #[test]
    fn only_runs_take_a_slot() {
        assert!(Job::Restore {
            created_backup_id: Uuid::new_v4(),
            target: None
        }
        .needs_slot());
        assert!(!Job::DispatchDue { recipient: None }.needs_slot());
        assert!(!Job::SweepExpired.needs_slot());
    }
}
