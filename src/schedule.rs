// projectbackup/src/schedule.rs
//! Recurrence of backup configurations and the due-backup sweep.
//!
//! All times are UTC; `backup_time` is a UTC time of day.

use chrono::{DateTime, Duration, Months, NaiveTime, Utc};
use uuid::Uuid;

use crate::backup::run_backup;
use crate::engine::Engine;
use crate::errors::Result;
use crate::notify::Recipient;
use crate::records::{BackupConfig, Frequency, RunStatus};
use crate::store::BackupRepository;

/// `t` plus one interval. Monthly steps land on the same day of the next
/// month, or its last day when that day does not exist.
pub fn next_due(frequency: Frequency, t: DateTime<Utc>) -> DateTime<Utc> {
    let next = match frequency {
        Frequency::Daily => t.checked_add_signed(Duration::days(1)),
        Frequency::Weekly => t.checked_add_signed(Duration::weeks(1)),
        Frequency::Monthly => t.checked_add_months(Months::new(1)),
    };
    next.unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// First run of a freshly (re)scheduled configuration: today at
/// `backup_time`, moved forward by whole intervals until it is after `now`.
pub fn initial_due(frequency: Frequency, backup_time: NaiveTime, now: DateTime<Utc>) -> DateTime<Utc> {
    let anchor = now.date_naive().and_time(backup_time).and_utc();
    forward_past(frequency, anchor, now)
}

/// Next run after a dispatched one. Runs missed while nothing was sweeping
/// are skipped rather than replayed.
pub fn advance_due(frequency: Frequency, previous_due: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    forward_past(frequency, next_due(frequency, previous_due), now)
}

fn forward_past(frequency: Frequency, mut candidate: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    while candidate <= now {
        let next = next_due(frequency, candidate);
        if next == candidate {
            break;
        }
        candidate = next;
    }
    candidate
}

/// Recomputes `next_backup_at` from the configuration's recurrence rule.
pub fn reschedule(config: &mut BackupConfig, now: DateTime<Utc>) {
    config.next_backup_at = config
        .frequency
        .map(|frequency| initial_due(frequency, config.backup_time, now));
}

/// Last instant of the UTC day containing `now`.
pub fn end_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = now.date_naive().and_time(NaiveTime::MIN).and_utc();
    midnight + Duration::days(1) - Duration::nanoseconds(1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueRun {
    pub config_id: Uuid,
    pub due_at: DateTime<Utc>,
    pub next_backup_at: DateTime<Utc>,
}

/// Selects every recurring configuration due today or earlier and advances
/// its `next_backup_at` by one interval. The caller dispatches the runs.
pub async fn collect_due(repo: &dyn BackupRepository, now: DateTime<Utc>) -> Result<Vec<DueRun>> {
    let due = repo.due_configs(end_of_day(now)).await?;
    let mut runs = Vec::with_capacity(due.len());

    for config in due {
        let (Some(frequency), Some(due_at)) = (config.frequency, config.next_backup_at) else {
            continue;
        };
        let next_backup_at = advance_due(frequency, due_at, now);
        repo.set_next_backup_at(config.id, Some(next_backup_at)).await?;
        tracing::info!(
            backup = %config.id,
            due_at = %due_at,
            next_backup_at = %next_backup_at,
            "backup due"
        );
        runs.push(DueRun {
            config_id: config.id,
            due_at,
            next_backup_at,
        });
    }
    Ok(runs)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Runs that could not start, with the reason.
    pub rejected: Vec<(Uuid, String)>,
}

/// Collects due configurations and runs each one in turn.
pub async fn dispatch_due(engine: &Engine, now: DateTime<Utc>, recipient: Option<Recipient>) -> Result<DispatchReport> {
    let runs = collect_due(engine.repo.as_ref(), now).await?;
    let mut report = DispatchReport {
        dispatched: runs.len(),
        ..DispatchReport::default()
    };

    for run in runs {
        match run_backup(engine, run.config_id, recipient.clone()).await {
            Ok(outcome) if outcome.status == RunStatus::Success => report.succeeded += 1,
            Ok(_) => report.failed += 1,
            Err(e) => {
                tracing::warn!(backup = %run.config_id, error = %e, "due backup could not start");
                report.rejected.push((run.config_id, e.to_string()));
            }
        }
    }
    Ok(report)
}
