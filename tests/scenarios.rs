// projectbackup/tests/scenarios.rs
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use projectbackup::backup::archive::{self, DATABASE_DUMP_ENTRY, ExtraEntry, WalkOptions};
use projectbackup::backup::{DatabaseDump, run_backup};
use projectbackup::config::{AppConfig, RawJsonConfig};
use projectbackup::integrity;
use projectbackup::notify::{BackupEvent, ChannelNotifier, Recipient};
use projectbackup::records::{BackupConfig, CreatedBackup, Frequency, Project, RunStatus};
use projectbackup::restore::{DatabaseRestore, restore};
use projectbackup::retention::{delete_created_backup, sweep_expired};
use projectbackup::schedule::dispatch_due;
use projectbackup::store::{BackupRepository, MemoryRepository};
use projectbackup::worker::{Job, Worker, WorkerSettings};
use projectbackup::{Engine, EngineError};

struct Harness {
    _root: TempDir,
    projects: std::path::PathBuf,
    disk: std::path::PathBuf,
    repo: Arc<MemoryRepository>,
    engine: Arc<Engine>,
    events: UnboundedReceiver<BackupEvent>,
}

fn harness() -> Harness {
    let root = tempfile::tempdir().unwrap();
    let projects = root.path().join("projects");
    let disk = root.path().join("storage");
    fs::create_dir_all(&projects).unwrap();
    fs::create_dir_all(&disk).unwrap();

    let raw: RawJsonConfig = serde_json::from_value(json!({
        "projects_base_dir": projects,
        "disks": { "local": disk },
        "db_connect_timeout_secs": 2,
        "worker_concurrency": 2
    }))
    .unwrap();
    let config = AppConfig::from_raw(raw).unwrap();

    let repo = Arc::new(MemoryRepository::new());
    let (notifier, events) = ChannelNotifier::new();
    let engine = Engine::new(config, repo.clone(), Arc::new(notifier)).unwrap();

    Harness {
        _root: root,
        projects,
        disk,
        repo,
        engine: Arc::new(engine),
        events,
    }
}

impl Harness {
    /// Registers a project at `<base>/<name>` holding `files`.
    async fn project(&self, name: &str, files: &[(&str, &str)]) -> Project {
        let dir = self.projects.join(name);
        for (relative, contents) in files {
            let path = dir.join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, contents).unwrap();
        }
        let project = Project {
            id: Uuid::new_v4(),
            name: name.to_string(),
            path: name.to_string(),
            description: None,
        };
        self.repo.insert_project(&project).await.unwrap();
        project
    }

    async fn config(&self, project: &Project, edit: impl FnOnce(&mut BackupConfig)) -> BackupConfig {
        let mut config = BackupConfig::new(project.id, &project.name);
        edit(&mut config);
        self.repo.insert_backup_config(&config).await.unwrap();
        config
    }
}

fn entry_names(path: &Path) -> Vec<String> {
    let archive = archive::open_archive(path).unwrap();
    let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
    names.sort();
    names
}

#[tokio::test]
async fn file_only_backup_records_one_artifact() {
    let mut h = harness();
    let project = h
        .project("shop", &[("index.php", "<?php"), ("app/a.php", "a"), (".env.example", "X=1")])
        .await;
    let config = h.config(&project, |_| {}).await;
    let recipient = Recipient("owner@example.com".to_string());

    let outcome = run_backup(&h.engine, config.id, Some(recipient.clone())).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(outcome.database, DatabaseDump::NotRequested);
    assert!(outcome.status_recorded);

    let created = outcome.created_backup.unwrap();
    assert_eq!(created.file_count, 3);
    assert!(!created.database_included);
    assert!(created.file_path.starts_with(&format!("backups/{}/shop_", project.id)));
    assert!(created.file_path.ends_with(".zip"));
    assert_eq!(created.expires_at, Some(created.created_at + ChronoDuration::days(30)));

    let artifact = h.disk.join(&created.file_path);
    assert!(integrity::verify(&artifact, created.checksum.as_deref().unwrap()).unwrap());
    assert_eq!(entry_names(&artifact), vec![".env.example", "app/a.php", "index.php"]);

    assert_eq!(h.repo.created_backups().await.unwrap(), vec![created.clone()]);
    let stored = h.repo.backup_config(config.id).await.unwrap();
    assert_eq!(stored.status, RunStatus::Success);
    assert_eq!(stored.last_created_backup_id, Some(created.id));
    assert_eq!(stored.version, config.version + 2);

    let event = h.events.recv().await.unwrap();
    assert_eq!(event.recipient, Some(recipient));
    assert_eq!(event.created_backup.map(|b| b.id), Some(created.id));
}

#[tokio::test]
async fn missing_source_fails_without_artifact() {
    let mut h = harness();
    let project = h.project("ghost", &[]).await;
    fs::remove_dir_all(h.projects.join("ghost")).ok();
    let config = h.config(&project, |_| {}).await;

    let outcome = run_backup(&h.engine, config.id, None).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(outcome.created_backup.is_none());
    let message = outcome.error_message.unwrap();
    assert!(message.contains(&h.projects.join("ghost").display().to_string()), "{message}");

    assert!(h.repo.created_backups().await.unwrap().is_empty());
    let stored = h.repo.backup_config(config.id).await.unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert_eq!(stored.error_message, Some(message));

    let event = h.events.recv().await.unwrap();
    assert_eq!(event.status, RunStatus::Failed);
    assert!(event.recipient.is_none());
}

#[tokio::test]
async fn env_without_database_name_still_archives_files() {
    let h = harness();
    let project = h
        .project("blog", &[(".env", "DB_CONNECTION=pgsql\nDB_HOST=127.0.0.1\n"), ("post.md", "hi")])
        .await;
    let config = h.config(&project, |c| c.include_database = true).await;

    let outcome = run_backup(&h.engine, config.id, None).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Success);
    assert!(matches!(outcome.database, DatabaseDump::Skipped { .. }));

    let created = outcome.created_backup.unwrap();
    assert!(!created.database_included);
    let names = entry_names(&h.disk.join(&created.file_path));
    assert!(!names.iter().any(|n| n == DATABASE_DUMP_ENTRY));
    assert_eq!(names, vec![".env", "post.md"]);
}

#[tokio::test]
async fn restore_of_deleted_artifact_touches_nothing() {
    let h = harness();
    let project = h.project("site", &[("keep.txt", "original")]).await;
    let config = h.config(&project, |_| {}).await;
    let created = run_backup(&h.engine, config.id, None)
        .await
        .unwrap()
        .created_backup
        .unwrap();

    fs::remove_file(h.disk.join(&created.file_path)).unwrap();
    fs::write(h.projects.join("site/keep.txt"), "changed").unwrap();

    let err = restore(&h.engine, created.id, None).await.unwrap_err();
    assert!(matches!(err, EngineError::ArtifactNotFound { .. }));
    assert_eq!(fs::read_to_string(h.projects.join("site/keep.txt")).unwrap(), "changed");

    // an override target is not created either
    let err = restore(&h.engine, created.id, Some("elsewhere")).await.unwrap_err();
    assert!(matches!(err, EngineError::ArtifactNotFound { .. }));
    assert!(!h.projects.join("elsewhere").exists());
}

#[tokio::test]
async fn restore_overwrites_and_keeps_unrelated_files() {
    let h = harness();
    let project = h.project("site", &[("a.txt", "one"), ("nested/b.txt", "two")]).await;
    let config = h.config(&project, |_| {}).await;
    let created = run_backup(&h.engine, config.id, None)
        .await
        .unwrap()
        .created_backup
        .unwrap();

    fs::write(h.projects.join("site/a.txt"), "edited").unwrap();
    fs::remove_file(h.projects.join("site/nested/b.txt")).unwrap();
    fs::write(h.projects.join("site/new.txt"), "mine").unwrap();

    let outcome = restore(&h.engine, created.id, None).await.unwrap();
    assert_eq!(outcome.files_written, 2);
    assert_eq!(outcome.database, DatabaseRestore::NotPresent);
    assert_eq!(fs::read_to_string(h.projects.join("site/a.txt")).unwrap(), "one");
    assert_eq!(fs::read_to_string(h.projects.join("site/nested/b.txt")).unwrap(), "two");
    assert_eq!(fs::read_to_string(h.projects.join("site/new.txt")).unwrap(), "mine");
}

#[tokio::test]
async fn corrupted_artifact_is_not_restored() {
    let h = harness();
    let project = h.project("site", &[("a.txt", "one")]).await;
    let config = h.config(&project, |_| {}).await;
    let created = run_backup(&h.engine, config.id, None)
        .await
        .unwrap()
        .created_backup
        .unwrap();

    let artifact = h.disk.join(&created.file_path);
    let mut bytes = fs::read(&artifact).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&artifact, bytes).unwrap();
    fs::write(h.projects.join("site/a.txt"), "edited").unwrap();

    let err = restore(&h.engine, created.id, None).await.unwrap_err();
    assert!(matches!(err, EngineError::IntegrityMismatch { .. }));
    assert_eq!(fs::read_to_string(h.projects.join("site/a.txt")).unwrap(), "edited");
    assert!(artifact.exists());
}

/// Archives `<projects>/<project.path>` with `dump` embedded and records it
/// the way a run with a successful database dump would.
async fn record_with_dump(h: &Harness, project: &Project, config: &BackupConfig, dump_sql: &str) -> CreatedBackup {
    let scratch = tempfile::tempdir().unwrap();
    let dump = scratch.path().join("dump.sql");
    fs::write(&dump, dump_sql).unwrap();

    let relative = format!("backups/{}/{}_with_dump.zip", project.id, project.name);
    let artifact = h.disk.join(&relative);
    let stats = archive::build_with(
        &h.projects.join(&project.path),
        &artifact,
        WalkOptions::default(),
        &[ExtraEntry {
            name: DATABASE_DUMP_ENTRY,
            path: &dump,
        }],
    )
    .unwrap();
    assert_eq!(stats.extra_entries, 1);

    let record = CreatedBackup {
        id: Uuid::new_v4(),
        backup_id: config.id,
        file_name: format!("{}_with_dump", project.name),
        file_path: relative,
        size: stats.bytes_written,
        storage_disk: "local".to_string(),
        checksum: Some(integrity::checksum(&artifact).unwrap()),
        file_count: stats.file_count,
        database_included: true,
        expires_at: None,
        created_at: Utc::now(),
    };
    h.repo.insert_created_backup(&record).await.unwrap();
    record
}

#[tokio::test]
async fn failed_replay_keeps_extracted_files() {
    let h = harness();
    // nothing listens on port 1, so the replay fails after extraction
    let project = h
        .project(
            "app",
            &[
                (".env", "DB_CONNECTION=pgsql\nDB_HOST=127.0.0.1\nDB_PORT=1\nDB_DATABASE=app\n"),
                ("src/main.rs", "fn main() {}"),
            ],
        )
        .await;
    let config = h.config(&project, |_| {}).await;
    let created = record_with_dump(&h, &project, &config, "CREATE TABLE t (id int);\nINSERT INTO t VALUES (1);\n").await;

    fs::remove_dir_all(h.projects.join("app")).unwrap();

    let outcome = restore(&h.engine, created.id, None).await.unwrap();
    assert!(matches!(outcome.database, DatabaseRestore::Failed { .. }));
    assert_eq!(fs::read_to_string(h.projects.join("app/src/main.rs")).unwrap(), "fn main() {}");
    assert!(h.projects.join("app/.env").exists());
    assert!(!h.projects.join("app").join(DATABASE_DUMP_ENTRY).exists());
}

#[tokio::test]
async fn project_file_named_like_the_dump_is_restored_not_replayed() {
    let h = harness();
    let sql = "DROP TABLE users;\n";
    let project = h
        .project(
            "app",
            &[
                (".env", "DB_CONNECTION=pgsql\nDB_HOST=127.0.0.1\nDB_PORT=1\nDB_DATABASE=app\n"),
                (DATABASE_DUMP_ENTRY, sql),
            ],
        )
        .await;
    let config = h.config(&project, |_| {}).await;
    let created = run_backup(&h.engine, config.id, None)
        .await
        .unwrap()
        .created_backup
        .unwrap();
    assert!(!created.database_included);

    fs::remove_file(h.projects.join("app").join(DATABASE_DUMP_ENTRY)).unwrap();

    let outcome = restore(&h.engine, created.id, None).await.unwrap();
    assert_eq!(outcome.database, DatabaseRestore::NotPresent);
    assert_eq!(fs::read_to_string(h.projects.join("app").join(DATABASE_DUMP_ENTRY)).unwrap(), sql);
}

#[tokio::test]
async fn back_to_back_runs_never_share_an_artifact() {
    let h = harness();
    let project = h.project("site", &[("a.txt", "one")]).await;
    let config = h.config(&project, |_| {}).await;

    let mut created = Vec::new();
    for contents in ["one", "two", "three", "four"] {
        fs::write(h.projects.join("site/a.txt"), contents).unwrap();
        let outcome = run_backup(&h.engine, config.id, None).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Success, "{:?}", outcome.error_message);
        created.push(outcome.created_backup.unwrap());
    }

    let mut paths: Vec<&str> = created.iter().map(|c| c.file_path.as_str()).collect();
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), created.len());

    // every record still owns an intact file of its own
    for record in &created {
        integrity::verify_created_backup(record, &h.engine.config.disks).unwrap();
    }
    delete_created_backup(h.repo.as_ref(), &h.engine.config.disks, &created[0])
        .await
        .unwrap();
    for record in &created[1..] {
        integrity::verify_created_backup(record, &h.engine.config.disks).unwrap();
    }
}

#[tokio::test]
async fn oversized_retention_keeps_the_artifact_forever() {
    let h = harness();
    let project = h.project("site", &[("a.txt", "one")]).await;
    let config = h.config(&project, |c| c.retention_days = 200_000_000).await;

    let outcome = run_backup(&h.engine, config.id, None).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(outcome.created_backup.unwrap().expires_at, None);
    assert_eq!(h.repo.backup_config(config.id).await.unwrap().status, RunStatus::Success);
}

#[tokio::test]
async fn expiry_sweep_removes_only_expired_backups() {
    let h = harness();
    let project = h.project("site", &[("a.txt", "one")]).await;
    let config = h.config(&project, |_| {}).await;

    let now = Utc::now();
    let mut records = Vec::new();
    for (name, expires_at) in [
        ("old", Some(now - ChronoDuration::hours(1))),
        ("fresh", Some(now + ChronoDuration::days(3))),
        ("forever", None),
    ] {
        let relative = format!("backups/{}/{}.zip", project.id, name);
        let path = h.disk.join(&relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, name).unwrap();
        let record = CreatedBackup {
            id: Uuid::new_v4(),
            backup_id: config.id,
            file_name: name.to_string(),
            file_path: relative,
            size: name.len() as u64,
            storage_disk: "local".to_string(),
            checksum: None,
            file_count: 1,
            database_included: false,
            expires_at,
            created_at: now - ChronoDuration::days(40),
        };
        h.repo.insert_created_backup(&record).await.unwrap();
        records.push(record);
    }

    let report = sweep_expired(h.repo.as_ref(), &h.engine.config.disks, now).await.unwrap();
    assert_eq!(report.removed, vec![records[0].id]);
    assert!(!h.disk.join(&records[0].file_path).exists());
    assert!(h.disk.join(&records[1].file_path).exists());
    assert!(h.disk.join(&records[2].file_path).exists());
    assert_eq!(h.repo.created_backups().await.unwrap().len(), 2);

    // repeating is harmless
    let again = sweep_expired(h.repo.as_ref(), &h.engine.config.disks, now).await.unwrap();
    assert_eq!(again.examined, 0);
}

#[tokio::test]
async fn due_sweep_runs_and_advances_recurring_configs() {
    let h = harness();
    let project = h.project("site", &[("a.txt", "one")]).await;
    let now = Utc::now();
    let due = h
        .config(&project, |c| {
            c.frequency = Some(Frequency::Daily);
            c.next_backup_at = Some(now - ChronoDuration::days(3));
        })
        .await;
    let not_recurring = h
        .config(&project, |c| c.next_backup_at = Some(now - ChronoDuration::days(3)))
        .await;
    let later = h
        .config(&project, |c| {
            c.frequency = Some(Frequency::Weekly);
            c.next_backup_at = Some(now + ChronoDuration::days(2));
        })
        .await;

    let report = dispatch_due(&h.engine, now, None).await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.succeeded, 1);

    let stored = h.repo.backup_config(due.id).await.unwrap();
    assert_eq!(stored.status, RunStatus::Success);
    assert!(stored.next_backup_at.unwrap() > now);
    assert!(stored.next_backup_at.unwrap() <= now + ChronoDuration::days(1));

    for untouched in [not_recurring, later] {
        let stored = h.repo.backup_config(untouched.id).await.unwrap();
        assert_eq!(stored.next_backup_at, untouched.next_backup_at);
        assert!(stored.last_created_backup_id.is_none());
    }

    // already advanced: a second sweep on the same day dispatches nothing
    let report = dispatch_due(&h.engine, now, None).await.unwrap();
    assert_eq!(report.dispatched, 0);
}

#[tokio::test]
async fn worker_runs_queued_backups() {
    let mut h = harness();
    let project = h.project("site", &[("a.txt", "one")]).await;
    let first = h.config(&project, |_| {}).await;
    let second = h.config(&project, |c| c.file_name = "other".to_string()).await;

    let settings = WorkerSettings {
        concurrency: 1,
        sweep_interval: None,
        recipient: None,
    };
    let (handle, task) = Worker::spawn(h.engine.clone(), settings);
    for config in [&first, &second] {
        handle
            .submit(Job::Backup {
                config_id: config.id,
                recipient: Some(Recipient("ops@example.com".to_string())),
            })
            .unwrap();
    }

    let mut finished = Vec::new();
    for _ in 0..2 {
        let event = tokio::time::timeout(Duration::from_secs(30), h.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.status, RunStatus::Success);
        finished.push(event.config.id);
    }
    finished.sort();
    let mut expected = vec![first.id, second.id];
    expected.sort();
    assert_eq!(finished, expected);

    handle.shutdown();
    task.await.unwrap();
    assert!(matches!(
        handle.submit(Job::SweepExpired),
        Err(EngineError::WorkerStopped)
    ));
}

#[tokio::test]
async fn queued_jobs_are_dropped_at_shutdown() {
    let mut h = harness();
    let project = h.project("site", &[("a.txt", "one")]).await;
    let config = h.config(&project, |_| {}).await;

    let settings = WorkerSettings {
        concurrency: 1,
        sweep_interval: None,
        recipient: None,
    };
    let (handle, task) = Worker::spawn(h.engine.clone(), settings);
    for _ in 0..3 {
        handle
            .submit(Job::Backup {
                config_id: config.id,
                recipient: None,
            })
            .unwrap();
    }
    // the worker task has not been polled yet on this runtime
    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(30), task)
        .await
        .unwrap()
        .unwrap();

    assert!(h.events.try_recv().is_err());
    assert!(h.repo.created_backups().await.unwrap().is_empty());
    assert_eq!(h.repo.backup_config(config.id).await.unwrap().version, config.version);
}
