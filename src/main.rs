//! Project Backup Tool
//!
//! Provides CLI interface for project backup, restore and the scheduled sweeps

// projectbackup/src/main.rs
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use projectbackup::backup::credentials::{CredentialCipher, DbCredentials, DbDriver};
use projectbackup::config::AppConfig;
use projectbackup::integrity::{verify_all, verify_created_backup};
use projectbackup::notify::{LogNotifier, Recipient};
use projectbackup::store::{BackupRepository, PgRepository};
use projectbackup::worker::{Worker, WorkerSettings};
use projectbackup::{Engine, backup, restore, retention, schedule};

#[derive(Parser)]
#[command(name = "projectbackup")]
#[command(version)]
#[command(about = "Back up, restore and sweep project archives", long_about = None)]
struct Cli {
    /// Path to config.json
    #[arg(long, short, default_value = "config.json", env = "PROJECTBACKUP_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one backup of a configuration now
    Backup {
        config_id: Uuid,
        /// Who is told about the outcome
        #[arg(long)]
        notify: Option<String>,
    },
    /// Restore a created backup over its project directory
    Restore {
        created_backup_id: Uuid,
        /// Restore somewhere else (`~/...`, absolute, or relative to the projects base directory)
        #[arg(long)]
        target: Option<String>,
    },
    /// Run every backup due today or earlier and advance its schedule
    DispatchDue {
        #[arg(long)]
        notify: Option<String>,
    },
    /// Delete created backups past their expiry
    SweepExpired,
    /// Recompute archive checksums
    Verify {
        /// Only this created backup
        created_backup_id: Option<Uuid>,
    },
    /// Process jobs and periodic sweeps until interrupted
    Worker,
    /// Apply database migrations
    Migrate,
    /// Print a sealed blob for custom database credentials (password from DB_PASSWORD)
    SealCredentials {
        #[arg(long, default_value = "mysql")]
        driver: String,
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        database: String,
        #[arg(long, default_value = "")]
        username: String,
    },
}

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "projectbackup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run_app(Cli::parse()).await {
        Ok(_) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app(cli: Cli) -> Result<()> {
    let app_config = AppConfig::load_from_json(&cli.config).with_context(|| {
        format!(
            "Failed to load application configuration from {}",
            cli.config.display()
        )
    })?;

    let command = match cli.command {
        Command::SealCredentials {
            driver,
            host,
            port,
            database,
            username,
        } => return seal_credentials(&app_config, &driver, &host, port, &database, &username),
        command => command,
    };

    let database_url = app_config
        .database_url
        .clone()
        .context("database_url must be set in config.json or DATABASE_URL")?;
    let pg = PgRepository::connect(&database_url, app_config.db_connect_timeout)
        .await
        .context("Failed to connect to the backup records database")?;

    let repo: Arc<dyn BackupRepository> = Arc::new(pg.clone());
    let engine = Arc::new(
        Engine::new(app_config, repo, Arc::new(LogNotifier)).context("Failed to initialise backup engine")?,
    );

    match command {
        Command::Backup { config_id, notify } => {
            let outcome = backup::run_backup(&engine, config_id, notify.map(Recipient))
                .await
                .context("Backup could not start")?;
            print_json(&outcome)?;
            if let Some(reason) = outcome.error_message {
                anyhow::bail!("Backup failed: {}", reason);
            }
        }
        Command::Restore {
            created_backup_id,
            target,
        } => {
            let outcome = restore::restore(&engine, created_backup_id, target.as_deref())
                .await
                .context("Restore process failed")?;
            print_json(&outcome)?;
        }
        Command::DispatchDue { notify } => {
            let report = schedule::dispatch_due(&engine, Utc::now(), notify.map(Recipient))
                .await
                .context("Due backup sweep failed")?;
            println!(
                "Dispatched {} backup(s): {} succeeded, {} failed, {} could not start",
                report.dispatched,
                report.succeeded,
                report.failed,
                report.rejected.len()
            );
        }
        Command::SweepExpired => {
            let report = retention::sweep_expired(engine.repo.as_ref(), &engine.config.disks, Utc::now())
                .await
                .context("Expiry sweep failed")?;
            println!(
                "Removed {} of {} expired backup(s), {} already missing on disk",
                report.removed.len(),
                report.examined,
                report.missing_files
            );
            if !report.errors.is_empty() {
                anyhow::bail!("{} expired backup(s) could not be removed", report.errors.len());
            }
        }
        Command::Verify { created_backup_id } => verify(&engine, created_backup_id).await?,
        Command::Worker => run_worker(engine).await?,
        Command::Migrate => {
            pg.migrate().await.context("Failed to apply migrations")?;
            println!("🛠 Migrations applied");
        }
        // handled before connecting
        Command::SealCredentials { .. } => {}
    }
    Ok(())
}

async fn verify(engine: &Engine, created_backup_id: Option<Uuid>) -> Result<()> {
    if let Some(id) = created_backup_id {
        let record = engine.repo.created_backup(id).await?;
        verify_created_backup(&record, &engine.config.disks)
            .with_context(|| format!("Created backup {} failed verification", id))?;
        println!("✓ {} is intact", record.file_path);
        return Ok(());
    }

    let records = engine.repo.created_backups().await?;
    let report = verify_all(&records, &engine.config.disks);
    println!(
        "Verified {}, without checksum {}, missing {}, corrupted {}",
        report.verified,
        report.unchecked,
        report.missing.len(),
        report.corrupted.len()
    );
    for path in report.missing.iter().chain(report.corrupted.iter()) {
        println!("  ⚠️ {}", path.display());
    }
    for error in &report.errors {
        println!("  ⚠️ {}", error);
    }
    if !report.is_clean() {
        anyhow::bail!("Integrity check found problems");
    }
    Ok(())
}

async fn run_worker(engine: Arc<Engine>) -> Result<()> {
    let settings = WorkerSettings {
        concurrency: engine.config.worker_concurrency,
        sweep_interval: engine.config.sweep_interval,
        recipient: engine.config.notify_recipient.clone().map(Recipient),
    };
    let (handle, task) = Worker::spawn(engine, settings);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    handle.shutdown();
    task.await.context("Worker task failed")?;
    Ok(())
}

fn seal_credentials(
    app_config: &AppConfig,
    driver: &str,
    host: &str,
    port: Option<u16>,
    database: &str,
    username: &str,
) -> Result<()> {
    let app_key = app_config
        .app_key
        .as_deref()
        .context("APP_KEY must be set to seal credentials")?;
    let cipher = CredentialCipher::from_app_key(app_key)?;
    let driver = DbDriver::from_connection_name(driver)
        .with_context(|| format!("Unsupported database driver: {}", driver))?;
    let credentials = DbCredentials {
        driver,
        host: host.to_string(),
        port: port.unwrap_or_else(|| driver.default_port()),
        database: database.to_string(),
        username: username.to_string(),
        password: std::env::var("DB_PASSWORD").ok().filter(|p| !p.is_empty()),
    };
    let sealed = cipher.seal(&credentials)?;
    println!("{}", sealed.0);
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
