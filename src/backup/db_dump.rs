// projectbackup/src/backup/db_dump.rs
use std::ffi::OsString;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;

use crate::backup::credentials::{DbCredentials, DbDriver};
use crate::errors::{EngineError, Result};
use crate::records::TableScope;
use crate::utils::find_executable;
use crate::utils::setting::check_db_connection;

static TABLE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_$.\-]*$").expect("table name pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpStats {
    pub bytes: u64,
    /// `None` when the whole database was dumped.
    pub tables: Option<usize>,
}

/// A dump utility invocation. The password travels in `env` only.
#[derive(Debug, Clone)]
pub struct DumpCommand {
    pub program: &'static str,
    pub args: Vec<OsString>,
    env: Vec<(&'static str, String)>,
}

impl DumpCommand {
    /// Command line for logs.
    pub fn display(&self) -> String {
        let mut line = self.program.to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }
}

/// Validates the selected tables. An empty selection means the whole database.
fn selected_tables(scope: &TableScope) -> Result<Vec<&str>> {
    match scope {
        TableScope::All => Ok(Vec::new()),
        TableScope::Selected(tables) => {
            let mut names = Vec::with_capacity(tables.len());
            for table in tables {
                let name = table.trim();
                if !TABLE_NAME.is_match(name) {
                    return Err(EngineError::dump_failed(
                        "table selection",
                        format!("Invalid table name in selection: {:?}", table),
                    ));
                }
                names.push(name);
            }
            Ok(names)
        }
    }
}

/// Builds the `pg_dump` / `mysqldump` invocation for `credentials`.
///
/// Table names are passed as separate arguments; no shell is involved.
pub fn dump_command(
    credentials: &DbCredentials,
    output_path: &Path,
    scope: &TableScope,
) -> Result<DumpCommand> {
    let tables = selected_tables(scope)?;
    let mut args: Vec<OsString> = Vec::new();
    let mut env = Vec::new();

    let program = match credentials.driver {
        DbDriver::Postgres => {
            args.extend(["--no-owner", "--no-acl", "--inserts"].map(OsString::from));
            args.push("--host".into());
            args.push(credentials.host.clone().into());
            args.push("--port".into());
            args.push(credentials.port.to_string().into());
            if !credentials.username.is_empty() {
                args.push("--username".into());
                args.push(credentials.username.clone().into());
            }
            args.push("--file".into());
            args.push(output_path.as_os_str().to_owned());
            for table in &tables {
                args.push("--table".into());
                args.push((*table).into());
            }
            args.push("--dbname".into());
            args.push(credentials.database.clone().into());
            if let Some(password) = &credentials.password {
                env.push(("PGPASSWORD", password.clone()));
            }
            "pg_dump"
        }
        DbDriver::MySql => {
            args.push(format!("--host={}", credentials.host).into());
            args.push(format!("--port={}", credentials.port).into());
            if !credentials.username.is_empty() {
                args.push(format!("--user={}", credentials.username).into());
            }
            args.extend(["--single-transaction", "--skip-triggers"].map(OsString::from));
            let mut result_file = OsString::from("--result-file=");
            result_file.push(output_path.as_os_str());
            args.push(result_file);
            args.push(credentials.database.clone().into());
            for table in &tables {
                args.push((*table).into());
            }
            if let Some(password) = &credentials.password {
                env.push(("MYSQL_PWD", password.clone()));
            }
            "mysqldump"
        }
    };

    Ok(DumpCommand { program, args, env })
}

/// Dumps the database described by `credentials` into `output_path`.
///
/// Connectivity is checked first so an unreachable server is reported as
/// such instead of as a dump utility failure.
pub async fn dump(
    credentials: &DbCredentials,
    output_path: &Path,
    scope: &TableScope,
    connect_timeout: Duration,
) -> Result<DumpStats> {
    check_db_connection(credentials, connect_timeout).await?;

    let command = dump_command(credentials, output_path, scope)?;
    let executable = find_executable(command.program)?;
    let tables = match scope {
        TableScope::Selected(list) if !list.is_empty() => Some(list.len()),
        _ => None,
    };

    tracing::info!(
        database = %credentials.display_target(),
        output = %output_path.display(),
        command = %command.display(),
        "dumping database"
    );

    let output = Command::new(&executable)
        .args(&command.args)
        .envs(command.env.iter().map(|(k, v)| (*k, v.as_str())))
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| EngineError::dump_failed(command.display(), format!("Failed to execute {}: {}", command.program, e)))?;

    if !output.status.success() {
        let reason = format!(
            "{} exited with status {}\nStderr: {}",
            command.program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
        tracing::error!(command = %command.display(), %reason, "database dump failed");
        return Err(EngineError::dump_failed(command.display(), reason));
    }

    let bytes = match tokio::fs::metadata(output_path).await {
        Ok(meta) if meta.len() > 0 => meta.len(),
        Ok(_) => {
            return Err(EngineError::dump_failed(command.display(), "dump utility produced an empty file"));
        }
        Err(e) => {
            return Err(EngineError::dump_failed(
                command.display(),
                format!("dump file {} is missing: {}", output_path.display(), e),
            ));
        }
    };

    tracing::info!(database = %credentials.display_target(), bytes, "✓ database dumped");
    Ok(DumpStats { bytes, tables })
}
