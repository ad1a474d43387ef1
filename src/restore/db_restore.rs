// projectbackup/src/restore/db_restore.rs
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Connection, Executor, MySqlConnection, PgConnection};
use tokio::time::timeout;

use crate::backup::credentials::{DbCredentials, DbDriver};
use crate::errors::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Postgres,
    MySql,
}

impl From<DbDriver> for SqlDialect {
    fn from(driver: DbDriver) -> Self {
        match driver {
            DbDriver::Postgres => SqlDialect::Postgres,
            DbDriver::MySql => SqlDialect::MySql,
        }
    }
}

/// Runs raw SQL statements one at a time on a single connection.
#[async_trait]
pub trait StatementExecutor: Send {
    async fn execute(&mut self, statement: &str) -> std::result::Result<(), String>;
}

pub struct PgExecutor {
    conn: PgConnection,
}

#[async_trait]
impl StatementExecutor for PgExecutor {
    async fn execute(&mut self, statement: &str) -> std::result::Result<(), String> {
        (&mut self.conn)
            .execute(statement)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

pub struct MySqlExecutor {
    conn: MySqlConnection,
}

#[async_trait]
impl StatementExecutor for MySqlExecutor {
    async fn execute(&mut self, statement: &str) -> std::result::Result<(), String> {
        (&mut self.conn)
            .execute(statement)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// Opens the live connection a dump is replayed on.
pub async fn connect_executor(
    credentials: &DbCredentials,
    limit: Duration,
) -> Result<Box<dyn StatementExecutor>> {
    let url = credentials.connection_url()?;
    let unreachable = |reason: String| EngineError::DatabaseUnreachable {
        target: credentials.display_target(),
        reason,
    };

    let connected: std::result::Result<Box<dyn StatementExecutor>, sqlx::Error> =
        match credentials.driver {
            DbDriver::Postgres => timeout(limit, PgConnection::connect(url.as_str()))
                .await
                .map_err(|_| unreachable("connection timed out".to_string()))?
                .map(|conn| Box::new(PgExecutor { conn }) as Box<dyn StatementExecutor>),
            DbDriver::MySql => timeout(limit, MySqlConnection::connect(url.as_str()))
                .await
                .map_err(|_| unreachable("connection timed out".to_string()))?
                .map(|conn| Box::new(MySqlExecutor { conn }) as Box<dyn StatementExecutor>),
        };
    connected.map_err(|e| unreachable(e.to_string()))
}

/// Executes `statements` in order and stops at the first failure.
///
/// Statements already executed are not rolled back.
pub async fn replay(executor: &mut dyn StatementExecutor, statements: &[String]) -> Result<usize> {
    for (index, statement) in statements.iter().enumerate() {
        if let Err(reason) = executor.execute(statement).await {
            let preview: String = statement.chars().take(120).collect();
            tracing::error!(
                statement = index + 1,
                total = statements.len(),
                sql = %preview,
                error = %reason,
                "database replay failed"
            );
            return Err(EngineError::RestoreReplayFailed {
                statement: index + 1,
                reason,
            });
        }
    }
    Ok(statements.len())
}

/// Reads a dump file, connects with `credentials` and replays it.
pub async fn replay_dump_file(
    dump_path: &Path,
    credentials: &DbCredentials,
    connect_timeout: Duration,
) -> Result<usize> {
    let bytes = tokio::fs::read(dump_path).await?;
    let sql = String::from_utf8_lossy(&bytes);
    let statements = split_statements(&sql, credentials.driver.into());

    tracing::info!(
        dump = %dump_path.display(),
        database = %credentials.display_target(),
        statements = statements.len(),
        "replaying database dump"
    );

    let mut executor = connect_executor(credentials, connect_timeout).await?;
    let executed = replay(executor.as_mut(), &statements).await?;
    tracing::info!(statements = executed, "✓ database dump replayed");
    Ok(executed)
}

/// Splits a SQL script into statements on top-level `;`.
///
/// Quoted strings and identifiers, comments and (for Postgres) dollar-quoted
/// bodies are kept intact. psql meta-command lines (`\connect`, ...) are
/// dropped, as are statements that contain nothing but comments, except MySQL
/// `/*! ... */` executable comments.
pub fn split_statements(sql: &str, dialect: SqlDialect) -> Vec<String> {
    let bytes = sql.as_bytes();
    let len = bytes.len();
    let mysql = dialect == SqlDialect::MySql;

    let mut statements = Vec::new();
    let mut start = 0;
    let mut has_code = false;
    let mut i = 0;

    while i < len {
        let b = bytes[i];
        let next = bytes.get(i + 1).copied();
        match b {
            b'\'' => {
                let escapes = mysql || is_escape_string_prefix(bytes, i);
                has_code = true;
                i = skip_quoted(bytes, i, b'\'', escapes);
            }
            b'"' => {
                has_code = true;
                i = skip_quoted(bytes, i, b'"', mysql);
            }
            b'`' if mysql => {
                has_code = true;
                i = skip_quoted(bytes, i, b'`', false);
            }
            b'-' if next == Some(b'-') => i = skip_line(bytes, i),
            b'#' if mysql => i = skip_line(bytes, i),
            b'/' if next == Some(b'*') => {
                if mysql && bytes.get(i + 2) == Some(&b'!') {
                    has_code = true;
                }
                i = skip_block_comment(bytes, i, !mysql);
            }
            b'$' if !mysql && !follows_identifier(bytes, i) => {
                has_code = true;
                i = match dollar_tag_end(bytes, i) {
                    Some(tag_end) => skip_dollar_quoted(bytes, i, tag_end),
                    None => i + 1,
                };
            }
            b'\\' if !has_code => {
                i = skip_line(bytes, i);
                start = i;
            }
            b';' => {
                if has_code {
                    statements.push(sql[start..i].trim().to_string());
                }
                has_code = false;
                i += 1;
                start = i;
            }
            _ => {
                if !b.is_ascii_whitespace() {
                    has_code = true;
                }
                i += 1;
            }
        }
    }

    if has_code {
        let tail = sql[start..].trim();
        if !tail.is_empty() {
            statements.push(tail.to_string());
        }
    }
    statements
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn follows_identifier(bytes: &[u8], i: usize) -> bool {
    i > 0 && is_ident_byte(bytes[i - 1])
}

/// `E'...'` strings honour backslash escapes in Postgres.
fn is_escape_string_prefix(bytes: &[u8], i: usize) -> bool {
    i > 0 && matches!(bytes[i - 1], b'E' | b'e') && !(i > 1 && is_ident_byte(bytes[i - 2]))
}

/// Returns the index just past the closing quote (doubled quotes are escapes).
fn skip_quoted(bytes: &[u8], open: usize, quote: u8, backslash_escapes: bool) -> usize {
    let mut j = open + 1;
    while j < bytes.len() {
        let c = bytes[j];
        if backslash_escapes && c == b'\\' {
            j += 2;
            continue;
        }
        if c == quote {
            if bytes.get(j + 1) == Some(&quote) {
                j += 2;
                continue;
            }
            return j + 1;
        }
        j += 1;
    }
    bytes.len()
}

fn skip_line(bytes: &[u8], from: usize) -> usize {
    match bytes[from..].iter().position(|&b| b == b'\n') {
        Some(offset) => from + offset + 1,
        None => bytes.len(),
    }
}

fn skip_block_comment(bytes: &[u8], open: usize, nested: bool) -> usize {
    let mut depth = 1;
    let mut j = open + 2;
    while j < bytes.len() {
        if nested && bytes[j] == b'/' && bytes.get(j + 1) == Some(&b'*') {
            depth += 1;
            j += 2;
        } else if bytes[j] == b'*' && bytes.get(j + 1) == Some(&b'/') {
            depth -= 1;
            j += 2;
            if depth == 0 {
                return j;
            }
        } else {
            j += 1;
        }
    }
    bytes.len()
}

/// For `$tag$` at `open`, returns the index just past the opening tag.
fn dollar_tag_end(bytes: &[u8], open: usize) -> Option<usize> {
    let mut j = open + 1;
    if let Some(&first) = bytes.get(j) {
        if first.is_ascii_digit() {
            return None;
        }
    }
    while j < bytes.len() && is_ident_byte(bytes[j]) {
        j += 1;
    }
    (bytes.get(j) == Some(&b'$')).then_some(j + 1)
}

fn skip_dollar_quoted(bytes: &[u8], open: usize, tag_end: usize) -> usize {
    let tag = &bytes[open..tag_end];
    bytes[tag_end..]
        .windows(tag.len())
        .position(|window| window == tag)
        .map_or(bytes.len(), |offset| tag_end + offset + tag.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pg(sql: &str) -> Vec<String> {
        split_statements(sql, SqlDialect::Postgres)
    }

    fn my(sql: &str) -> Vec<String> {
        split_statements(sql, SqlDialect::MySql)
    }

    #[test]
    fn splits_simple_statements() {
        assert_eq!(
            pg("CREATE TABLE a (id int);\nINSERT INTO a VALUES (1);\n\n"),
            vec!["CREATE TABLE a (id int)", "INSERT INTO a VALUES (1)"]
        );
    }

    #[test]
    fn keeps_semicolons_inside_strings_and_identifiers() {
        assert_eq!(
            pg("INSERT INTO \"we;ird\" VALUES ('a;b', 'it''s; fine'); SELECT 1"),
            vec!["INSERT INTO \"we;ird\" VALUES ('a;b', 'it''s; fine')", "SELECT 1"]
        );
        assert_eq!(
            pg("SELECT E'back\\'slash;'; SELECT 2;"),
            vec!["SELECT E'back\\'slash;'", "SELECT 2"]
        );
    }

    #[test]
    fn keeps_dollar_quoted_bodies_whole() {
        let sql = "CREATE FUNCTION f() RETURNS int AS $body$ BEGIN RETURN 1; END; $body$ LANGUAGE plpgsql;\nSELECT $$a;b$$;";
        let statements = pg(sql);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].ends_with("LANGUAGE plpgsql"));
        assert_eq!(statements[1], "SELECT $$a;b$$");
    }

    #[test]
    fn drops_comments_and_psql_meta_commands() {
        let sql = "--\n-- PostgreSQL database dump\n--\n\\restrict abc123\nSET statement_timeout = 0;\n/* outer /* nested; */ still; */\n-- trailing; comment\n\\unrestrict abc123\n";
        assert_eq!(pg(sql), vec!["SET statement_timeout = 0"]);
    }

    #[test]
    fn mysql_quoting_rules() {
        let sql = "/*!40101 SET NAMES utf8mb4 */;\n# comment; here\nINSERT INTO `t;x` VALUES ('it\\'s;', \"q;\");\n/* plain comment */;";
        assert_eq!(
            my(sql),
            vec![
                "/*!40101 SET NAMES utf8mb4 */",
                "# comment; here\nINSERT INTO `t;x` VALUES ('it\\'s;', \"q;\")"
            ]
        );
    }

    #[test]
    fn positional_parameters_are_not_dollar_quotes() {
        assert_eq!(pg("SELECT $1; SELECT a$b$c;"), vec!["SELECT $1", "SELECT a$b$c"]);
    }

    struct FailingAt {
        fail_at: usize,
        executed: Vec<String>,
    }

    #[async_trait]
    impl StatementExecutor for FailingAt {
        async fn execute(&mut self, statement: &str) -> std::result::Result<(), String> {
            if self.executed.len() + 1 == self.fail_at {
                return Err("syntax error".to_string());
            }
            self.executed.push(statement.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn replay_stops_at_first_failure() {
        let statements = pg("SELECT 1; SELECT 2; SELECT 3;");
        let mut executor = FailingAt {
            fail_at: 2,
            executed: Vec::new(),
        };
        let err = replay(&mut executor, &statements).await.unwrap_err();
        assert!(matches!(err, EngineError::RestoreReplayFailed { statement: 2, .. }));
        assert_eq!(executor.executed, vec!["SELECT 1"]);

        let mut executor = FailingAt {
            fail_at: 0,
            executed: Vec::new(),
        };
        assert_eq!(replay(&mut executor, &statements).await.unwrap(), 3);
    }
}
