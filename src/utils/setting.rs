// projectbackup/src/utils/setting.rs
use std::time::Duration;

use sqlx::{Connection, MySqlConnection, PgConnection};
use tokio::time::timeout;

use crate::backup::credentials::{DbCredentials, DbDriver};
use crate::errors::{EngineError, Result};

/// Opens and closes one connection to the credentials' database.
pub async fn check_db_connection(credentials: &DbCredentials, limit: Duration) -> Result<()> {
    let target = credentials.display_target();
    let url = credentials.connection_url()?;
    let unreachable = |reason: String| EngineError::DatabaseUnreachable {
        target: target.clone(),
        reason,
    };

    let attempt = async {
        match credentials.driver {
            DbDriver::Postgres => PgConnection::connect(url.as_str()).await?.close().await,
            DbDriver::MySql => MySqlConnection::connect(url.as_str()).await?.close().await,
        }
    };

    match timeout(limit, attempt).await {
        Ok(Ok(())) => {
            tracing::debug!(target = %target, "database connection verified");
            Ok(())
        }
        Ok(Err(e)) => Err(unreachable(e.to_string())),
        Err(_) => Err(unreachable(format!(
            "connection timed out after {} seconds",
            limit.as_secs()
        ))),
    }
}
