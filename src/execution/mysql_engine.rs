//! MySQL / Doris Execution Engine
//!
//! Doris speaks the MySQL wire protocol, so both dialects share this engine.
//! One connection per call, text protocol, autocommit on. The timeout wraps
//! connect plus execute; a statement abandoned by the timeout is not killed
//! on the server.

use crate::config::{HarnessConfig, MySqlCredentials};
use crate::dialect::Dialect;
use crate::execution::engine::{ExecutionEngine, ExecutionResult};
use crate::execution::result::{RenderOptions, ResultSet};
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::{Column, ConnectOptions, Connection, Executor, Row};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub struct MySqlEngine {
    dialect: Dialect,
    credentials: MySqlCredentials,
    timeout: Duration,
    render: RenderOptions,
}

impl MySqlEngine {
    pub fn new(config: &HarnessConfig, dialect: Dialect) -> Self {
        Self {
            dialect,
            credentials: config.mysql_credentials(dialect).clone(),
            timeout: config.timeouts.mysql,
            render: RenderOptions {
                max_rows: config.output.max_rows,
                max_columns: config.output.max_columns,
                token_budget: config.output.token_budget,
            },
        }
    }

    fn label(&self) -> &'static str {
        self.dialect.display_name()
    }

    fn options(&self, target: &str) -> MySqlConnectOptions {
        let creds = &self.credentials;
        let mut options = MySqlConnectOptions::new()
            .host(&creds.host)
            .port(creds.port)
            .username(&creds.user)
            .password(&creds.password);
        let database = if target.is_empty() { creds.database.as_deref() } else { Some(target) };
        if let Some(db) = database {
            options = options.database(db);
        }
        options.disable_statement_logging()
    }

    async fn run(&self, query: &str, target: &str, fetch: bool) -> Result<Option<ResultSet>, sqlx::Error> {
        let mut conn = MySqlConnection::connect_with(&self.options(target)).await?;
        let outcome = if fetch {
            (&mut conn).fetch_all(query).await.map(|rows| Some(rows_to_set(&rows)))
        } else {
            (&mut conn).execute(query).await.map(|done| {
                debug!("{} statement affected {} rows", self.label(), done.rows_affected());
                None
            })
        };
        if let Err(e) = conn.close().await {
            debug!("Closing {} connection failed: {}", self.label(), e);
        }
        outcome
    }
}

fn rows_to_set(rows: &[MySqlRow]) -> ResultSet {
    let columns: Vec<String> = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    let mut set = ResultSet::new(columns);
    for row in rows {
        let cells = (0..row.len())
            .map(|idx| match row.try_get_unchecked::<Option<String>, _>(idx) {
                Ok(value) => value,
                Err(_) => row
                    .try_get_unchecked::<Option<Vec<u8>>, _>(idx)
                    .ok()
                    .flatten()
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
            })
            .collect();
        set.push_row(cells);
    }
    set
}

/// Server-reported errors are programming errors, transport failures are
/// database errors, everything else is unknown.
pub fn classify_mysql_error(label: &str, error: &sqlx::Error) -> ExecutionResult {
    match error {
        sqlx::Error::Database(db) => {
            ExecutionResult::programming_error(format!("{} Programming Error: {}", label, db.message()))
        }
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Configuration(_) | sqlx::Error::Protocol(_) => {
            ExecutionResult::database_error(format!("{} Database Error: {}", label, error))
        }
        _ => ExecutionResult::unknown(format!("{} Unknown Error: {}", label, error)),
    }
}

#[async_trait]
impl ExecutionEngine for MySqlEngine {
    fn name(&self) -> &'static str {
        match self.dialect {
            Dialect::Doris => "doris",
            _ => "mysql",
        }
    }

    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn execute(&self, query: &str, target: &str, fetch: bool) -> ExecutionResult {
        let started = Instant::now();
        if self.credentials.is_empty() {
            return ExecutionResult::database_error(format!("{} Database Error: no credentials configured", self.label()));
        }
        match tokio::time::timeout(self.timeout, self.run(query, target, fetch)).await {
            Err(_) => {
                warn!(
                    "{} statement abandoned after {}s; the server may still be running it",
                    self.label(),
                    self.timeout.as_secs()
                );
                ExecutionResult::unknown(format!("Execution timed out after {} seconds.", self.timeout.as_secs()))
            }
            Ok(Ok(None)) => ExecutionResult::success(None),
            Ok(Ok(Some(set))) => ExecutionResult::success(Some(set.render(started.elapsed(), &self.render))),
            Ok(Err(e)) => classify_mysql_error(self.label(), &e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::engine::StatusCode;

    #[test]
    fn test_transport_errors_are_database_errors() {
        let io = sqlx::Error::Io(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"));
        assert_eq!(classify_mysql_error("MySQL", &io).status, StatusCode::DatabaseError);
        assert_eq!(classify_mysql_error("Doris", &sqlx::Error::RowNotFound).status, StatusCode::UnknownOrTimeout);
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_at_call_time() {
        let engine = MySqlEngine::new(&HarnessConfig::default(), Dialect::Doris);
        let result = engine.execute("SELECT 1", "db", true).await;
        assert_eq!(result.status, StatusCode::DatabaseError);
        assert_eq!(engine.name(), "doris");
    }
}
