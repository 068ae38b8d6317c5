//! SQLite Execution Engine
//!
//! Local embedded-file backend:
//! - fresh connection per attempt, opened read-write without create
//! - each attempt runs on a blocking thread under a wall-clock timeout
//! - on timeout the statement is interrupted and retried exactly once
//! - connection dropped on every exit path

use crate::config::HarnessConfig;
use crate::dialect::Dialect;
use crate::execution::engine::{ExecutionEngine, ExecutionResult};
use crate::execution::result::{RenderOptions, ResultSet};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const ATTEMPTS: usize = 2;

pub struct SqliteEngine {
    sqlite_dir: PathBuf,
    timeout: Duration,
    render: RenderOptions,
    attempts_issued: AtomicUsize,
}

impl SqliteEngine {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            sqlite_dir: config.sqlite_dir.clone(),
            timeout: config.timeouts.sqlite,
            render: RenderOptions {
                max_rows: config.output.sqlite_max_rows,
                max_columns: config.output.max_columns,
                token_budget: config.output.token_budget,
            },
            attempts_issued: AtomicUsize::new(0),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Number of attempts started since construction.
    pub fn attempts_issued(&self) -> usize {
        self.attempts_issued.load(Ordering::SeqCst)
    }

    fn resolve(&self, target: &str) -> PathBuf {
        if target.ends_with(".sqlite") || target.ends_with(".db") {
            PathBuf::from(target)
        } else {
            self.sqlite_dir.join(target).join(format!("{}.sqlite", target))
        }
    }
}

#[async_trait]
impl ExecutionEngine for SqliteEngine {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn execute(&self, query: &str, target: &str, fetch: bool) -> ExecutionResult {
        let path = self.resolve(target);
        debug!("SQLite query on {}: {}", path.display(), query);

        for attempt in 1..=ATTEMPTS {
            self.attempts_issued.fetch_add(1, Ordering::SeqCst);
            // Handle taken before the statement starts.
            let conn = match open(&path) {
                Ok(conn) => conn,
                Err(e) => return classify(&e),
            };
            let interrupt = conn.get_interrupt_handle();

            let task = {
                let query = query.to_string();
                let render = self.render.clone();
                tokio::task::spawn_blocking(move || run_statement(conn, &query, fetch, &render))
            };

            match tokio::time::timeout(self.timeout, task).await {
                Ok(Ok(result)) => return result,
                Ok(Err(join_error)) => {
                    return ExecutionResult::unknown(format!("SQLite Unknown Error: {}", join_error));
                }
                Err(_) => {
                    warn!(
                        "SQLite attempt {}/{} exceeded {}s, interrupting",
                        attempt,
                        ATTEMPTS,
                        self.timeout.as_secs()
                    );
                    interrupt.interrupt();
                }
            }
        }

        ExecutionResult::database_error(format!(
            "SQLite Database Error: execution exceeded {} seconds.",
            self.timeout.as_secs()
        ))
    }
}

fn open(path: &Path) -> rusqlite::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    Connection::open_with_flags(path, flags)
}

fn run_statement(conn: Connection, query: &str, fetch: bool, render: &RenderOptions) -> ExecutionResult {
    let started = Instant::now();
    let result = if fetch {
        fetch_rows(&conn, query).map(|rows| ExecutionResult::success(Some(rows.render(started.elapsed(), render))))
    } else {
        conn.execute_batch(query).map(|_| {
            info!("✅ SQLite statement committed in {:.4}s", started.elapsed().as_secs_f64());
            ExecutionResult::success(None)
        })
    };
    result.unwrap_or_else(|e| classify(&e))
}

fn fetch_rows(conn: &Connection, query: &str) -> rusqlite::Result<ResultSet> {
    let mut stmt = conn.prepare(query)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let width = columns.len();
    let mut set = ResultSet::new(columns);
    if width == 0 {
        stmt.raw_execute()?;
        return Ok(set);
    }

    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let mut cells = Vec::with_capacity(width);
        for idx in 0..width {
            cells.push(match row.get_ref(idx)? {
                ValueRef::Null => None,
                ValueRef::Integer(i) => Some(i.to_string()),
                ValueRef::Real(f) => Some(f.to_string()),
                ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
                ValueRef::Blob(bytes) => Some(format!("<blob {} bytes>", bytes.len())),
            });
        }
        set.push_row(cells);
    }
    Ok(set)
}

/// SQL logic errors (syntax, unknown table/column, whether reported at
/// prepare time or at step time) are programming errors;
/// every other SQLite failure is a database error.
fn classify(error: &rusqlite::Error) -> ExecutionResult {
    match error {
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::Unknown => {
            ExecutionResult::programming_error(format!("SQLite Programming Error: {}", error))
        }
        rusqlite::Error::SqlInputError { .. }
        | rusqlite::Error::MultipleStatement
        | rusqlite::Error::InvalidColumnName(_) => {
            ExecutionResult::programming_error(format!("SQLite Programming Error: {}", error))
        }
        rusqlite::Error::SqliteFailure(_, _) => {
            ExecutionResult::database_error(format!("SQLite Database Error: {}", error))
        }
        _ => ExecutionResult::unknown(format!("SQLite Unknown Error: {}", error)),
    }
}
