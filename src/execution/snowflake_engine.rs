//! Snowflake Execution Engine
//!
//! The warehouse path races redundant worker processes. Each worker is this
//! crate's binary started with the hidden `warehouse-worker` subcommand: it
//! reads a `WarehouseJob` as JSON on stdin, opens its own Snowflake session,
//! runs the query under its own timeout and prints a `WorkerReport` on stdout.
//!
//! The orchestrator:
//! - starts `concurrency` workers per batch
//! - accepts the first report whose status is not 3 and kills the rest
//! - retries the batch when every worker timed out, up to `max_batches`
//! - bounds each batch by the query timeout plus a fixed grace

use crate::config::{HarnessConfig, SnowflakeCredentials, WarehouseSettings};
use crate::dialect::Dialect;
use crate::error::{HarnessError, Result};
use crate::execution::engine::{ExecutionEngine, ExecutionResult, StatusCode};
use crate::execution::race::{race, ProcessContender, ProcessOutput, RaceConfig, RaceOutcome, WorkerCommand};
use crate::execution::result::{RenderOptions, ResultSet};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snowflake_connector_rs::{SnowflakeAuthMethod, SnowflakeClient, SnowflakeClientConfig};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Environment variable carrying the worker's index inside its batch.
pub const WORKER_INDEX_ENV: &str = "SQLREFINE_WORKER_INDEX";

/// Hidden subcommand the binary dispatches to `run_worker_stdio`.
pub const WORKER_SUBCOMMAND: &str = "warehouse-worker";

/// Everything a worker needs; workers share no state with the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseJob {
    pub query: String,
    pub database: String,
    pub fetch: bool,
    pub timeout_secs: u64,
    pub credentials: SnowflakeCredentials,
    pub max_rows: usize,
    pub max_columns: usize,
    pub token_budget: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReport {
    pub status: u8,
    pub payload: Option<String>,
}

impl WorkerReport {
    fn into_result(self) -> ExecutionResult {
        ExecutionResult {
            status: StatusCode::from_code(self.status).unwrap_or(StatusCode::UnknownOrTimeout),
            payload: self.payload,
        }
    }
}

impl From<ExecutionResult> for WorkerReport {
    fn from(result: ExecutionResult) -> Self {
        Self { status: result.status.code(), payload: result.payload }
    }
}

pub struct SnowflakeEngine {
    credentials: SnowflakeCredentials,
    settings: WarehouseSettings,
    timeout: Duration,
    render: RenderOptions,
    worker: WorkerCommand,
}

impl SnowflakeEngine {
    pub fn new(config: &HarnessConfig) -> Result<Self> {
        let worker = match &config.warehouse.worker_program {
            Some(program) => WorkerCommand::new(program.clone(), vec![WORKER_SUBCOMMAND.to_string()]),
            None => {
                let exe = std::env::current_exe().map_err(|e| {
                    HarnessError::Config(format!("Cannot locate worker executable: {}", e))
                })?;
                WorkerCommand::new(exe, vec![WORKER_SUBCOMMAND.to_string()])
            }
        };
        Ok(Self {
            credentials: config.snowflake.clone(),
            settings: config.warehouse.clone(),
            timeout: config.timeouts.warehouse,
            render: RenderOptions {
                max_rows: config.output.max_rows,
                max_columns: config.output.max_columns,
                token_budget: config.output.token_budget,
            },
            worker,
        })
    }

    /// Replace the worker command (tests use shell scripts as simulated workers).
    pub fn with_worker(mut self, worker: WorkerCommand) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_settings(mut self, settings: WarehouseSettings, timeout: Duration) -> Self {
        self.settings = settings;
        self.timeout = timeout;
        self
    }

    fn job(&self, query: &str, target: &str, fetch: bool) -> WarehouseJob {
        WarehouseJob {
            query: query.to_string(),
            database: target.to_string(),
            fetch,
            timeout_secs: self.timeout.as_secs().max(1),
            credentials: self.credentials.clone(),
            max_rows: self.render.max_rows,
            max_columns: self.render.max_columns,
            token_budget: self.render.token_budget,
        }
    }

    async fn spawn_batch(&self, payload: &[u8]) -> std::io::Result<Vec<ProcessContender>> {
        let mut contenders = Vec::with_capacity(self.settings.concurrency);
        for index in 0..self.settings.concurrency.max(1) {
            let env = vec![(WORKER_INDEX_ENV.to_string(), index.to_string())];
            match ProcessContender::spawn(&self.worker, &env, payload).await {
                Ok(contender) => contenders.push(contender),
                Err(e) => {
                    for started in contenders.iter_mut() {
                        crate::execution::race::Contender::terminate(started).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(contenders)
    }
}

fn parse_report(output: &ProcessOutput) -> Option<WorkerReport> {
    output
        .stdout
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str::<WorkerReport>(line.trim()).ok())
}

/// A report is accepted unless it is missing or carries status 3.
fn accept_report(output: &ProcessOutput) -> bool {
    parse_report(output).map(|r| r.status != StatusCode::UnknownOrTimeout.code()).unwrap_or(false)
}

#[async_trait]
impl ExecutionEngine for SnowflakeEngine {
    fn name(&self) -> &'static str {
        "snowflake"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Snowflake
    }

    async fn execute(&self, query: &str, target: &str, fetch: bool) -> ExecutionResult {
        let payload = match serde_json::to_vec(&self.job(query, target, fetch)) {
            Ok(bytes) => bytes,
            Err(e) => return ExecutionResult::unknown(format!("Unknown Error: cannot encode job: {}", e)),
        };
        let race_config = RaceConfig {
            poll_interval: self.settings.poll_interval,
            ceiling: self.timeout + self.settings.grace,
        };

        for batch in 1..=self.settings.max_batches {
            info!("Snowflake batch {}/{} with {} worker(s)", batch, self.settings.max_batches, self.settings.concurrency);
            let contenders = match self.spawn_batch(&payload).await {
                Ok(c) => c,
                Err(e) => return ExecutionResult::unknown(format!("Unknown Error: cannot start warehouse worker: {}", e)),
            };

            match race(contenders, accept_report, &race_config).await {
                RaceOutcome::Winner { index, output } => {
                    if let Some(report) = parse_report(&output) {
                        info!("✅ Snowflake worker {} answered with status {}", index, report.status);
                        return report.into_result();
                    }
                }
                RaceOutcome::AllRejected { rejected } => {
                    let reasons: Vec<String> = rejected
                        .iter()
                        .map(|o| parse_report(o).and_then(|r| r.payload).unwrap_or_else(|| "no report".to_string()))
                        .collect();
                    warn!("Snowflake batch {} produced no usable result: {}", batch, reasons.join(" | "));
                }
                RaceOutcome::HardTimeout { .. } => {
                    warn!("Snowflake batch {} hit the {}s ceiling", batch, race_config.ceiling.as_secs());
                }
            }
        }

        ExecutionResult::unknown(format!("Execution timed out after {} attempts.", self.settings.max_batches))
    }
}

/// Map Snowflake error text onto the status taxonomy.
pub fn classify_snowflake_error(message: &str) -> ExecutionResult {
    let lower = message.to_lowercase();
    if lower.contains("000630") || lower.contains("timed out") {
        ExecutionResult::unknown(format!("Timeout: {}", message))
    } else if lower.contains("sql compilation error")
        || lower.contains("syntax error")
        || lower.contains("invalid identifier")
        || lower.contains("does not exist or not authorized")
    {
        ExecutionResult::programming_error(format!("Snowflake Programming Error: {}", message))
    } else {
        ExecutionResult::database_error(format!("Snowflake Database Error: {}", message))
    }
}

/// Run one job inside a worker process.
pub async fn run_worker(job: &WarehouseJob) -> ExecutionResult {
    let started = Instant::now();
    if job.credentials.is_empty() {
        return ExecutionResult::database_error("Snowflake Database Error: no credentials configured");
    }
    let timeout = Duration::from_secs(job.timeout_secs);
    let creds = &job.credentials;
    let client = match SnowflakeClient::new(
        &creds.user,
        SnowflakeAuthMethod::Password(creds.password.clone()),
        SnowflakeClientConfig {
            account: creds.account.clone(),
            role: creds.role.clone(),
            warehouse: creds.warehouse.clone(),
            database: (!job.database.is_empty()).then(|| job.database.clone()),
            schema: None,
            timeout: Some(timeout),
        },
    ) {
        Ok(client) => client,
        Err(e) => return classify_snowflake_error(&e.to_string()),
    };

    let work = async {
        let session = client.create_session().await?;
        session.query(job.query.trim().trim_end_matches(';')).await
    };
    let rows = match tokio::time::timeout(timeout, work).await {
        Err(_) => {
            return ExecutionResult::unknown(format!("Timeout: execution exceeded {} seconds.", job.timeout_secs));
        }
        Ok(Err(e)) => return classify_snowflake_error(&e.to_string()),
        Ok(Ok(rows)) => rows,
    };
    if !job.fetch {
        return ExecutionResult::success(None);
    }

    let columns: Vec<String> = rows
        .first()
        .map(|row| row.column_types().into_iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    let mut set = ResultSet::new(columns.clone());
    for row in &rows {
        let cells = columns
            .iter()
            .map(|name| match row.get::<Option<String>>(name) {
                Ok(value) => value,
                Err(_) => row.get::<serde_json::Value>(name).ok().map(|v| v.to_string()),
            })
            .collect();
        set.push_row(cells);
    }
    let render = RenderOptions {
        max_rows: job.max_rows,
        max_columns: job.max_columns,
        token_budget: job.token_budget,
    };
    ExecutionResult::success(Some(set.render(started.elapsed(), &render)))
}

/// Worker entry point: job on stdin, one report line on stdout.
pub async fn run_worker_stdio() -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut input = String::new();
    tokio::io::stdin().read_to_string(&mut input).await?;
    let job: WarehouseJob = serde_json::from_str(&input)
        .map_err(|e| HarnessError::Parse(format!("Malformed warehouse job: {}", e)))?;
    let report = WorkerReport::from(run_worker(&job).await);

    let mut stdout = tokio::io::stdout();
    stdout.write_all(serde_json::to_string(&report)?.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}
