//! Engine Factory - one engine per dialect
//!
//! Backends are a closed set. The factory builds the engine for a dialect once
//! and hands out shared references afterwards.

use crate::config::HarnessConfig;
use crate::dialect::Dialect;
use crate::error::Result;
use crate::execution::bigquery_engine::BigQueryEngine;
use crate::execution::engine::{ExecutionEngine, ExecutionResult};
use crate::execution::mysql_engine::MySqlEngine;
use crate::execution::snowflake_engine::SnowflakeEngine;
use crate::execution::sqlite_engine::SqliteEngine;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

pub struct EngineFactory {
    config: Arc<HarnessConfig>,
    engines: Mutex<HashMap<Dialect, Arc<dyn ExecutionEngine>>>,
}

impl EngineFactory {
    pub fn new(config: Arc<HarnessConfig>) -> Self {
        Self { config, engines: Mutex::new(HashMap::new()) }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Register a prebuilt engine, replacing whatever the factory would build.
    pub fn with_engine(self, engine: Arc<dyn ExecutionEngine>) -> Self {
        self.engines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(engine.dialect(), engine);
        self
    }

    pub fn engine_for(&self, dialect: Dialect) -> Result<Arc<dyn ExecutionEngine>> {
        let mut engines = self.engines.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(engine) = engines.get(&dialect) {
            return Ok(Arc::clone(engine));
        }

        let engine: Arc<dyn ExecutionEngine> = match dialect {
            Dialect::Sqlite => Arc::new(SqliteEngine::new(&self.config)),
            Dialect::Snowflake => Arc::new(SnowflakeEngine::new(&self.config)?),
            Dialect::BigQuery => Arc::new(BigQueryEngine::new(&self.config)),
            Dialect::MySql | Dialect::Doris => Arc::new(MySqlEngine::new(&self.config, dialect)),
        };
        info!("✅ Created {} execution engine", engine.name());
        engines.insert(dialect, Arc::clone(&engine));
        Ok(engine)
    }

    /// Run `query` on the dialect's engine. Construction failures surface as
    /// an unknown-error result so the caller always gets the status contract.
    pub async fn execute(&self, dialect: Dialect, query: &str, target: &str, fetch: bool) -> ExecutionResult {
        match self.engine_for(dialect) {
            Ok(engine) => engine.execute(query, target, fetch).await,
            Err(e) => ExecutionResult::unknown(format!("{} Unknown Error: {}", dialect.display_name(), e)),
        }
    }
}
