//! Statement runner with the repair sub-loop
//!
//! Every SQL a session issues goes through `StatementRunner::run`:
//! 1. Snowflake only: expand abbreviated UNION ALL branches first
//! 2. execute through the engine factory
//! 3. on a programming error, ask for a fix and re-execute, a bounded number of times

use crate::dialect::Dialect;
use crate::error::HarnessError;
use crate::execution::{EngineFactory, ExecutionResult, StatusCode};
use crate::extract;
use crate::llm::{CompletionRequest, LanguageModel, ModelRoles};
use crate::refine::prompts::{self, PromptContext};
use crate::retry::RetryState;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_REPAIR_ATTEMPTS: usize = 3;
pub const DEFAULT_COMPLETION_ATTEMPTS: usize = 10;

/// Whether a Snowflake query looks like it abbreviates repeated branches.
pub fn needs_completion(sql: &str) -> bool {
    let lower = sql.to_lowercase();
    let has = |word: &str| lower.contains(word);
    (has("union") && has("repeated"))
        || (has("union") && has("note"))
        || (has("repeated") && has("note"))
        || (has("union") && has("repeat"))
        || (has("union") && has("table") && has("/*"))
}

pub struct StatementRunner {
    factory: Arc<EngineFactory>,
    llm: Arc<dyn LanguageModel>,
    roles: ModelRoles,
    dialect: Dialect,
    target: String,
    repair_attempts: usize,
    completion_attempts: usize,
}

impl StatementRunner {
    pub fn new(
        factory: Arc<EngineFactory>,
        llm: Arc<dyn LanguageModel>,
        roles: ModelRoles,
        dialect: Dialect,
        target: &str,
    ) -> Self {
        Self {
            factory,
            llm,
            roles,
            dialect,
            target: target.to_string(),
            repair_attempts: DEFAULT_REPAIR_ATTEMPTS,
            completion_attempts: DEFAULT_COMPLETION_ATTEMPTS,
        }
    }

    pub fn with_repair_attempts(mut self, attempts: usize) -> Self {
        self.repair_attempts = attempts;
        self
    }

    /// Execute without completion or repair.
    pub async fn execute_raw(&self, sql: &str) -> ExecutionResult {
        self.factory.execute(self.dialect, sql, &self.target, true).await
    }

    /// Execute `sql`, repairing programming errors. Returns the SQL that was
    /// finally executed with its result.
    pub async fn run(&self, sql: &str, ctx: &PromptContext<'_>) -> (String, ExecutionResult) {
        let mut current = if self.dialect == Dialect::Snowflake && needs_completion(sql) {
            self.complete_snowflake(sql).await
        } else {
            sql.to_string()
        };
        let mut result = self.execute_raw(&current).await;

        let mut retry = RetryState::new("sql repair", self.repair_attempts);
        while result.status == StatusCode::ProgrammingError && retry.begin_attempt() {
            let request = CompletionRequest::prompt(
                &self.roles.base,
                prompts::fix_prompt(ctx, &current, result.payload_text()),
                1.0,
            );
            let fixed = match self.llm.complete(&request).await {
                Ok(completion) => extract::json_object(&completion.text)
                    .and_then(|obj| extract::str_field(&obj, "FIXSQL"))
                    .or_else(|| extract::last_sql_block(&completion.text)),
                Err(e) => {
                    retry.record_failure(e);
                    continue;
                }
            };
            let Some(fixed) = fixed else {
                retry.record_failure("answer carries no FIXSQL");
                continue;
            };
            debug!("Repair attempt {} produced a new query", retry.attempts());
            current = fixed;
            result = self.execute_raw(&current).await;
            if result.status == StatusCode::ProgrammingError {
                retry.record_failure(result.payload_text().to_string());
            }
        }
        if result.status == StatusCode::ProgrammingError && retry.is_exhausted() {
            warn!("Query still failing after {} repair attempts", retry.attempts());
        }
        (current, result)
    }

    /// Ask the tool model to write out abbreviated branches. Falls back to the
    /// original text when no attempt yields a SQL block.
    pub async fn complete_snowflake(&self, sql: &str) -> String {
        info!("Expanding abbreviated Snowflake query");
        let request = CompletionRequest::prompt(&self.roles.tool, prompts::completion_prompt(sql), 0.0);
        let llm = &self.llm;
        let request = &request;
        RetryState::new("snowflake completion", self.completion_attempts)
            .run(|_| async move {
                let completion = llm.complete(request).await?;
                extract::last_sql_block(&completion.text)
                    .ok_or_else(|| HarnessError::Parse("no ```sql block in completion".into()))
            })
            .await
            .unwrap_or(sql.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_triggers() {
        assert!(needs_completion("SELECT 1 UNION ALL SELECT 2 -- repeated for each year"));
        assert!(needs_completion("select * from a union all /* same for every table */"));
        assert!(needs_completion("-- note: pattern repeated"));
        assert!(!needs_completion("SELECT * FROM a UNION ALL SELECT * FROM b"));
        assert!(!needs_completion("SELECT note FROM t"));
    }
}
