//! Refinement Session - the sub-question control loop
//!
//! Begin asks for the first sub-question's SQL. Each Continue step picks one
//! of Extend, Revise, Explore or Rephrase; every non-terminal step executes
//! immediately and its result feeds the next prompt. Rephrase ends the
//! session with the final query. When the step budget runs out, the last
//! accepted SQL is returned as a best effort.

use crate::dialect::Dialect;
use crate::error::{HarnessError, Result};
use crate::execution::{EngineFactory, ExecutionResult, RelationProfile, StatusCode};
use crate::extract;
use crate::linking::{LinkingOutcome, SchemaLinker};
use crate::llm::{CompletionRequest, LanguageModel, ModelRoles};
use crate::refine::prompts::{self, PromptContext};
use crate::refine::repair::{StatementRunner, DEFAULT_REPAIR_ATTEMPTS};
use crate::refine::state::{LoopState, StepAction, SubQuestionTrace, TraceEntry};
use crate::retry::RetryState;
use crate::schema::{Level, SchemaAccessor, SchemaFilter};
use crate::tokens;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

const GENERATION_TEMPERATURE: f32 = 0.2;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub step_budget: usize,
    pub repair_attempts: usize,
    /// Attempts to get a parseable JSON answer for one step.
    pub generation_attempts: usize,
    /// Per-result token cap inside the history block.
    pub result_tokens: usize,
    /// Token budget for the schema text when no linker narrows it.
    pub schema_budget: usize,
    pub evidence: Option<String>,
    pub compress_evidence: bool,
    /// Run exploratory queries and summarize them before Begin.
    pub explore_first: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            step_budget: 10,
            repair_attempts: DEFAULT_REPAIR_ATTEMPTS,
            generation_attempts: 3,
            result_tokens: 1000,
            schema_budget: 50_000,
            evidence: None,
            compress_evidence: false,
            explore_first: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub final_sql: Option<String>,
    pub result: ExecutionResult,
    pub trace: SubQuestionTrace,
    /// The model's last `result_acceptable` verdict.
    pub accepted: bool,
    pub steps: usize,
    pub linking: Option<LinkingOutcome>,
}

impl SessionOutcome {
    pub fn as_pair(&self) -> (u8, Option<String>) {
        self.result.as_pair()
    }
}

pub struct RefinementSession {
    llm: Arc<dyn LanguageModel>,
    roles: ModelRoles,
    factory: Arc<EngineFactory>,
    schema: Arc<SchemaAccessor>,
    linker: Option<SchemaLinker>,
    dialect: Dialect,
    options: SessionOptions,
}

impl RefinementSession {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        roles: ModelRoles,
        factory: Arc<EngineFactory>,
        schema: Arc<SchemaAccessor>,
        dialect: Dialect,
    ) -> Self {
        Self { llm, roles, factory, schema, linker: None, dialect, options: SessionOptions::default() }
    }

    pub fn with_linker(mut self, linker: SchemaLinker) -> Self {
        self.linker = Some(linker);
        self
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub async fn run(&self, question: &str, db_id: &str) -> Result<SessionOutcome> {
        info!("Refinement session on {} '{}'", self.dialect.display_name(), db_id);
        let known = self.known_relations(db_id)?;
        let (schema_text, linking) = self.schema_text(question, db_id).await?;
        let evidence = self.evidence(question).await;
        let runner = StatementRunner::new(
            Arc::clone(&self.factory),
            Arc::clone(&self.llm),
            self.roles.clone(),
            self.dialect,
            db_id,
        )
        .with_repair_attempts(self.options.repair_attempts);

        let mut ctx = PromptContext {
            question,
            schema_text: &schema_text,
            dialect: self.dialect,
            evidence: evidence.as_deref(),
            notes: None,
        };
        let notes = if self.options.explore_first { self.explore(&ctx, &runner).await } else { None };
        ctx.notes = notes.as_deref();

        let mut trace = SubQuestionTrace::default();
        let mut state = LoopState::Begin;
        let mut steps = 0;
        let mut accepted = false;
        let mut warning: Option<String> = None;
        let mut final_step: Option<(String, ExecutionResult)> = None;

        while state != LoopState::Done && steps < self.options.step_budget {
            steps += 1;
            if state == LoopState::Begin {
                let Some(answer) = self.generate(prompts::begin_prompt(&ctx)).await else { continue };
                let Some(sql) = extract::str_field(&answer, "sql") else {
                    warn!("Begin answer has no sql field");
                    continue;
                };
                let (sql, result) = runner.run(&sql, &ctx).await;
                warning = self.hallucination_warning(&sql, &known);
                trace.push(TraceEntry { sub_question: solved(&answer, question), sql, action: StepAction::Begin, result });
                state = LoopState::Continue;
                continue;
            }

            let history = trace.history_text(self.options.result_tokens);
            let hint = state_hint(trace.last().map(|e| &e.result), accepted);
            let prompt = prompts::continue_prompt(&ctx, &history, hint, warning.as_deref());
            let Some(answer) = self.generate(prompt).await else { continue };

            accepted = extract::bool_field(&answer, "result_acceptable").unwrap_or(accepted);
            let action = StepAction::parse(&extract::str_field(&answer, "current_state").unwrap_or_default());
            let sql = extract::str_field(&answer, "sql");
            debug!("Step {}: {} (acceptable: {})", steps, action, accepted);

            if action == StepAction::Rephrase {
                accepted = true;
                let Some(sql) = sql.or_else(|| trace.accepted().map(|e| e.sql.clone())) else {
                    warn!("Rephrase without any SQL to finish with");
                    continue;
                };
                let (sql, result) = runner.run(&sql, &ctx).await;
                trace.push(TraceEntry {
                    sub_question: solved(&answer, question),
                    sql: sql.clone(),
                    action,
                    result: result.clone(),
                });
                final_step = Some((sql, result));
                state = LoopState::Done;
                continue;
            }

            let Some(sql) = sql else {
                warn!("{} answer has no sql field", action);
                continue;
            };
            let (sql, result) = runner.run(&sql, &ctx).await;
            warning = self.hallucination_warning(&sql, &known);
            trace.push(TraceEntry { sub_question: solved(&answer, question), sql, action, result });
        }

        let (final_sql, result) = match final_step {
            Some((sql, result)) => (Some(sql), result),
            None => match trace.accepted() {
                Some(entry) => {
                    warn!("Step budget of {} exhausted, returning last accepted SQL", self.options.step_budget);
                    (Some(entry.sql.clone()), entry.result.clone())
                }
                None => (None, ExecutionResult::unknown("No SQL was produced within the step budget.")),
            },
        };
        info!("✅ Session finished after {} steps with status {}", steps, result.status.code());
        Ok(SessionOutcome { final_sql, result, trace, accepted, steps, linking })
    }

    /// Tables the schema knows, including every member of an alias group.
    fn known_relations(&self, db_id: &str) -> Result<Vec<String>> {
        let description = self.schema.description(db_id, self.dialect)?;
        let mut known: Vec<String> = description.tables.iter().map(|t| t.full_name()).collect();
        for group in &description.alias_groups {
            for member in &group.members {
                known.push(match &group.qualifier {
                    Some(q) => format!("{}.{}", q, member),
                    None => member.clone(),
                });
            }
        }
        Ok(known)
    }

    async fn schema_text(&self, question: &str, db_id: &str) -> Result<(String, Option<LinkingOutcome>)> {
        if let Some(linker) = &self.linker {
            let outcome = linker.link(question, db_id, self.dialect).await?;
            if !outcome.columns.is_empty() {
                let text = if outcome.columns.values().all(|c| !c.is_empty()) {
                    let filter = SchemaFilter::Columns(outcome.columns.clone());
                    self.schema.render(db_id, Some(&filter), Level::Column, self.dialect)?
                } else {
                    let filter = SchemaFilter::Tables(outcome.tables.clone());
                    self.schema.render(db_id, Some(&filter), Level::Table, self.dialect)?
                };
                return Ok((text, Some(outcome)));
            }
            warn!("Linking found nothing for '{}', using the whole schema", db_id);
        }

        let full = self.schema.render(db_id, None, Level::Table, self.dialect)?;
        if tokens::estimate(&full) <= self.options.schema_budget {
            return Ok((full, None));
        }
        let ddl = self.schema.render_ddl(db_id, None, self.dialect)?;
        Ok((tokens::truncate(&ddl, self.options.schema_budget), None))
    }

    async fn evidence(&self, question: &str) -> Option<String> {
        let evidence = self.options.evidence.clone()?;
        if !self.options.compress_evidence {
            return Some(evidence);
        }
        let request = CompletionRequest::prompt(&self.roles.base, prompts::compression_prompt(question, &evidence), 1.0);
        match self.llm.complete(&request).await {
            Ok(completion) => extract::json_object(&completion.text)
                .and_then(|obj| extract::str_field(&obj, "evidence"))
                .or(Some(evidence)),
            Err(e) => {
                warn!("Evidence compression failed: {}", e);
                Some(evidence)
            }
        }
    }

    /// Exploration then aggregation. The summary becomes notes for every later prompt.
    async fn explore(&self, ctx: &PromptContext<'_>, runner: &StatementRunner) -> Option<String> {
        let request = CompletionRequest::prompt(&self.roles.reasoning, prompts::exploration_prompt(ctx), 1.0);
        let queries = match self.llm.complete(&request).await {
            Ok(completion) => extract::json_object(&completion.text)?,
            Err(e) => {
                warn!("Exploration failed: {}", e);
                return None;
            }
        };

        let mut findings = Vec::new();
        for (label, sql) in queries.iter().filter_map(|(k, v)| v.as_str().map(|s| (k, s))) {
            let result = runner.execute_raw(sql).await;
            findings.push(format!(
                "{}:\n```sql\n{}\n```\nStatus: {}\n{}",
                label,
                sql,
                result.status.code(),
                tokens::truncate(result.payload_text(), self.options.result_tokens)
            ));
        }
        if findings.is_empty() {
            return None;
        }

        let request = CompletionRequest::prompt(
            &self.roles.reasoning,
            prompts::aggregation_prompt(ctx, &findings.join("\n\n")),
            0.0,
        );
        match self.llm.complete(&request).await {
            Ok(completion) => Some(extract::answer_block(&completion.text)),
            Err(e) => {
                warn!("Aggregation failed: {}", e);
                None
            }
        }
    }

    async fn generate(&self, prompt: String) -> Option<Map<String, Value>> {
        let request = CompletionRequest::prompt(&self.roles.reasoning, prompt, GENERATION_TEMPERATURE);
        let llm = &self.llm;
        let request = &request;
        RetryState::new("step generation", self.options.generation_attempts)
            .run(|_| async move {
                let completion = llm.complete(request).await?;
                extract::json_object(&completion.text)
                    .ok_or_else(|| HarnessError::Parse("answer is not a JSON object".into()))
            })
            .await
            .ok()
    }

    fn hallucination_warning(&self, sql: &str, known: &[String]) -> Option<String> {
        let unknown = RelationProfile::from_sql(sql, self.dialect)?.unknown_relations(known);
        if unknown.is_empty() {
            return None;
        }
        warn!("Query references unknown relations: {}", unknown.join(", "));
        Some(format!(
            "the last query referenced tables that do not exist in the schema: {}. Use only tables listed under [Schema].",
            unknown.join(", ")
        ))
    }
}

fn solved(answer: &Map<String, Value>, question: &str) -> String {
    let list = extract::string_list_field(answer, "solved_subquestions_list");
    if list.is_empty() {
        question.to_string()
    } else {
        list.join("; ")
    }
}

fn state_hint(last: Option<&ExecutionResult>, accepted: bool) -> &'static str {
    match last {
        Some(r) if r.status != StatusCode::Success => {
            "The last query failed. Revise it, or Explore the data to find the cause."
        }
        Some(r) if r.is_empty_result() => {
            "The last query returned no rows. Check filter values with Explore, or Revise the query."
        }
        _ if accepted => "The previous result was acceptable. Extend with the next sub-question, or Rephrase if all are solved.",
        _ => "Judge whether the last result answers its sub-question before choosing the next state.",
    }
}
