//! Schema-Linking Refiner
//!
//! Narrows a database schema to the tables and columns a question needs by
//! sampling exploratory SQL from the model and extracting what it touches.
//!
//! Budget ladder:
//! 1. full schema text when it fits the token budget
//! 2. the DDL form when that fits half the budget
//! 3. otherwise a per-table relevance pass, then a minimal pass over its picks

use crate::dialect::Dialect;
use crate::error::Result;
use crate::extract;
use crate::linking::extractor::LinkageExtractor;
use crate::linking::{merge, prompts};
use crate::llm::{CompletionRequest, LanguageModel, ModelRoles};
use crate::retry::RetryState;
use crate::schema::series::simplify_linkage;
use crate::schema::{Level, LinkageMap, SchemaAccessor, SchemaDescription, SchemaFilter};
use crate::tokens;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const IRRELEVANT_MARKER: &str = "select false as result";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkingStage {
    FullSchema,
    DdlSubstitute,
    LegacyPerTable,
    Minimal,
    SingleTableShortcut,
}

#[derive(Debug, Clone)]
pub struct LinkingOptions {
    /// Token budget for the schema text in one prompt.
    pub budget: usize,
    pub temperature: f32,
    pub rounds: usize,
    /// Attempts per sampling round.
    pub max_retries: usize,
    /// Run the full workflow even for single-table databases.
    pub use_single_table: bool,
    /// Validate extracted columns; `None` picks the backend default.
    pub check_columns: Option<bool>,
    pub refine_after_merge: bool,
}

impl Default for LinkingOptions {
    fn default() -> Self {
        Self {
            budget: 50_000,
            temperature: 1.2,
            rounds: 3,
            max_retries: 10,
            use_single_table: false,
            check_columns: None,
            refine_after_merge: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkingOutcome {
    pub tables: Vec<String>,
    pub columns: LinkageMap,
    /// Per-round extraction results of the last sampling pass.
    pub samples: BTreeMap<usize, LinkageMap>,
    pub stages: Vec<LinkingStage>,
}

impl LinkingOutcome {
    fn from_columns(columns: LinkageMap, samples: BTreeMap<usize, LinkageMap>, stages: Vec<LinkingStage>) -> Self {
        Self { tables: columns.keys().cloned().collect(), columns, samples, stages }
    }
}

pub struct SchemaLinker {
    llm: Arc<dyn LanguageModel>,
    roles: ModelRoles,
    schema: Arc<SchemaAccessor>,
    options: LinkingOptions,
}

impl SchemaLinker {
    pub fn new(llm: Arc<dyn LanguageModel>, roles: ModelRoles, schema: Arc<SchemaAccessor>) -> Self {
        Self { llm, roles, schema, options: LinkingOptions::default() }
    }

    pub fn with_options(mut self, options: LinkingOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &LinkingOptions {
        &self.options
    }

    pub async fn link(&self, question: &str, db_id: &str, dialect: Dialect) -> Result<LinkingOutcome> {
        let description = self.schema.description(db_id, dialect)?;
        let tables = description.non_empty_tables();
        info!("Linking '{}' over {} tables", db_id, tables.len());

        if tables.len() == 1 && !self.options.use_single_table {
            let columns: LinkageMap = tables.iter().map(|t| (t.clone(), Vec::new())).collect();
            let samples = BTreeMap::from([(0, columns.clone())]);
            return Ok(LinkingOutcome::from_columns(columns, samples, vec![LinkingStage::SingleTableShortcut]));
        }

        let mut stages = Vec::new();
        let Some((schema_text, stage)) = self.budgeted_schema(db_id, None, dialect)? else {
            return self.legacy_then_minimal(question, db_id, &description, &tables, stages).await;
        };
        stages.push(stage);

        let samples = self.sample_rounds(question, &schema_text, &description).await;
        let merged = simplify_linkage(&merge(samples.values()));
        if merged.is_empty() {
            warn!("Every linking round failed for '{}', returning an empty linkage", db_id);
            return Ok(LinkingOutcome::from_columns(LinkageMap::new(), samples, stages));
        }

        if self.options.refine_after_merge && merged.len() > 1 {
            let picked: Vec<String> = merged.keys().cloned().collect();
            stages.push(LinkingStage::Minimal);
            let (refined, refined_samples) = self.minimal_pass(question, db_id, &description, &picked).await?;
            if !refined.is_empty() {
                return Ok(LinkingOutcome::from_columns(refined, refined_samples, stages));
            }
        }
        Ok(LinkingOutcome::from_columns(merged, samples, stages))
    }

    /// Schema text for `tables` (every table when `None`): the rendered form
    /// when it fits the budget, else the DDL form when that fits half of it.
    fn budgeted_schema(
        &self,
        db_id: &str,
        tables: Option<&[String]>,
        dialect: Dialect,
    ) -> Result<Option<(String, LinkingStage)>> {
        let filter = tables.map(|t| SchemaFilter::Tables(t.to_vec()));
        let text = self.schema.render(db_id, filter.as_ref(), Level::Table, dialect)?;
        let cost = tokens::estimate(&text);
        if cost <= self.options.budget {
            return Ok(Some((text, LinkingStage::FullSchema)));
        }

        let ddl = self.schema.render_ddl(db_id, tables, dialect)?;
        if tokens::estimate(&ddl) <= self.options.budget / 2 {
            debug!("Schema text costs {} tokens, over budget; using DDL form", cost);
            return Ok(Some((ddl, LinkingStage::DdlSubstitute)));
        }
        Ok(None)
    }

    async fn legacy_then_minimal(
        &self,
        question: &str,
        db_id: &str,
        description: &SchemaDescription,
        tables: &[String],
        mut stages: Vec<LinkingStage>,
    ) -> Result<LinkingOutcome> {
        stages.push(LinkingStage::LegacyPerTable);
        let relevant = self.legacy_per_table(question, db_id, description.dialect, tables).await?;
        stages.push(LinkingStage::Minimal);
        let (columns, samples) = self.minimal_pass(question, db_id, description, &relevant).await?;
        Ok(LinkingOutcome::from_columns(columns, samples, stages))
    }

    /// Ask about one table at a time. Tables the model rejects are dropped; if
    /// it rejects everything the full list is kept.
    async fn legacy_per_table(&self, question: &str, db_id: &str, dialect: Dialect, tables: &[String]) -> Result<Vec<String>> {
        let mut relevant = Vec::new();
        for table in tables {
            let text = self.schema.render(db_id, Some(&SchemaFilter::Tables(vec![table.clone()])), Level::Table, dialect)?;
            let request = CompletionRequest::prompt(
                &self.roles.base,
                prompts::legacy_table_prompt(&text, question, dialect),
                self.options.temperature,
            );
            let sql = self.sql_with_retry("per-table relevance", &request).await;
            match sql {
                Some(sql) if !sql.to_lowercase().contains(IRRELEVANT_MARKER) => relevant.push(table.clone()),
                Some(_) => debug!("Table '{}' judged irrelevant", table),
                None => relevant.push(table.clone()),
            }
        }
        if relevant.is_empty() {
            warn!("No table judged relevant, keeping all {}", tables.len());
            return Ok(tables.to_vec());
        }
        Ok(relevant)
    }

    /// Sampling rounds over the schema restricted to `tables`. A single table
    /// is returned as is unless `use_single_table` is set.
    async fn minimal_pass(
        &self,
        question: &str,
        db_id: &str,
        description: &SchemaDescription,
        tables: &[String],
    ) -> Result<(LinkageMap, BTreeMap<usize, LinkageMap>)> {
        if let [only] = tables {
            if !self.options.use_single_table {
                let columns = LinkageMap::from([(only.clone(), Vec::new())]);
                return Ok((columns.clone(), BTreeMap::from([(0, columns)])));
            }
        }

        let text = match self.budgeted_schema(db_id, Some(tables), description.dialect)? {
            Some((text, _)) => text,
            None => {
                warn!("Schema for {} linked tables is over budget, truncating", tables.len());
                let filter = SchemaFilter::Tables(tables.to_vec());
                let text = self.schema.render(db_id, Some(&filter), Level::Table, description.dialect)?;
                tokens::truncate(&text, self.options.budget)
            }
        };
        let samples = self.sample_rounds(question, &text, description).await;
        Ok((simplify_linkage(&merge(samples.values())), samples))
    }

    async fn sample_rounds(
        &self,
        question: &str,
        schema_text: &str,
        description: &SchemaDescription,
    ) -> BTreeMap<usize, LinkageMap> {
        let dialect = description.dialect;
        let check_columns = self.options.check_columns.unwrap_or(!dialect.is_warehouse());
        let extractor = LinkageExtractor::new(Arc::clone(&self.llm), &self.roles.tool);
        let request = CompletionRequest::prompt(
            &self.roles.base,
            prompts::exploratory_prompt(schema_text, question, dialect),
            self.options.temperature,
        );

        let mut samples = BTreeMap::new();
        for round in 0..self.options.rounds {
            let Some(sql) = self.sql_with_retry("linking round", &request).await else {
                warn!("Linking round {} produced no SQL, dropping it", round);
                continue;
            };
            let linkage = extractor.extract(&sql, description, check_columns).await;
            debug!("Round {} linked {} tables", round, linkage.len());
            samples.insert(round, linkage);
        }
        samples
    }

    async fn sql_with_retry(&self, label: &'static str, request: &CompletionRequest) -> Option<String> {
        let llm = &self.llm;
        RetryState::new(label, self.options.max_retries)
            .run(|_| async move {
                let completion = llm.complete(request).await?;
                extract::last_sql_block(&completion.text)
                    .ok_or_else(|| crate::error::HarnessError::Parse("no ```sql block in answer".into()))
            })
            .await
            .ok()
    }
}
