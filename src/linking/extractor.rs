//! Linkage Extractor - tables and columns referenced by generated SQL
//!
//! A bounded-retry model sub-call at temperature 0. The answer is validated
//! case-insensitively against the schema before it is accepted:
//! - flat backends keep known tables only, in their stored case
//! - warehouses check `table.column` pairs against the column universe

use crate::dialect::Dialect;
use crate::extract;
use crate::linking::prompts;
use crate::llm::{CompletionRequest, LanguageModel};
use crate::retry::RetryState;
use crate::schema::{LinkageMap, SchemaDescription};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_EXTRACTION_ATTEMPTS: usize = 10;

pub struct LinkageExtractor {
    llm: Arc<dyn LanguageModel>,
    model: String,
    max_attempts: usize,
}

enum Verdict {
    Accept(LinkageMap),
    /// Usable only if nothing better arrives before the bound.
    Partial(LinkageMap),
    Reject(String),
}

impl LinkageExtractor {
    pub fn new(llm: Arc<dyn LanguageModel>, model: &str) -> Self {
        Self { llm, model: model.to_string(), max_attempts: DEFAULT_EXTRACTION_ATTEMPTS }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Tables and columns referenced by `sql`. Exhaustion yields the best
    /// partial answer seen, or an empty map.
    pub async fn extract(&self, sql: &str, schema: &SchemaDescription, check_columns: bool) -> LinkageMap {
        let request = CompletionRequest::prompt(&self.model, prompts::extraction_prompt(sql, schema.dialect), 0.0);
        let universe = if check_columns && schema.dialect.is_warehouse() {
            schema.column_universe()
        } else {
            BTreeSet::new()
        };

        let mut retry = RetryState::new("linkage extraction", self.max_attempts);
        let mut partial: Option<LinkageMap> = None;
        while retry.begin_attempt() {
            let completion = match self.llm.complete(&request).await {
                Ok(c) => c,
                Err(e) => {
                    retry.record_failure(e);
                    continue;
                }
            };
            let Some(raw) = parse_linkage(&completion.text) else {
                retry.record_failure("answer is not a JSON object");
                continue;
            };

            let verdict = if schema.dialect.is_warehouse() {
                validate_warehouse(raw, &universe, check_columns)
            } else {
                validate_flat(raw, schema, check_columns)
            };
            match verdict {
                Verdict::Accept(map) => {
                    debug!("Extracted {} tables after {} attempts", map.len(), retry.attempts());
                    return map;
                }
                Verdict::Partial(map) => {
                    retry.record_failure("some columns are not in the schema");
                    partial = Some(map);
                }
                Verdict::Reject(reason) => retry.record_failure(reason),
            }
        }
        retry.give_up::<LinkageMap>();
        partial.unwrap_or_default()
    }
}

fn parse_linkage(text: &str) -> Option<LinkageMap> {
    let obj = extract::json_object(text)?;
    Some(
        obj.keys()
            .map(|table| (table.trim().to_string(), extract::string_list_field(&obj, table)))
            .filter(|(table, _)| !table.is_empty())
            .collect(),
    )
}

fn validate_flat(raw: LinkageMap, schema: &SchemaDescription, check_columns: bool) -> Verdict {
    let mut out = LinkageMap::new();
    for (name, columns) in raw {
        let Some(resolved) = schema.resolve(&name) else {
            debug!("Dropping unknown table '{}'", name);
            continue;
        };
        let table = &schema.tables[resolved.index];
        let columns: Vec<String> = if check_columns {
            columns.iter().filter_map(|c| table.column(c).map(|col| col.name.clone())).collect()
        } else {
            columns
        };
        if columns.is_empty() && schema.dialect != Dialect::Sqlite {
            continue;
        }
        let entry = out.entry(table.key.clone()).or_default();
        entry.extend(columns);
        entry.sort();
        entry.dedup();
    }
    if out.is_empty() {
        Verdict::Reject("no known tables in the answer".into())
    } else {
        Verdict::Accept(out)
    }
}

fn validate_warehouse(raw: LinkageMap, universe: &BTreeSet<String>, check_columns: bool) -> Verdict {
    if raw.is_empty() {
        return Verdict::Accept(LinkageMap::new());
    }
    if !check_columns {
        return Verdict::Accept(raw.into_keys().map(|t| (t, Vec::new())).collect());
    }

    let mut all_known = true;
    let mut matched = LinkageMap::new();
    for (table, columns) in raw {
        let prefix = table.to_lowercase();
        let entry: &mut Vec<String> = matched.entry(table).or_default();
        for column in columns {
            if universe.contains(&format!("{}.{}", prefix, column.to_lowercase())) {
                entry.push(column);
            } else {
                all_known = false;
            }
        }
        entry.sort();
        entry.dedup();
    }
    if all_known {
        return Verdict::Accept(matched);
    }
    if matched.values().all(Vec::is_empty) {
        warn!("No extracted column matches the schema");
    }
    Verdict::Partial(matched)
}
