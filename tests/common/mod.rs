#![allow(dead_code)]

use async_trait::async_trait;
use sqlrefine::config::HarnessConfig;
use sqlrefine::dialect::Dialect;
use sqlrefine::error::{HarnessError, Result};
use sqlrefine::execution::{ExecutionEngine, ExecutionResult};
use sqlrefine::llm::{Completion, CompletionRequest, LanguageModel};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One scripted reply: used when every needle appears in the prompt. Replies
/// are consumed in order; the last one repeats.
pub struct Rule {
    needles: Vec<String>,
    replies: Vec<String>,
    next: usize,
}

impl Rule {
    pub fn new(needles: &[&str], replies: &[&str]) -> Self {
        Self {
            needles: needles.iter().map(|s| s.to_string()).collect(),
            replies: replies.iter().map(|s| s.to_string()).collect(),
            next: 0,
        }
    }
}

/// In-process `LanguageModel` double. Records every prompt it sees.
pub struct ScriptedModel {
    rules: Mutex<Vec<Rule>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules: Mutex::new(rules), prompts: Mutex::new(Vec::new()) }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn calls_containing(&self, needle: &str) -> usize {
        self.prompts().iter().filter(|p| p.contains(needle)).count()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let prompt = request.last_user_text().to_string();
        self.prompts.lock().unwrap().push(prompt.clone());

        let mut rules = self.rules.lock().unwrap();
        let rule = rules
            .iter_mut()
            .find(|r| r.needles.iter().all(|n| prompt.contains(n.as_str())))
            .ok_or_else(|| HarnessError::Llm(format!("no scripted reply for prompt: {}", prompt.chars().take(120).collect::<String>())))?;
        let index = rule.next.min(rule.replies.len() - 1);
        rule.next += 1;
        Ok(Completion {
            input_tokens: prompt.len() as u64 / 4,
            output_tokens: 10,
            reasoning: None,
            text: rule.replies[index].clone(),
        })
    }
}

/// Engine double that records queries and answers with a fixed payload.
pub struct RecordingEngine {
    dialect: Dialect,
    pub queries: Mutex<Vec<String>>,
}

impl RecordingEngine {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect, queries: Mutex::new(Vec::new()) }
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionEngine for RecordingEngine {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn execute(&self, query: &str, _target: &str, _fetch: bool) -> ExecutionResult {
        self.queries.lock().unwrap().push(query.to_string());
        ExecutionResult::success(Some("n\n1\nQuery Time: 0.0010 s".to_string()))
    }
}

pub fn scratch_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("sqlrefine_{}_{}", label, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn write_schema(root: &Path, db_id: &str, body: &serde_json::Value) {
    let dir = root.join(db_id);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(format!("{}_M-Schema.json", db_id)), serde_json::to_string_pretty(body).unwrap()).unwrap();
}

/// A SQLite database at `<root>/<db_id>/<db_id>.sqlite` built from `ddl`.
pub fn write_sqlite(root: &Path, db_id: &str, ddl: &str) -> PathBuf {
    let dir = root.join(db_id);
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{}.sqlite", db_id));
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(ddl).unwrap();
    path
}

pub fn config_for(root: &Path) -> HarnessConfig {
    HarnessConfig {
        sqlite_dir: root.to_path_buf(),
        snowflake_dir: root.to_path_buf(),
        bigquery_dir: root.to_path_buf(),
        mysql_dir: root.to_path_buf(),
        doris_dir: root.to_path_buf(),
        ..HarnessConfig::default()
    }
}
