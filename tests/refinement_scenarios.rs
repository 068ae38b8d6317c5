mod common;

use common::{config_for, scratch_dir, write_schema, write_sqlite, RecordingEngine, Rule, ScriptedModel};
use serde_json::json;
use sqlrefine::dialect::Dialect;
use sqlrefine::execution::{EngineFactory, StatusCode};
use sqlrefine::linking::{LinkingOptions, LinkingStage, SchemaLinker};
use sqlrefine::llm::ModelRoles;
use sqlrefine::refine::{RefinementSession, SessionOptions, StepAction};
use sqlrefine::schema::{Level, SchemaAccessor};
use sqlrefine::tokens;
use std::sync::Arc;

const BEGIN: &str = "answer the FIRST one";
const CONTINUE: &str = "Choose the next state";
const FIX: &str = "The query below failed";
const COMPLETION: &str = "abbreviates repeated UNION ALL branches";

fn single_table_db(label: &str) -> std::path::PathBuf {
    let root = scratch_dir(label);
    write_sqlite(
        &root,
        "people",
        "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT);
         INSERT INTO t VALUES (1, 'ann'), (2, 'bob'), (3, 'cy');",
    );
    write_schema(
        &root,
        "people",
        &json!({"people": {"t": [["id", "Primary Key", "INTEGER", "", "1, 2"], ["name", "None", "TEXT", "", "ann, bob"]]}}),
    );
    root
}

fn session(root: &std::path::Path, llm: Arc<ScriptedModel>, dialect: Dialect) -> RefinementSession {
    let config = Arc::new(config_for(root));
    let factory = Arc::new(EngineFactory::new(Arc::clone(&config)));
    let schema = Arc::new(SchemaAccessor::new(config));
    RefinementSession::new(llm, ModelRoles::uniform("scripted"), factory, schema, dialect)
}

#[tokio::test]
async fn test_scenario_a_begin_then_rephrase() {
    let root = single_table_db("scenario_a");
    let llm = Arc::new(ScriptedModel::new(vec![
        Rule::new(
            &[CONTINUE],
            &[r#"{"result_acceptable": true, "current_state": "Rephrase", "sql": "SELECT id, name FROM t", "solved_subquestions_list": ["list all names"]}"#],
        ),
        Rule::new(&[BEGIN], &[r#"```json
{"sql": "SELECT id, name FROM t", "solved_subquestions_list": ["list all names"]}
```"#]),
    ]));

    let outcome = session(&root, Arc::clone(&llm), Dialect::Sqlite).run("list all names", "people").await.unwrap();

    assert_eq!(outcome.as_pair().0, 0);
    assert!(outcome.result.payload_text().contains("bob"));
    assert_eq!(outcome.final_sql.as_deref(), Some("SELECT id, name FROM t"));
    assert_eq!(outcome.steps, 2);
    assert!(outcome.accepted);
    let actions: Vec<StepAction> = outcome.trace.entries().iter().map(|e| e.action).collect();
    assert_eq!(actions, vec![StepAction::Begin, StepAction::Rephrase]);
    assert_eq!(outcome.trace.entries()[0].result.status, StatusCode::Success);
}

#[tokio::test]
async fn test_budget_exhaustion_returns_last_accepted() {
    let root = single_table_db("budget");
    let llm = Arc::new(ScriptedModel::new(vec![
        Rule::new(&[FIX], &[r#"{"FIXSQL": "SELECT nope FROM t"}"#]),
        Rule::new(
            &[CONTINUE],
            &[
                r#"{"result_acceptable": false, "current_state": "Explore", "sql": "SELECT DISTINCT name FROM t"}"#,
                r#"{"result_acceptable": true, "current_state": "Revise", "sql": "SELECT id, name FROM t ORDER BY id"}"#,
                r#"{"result_acceptable": true, "current_state": "Explore", "sql": "SELECT COUNT(*) FROM t"}"#,
                r#"{"result_acceptable": true, "current_state": "Extend", "sql": "SELECT nope FROM t"}"#,
            ],
        ),
        Rule::new(&[BEGIN], &[r#"{"sql": "SELECT name FROM t"}"#]),
    ]));

    let options = SessionOptions { step_budget: 5, ..SessionOptions::default() };
    let outcome = session(&root, llm, Dialect::Sqlite)
        .with_options(options)
        .run("list all names", "people")
        .await
        .unwrap();

    assert_eq!(outcome.steps, 5);
    assert_eq!(outcome.trace.len(), 5);
    assert_eq!(outcome.trace.last().unwrap().result.status, StatusCode::ProgrammingError);
    assert_eq!(outcome.final_sql.as_deref(), Some("SELECT id, name FROM t ORDER BY id"));
    assert_eq!(outcome.as_pair().0, 0);
}

#[tokio::test]
async fn test_rephrase_always_accepts() {
    let root = single_table_db("rephrase");
    let llm = Arc::new(ScriptedModel::new(vec![
        Rule::new(
            &[CONTINUE],
            &[r#"{"result_acceptable": false, "current_state": "Rephrase", "sql": "SELECT name FROM t"}"#],
        ),
        Rule::new(&[BEGIN], &[r#"{"sql": "SELECT name FROM t"}"#]),
    ]));

    let outcome = session(&root, llm, Dialect::Sqlite).run("list all names", "people").await.unwrap();

    assert!(outcome.accepted);
    assert_eq!(outcome.steps, 2);
    assert_eq!(outcome.final_sql.as_deref(), Some("SELECT name FROM t"));
}

#[tokio::test]
async fn test_unknown_relation_warning_and_repair_bound() {
    let root = single_table_db("ghost");
    let llm = Arc::new(ScriptedModel::new(vec![
        Rule::new(&[FIX], &[r#"{"FIXSQL": "SELECT name FROM ghost"}"#]),
        Rule::new(
            &[CONTINUE],
            &[r#"{"result_acceptable": true, "current_state": "Rephrase", "sql": "SELECT id, name FROM t"}"#],
        ),
        Rule::new(&[BEGIN], &[r#"{"sql": "SELECT name FROM ghost"}"#]),
    ]));

    let outcome = session(&root, Arc::clone(&llm), Dialect::Sqlite).run("list all names", "people").await.unwrap();

    assert_eq!(llm.calls_containing(FIX), 3);
    assert_eq!(outcome.trace.entries()[0].result.status, StatusCode::ProgrammingError);
    let continue_prompt = llm.prompts().into_iter().find(|p| p.contains(CONTINUE)).unwrap();
    assert!(continue_prompt.contains("do not exist in the schema: ghost"));
    assert_eq!(outcome.as_pair().0, 0);
}

fn three_table_db(label: &str) -> std::path::PathBuf {
    let root = scratch_dir(label);
    write_sqlite(
        &root,
        "shop",
        "CREATE TABLE t (id INTEGER, total REAL); CREATE TABLE u (id INTEGER, label TEXT); CREATE TABLE v (id INTEGER, note TEXT);",
    );
    write_schema(
        &root,
        "shop",
        &json!({"shop": {
            "t": [["id", "Primary Key", "INTEGER", "order id", "1, 2, 3"], ["total", "None", "REAL", "amount paid in dollars", "9.5, 12.0"]],
            "u": [["id", "Primary Key", "INTEGER", "user id", "1, 2, 3"], ["label", "None", "TEXT", "display label of the user", "ann, bob"]],
            "v": [["id", "Primary Key", "INTEGER", "visit id", "1, 2, 3"], ["note", "None", "TEXT", "free-form visit note", "late, early"]]
        }}),
    );
    root
}

fn linker(root: &std::path::Path, llm: &Arc<ScriptedModel>, options: LinkingOptions) -> SchemaLinker {
    let config = Arc::new(config_for(root));
    SchemaLinker::new(
        Arc::clone(llm) as Arc<dyn sqlrefine::llm::LanguageModel>,
        ModelRoles::uniform("scripted"),
        Arc::new(SchemaAccessor::new(config)),
    )
    .with_options(options)
}

#[tokio::test]
async fn test_scenario_b_over_budget_takes_legacy_path() {
    let root = three_table_db("scenario_b");
    let llm = Arc::new(ScriptedModel::new(vec![
        Rule::new(&["ONE table", "# Table: v"], &["```sql\nSELECT FALSE AS result;\n```"]),
        Rule::new(&["ONE table"], &["```sql\nSELECT total FROM t\n```"]),
        Rule::new(&["List every table and column"], &[r#"{"T": ["TOTAL", "missing"]}"#]),
        Rule::new(&["between 5 and 10"], &["```sql\n-- Query1\nSELECT total FROM t;\n```"]),
    ]));

    let options = LinkingOptions { budget: 1, rounds: 2, max_retries: 2, ..LinkingOptions::default() };
    let outcome = linker(&root, &llm, options).link("total of t", "shop", Dialect::Sqlite).await.unwrap();

    assert_eq!(outcome.stages, vec![LinkingStage::LegacyPerTable, LinkingStage::Minimal]);
    assert_eq!(llm.calls_containing("ONE table"), 3);
    assert_eq!(llm.calls_containing("between 5 and 10"), 2);
    assert_eq!(outcome.tables, vec!["t"]);
    assert_eq!(outcome.columns["t"], vec!["total"]);
    assert_eq!(outcome.samples.len(), 2);
}

#[tokio::test]
async fn test_legacy_pick_of_one_table_skips_sampling() {
    let root = three_table_db("legacy_single");
    let llm = Arc::new(ScriptedModel::new(vec![
        Rule::new(&["ONE table", "# Table: t"], &["```sql\nSELECT total FROM t\n```"]),
        Rule::new(&["ONE table"], &["```sql\nSELECT FALSE AS result;\n```"]),
    ]));

    let options = LinkingOptions { budget: 1, ..LinkingOptions::default() };
    let outcome = linker(&root, &llm, options).link("total of t", "shop", Dialect::Sqlite).await.unwrap();

    assert_eq!(outcome.stages, vec![LinkingStage::LegacyPerTable, LinkingStage::Minimal]);
    assert_eq!(outcome.tables, vec!["t"]);
    assert!(outcome.columns["t"].is_empty());
    assert_eq!(llm.calls_containing("between 5 and 10"), 0);
}

#[tokio::test]
async fn test_ddl_form_replaces_oversized_schema() {
    let root = three_table_db("ddl_substitute");
    let accessor = SchemaAccessor::new(Arc::new(config_for(&root)));
    let full = tokens::estimate(&accessor.render("shop", None, Level::Table, Dialect::Sqlite).unwrap());
    let ddl = tokens::estimate(&accessor.render_ddl("shop", None, Dialect::Sqlite).unwrap());
    let budget = full - 1;
    assert!(ddl <= budget / 2, "fixture DDL ({} tokens) must fit half of {}", ddl, budget);

    let llm = Arc::new(ScriptedModel::new(vec![
        Rule::new(&["List every table and column"], &[r#"{"t": ["total"]}"#]),
        Rule::new(&["between 5 and 10", "CREATE TABLE"], &["```sql\nSELECT total FROM t\n```"]),
    ]));
    let options = LinkingOptions { budget, rounds: 2, ..LinkingOptions::default() };
    let outcome = linker(&root, &llm, options).link("total of t", "shop", Dialect::Sqlite).await.unwrap();

    assert_eq!(outcome.stages, vec![LinkingStage::DdlSubstitute]);
    assert_eq!(llm.calls_containing("ONE table"), 0);
    assert_eq!(outcome.tables, vec!["t"]);
    assert_eq!(outcome.columns["t"], vec!["total"]);
}

#[tokio::test]
async fn test_failed_rounds_return_empty_linkage() {
    let root = three_table_db("rounds_fail");
    let llm = Arc::new(ScriptedModel::new(vec![Rule::new(&["between 5 and 10"], &["I cannot write SQL for this."])]));

    let options = LinkingOptions { rounds: 3, max_retries: 2, ..LinkingOptions::default() };
    let outcome = linker(&root, &llm, options).link("total of t", "shop", Dialect::Sqlite).await.unwrap();

    assert_eq!(outcome.stages, vec![LinkingStage::FullSchema]);
    assert!(outcome.tables.is_empty());
    assert!(outcome.columns.is_empty());
    assert_eq!(llm.prompts().len(), 6);
}

#[tokio::test]
async fn test_linking_full_schema_and_single_table_shortcut() {
    let root = single_table_db("shortcut");
    let llm = Arc::new(ScriptedModel::new(vec![]));
    let config = Arc::new(config_for(&root));
    let accessor = Arc::new(SchemaAccessor::new(config));

    let linker = SchemaLinker::new(Arc::clone(&llm) as Arc<dyn sqlrefine::llm::LanguageModel>, ModelRoles::uniform("m"), Arc::clone(&accessor));
    let outcome = linker.link("anything", "people", Dialect::Sqlite).await.unwrap();
    assert_eq!(outcome.stages, vec![LinkingStage::SingleTableShortcut]);
    assert_eq!(outcome.tables, vec!["t"]);
    assert!(llm.prompts().is_empty());

    let llm = Arc::new(ScriptedModel::new(vec![
        Rule::new(&["List every table and column"], &[r#"{"t": ["name"]}"#]),
        Rule::new(&["between 5 and 10"], &["```sql\nSELECT name FROM t\n```"]),
    ]));
    let linker = SchemaLinker::new(Arc::clone(&llm) as Arc<dyn sqlrefine::llm::LanguageModel>, ModelRoles::uniform("m"), accessor)
        .with_options(LinkingOptions { use_single_table: true, refine_after_merge: false, ..LinkingOptions::default() });
    let outcome = linker.link("names", "people", Dialect::Sqlite).await.unwrap();
    assert_eq!(outcome.stages, vec![LinkingStage::FullSchema]);
    assert_eq!(outcome.columns["t"], vec!["name"]);
    assert_eq!(llm.calls_containing("between 5 and 10"), 3);
}

#[tokio::test]
async fn test_scenario_c_completion_only_for_marked_queries() {
    let root = scratch_dir("scenario_c");
    write_schema(
        &root,
        "DB",
        &json!({"PUBLIC": {
            "PUBLIC.SALES_2020": [["amount", "FLOAT", "", ""]],
            "PUBLIC.SALES_2021": [["amount", "FLOAT", "", ""]]
        }}),
    );
    let expanded = r#"SELECT "amount" FROM "DB"."PUBLIC"."SALES_2020" UNION ALL SELECT "amount" FROM "DB"."PUBLIC"."SALES_2021""#;
    let marked = r#"SELECT "amount" FROM "DB"."PUBLIC"."SALES_2020" UNION ALL -- repeated for every year"#;
    let plain = r#"SELECT SUM("amount") FROM "DB"."PUBLIC"."SALES_2020""#;

    let llm = Arc::new(ScriptedModel::new(vec![
        Rule::new(&[COMPLETION], &[format!("```sql\n{}\n```", expanded).as_str()]),
        Rule::new(
            &[CONTINUE],
            &[json!({"result_acceptable": true, "current_state": "Rephrase", "sql": plain}).to_string().as_str()],
        ),
        Rule::new(&[BEGIN], &[json!({"sql": marked}).to_string().as_str()]),
    ]));

    let config = Arc::new(config_for(&root));
    let engine = Arc::new(RecordingEngine::new(Dialect::Snowflake));
    let factory = Arc::new(EngineFactory::new(Arc::clone(&config)).with_engine(Arc::clone(&engine) as _));
    let schema = Arc::new(SchemaAccessor::new(config));
    let session = RefinementSession::new(
        Arc::clone(&llm) as _,
        ModelRoles::uniform("scripted"),
        factory,
        schema,
        Dialect::Snowflake,
    );

    let outcome = session.run("total sales", "DB").await.unwrap();

    assert_eq!(llm.calls_containing(COMPLETION), 1);
    assert_eq!(engine.queries(), vec![expanded.to_string(), plain.to_string()]);
    assert_eq!(outcome.trace.entries()[0].sql, expanded);
    assert_eq!(outcome.final_sql.as_deref(), Some(plain));
}
