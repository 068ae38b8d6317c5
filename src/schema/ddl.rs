//! DDL form of a schema
//!
//! The compact fallback used when the full rendering is over budget. SQLite
//! reads the real `CREATE TABLE` statements from `sqlite_master`; every other
//! backend synthesizes them from the JSON description.

use crate::dialect::Dialect;
use crate::error::{HarnessError, Result};
use crate::schema::model::{KeyRole, SchemaDescription, TableDescriptor};
use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::{Connection, OpenFlags};
use std::collections::HashSet;
use std::path::Path;

lazy_static! {
    static ref DIGITS: Regex = Regex::new(r"\d+").unwrap();
}

const MAX_TYPE_LEN: usize = 50;

/// Normalized name used to match requested tables: quotes and digits removed,
/// lower-cased.
pub fn clean_table_name(name: &str) -> String {
    DIGITS.replace_all(&name.replace('"', ""), "").to_lowercase()
}

fn snowflake_type(raw: &str) -> String {
    match raw.to_uppercase().as_str() {
        "TEXT" => "TEXT".into(),
        "NUMBER" => "INTEGER".into(),
        "FLOAT" => "REAL".into(),
        "DATE" => "DATE".into(),
        "TIME" => "TIME".into(),
        _ => raw.to_string(),
    }
}

fn bigquery_type(raw: &str) -> String {
    let upper = raw.trim().to_uppercase();
    if upper.is_empty() {
        return "UNKNOWN".into();
    }
    if upper.len() > MAX_TYPE_LEN {
        return "COMPLEX_TYPE".into();
    }
    match upper.as_str() {
        "STRING" | "TEXT" => "STRING".into(),
        "NUMBER" | "INTEGER" => "INT64".into(),
        "FLOAT" | "REAL" => "FLOAT64".into(),
        "BOOLEAN" => "BOOL".into(),
        _ => upper,
    }
}

fn mysql_type(raw: &str) -> String {
    match raw.to_uppercase().as_str() {
        "NUMBER" => "INT".into(),
        "FLOAT" => "DOUBLE".into(),
        other => other.to_string(),
    }
}

fn table_ddl(dialect: Dialect, table: &TableDescriptor) -> Option<String> {
    let (open, close) = match dialect {
        Dialect::Snowflake => ("\"", "\""),
        _ => ("`", "`"),
    };
    let columns: Vec<String> = table
        .columns
        .iter()
        .map(|c| match dialect {
            Dialect::Snowflake => format!("    \"{}\" {}", c.name, snowflake_type(&c.data_type)),
            Dialect::BigQuery => format!("    `{}` {}", c.name, bigquery_type(&c.data_type)),
            _ => {
                let pk = if c.key_role == KeyRole::PrimaryKey { " PRIMARY KEY" } else { "" };
                format!("    `{}` {}{}", c.name, mysql_type(&c.data_type), pk)
            }
        })
        .collect();
    if dialect == Dialect::BigQuery && columns.is_empty() {
        return None;
    }

    let mut ddl = format!("CREATE TABLE {}{}{} (\n{}\n);\n", open, table.full_name(), close, columns.join(",\n"));
    if let Some(summary) = table.summary.as_ref().filter(|_| dialect.is_warehouse()) {
        ddl.push_str(&format!("\n/*\n{}\n*/\n", summary));
    }
    Some(ddl)
}

/// Synthesized DDL for a JSON-described schema, optionally restricted to
/// `tables` (matched by [`clean_table_name`]).
pub fn render_ddl(schema: &SchemaDescription, tables: Option<&[String]>) -> String {
    let wanted: Option<HashSet<String>> = tables.map(|names| names.iter().map(|n| clean_table_name(n)).collect());
    schema
        .tables
        .iter()
        .filter(|t| wanted.as_ref().map_or(true, |w| w.contains(&clean_table_name(&t.full_name()))))
        .filter_map(|t| table_ddl(schema.dialect, t))
        .collect::<Vec<_>>()
        .join("\n")
}

/// `CREATE TABLE` statements stored in a SQLite file.
pub fn sqlite_ddl(path: &Path, tables: Option<&[String]>) -> Result<String> {
    if !path.exists() {
        return Err(HarnessError::NotFound(format!("database file {}", path.display())));
    }
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|e| HarnessError::Execution(format!("open {}: {}", path.display(), e)))?;

    let mut sql = "SELECT sql FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'".to_string();
    let names: Vec<String> = tables.map(|t| t.to_vec()).unwrap_or_default();
    if tables.is_some() {
        let placeholders = vec!["?"; names.len()].join(", ");
        sql.push_str(&format!(" AND name IN ({})", placeholders));
    }

    let mut stmt = conn.prepare(&sql).map_err(|e| HarnessError::Execution(e.to_string()))?;
    let statements = stmt
        .query_map(rusqlite::params_from_iter(names.iter()), |row| row.get::<_, Option<String>>(0))
        .map_err(|e| HarnessError::Execution(e.to_string()))?
        .filter_map(|row| row.ok().flatten())
        .collect::<Vec<_>>();

    if statements.is_empty() {
        return Ok(String::new());
    }
    Ok(format!("{};", statements.join(";\n\n")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_clean_table_name() {
        assert_eq!(clean_table_name("\"DB\".\"EVENTS_2020\""), "db.events_");
    }

    #[test]
    fn test_snowflake_ddl_with_summary() {
        let value = json!({"PUBLIC": {
            "PUBLIC.T": [["id", "NUMBER", "", ""], ["amount", "FLOAT", "", ""], ["note", "VARIANT", "", ""]],
            "table_description_summary": {"PUBLIC.T": "Payments."}
        }});
        let schema = SchemaDescription::from_value(&value, "DB", Dialect::Snowflake).unwrap();
        let ddl = render_ddl(&schema, None);
        assert_eq!(
            ddl,
            "CREATE TABLE \"DB.PUBLIC.T\" (\n    \"id\" INTEGER,\n    \"amount\" REAL,\n    \"note\" VARIANT\n);\n\n/*\nPayments.\n*/\n"
        );
    }

    #[test]
    fn test_bigquery_types_and_filter() {
        let long = "STRUCT<".to_string() + "a INT64, ".repeat(10).as_str() + ">";
        let value = json!({"proj": {"ds": {
            "ds.a": [["flag", "BOOLEAN", "", ""], ["blob", long, "", ""], ["x", "", "", ""]],
            "ds.b_2020": [["n", "numeric", "", ""]],
            "ds.empty": []
        }}});
        let schema = SchemaDescription::from_value(&value, "task", Dialect::BigQuery).unwrap();
        let all = render_ddl(&schema, None);
        assert!(all.contains("`flag` BOOL"));
        assert!(all.contains("`blob` COMPLEX_TYPE"));
        assert!(all.contains("`x` UNKNOWN"));
        assert!(!all.contains("ds.empty"));

        let only = render_ddl(&schema, Some(&["proj.ds.b_2019".to_string()]));
        assert_eq!(only, "CREATE TABLE `proj.ds.b_2020` (\n    `n` NUMERIC\n);\n");
    }

    #[test]
    fn test_mysql_primary_key() {
        let value = json!({"db": {"users": [["id", "Primary Key", "number", "", ""], ["score", "None", "float", "", ""]]}});
        let schema = SchemaDescription::from_value(&value, "db", Dialect::MySql).unwrap();
        assert_eq!(
            render_ddl(&schema, None),
            "CREATE TABLE `users` (\n    `id` INT PRIMARY KEY,\n    `score` DOUBLE\n);\n"
        );
    }

    #[test]
    fn test_sqlite_master() {
        let path = std::env::temp_dir().join(format!("sqlrefine_ddl_{}.sqlite", uuid::Uuid::new_v4()));
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE a (id INTEGER); CREATE TABLE b (name TEXT);").unwrap();
        drop(conn);

        let all = sqlite_ddl(&path, None).unwrap();
        assert_eq!(all, "CREATE TABLE a (id INTEGER);\n\nCREATE TABLE b (name TEXT);");
        let only = sqlite_ddl(&path, Some(&["b".to_string()])).unwrap();
        assert_eq!(only, "CREATE TABLE b (name TEXT);");
        std::fs::remove_file(&path).ok();
    }
}
