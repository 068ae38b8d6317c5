//! Linking Prompts - exploratory SQL, per-table relevance and extraction
//!
//! The wording is deliberately short. Every generation prompt ends with the
//! expected output shape so the extraction rules in `crate::extract` apply.

use crate::dialect::Dialect;

/// Instructions for the exploratory round: many diverse queries in one block,
/// the last one a best-effort answer.
pub const EXPLORATORY_INSTRUCTIONS: &str = r#"You are exploring a database to find every table and column a question needs.

Write between 5 and 10 diverse SQL queries that probe the schema from different angles:
- look at candidate tables and their key columns
- check value formats of columns that filter or join
- try alternative joins when the link between tables is unclear

The LAST query must be your best attempt at answering the question.
Put ALL queries in ONE ```sql block, each preceded by a comment line `-- Query1`, `-- Query2`, ..."#;

const WAREHOUSE_RULES: &str = r#"Warehouse rules:
- quote every identifier with double quotes and fully qualify tables as database.schema.table
- do not use UNION ALL and do not use wildcard tables
- when a family of similar tables exists (for example daily shards) pick ONE representative table"#;

/// Instructions for judging one table at a time.
pub const LEGACY_TABLE_INSTRUCTIONS: &str = r#"You are given ONE table of a database and a question.
Decide whether this table is needed to answer the question.
- If it is, write one SQL query that uses it for the question.
- If it is not, write exactly: SELECT FALSE AS result;
Answer with a single ```sql block."#;

pub fn exploratory_prompt(schema_text: &str, question: &str, dialect: Dialect) -> String {
    let mut prompt = format!(
        "{}\n\nDatabase dialect: {}\n",
        EXPLORATORY_INSTRUCTIONS,
        dialect.display_name()
    );
    if dialect.is_warehouse() {
        prompt.push_str(WAREHOUSE_RULES);
        prompt.push('\n');
    }
    prompt.push_str(&format!("\n[Schema]\n{}\n\n[Question]\n{}\n", schema_text, question));
    prompt
}

pub fn legacy_table_prompt(table_text: &str, question: &str, dialect: Dialect) -> String {
    format!(
        "{}\n\nDatabase dialect: {}\n\n[Table]\n{}\n\n[Question]\n{}\n",
        LEGACY_TABLE_INSTRUCTIONS,
        dialect.display_name(),
        table_text,
        question
    )
}

/// Ask for the tables and columns `sql` touches, as a JSON object.
pub fn extraction_prompt(sql: &str, dialect: Dialect) -> String {
    let naming = match dialect {
        Dialect::Snowflake => "Use full table names DATABASE.SCHEMA.TABLE exactly as written in the queries, without quotes.",
        Dialect::BigQuery => "Use full table names project.dataset.table exactly as written in the queries, without backticks.",
        _ => "Use table names exactly as written in the queries, without aliases.",
    };
    format!(
        r#"List every table and column referenced by the SQL below.
Resolve aliases to real table names and ignore CTE names and computed columns.
{}
Return ONLY a JSON object mapping each table to its columns, for example:
```json
{{"orders": ["id", "customer_id"], "customers": ["id"]}}
```
Return {{}} when no real table is referenced.

```sql
{}
```"#,
        naming, sql
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warehouse_rules_only_for_warehouses() {
        assert!(exploratory_prompt("s", "q", Dialect::Snowflake).contains("double quotes"));
        assert!(!exploratory_prompt("s", "q", Dialect::Sqlite).contains("double quotes"));
    }

    #[test]
    fn test_extraction_prompt_embeds_sql() {
        let prompt = extraction_prompt("SELECT 1 FROM t", Dialect::BigQuery);
        assert!(prompt.contains("SELECT 1 FROM t"));
        assert!(prompt.contains("project.dataset.table"));
    }
}
