//! Refinement Prompts
//!
//! Builders for every model call the refinement session makes. Each prompt
//! names the JSON (or tagged) shape the answer must take.

use crate::dialect::Dialect;

/// Output policy injected into every generation prompt.
pub const POLICY_LINES: &str = r#"Output policy:
- Round every non-integer number to 4 decimal places.
- When the question asks for an entity, return both its name and its id.
- Do not use GROUP_CONCAT, STRING_AGG, LISTAGG or other functions that only change how results are displayed.
- Never hardcode values you computed yourself; derive them in SQL.
- Do not chain OR / AND conditions over several similar columns; pick the one column that answers the question."#;

pub fn dialect_rules(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Sqlite => {
            "SQLite rules:\n- Use strftime for date parts and CAST for numeric division.\n- There is no FULL OUTER JOIN before SQLite 3.39."
        }
        Dialect::Snowflake => {
            "Snowflake rules:\n- Quote every identifier with double quotes and fully qualify tables as \"DATABASE\".\"SCHEMA\".\"TABLE\".\n- Use FLATTEN with LATERAL for VARIANT arrays and ::type casts for semi-structured fields."
        }
        Dialect::BigQuery => {
            "BigQuery rules:\n- Quote table names with backticks as `project.dataset.table`.\n- Use _TABLE_SUFFIX with wildcard tables for sharded series and SAFE_DIVIDE for ratios."
        }
        Dialect::MySql => "MySQL rules:\n- Quote identifiers with backticks.\n- Use LIMIT instead of TOP and DATE_FORMAT for date parts.",
        Dialect::Doris => {
            "Doris rules:\n- Doris speaks the MySQL dialect: quote identifiers with backticks.\n- Avoid correlated subqueries; rewrite them as joins."
        }
    }
}

/// Shared context block: schema, optional notes from the pre-stages, question.
pub struct PromptContext<'a> {
    pub question: &'a str,
    pub schema_text: &'a str,
    pub dialect: Dialect,
    pub evidence: Option<&'a str>,
    pub notes: Option<&'a str>,
}

impl PromptContext<'_> {
    fn header(&self) -> String {
        let mut out = format!(
            "Database dialect: {}\n{}\n\n[Schema]\n{}\n",
            self.dialect.display_name(),
            dialect_rules(self.dialect),
            self.schema_text
        );
        if let Some(evidence) = self.evidence.filter(|e| !e.trim().is_empty()) {
            out.push_str(&format!("\n[Evidence]\n{}\n", evidence));
        }
        if let Some(notes) = self.notes.filter(|n| !n.trim().is_empty()) {
            out.push_str(&format!("\n[Exploration notes]\n{}\n", notes));
        }
        out.push_str(&format!("\n[Question]\n{}\n", self.question));
        out
    }
}

pub fn begin_prompt(ctx: &PromptContext<'_>) -> String {
    format!(
        r#"{}
Break the question into sub-questions and answer the FIRST one with a single SQL query.
{}

Answer with a JSON object:
```json
{{"sql": "<query for the first sub-question>", "solved_subquestions_list": ["<sub-question this query answers>"]}}
```"#,
        ctx.header(),
        POLICY_LINES
    )
}

pub fn continue_prompt(ctx: &PromptContext<'_>, history: &str, state_hint: &str, warning: Option<&str>) -> String {
    let warning = warning.map(|w| format!("\nWarning: {}\n", w)).unwrap_or_default();
    format!(
        r#"{}
[History]
{}
{}
{}

Choose the next state:
- "Extend": the last result is right; write SQL for the next unsolved sub-question, building on what is solved.
- "Revise": the last result is wrong or empty; write a corrected query that replaces it.
- "Explore": you need to look at data first; write a diagnostic query. It does not replace the accepted query.
- "Rephrase": every sub-question is solved; write the FINAL query answering the whole question.
{}

Answer with a JSON object:
```json
{{"result_acceptable": true, "current_state": "Extend", "sql": "<query>", "solved_subquestions_list": ["..."]}}
```"#,
        ctx.header(),
        history,
        warning,
        state_hint,
        POLICY_LINES
    )
}

pub fn fix_prompt(ctx: &PromptContext<'_>, sql: &str, error: &str) -> String {
    let union_line = if ctx.dialect == Dialect::Snowflake {
        "\nIf the query unions many similar tables, write every UNION ALL branch out in full; never leave a comment in place of repeated branches."
    } else {
        ""
    };
    format!(
        r#"{}
The query below failed.

```sql
{}
```

Error:
{}
{}
Fix the query. Answer with a JSON object:
```json
{{"FIXSQL": "<corrected query>"}}
```"#,
        ctx.header(),
        sql,
        error,
        union_line
    )
}

pub fn exploration_prompt(ctx: &PromptContext<'_>) -> String {
    format!(
        r#"{}
Before answering, write up to 10 small exploratory queries that check table contents, value formats and join keys relevant to the question. Use LIMIT on each.

Answer with a JSON object mapping labels to queries:
```json
{{"Query1": "<sql>", "Query2": "<sql>"}}
```"#,
        ctx.header()
    )
}

pub fn aggregation_prompt(ctx: &PromptContext<'_>, findings: &str) -> String {
    format!(
        r#"{}
[Exploration results]
{}

Summarize what these results reveal about the tables, columns and values needed for the question. Put the summary inside <answer></answer> tags."#,
        ctx.header(),
        findings
    )
}

pub fn compression_prompt(question: &str, evidence: &str) -> String {
    format!(
        r#"Keep only the parts of the evidence that help answer the question. Preserve formulas, constants and column names exactly.

[Question]
{}

[Evidence]
{}

Answer with a JSON object:
```json
{{"evidence": "<compressed evidence>"}}
```"#,
        question, evidence
    )
}

/// Ask the model to expand a Snowflake query whose repeated branches were
/// abbreviated into a comment.
pub fn completion_prompt(sql: &str) -> String {
    format!(
        r#"The Snowflake query below abbreviates repeated UNION ALL branches with a comment or note.
Write the complete query with every branch spelled out and no placeholder comments.
Answer with a single ```sql block.

```sql
{}
```"#,
        sql
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(dialect: Dialect) -> PromptContext<'static> {
        PromptContext { question: "How many?", schema_text: "# Table: t", dialect, evidence: None, notes: Some("t has 3 rows") }
    }

    #[test]
    fn test_generation_prompts_carry_policy() {
        assert!(begin_prompt(&ctx(Dialect::Sqlite)).contains("4 decimal places"));
        let text = continue_prompt(&ctx(Dialect::Sqlite), "h", "hint", Some("ghost table"));
        assert!(text.contains("4 decimal places"));
        assert!(text.contains("Warning: ghost table"));
        assert!(text.contains("[Exploration notes]\nt has 3 rows"));
    }

    #[test]
    fn test_fix_prompt_union_line_is_snowflake_only() {
        assert!(fix_prompt(&ctx(Dialect::Snowflake), "SELECT", "err").contains("UNION ALL branch"));
        assert!(!fix_prompt(&ctx(Dialect::MySql), "SELECT", "err").contains("UNION ALL branch"));
    }
}
