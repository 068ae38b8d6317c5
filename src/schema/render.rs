//! Prompt-ready schema text.

use crate::dialect::Dialect;
use crate::error::{HarnessError, Result};
use crate::schema::model::{ColumnDescriptor, KeyRole, SchemaDescription, TableDescriptor};
use crate::schema::series::{simplify_names, LinkageMap};
use std::collections::HashSet;
use tracing::warn;

const FLAT_PREAMBLE: &str = "Note that the 'Examples' are actual values from the column. \
Some column might contain the values that are directly related to the question. \
Use it to help you justify which columns or values to use.";
const NO_COLUMNS: &str = "  (Detailed column information not found for table)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Table,
    Column,
}

/// Which part of a schema to render. Table level takes a list of names,
/// column level a table-to-columns map.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaFilter {
    Tables(Vec<String>),
    Columns(LinkageMap),
}

struct Selection {
    index: usize,
    columns: Option<Vec<String>>,
}

pub fn render(schema: &SchemaDescription, filter: Option<&SchemaFilter>, level: Level) -> Result<String> {
    let selections = select(schema, filter, level)?;
    let warehouse = schema.dialect.is_warehouse();

    let mut out = Vec::new();
    match schema.dialect {
        Dialect::Snowflake => {
            out.push(format!("[DB_ID] {}", schema.db_id));
            out.push("[Schema]".to_string());
        }
        Dialect::BigQuery => out.push(format!("【TASK_ID】{}", schema.db_id)),
        _ => {
            out.push(FLAT_PREAMBLE.to_string());
            out.push(format!("[DB_ID] {}", schema.db_id));
        }
    }

    for selection in &selections {
        let table = &schema.tables[selection.index];
        if warehouse {
            render_warehouse_table(table, selection, &mut out);
        } else {
            render_flat_table(table, selection, &mut out);
        }
    }

    if selections.len() > 1 && !schema.foreign_keys.is_empty() {
        let rendered: HashSet<String> =
            selections.iter().map(|s| schema.tables[s.index].key.to_lowercase()).collect();
        let edges: Vec<String> = schema
            .foreign_keys
            .iter()
            .filter(|(src, dst)| rendered.contains(&owner(src)) && rendered.contains(&owner(dst)))
            .map(|(src, dst)| format!("{} = {}", src, dst))
            .collect();
        if !edges.is_empty() {
            out.push("[Foreign keys]".to_string());
            out.extend(edges);
        }
    }

    Ok(out.join("\n"))
}

fn owner(endpoint: &str) -> String {
    endpoint.split('.').next().unwrap_or(endpoint).to_lowercase()
}

fn select(schema: &SchemaDescription, filter: Option<&SchemaFilter>, level: Level) -> Result<Vec<Selection>> {
    let requests: Vec<(String, Option<Vec<String>>)> = match (level, filter) {
        (_, None) => {
            return Ok((0..schema.tables.len())
                .map(|index| Selection { index, columns: None })
                .collect())
        }
        (Level::Table, Some(SchemaFilter::Tables(names))) => names.iter().map(|n| (n.clone(), None)).collect(),
        (Level::Column, Some(SchemaFilter::Columns(map))) => {
            map.iter().map(|(t, cols)| (t.clone(), Some(cols.clone()))).collect()
        }
        (Level::Table, Some(SchemaFilter::Columns(_))) => {
            return Err(HarnessError::InvalidArgument("table-level rendering takes a list of table names".into()))
        }
        (Level::Column, Some(SchemaFilter::Tables(_))) => {
            return Err(HarnessError::InvalidArgument("column-level rendering takes a table-to-columns map".into()))
        }
    };

    let requests = if schema.dialect.is_warehouse() {
        let names: Vec<String> = requests.iter().map(|(n, _)| n.clone()).collect();
        let kept: HashSet<String> = simplify_names(&names, schema.dialect).into_iter().collect();
        requests.into_iter().filter(|(n, _)| kept.contains(n)).collect()
    } else {
        requests
    };

    let mut selections: Vec<Selection> = Vec::new();
    for (name, columns) in requests {
        let Some(resolved) = schema.resolve(&name) else {
            warn!("Table '{}' not found in '{}'", name, schema.db_id);
            continue;
        };
        if let Some(existing) = selections.iter_mut().find(|s| s.index == resolved.index) {
            if let (Some(have), Some(more)) = (existing.columns.as_mut(), columns) {
                have.extend(more);
            }
            continue;
        }
        selections.push(Selection { index: resolved.index, columns });
    }
    Ok(selections)
}

fn column_lines<'a>(table: &'a TableDescriptor, wanted: &Option<Vec<String>>) -> Vec<&'a ColumnDescriptor> {
    match wanted {
        None => table.columns.iter().collect(),
        Some(names) => {
            let mut seen = HashSet::new();
            names
                .iter()
                .filter(|n| seen.insert(n.to_lowercase()))
                .filter_map(|n| {
                    let column = table.column(n);
                    if column.is_none() {
                        warn!("Column '{}' not found in table '{}'", n, table.full_name());
                    }
                    column
                })
                .collect()
        }
    }
}

fn render_flat_table(table: &TableDescriptor, selection: &Selection, out: &mut Vec<String>) {
    out.push(format!("# Table: {}", table.key));
    out.push("[".to_string());
    let columns = column_lines(table, &selection.columns);
    let last = columns.len().saturating_sub(1);
    for (i, column) in columns.iter().enumerate() {
        let mut line = format!("({}: {}", column.name, column.data_type);
        if column.key_role == KeyRole::PrimaryKey {
            line.push_str(", Primary Key");
        }
        if let Some(desc) = &column.description {
            line.push_str(&format!(", {}", desc));
        }
        if let Some(examples) = &column.examples {
            line.push_str(&format!(", Examples: [{}]", examples));
        }
        line.push(')');
        if i != last {
            line.push(',');
        }
        out.push(line);
    }
    out.push("]".to_string());
}

fn render_warehouse_table(table: &TableDescriptor, selection: &Selection, out: &mut Vec<String>) {
    out.push(format!("# Table: {}", table.full_name()));
    out.push("[".to_string());
    let columns = column_lines(table, &selection.columns);
    if columns.is_empty() {
        out.push(NO_COLUMNS.to_string());
    }
    let last = columns.len().saturating_sub(1);
    for (i, column) in columns.iter().enumerate() {
        let mut line = format!("  ({}: {}", column.name, column.data_type);
        if let Some(desc) = &column.description {
            line.push_str(&format!(", {}", desc));
        }
        if let Some(examples) = &column.examples {
            let trimmed = examples.trim();
            let trimmed = trimmed
                .strip_prefix("examples:")
                .or_else(|| trimmed.strip_prefix("Examples:"))
                .unwrap_or(trimmed)
                .trim();
            if !trimmed.is_empty() {
                line.push_str(&format!(", Examples: {}", trimmed));
            }
        }
        line.push(')');
        if i != last {
            line.push(',');
        }
        out.push(line);
    }
    out.push("]".to_string());
    if let Some(summary) = &table.summary {
        out.push(format!("# Table Description: {}", summary));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flat() -> SchemaDescription {
        let value = json!({
            "shop": {
                "orders": [["id", "Primary Key", "INTEGER", "order id", "1, 2"], ["customer_id", "None", "INTEGER", null, null]],
                "customers": [["id", "Primary Key", "INTEGER", null, null], ["name", "None", "TEXT", null, "Ann"]]
            },
            "foreign_keys": {"orders.customer_id": "customers.id"}
        });
        SchemaDescription::from_value(&value, "shop", Dialect::Sqlite).unwrap()
    }

    #[test]
    fn test_flat_full_render() {
        let text = render(&flat(), None, Level::Table).unwrap();
        assert!(text.starts_with(FLAT_PREAMBLE));
        assert!(text.contains("[DB_ID] shop\n# Table: orders\n[\n(id: INTEGER, Primary Key, order id, Examples: [1, 2]),\n(customer_id: INTEGER)\n]"));
        assert!(text.ends_with("[Foreign keys]\norders.customer_id = customers.id"));
    }

    #[test]
    fn test_column_filter_and_missing_names() {
        let mut map = LinkageMap::new();
        map.insert("Customers".into(), vec!["NAME".into(), "ghost".into()]);
        map.insert("nowhere".into(), vec![]);
        let text = render(&flat(), Some(&SchemaFilter::Columns(map)), Level::Column).unwrap();
        assert!(text.contains("# Table: customers\n[\n(name: TEXT, Examples: [Ann])\n]"));
        assert!(!text.contains("orders"));
        assert!(!text.contains("[Foreign keys]"));
    }

    #[test]
    fn test_filter_shape_must_match_level() {
        let err = render(&flat(), Some(&SchemaFilter::Tables(vec!["orders".into()])), Level::Column);
        assert!(matches!(err, Err(HarnessError::InvalidArgument(_))));
        let err = render(&flat(), Some(&SchemaFilter::Columns(LinkageMap::new())), Level::Table);
        assert!(matches!(err, Err(HarnessError::InvalidArgument(_))));
    }

    #[test]
    fn test_snowflake_alias_and_summary() {
        let value = json!({
            "PUBLIC": {
                "PUBLIC.EVENTS_20200101": [["id", "NUMBER", "event id", "examples: 1, 2"]],
                "PUBLIC.EMPTY": [],
                "table_Information": {"PUBLIC.EVENTS_20200101": ["PUBLIC.EVENTS_20200102"]},
                "table_description_summary": {"PUBLIC.EVENTS_20200101": "Daily shards."}
            }
        });
        let schema = SchemaDescription::from_value(&value, "DB", Dialect::Snowflake).unwrap();
        let filter = SchemaFilter::Tables(vec!["DB.PUBLIC.EVENTS_20200102".into(), "DB.PUBLIC.EMPTY".into()]);
        let text = render(&schema, Some(&filter), Level::Table).unwrap();
        assert!(text.starts_with("[DB_ID] DB\n[Schema]\n# Table: DB.PUBLIC.EVENTS_20200101"));
        assert!(text.contains("  (id: NUMBER, event id, Examples: 1, 2)\n]\n# Table Description: Daily shards."));
        assert!(text.contains("# Table: DB.PUBLIC.EMPTY\n[\n  (Detailed column information not found for table)\n]"));
    }

    #[test]
    fn test_warehouse_columns_are_comma_separated() {
        let value = json!({
            "PUBLIC": {
                "PUBLIC.ORDERS": [["id", "NUMBER", "", ""], ["amount", "FLOAT", "", ""], ["note", "TEXT", "", ""]]
            }
        });
        let schema = SchemaDescription::from_value(&value, "DB", Dialect::Snowflake).unwrap();
        let text = render(&schema, None, Level::Table).unwrap();
        assert!(text.contains("[\n  (id: NUMBER),\n  (amount: FLOAT),\n  (note: TEXT)\n]"));
    }
}
