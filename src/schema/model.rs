//! Schema Description model and loader
//!
//! Three on-disk shapes are read into one model:
//! - flat (SQLite, MySQL, Doris): `{db_id: {table: [[name, pk, type, desc, examples]]}, "foreign_keys": {src: dst}}`
//! - Snowflake: `{schema: {"SCHEMA.TABLE": [[name, type, desc, examples]], "table_Information": {..}, "table_description_summary": {..}}}`
//! - BigQuery: `{project: {dataset: {"dataset.table": [...], "table_Information": {..}, "table_description_summary": {..}}}}`
//!
//! Files live at `<dialect dir>/<db_id>/<db_id>_M-Schema.json`. The BigQuery
//! directory name is matched case-insensitively.

use crate::dialect::Dialect;
use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const TABLE_INFORMATION: &str = "table_Information";
pub const TABLE_SUMMARY: &str = "table_description_summary";
pub const FOREIGN_KEYS: &str = "foreign_keys";

fn is_metadata_key(key: &str) -> bool {
    key == TABLE_INFORMATION || key == TABLE_SUMMARY || key == FOREIGN_KEYS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyRole {
    PrimaryKey,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub key_role: KeyRole,
    pub data_type: String,
    pub description: Option<String>,
    pub examples: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Database id (Snowflake) or project (BigQuery); `None` for flat schemas.
    pub qualifier: Option<String>,
    /// Key as stored in the file: `table`, `SCHEMA.TABLE` or `dataset.table`.
    pub key: String,
    pub columns: Vec<ColumnDescriptor>,
    pub summary: Option<String>,
}

impl TableDescriptor {
    /// Name shown to the model and used in requests.
    pub fn full_name(&self) -> String {
        match &self.qualifier {
            Some(q) => format!("{}.{}", q, self.key),
            None => self.key.clone(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        let lower = name.to_lowercase();
        self.columns.iter().find(|c| c.name.to_lowercase() == lower)
    }
}

/// A series of same-shaped tables collapsed onto one representative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasGroup {
    pub qualifier: Option<String>,
    pub representative: String,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDescription {
    pub db_id: String,
    pub dialect: Dialect,
    pub tables: Vec<TableDescriptor>,
    pub foreign_keys: Vec<(String, String)>,
    pub alias_groups: Vec<AliasGroup>,
}

/// A request resolved to a stored table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub index: usize,
    pub via_alias: bool,
}

impl SchemaDescription {
    /// Locate and parse the schema file of `db_id` under `root`.
    pub fn load(root: &Path, db_id: &str, dialect: Dialect) -> Result<Self> {
        let path = schema_file(root, db_id, dialect)?;
        debug!("Loading schema description {}", path.display());
        let text = std::fs::read_to_string(&path)?;
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| HarnessError::Parse(format!("{}: {}", path.display(), e)))?;
        Self::from_value(&value, db_id, dialect)
    }

    pub fn from_value(value: &Value, db_id: &str, dialect: Dialect) -> Result<Self> {
        let root = value
            .as_object()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| HarnessError::Parse(format!("schema for '{}' is empty or not an object", db_id)))?;

        let mut schema = Self {
            db_id: db_id.to_string(),
            dialect,
            tables: Vec::new(),
            foreign_keys: Vec::new(),
            alias_groups: Vec::new(),
        };
        match dialect {
            Dialect::Sqlite | Dialect::MySql | Dialect::Doris => schema.read_flat(root)?,
            Dialect::Snowflake => {
                for content in root.values().filter_map(Value::as_object) {
                    schema.read_container(Some(db_id), content);
                }
            }
            Dialect::BigQuery => {
                for (project, datasets) in root {
                    for content in datasets.as_object().into_iter().flat_map(|d| d.values()).filter_map(Value::as_object) {
                        schema.read_container(Some(project.as_str()), content);
                    }
                }
            }
        }
        Ok(schema)
    }

    fn read_flat(&mut self, root: &Map<String, Value>) -> Result<()> {
        let lower = self.db_id.to_lowercase();
        let content = root
            .iter()
            .find(|(k, _)| k.to_lowercase() == lower)
            .or_else(|| root.iter().find(|(k, v)| !is_metadata_key(k) && v.is_object()))
            .and_then(|(_, v)| v.as_object())
            .ok_or_else(|| HarnessError::Parse(format!("no table section for '{}'", self.db_id)))?;

        for (table, columns) in content {
            if is_metadata_key(table) {
                continue;
            }
            let Some(rows) = columns.as_array() else {
                warn!("Table '{}' in '{}' is not a column list, skipping", table, self.db_id);
                continue;
            };
            let columns = rows
                .iter()
                .filter_map(Value::as_array)
                .filter(|row| row.len() >= 3)
                .map(|row| ColumnDescriptor {
                    name: text(&row[0]).unwrap_or_default(),
                    key_role: if text(&row[1]).as_deref() == Some("Primary Key") {
                        KeyRole::PrimaryKey
                    } else {
                        KeyRole::None
                    },
                    data_type: text(&row[2]).unwrap_or_default(),
                    description: row.get(3).and_then(text),
                    examples: row.get(4).and_then(text),
                })
                .collect();
            self.tables.push(TableDescriptor { qualifier: None, key: table.clone(), columns, summary: None });
        }

        if let Some(fks) = root.get(FOREIGN_KEYS).and_then(Value::as_object) {
            for (source, target) in fks {
                if let Some(target) = text(target) {
                    self.foreign_keys.push((source.clone(), target));
                }
            }
        }
        Ok(())
    }

    /// One Snowflake schema or BigQuery dataset.
    fn read_container(&mut self, qualifier: Option<&str>, content: &Map<String, Value>) {
        let summaries = content.get(TABLE_SUMMARY).and_then(Value::as_object);
        for (key, columns) in content {
            if is_metadata_key(key) {
                continue;
            }
            let Some(rows) = columns.as_array() else { continue };
            let columns = rows
                .iter()
                .filter_map(Value::as_array)
                .filter(|row| row.len() >= 2)
                .map(|row| ColumnDescriptor {
                    name: text(&row[0]).unwrap_or_default(),
                    key_role: KeyRole::None,
                    data_type: text(&row[1]).unwrap_or_default(),
                    description: row.get(2).and_then(text),
                    examples: row.get(3).and_then(text),
                })
                .collect();
            let summary = summaries.and_then(|s| s.get(key)).and_then(text);
            self.tables.push(TableDescriptor {
                qualifier: qualifier.map(str::to_string),
                key: key.clone(),
                columns,
                summary,
            });
        }

        if let Some(info) = content.get(TABLE_INFORMATION).and_then(Value::as_object) {
            for (representative, similar) in info {
                let members = similar
                    .get("similar_tables")
                    .unwrap_or(similar)
                    .as_array()
                    .map(|list| list.iter().filter_map(text).collect())
                    .unwrap_or_default();
                self.alias_groups.push(AliasGroup {
                    qualifier: qualifier.map(str::to_string),
                    representative: representative.clone(),
                    members,
                });
            }
        }
    }

    /// Full names of every table that has at least one column.
    pub fn non_empty_tables(&self) -> Vec<String> {
        self.tables.iter().filter(|t| !t.columns.is_empty()).map(TableDescriptor::full_name).collect()
    }

    /// Lower-cased `table.column` pairs, the ground truth for validation.
    pub fn column_universe(&self) -> BTreeSet<String> {
        self.tables
            .iter()
            .flat_map(|t| {
                let table = t.full_name().to_lowercase();
                t.columns.iter().map(move |c| format!("{}.{}", table, c.name.to_lowercase()))
            })
            .collect()
    }

    /// Resolve a requested table name, case-insensitively. Warehouse names must
    /// be fully qualified; a Snowflake request must name this database.
    pub fn resolve(&self, request: &str) -> Option<Resolved> {
        let lower = request.to_lowercase();
        if !self.dialect.is_warehouse() {
            return self
                .tables
                .iter()
                .position(|t| t.key.to_lowercase() == lower)
                .map(|index| Resolved { index, via_alias: false });
        }

        let parts: Vec<&str> = lower.splitn(3, '.').collect();
        if parts.len() < 3 {
            warn!("Skipping table name without three parts: {}", request);
            return None;
        }
        let (qualifier, short) = (parts[0], format!("{}.{}", parts[1], parts[2]));
        if self.dialect == Dialect::Snowflake && qualifier != self.db_id.to_lowercase() {
            warn!("Table '{}' is outside database '{}'", request, self.db_id);
            return None;
        }
        let qualifier_matches =
            |q: &Option<String>| q.as_deref().map(|q| q.to_lowercase() == qualifier).unwrap_or(false);

        if let Some(index) = self
            .tables
            .iter()
            .position(|t| qualifier_matches(&t.qualifier) && t.key.to_lowercase() == short)
        {
            return Some(Resolved { index, via_alias: false });
        }

        let group = self.alias_groups.iter().find(|g| {
            qualifier_matches(&g.qualifier) && g.members.iter().any(|m| m.to_lowercase() == short)
        })?;
        self.tables
            .iter()
            .position(|t| t.qualifier == group.qualifier && t.key == group.representative)
            .map(|index| Resolved { index, via_alias: true })
    }
}

/// `<root>/<db_id>/<db_id>_M-Schema.json`, with a case-insensitive directory
/// match for BigQuery.
pub fn schema_file(root: &Path, db_id: &str, dialect: Dialect) -> Result<PathBuf> {
    let dirname = if dialect == Dialect::BigQuery {
        let lower = db_id.to_lowercase();
        let entries = std::fs::read_dir(root)
            .map_err(|e| HarnessError::NotFound(format!("schema directory {}: {}", root.display(), e)))?;
        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .find(|name| name.to_lowercase() == lower)
            .ok_or_else(|| HarnessError::NotFound(format!("no directory for '{}' in {}", db_id, root.display())))?
    } else {
        db_id.to_string()
    };

    let path = root.join(&dirname).join(format!("{}_M-Schema.json", dirname));
    if !path.exists() {
        return Err(HarnessError::NotFound(format!("schema file {}", path.display())));
    }
    Ok(path)
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(items) if items.is_empty() => None,
        other => Some(other.to_string()),
    }
}
