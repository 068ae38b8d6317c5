//! Schema Accessor - cached per-database schema descriptions
//!
//! - `model`: the on-disk JSON formats and the in-memory description
//! - `render`: prompt text, full or filtered by table / column
//! - `ddl`: the compact `CREATE TABLE` form
//! - `series`: family simplification for sharded warehouse tables

pub mod ddl;
pub mod model;
pub mod render;
pub mod series;

pub use model::{AliasGroup, ColumnDescriptor, KeyRole, SchemaDescription, TableDescriptor};
pub use render::{Level, SchemaFilter};
pub use series::LinkageMap;

use crate::config::HarnessConfig;
use crate::dialect::Dialect;
use crate::error::Result;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::info;

pub struct SchemaAccessor {
    config: Arc<HarnessConfig>,
    cache: Mutex<HashMap<(Dialect, String), Arc<SchemaDescription>>>,
}

impl SchemaAccessor {
    pub fn new(config: Arc<HarnessConfig>) -> Self {
        Self { config, cache: Mutex::new(HashMap::new()) }
    }

    /// Load (once) and return the description of `db_id`.
    pub fn description(&self, db_id: &str, dialect: Dialect) -> Result<Arc<SchemaDescription>> {
        let key = (dialect, db_id.to_string());
        if let Some(found) = self.cache.lock().unwrap_or_else(|p| p.into_inner()).get(&key) {
            return Ok(Arc::clone(found));
        }
        let schema = Arc::new(SchemaDescription::load(self.config.schema_dir(dialect), db_id, dialect)?);
        info!("✅ Loaded {} schema '{}' ({} tables)", dialect.display_name(), db_id, schema.tables.len());
        self.cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key, Arc::clone(&schema));
        Ok(schema)
    }

    pub fn render(&self, db_id: &str, filter: Option<&SchemaFilter>, level: Level, dialect: Dialect) -> Result<String> {
        let schema = self.description(db_id, dialect)?;
        render::render(&schema, filter, level)
    }

    pub fn render_ddl(&self, db_id: &str, tables: Option<&[String]>, dialect: Dialect) -> Result<String> {
        match dialect {
            Dialect::Sqlite => ddl::sqlite_ddl(&self.config.sqlite_path(db_id), tables),
            _ => {
                let schema = self.description(db_id, dialect)?;
                Ok(ddl::render_ddl(&schema, tables))
            }
        }
    }

    /// Non-empty tables; warehouse names are fully qualified.
    pub fn tables(&self, db_id: &str, dialect: Dialect) -> Result<Vec<String>> {
        Ok(self.description(db_id, dialect)?.non_empty_tables())
    }

    pub fn column_universe(&self, db_id: &str, dialect: Dialect) -> Result<BTreeSet<String>> {
        Ok(self.description(db_id, dialect)?.column_universe())
    }
}
