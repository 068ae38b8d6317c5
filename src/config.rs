//! Harness configuration
//!
//! One explicit configuration object built at process start and passed by
//! reference into every engine, accessor and session constructor.
//!
//! Sources, in order:
//! - an optional registry file (a JSON list of `{DB_type, Local_path, Authentication}`)
//! - environment variables (loaded through `dotenv`)
//! - built-in defaults
//!
//! Credential files that do not exist yield empty credentials; the engine that
//! needs them fails at call time with a connection error.

use crate::dialect::Dialect;
use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Snowflake session parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnowflakeCredentials {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub warehouse: Option<String>,
}

impl SnowflakeCredentials {
    pub fn is_empty(&self) -> bool {
        self.user.is_empty() || self.account.is_empty()
    }
}

/// MySQL / Doris connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MySqlCredentials {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub database: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_mysql_port() -> u16 {
    3306
}

impl Default for MySqlCredentials {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_mysql_port(),
            user: String::new(),
            password: String::new(),
            database: None,
        }
    }
}

impl MySqlCredentials {
    pub fn is_empty(&self) -> bool {
        self.user.is_empty()
    }
}

/// Wall-clock bounds for every backend path.
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub sqlite: Duration,
    pub warehouse: Duration,
    pub bigquery: Duration,
    pub mysql: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            sqlite: Duration::from_secs(30),
            warehouse: Duration::from_secs(200),
            bigquery: Duration::from_secs(200),
            mysql: Duration::from_secs(200),
        }
    }
}

/// Settings for the first-to-finish warehouse race.
#[derive(Debug, Clone)]
pub struct WarehouseSettings {
    /// Redundant worker processes per batch.
    pub concurrency: usize,
    /// Batches retried when every worker times out.
    pub max_batches: usize,
    /// Added to the per-query timeout to form the orchestrator's hard ceiling.
    pub grace: Duration,
    pub poll_interval: Duration,
    /// Worker executable. Defaults to the running binary.
    pub worker_program: Option<PathBuf>,
}

impl Default for WarehouseSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_batches: 10,
            grace: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            worker_program: None,
        }
    }
}

/// Caps applied when rendering result sets for the model.
#[derive(Debug, Clone)]
pub struct OutputLimits {
    pub max_rows: usize,
    pub sqlite_max_rows: usize,
    pub max_columns: usize,
    pub token_budget: usize,
}

impl Default for OutputLimits {
    fn default() -> Self {
        Self {
            max_rows: 20,
            sqlite_max_rows: 10,
            max_columns: 10,
            token_budget: 4000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HarnessConfig {
    /// Per-dialect root directories. Each holds `<db_id>/<db_id>_M-Schema.json`;
    /// the SQLite root also holds `<db_id>/<db_id>.sqlite`.
    pub sqlite_dir: PathBuf,
    pub snowflake_dir: PathBuf,
    pub bigquery_dir: PathBuf,
    pub mysql_dir: PathBuf,
    pub doris_dir: PathBuf,

    pub snowflake: SnowflakeCredentials,
    /// Service-account key file for BigQuery.
    pub bigquery_key_path: Option<PathBuf>,
    pub mysql: MySqlCredentials,
    pub doris: MySqlCredentials,

    pub timeouts: Timeouts,
    pub warehouse: WarehouseSettings,
    pub output: OutputLimits,
}

#[derive(Debug, Deserialize)]
struct RegistryEntry {
    #[serde(rename = "DB_type", default)]
    db_type: String,
    #[serde(rename = "Local_path", default)]
    local_path: String,
    #[serde(rename = "Authentication", default)]
    authentication: String,
}

impl HarnessConfig {
    /// Load from an optional registry file, then apply environment overrides.
    pub fn load(registry: Option<&Path>) -> Result<Self> {
        let mut config = match registry {
            Some(path) => Self::from_registry(path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Parse a registry file. Each entry names a backend, the directory holding
    /// its schema descriptions and an optional credential file.
    pub fn from_registry(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Config(format!("Cannot read registry {}: {}", path.display(), e))
        })?;
        let entries: Vec<RegistryEntry> = serde_json::from_str(&text)
            .map_err(|e| HarnessError::Config(format!("Malformed registry {}: {}", path.display(), e)))?;

        let mut config = Self::default();
        for entry in entries {
            let dialect: Dialect = match entry.db_type.parse() {
                Ok(d) => d,
                Err(_) => {
                    warn!("Skipping registry entry with unknown DB_type '{}'", entry.db_type);
                    continue;
                }
            };
            let local = PathBuf::from(&entry.local_path);
            let auth = (!entry.authentication.is_empty()).then(|| PathBuf::from(&entry.authentication));
            match dialect {
                Dialect::Sqlite => config.sqlite_dir = local,
                Dialect::Snowflake => {
                    config.snowflake_dir = local;
                    config.snowflake = load_credentials(auth.as_deref());
                }
                Dialect::BigQuery => {
                    config.bigquery_dir = local;
                    config.bigquery_key_path = auth;
                }
                Dialect::MySql => {
                    config.mysql_dir = local;
                    config.mysql = load_credentials(auth.as_deref());
                }
                Dialect::Doris => {
                    config.doris_dir = local;
                    config.doris = load_credentials(auth.as_deref());
                }
            }
        }
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("SQLREFINE_SQLITE_DIR") {
            self.sqlite_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("SQLREFINE_SNOWFLAKE_DIR") {
            self.snowflake_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("SQLREFINE_BIGQUERY_DIR") {
            self.bigquery_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("SQLREFINE_MYSQL_DIR") {
            self.mysql_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("SQLREFINE_DORIS_DIR") {
            self.doris_dir = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("GOOGLE_APPLICATION_CREDENTIALS") {
            if self.bigquery_key_path.is_none() {
                self.bigquery_key_path = Some(PathBuf::from(path));
            }
        }
        if let Some(n) = env_parse::<usize>("SQLREFINE_WAREHOUSE_CONCURRENCY") {
            self.warehouse.concurrency = n.max(1);
        }
        if let Some(secs) = env_parse::<u64>("SQLREFINE_WAREHOUSE_TIMEOUT_SECS") {
            self.timeouts.warehouse = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("SQLREFINE_SQLITE_TIMEOUT_SECS") {
            self.timeouts.sqlite = Duration::from_secs(secs);
        }
        if let Ok(program) = std::env::var("SQLREFINE_WORKER_PROGRAM") {
            self.warehouse.worker_program = Some(PathBuf::from(program));
        }
    }

    /// Root directory holding the schema descriptions of `dialect`.
    pub fn schema_dir(&self, dialect: Dialect) -> &Path {
        match dialect {
            Dialect::Sqlite => &self.sqlite_dir,
            Dialect::Snowflake => &self.snowflake_dir,
            Dialect::BigQuery => &self.bigquery_dir,
            Dialect::MySql => &self.mysql_dir,
            Dialect::Doris => &self.doris_dir,
        }
    }

    /// Resolve a SQLite target: either a path ending in `.sqlite` or a database
    /// id living at `<sqlite_dir>/<id>/<id>.sqlite`.
    pub fn sqlite_path(&self, target: &str) -> PathBuf {
        if target.ends_with(".sqlite") || target.ends_with(".db") {
            PathBuf::from(target)
        } else {
            self.sqlite_dir.join(target).join(format!("{}.sqlite", target))
        }
    }

    pub fn mysql_credentials(&self, dialect: Dialect) -> &MySqlCredentials {
        match dialect {
            Dialect::Doris => &self.doris,
            _ => &self.mysql,
        }
    }
}

/// Read a credential file. Missing or unreadable files give the default
/// (empty) credential set.
pub fn load_credentials<T: Default + for<'de> Deserialize<'de>>(path: Option<&Path>) -> T {
    let Some(path) = path else {
        return T::default();
    };
    if !path.exists() {
        debug!("Credential file {} absent, using empty credentials", path.display());
        return T::default();
    }
    match std::fs::read_to_string(path).map(|text| serde_json::from_str::<T>(&text)) {
        Ok(Ok(creds)) => creds,
        Ok(Err(e)) => {
            warn!("Malformed credential file {}: {}", path.display(), e);
            T::default()
        }
        Err(e) => {
            warn!("Cannot read credential file {}: {}", path.display(), e);
            T::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_credentials_are_empty() {
        let creds: SnowflakeCredentials =
            load_credentials(Some(Path::new("/nonexistent/snowflake_credential.json")));
        assert!(creds.is_empty());
        let creds: MySqlCredentials = load_credentials(None);
        assert!(creds.is_empty());
        assert_eq!(creds.port, 3306);
    }

    #[test]
    fn test_registry_parsing() {
        let dir = std::env::temp_dir().join(format!("sqlrefine_cfg_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let cred_path = dir.join("mysql.json");
        std::fs::write(&cred_path, r#"{"host": "db.local", "user": "reader", "password": "pw"}"#).unwrap();
        let registry = dir.join("DB.json");
        std::fs::write(
            &registry,
            format!(
                r#"[
                    {{"DB_type": "sqlite", "Local_path": "/data/sqlite"}},
                    {{"DB_type": "mysql", "Local_path": "/data/mysql", "Authentication": "{}"}},
                    {{"DB_type": "snowflake", "Local_path": "/data/snow", "Authentication": "/missing.json"}},
                    {{"DB_type": "oracle", "Local_path": "/data/oracle"}}
                ]"#,
                cred_path.display()
            ),
        )
        .unwrap();

        let config = HarnessConfig::from_registry(&registry).unwrap();
        assert_eq!(config.sqlite_dir, PathBuf::from("/data/sqlite"));
        assert_eq!(config.mysql.host, "db.local");
        assert_eq!(config.mysql.user, "reader");
        assert!(config.snowflake.is_empty());
        assert_eq!(config.schema_dir(Dialect::Snowflake), Path::new("/data/snow"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_sqlite_path_resolution() {
        let config = HarnessConfig {
            sqlite_dir: PathBuf::from("/dbs"),
            ..Default::default()
        };
        assert_eq!(config.sqlite_path("chinook"), PathBuf::from("/dbs/chinook/chinook.sqlite"));
        assert_eq!(config.sqlite_path("/tmp/x.sqlite"), PathBuf::from("/tmp/x.sqlite"));
    }
}
