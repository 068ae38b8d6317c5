//! Dialect
//!
//! The closed set of supported SQL backends. Everything that branches on the
//! backend takes a `Dialect`, never a raw tag string.

use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Sqlite,
    Snowflake,
    BigQuery,
    MySql,
    Doris,
}

impl Dialect {
    pub const ALL: [Dialect; 5] = [
        Dialect::Sqlite,
        Dialect::Snowflake,
        Dialect::BigQuery,
        Dialect::MySql,
        Dialect::Doris,
    ];

    /// Detect the backend from a benchmark instance id such as `sf_bq011`,
    /// `bq042`, `local003` or `mysql_12`.
    pub fn detect(instance_id: &str) -> Result<Self> {
        let id = instance_id.to_lowercase();
        if id.starts_with("bq") || id.starts_with("ga") {
            Ok(Dialect::BigQuery)
        } else if id.starts_with("sf") {
            Ok(Dialect::Snowflake)
        } else if id.starts_with("local") {
            Ok(Dialect::Sqlite)
        } else if id.starts_with("mysql") || id.starts_with("my") {
            Ok(Dialect::MySql)
        } else if id.starts_with("doris") {
            Ok(Dialect::Doris)
        } else {
            Err(HarnessError::InvalidArgument(format!(
                "Cannot detect database type from instance id '{}'",
                instance_id
            )))
        }
    }

    /// Short tag used for directory names and log lines.
    pub fn tag(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "sqlite",
            Dialect::Snowflake => "snow",
            Dialect::BigQuery => "bigquery",
            Dialect::MySql => "mysql",
            Dialect::Doris => "doris",
        }
    }

    /// Human readable name used inside prompts.
    pub fn display_name(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "SQLite",
            Dialect::Snowflake => "Snowflake",
            Dialect::BigQuery => "BigQuery",
            Dialect::MySql => "MySQL",
            Dialect::Doris => "Doris",
        }
    }

    /// Warehouses describe tables as `db.schema.table` / `project.dataset.table`
    /// and group sharded tables into alias groups.
    pub fn is_warehouse(&self) -> bool {
        matches!(self, Dialect::Snowflake | Dialect::BigQuery)
    }

    /// Backends sharing the MySQL wire protocol.
    pub fn speaks_mysql(&self) -> bool {
        matches!(self, Dialect::MySql | Dialect::Doris)
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

impl FromStr for Dialect {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sqlite" | "local" => Ok(Dialect::Sqlite),
            "snow" | "snowflake" | "sf" => Ok(Dialect::Snowflake),
            "bigquery" | "bq" => Ok(Dialect::BigQuery),
            "mysql" => Ok(Dialect::MySql),
            "doris" => Ok(Dialect::Doris),
            other => Err(HarnessError::InvalidArgument(format!(
                "Unknown database type '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_prefixes() {
        assert_eq!(Dialect::detect("bq011").unwrap(), Dialect::BigQuery);
        assert_eq!(Dialect::detect("ga004").unwrap(), Dialect::BigQuery);
        assert_eq!(Dialect::detect("sf_bq029").unwrap(), Dialect::Snowflake);
        assert_eq!(Dialect::detect("local021").unwrap(), Dialect::Sqlite);
        assert_eq!(Dialect::detect("mysql_7").unwrap(), Dialect::MySql);
        assert_eq!(Dialect::detect("doris_3").unwrap(), Dialect::Doris);
        assert!(Dialect::detect("pg_1").is_err());
    }

    #[test]
    fn test_tag_round_trip() {
        for dialect in Dialect::ALL {
            assert_eq!(dialect.tag().parse::<Dialect>().unwrap(), dialect);
        }
    }
}
