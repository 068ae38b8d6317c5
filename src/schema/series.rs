//! Series simplification
//!
//! Warehouses shard data into families like `EVENTS_20200101`,
//! `EVENTS_20200102`. A family is keyed by its lower-cased name with the digit
//! runs removed; only the first member is kept when a list is simplified.
//! Distinct tables that differ only in digits collapse too.

use crate::dialect::Dialect;
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};

lazy_static! {
    static ref DIGITS: Regex = Regex::new(r"\d+").unwrap();
    static ref YEAR_SUFFIX: Regex = Regex::new(r"_\d{4}(_\d+yr)?$").unwrap();
}

/// Table name to requested columns.
pub type LinkageMap = BTreeMap<String, Vec<String>>;

/// Family key of a table name.
pub fn series_key(name: &str, dialect: Dialect) -> String {
    let lower = name.to_lowercase();
    let lower = if dialect == Dialect::BigQuery {
        YEAR_SUFFIX.replace(&lower, "").into_owned()
    } else {
        lower
    };
    DIGITS.replace_all(&lower, "").into_owned()
}

/// Keep the first name of each family, preserving input order.
pub fn simplify_names(names: &[String], dialect: Dialect) -> Vec<String> {
    names.iter().unique_by(|name| series_key(name, dialect)).cloned().collect()
}

/// Collapse a linkage map onto one key per family. Keys are visited in sorted
/// order; the first key of a family keeps its own columns and later keys are
/// dropped.
pub fn simplify_linkage(map: &LinkageMap) -> LinkageMap {
    let mut seen = HashSet::new();
    map.iter()
        .filter(|(table, _)| seen.insert(series_key(table, Dialect::Snowflake)))
        .map(|(table, columns)| (table.clone(), columns.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_key() {
        assert_eq!(series_key("DB.PUBLIC.EVENTS_20200101", Dialect::Snowflake), "db.public.events_");
        assert_eq!(series_key("p.ds.trips_2019_5yr", Dialect::BigQuery), "p.ds.trips");
        assert_eq!(series_key("p.ds.trips_2019_5yr", Dialect::Snowflake), "p.ds.trips__yr");
    }

    #[test]
    fn test_simplify_names_keeps_order() {
        let names: Vec<String> = ["S.P.LOG_2", "S.P.USERS", "S.P.LOG_1"].iter().map(|s| s.to_string()).collect();
        assert_eq!(simplify_names(&names, Dialect::Snowflake), vec!["S.P.LOG_2", "S.P.USERS"]);
    }

    #[test]
    fn test_simplify_linkage_is_idempotent() {
        let mut map = LinkageMap::new();
        map.insert("db.sc.t_2021".into(), vec!["b".into()]);
        map.insert("db.sc.t_2020".into(), vec!["a".into()]);
        map.insert("db.sc.users".into(), vec![]);
        let once = simplify_linkage(&map);
        assert_eq!(once.len(), 2);
        assert_eq!(once["db.sc.t_2020"], vec!["a"]);
        assert_eq!(simplify_linkage(&once), once);
    }
}
