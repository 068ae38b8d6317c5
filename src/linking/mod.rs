//! Schema Linking
//!
//! - `prompts`: exploratory, per-table and extraction prompt text
//! - `extractor`: bounded-retry extraction of tables and columns from SQL
//! - `refiner`: the sampling workflow with its budget fallbacks

pub mod extractor;
pub mod prompts;
pub mod refiner;

pub use crate::schema::series::{simplify_linkage, LinkageMap};
pub use extractor::LinkageExtractor;
pub use refiner::{LinkingOptions, LinkingOutcome, LinkingStage, SchemaLinker};

/// Union of several linkage maps; column lists deduplicated and sorted.
pub fn merge<'a>(maps: impl IntoIterator<Item = &'a LinkageMap>) -> LinkageMap {
    let mut merged = LinkageMap::new();
    for map in maps {
        for (table, columns) in map {
            merged.entry(table.clone()).or_insert_with(Vec::new).extend(columns.iter().cloned());
        }
    }
    for columns in merged.values_mut() {
        columns.sort();
        columns.dedup();
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &[&str])]) -> LinkageMap {
        entries
            .iter()
            .map(|(t, cols)| (t.to_string(), cols.iter().map(|c| c.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_merge_unions_columns() {
        let a = map(&[("orders", &["total", "id"])]);
        let b = map(&[("orders", &["id", "date"]), ("users", &[])]);
        let merged = merge([&a, &b]);
        assert_eq!(merged["orders"], vec!["date", "id", "total"]);
        assert!(merged["users"].is_empty());
    }

    #[test]
    fn test_merge_then_simplify() {
        let a = map(&[("db.s.log_2020", &["x"])]);
        let b = map(&[("db.s.log_2021", &["y"])]);
        let simplified = simplify_linkage(&merge([&a, &b]));
        assert_eq!(simplified, map(&[("db.s.log_2020", &["x"])]));
        assert_eq!(simplify_linkage(&simplified), simplified);
    }
}
