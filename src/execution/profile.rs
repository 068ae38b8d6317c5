//! Relation Profile - referenced tables of a SQL statement
//!
//! Walks the sqlparser AST of a generated query and collects every physical
//! relation it reads from. CTE names are excluded. Used by the refinement loop
//! to flag relations the model invented.

use crate::dialect::Dialect;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{Expr, Query, SetExpr, Statement, TableFactor, TableWithJoins};
use sqlparser::dialect::{
    BigQueryDialect, Dialect as SqlDialect, MySqlDialect, SQLiteDialect, SnowflakeDialect,
};
use sqlparser::parser::Parser;
use std::collections::BTreeSet;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelationProfile {
    /// Relations as written, quotes removed, dotted parts joined.
    pub relations: Vec<String>,
    /// Names bound by WITH clauses anywhere in the statement.
    pub cte_names: Vec<String>,
}

impl RelationProfile {
    /// Parse `sql` in the backend's dialect. `None` when the statement does not
    /// parse; callers treat that as "nothing to check".
    pub fn from_sql(sql: &str, dialect: Dialect) -> Option<Self> {
        let parsed = match dialect {
            Dialect::Sqlite => parse(&SQLiteDialect {}, sql),
            Dialect::Snowflake => parse(&SnowflakeDialect {}, sql),
            Dialect::BigQuery => parse(&BigQueryDialect {}, sql),
            Dialect::MySql | Dialect::Doris => parse(&MySqlDialect {}, sql),
        };
        let statements = match parsed {
            Ok(statements) => statements,
            Err(e) => {
                debug!("Relation profile skipped, statement does not parse: {}", e);
                return None;
            }
        };

        let mut walker = Walker::default();
        for statement in &statements {
            if let Statement::Query(query) = statement {
                walker.query(query);
            }
        }

        let ctes: BTreeSet<String> = walker.ctes.iter().map(|c| c.to_lowercase()).collect();
        let relations = walker
            .relations
            .into_iter()
            .filter(|name| !ctes.contains(&name.to_lowercase()))
            .unique_by(|name| name.to_lowercase())
            .collect();
        Some(Self { relations, cte_names: walker.ctes })
    }

    /// Relations with no counterpart in `known`. A relation matches when its
    /// full name or its last segment equals a known name or a known name's
    /// last segment, case-insensitively.
    pub fn unknown_relations(&self, known: &[String]) -> Vec<String> {
        let mut full = BTreeSet::new();
        let mut tails = BTreeSet::new();
        for name in known {
            let lower = name.to_lowercase();
            tails.insert(last_segment(&lower).to_string());
            full.insert(lower);
        }
        self.relations
            .iter()
            .filter(|relation| {
                let lower = relation.to_lowercase();
                !full.contains(&lower) && !tails.contains(last_segment(&lower))
            })
            .cloned()
            .collect()
    }
}

fn parse(dialect: &dyn SqlDialect, sql: &str) -> Result<Vec<Statement>, sqlparser::parser::ParserError> {
    Parser::parse_sql(dialect, sql)
}

fn last_segment(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

#[derive(Default)]
struct Walker {
    relations: Vec<String>,
    ctes: Vec<String>,
}

impl Walker {
    fn query(&mut self, query: &Query) {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes.push(cte.alias.name.value.clone());
                self.query(&cte.query);
            }
        }
        self.set_expr(&query.body);
    }

    fn set_expr(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                for table in &select.from {
                    self.table_with_joins(table);
                }
                if let Some(selection) = &select.selection {
                    self.expr(selection);
                }
                if let Some(having) = &select.having {
                    self.expr(having);
                }
            }
            SetExpr::Query(query) => self.query(query),
            SetExpr::SetOperation { left, right, .. } => {
                self.set_expr(left);
                self.set_expr(right);
            }
            _ => {}
        }
    }

    fn table_with_joins(&mut self, table: &TableWithJoins) {
        self.table_factor(&table.relation);
        for join in &table.joins {
            self.table_factor(&join.relation);
        }
    }

    fn table_factor(&mut self, factor: &TableFactor) {
        match factor {
            TableFactor::Table { name, .. } => {
                let joined = name
                    .0
                    .iter()
                    .map(|ident| ident.value.trim_matches('`').to_string())
                    .collect::<Vec<_>>()
                    .join(".");
                self.relations.push(joined);
            }
            TableFactor::Derived { subquery, .. } => self.query(subquery),
            TableFactor::NestedJoin { table_with_joins, .. } => self.table_with_joins(table_with_joins),
            _ => {}
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Subquery(query) | Expr::Exists { subquery: query, .. } => self.query(query),
            Expr::InSubquery { expr, subquery, .. } => {
                self.expr(expr);
                self.query(subquery);
            }
            Expr::BinaryOp { left, right, .. } => {
                self.expr(left);
                self.expr(right);
            }
            Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => self.expr(expr),
            _ => {}
        }
    }
}
