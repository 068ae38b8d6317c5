//! Result-set rendering
//!
//! Every backend collects rows as text cells into a `ResultSet`, which is
//! loaded into a polars `DataFrame` and rendered as a bounded table for the
//! model: capped rows, capped columns, query latency footer, `[]` for an
//! empty set, and a final token-budget truncation.

use crate::error::{HarnessError, Result};
use crate::tokens;
use polars::prelude::*;
use std::collections::HashMap;
use std::time::Duration;

/// Rows as returned by a backend, every cell already stringified.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub max_rows: usize,
    pub max_columns: usize,
    pub token_budget: usize,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self { max_rows: 20, max_columns: 10, token_budget: 4000 }
    }
}

impl ResultSet {
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns, rows: Vec::new() }
    }

    pub fn push_row(&mut self, row: Vec<Option<String>>) {
        self.rows.push(row);
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Load into a DataFrame. Duplicate column names (common with `SELECT a.id, b.id`)
    /// get a numeric suffix.
    pub fn to_dataframe(&self) -> Result<DataFrame> {
        let names = dedupe_names(&self.columns);
        let series: Vec<Series> = names
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let values: Vec<Option<String>> = self
                    .rows
                    .iter()
                    .map(|row| row.get(idx).cloned().flatten())
                    .collect();
                Series::new(name, values)
            })
            .collect();
        DataFrame::new(series)
            .map_err(|e| HarnessError::Execution(format!("Failed to create DataFrame: {}", e)))
    }

    /// Render for the model. Falls back to a plain listing if the DataFrame
    /// cannot be built.
    pub fn render(&self, elapsed: Duration, options: &RenderOptions) -> String {
        let body = if self.is_empty() {
            "[]\n".to_string()
        } else {
            match self.to_dataframe().and_then(|df| render_frame(&df, options)) {
                Ok(table) => table,
                Err(e) => {
                    tracing::warn!("Falling back to plain rendering: {}", e);
                    self.render_plain(options)
                }
            }
        };
        let text = format!("{}\nQuery Time: {:.4} s", body, elapsed.as_secs_f64());
        tokens::truncate(&text, options.token_budget)
    }

    fn render_plain(&self, options: &RenderOptions) -> String {
        let mut out = self.columns.join(" | ");
        out.push('\n');
        for row in self.rows.iter().take(options.max_rows) {
            let cells: Vec<&str> = row.iter().map(|c| c.as_deref().unwrap_or("None")).collect();
            out.push_str(&cells.join(" | "));
            out.push('\n');
        }
        out
    }
}

fn dedupe_names(columns: &[String]) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    columns
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            let base = if name.is_empty() { format!("column_{}", idx) } else { name.clone() };
            let count = seen.entry(base.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                base
            } else {
                format!("{}_{}", base, count)
            }
        })
        .collect()
}

/// Pandas-style table: row index, right-aligned cells, `...` marker when rows
/// or columns were cut, and a shape footer in that case.
fn render_frame(df: &DataFrame, options: &RenderOptions) -> Result<String> {
    let total_rows = df.height();
    let total_cols = df.width();
    let shown_cols = total_cols.min(options.max_columns.max(1));
    let shown_rows = total_rows.min(options.max_rows.max(1));

    let visible = DataFrame::new(df.get_columns()[..shown_cols].to_vec())
        .map_err(|e| HarnessError::Execution(format!("Failed to select columns: {}", e)))?
        .head(Some(shown_rows));

    let mut grid: Vec<Vec<String>> = Vec::with_capacity(shown_rows + 1);
    let mut header = vec![String::new()];
    header.extend(visible.get_column_names().iter().map(|n| n.to_string()));
    if shown_cols < total_cols {
        header.push("...".to_string());
    }
    grid.push(header);

    let mut cells_by_col: Vec<Vec<String>> = Vec::with_capacity(shown_cols);
    for series in visible.get_columns() {
        let strings = series
            .str()
            .map_err(|e| HarnessError::Execution(format!("Non-text column {}: {}", series.name(), e)))?;
        cells_by_col.push(
            (0..shown_rows)
                .map(|i| strings.get(i).unwrap_or("None").replace('\n', " "))
                .collect(),
        );
    }
    for row_idx in 0..shown_rows {
        let mut line = vec![row_idx.to_string()];
        for col in &cells_by_col {
            line.push(col[row_idx].clone());
        }
        if shown_cols < total_cols {
            line.push("...".to_string());
        }
        grid.push(line);
    }
    if shown_rows < total_rows {
        grid.push(vec!["...".to_string(); grid[0].len()]);
    }

    let widths: Vec<usize> = (0..grid[0].len())
        .map(|c| grid.iter().map(|r| r[c].chars().count()).max().unwrap_or(0))
        .collect();
    let mut out = String::new();
    for row in &grid {
        let padded: Vec<String> = row
            .iter()
            .zip(&widths)
            .map(|(cell, w)| format!("{:>width$}", cell, width = *w))
            .collect();
        out.push_str(padded.join("  ").trim_end());
        out.push('\n');
    }
    if shown_rows < total_rows || shown_cols < total_cols {
        out.push_str(&format!("\n[{} rows x {} columns]\n", total_rows, total_cols));
    }
    Ok(out)
}
