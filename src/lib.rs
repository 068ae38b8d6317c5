//! sqlrefine - multi-database NL-to-SQL agent harness
//!
//! - `execution`: per-dialect execution adapters behind one status contract
//! - `schema`: schema descriptions, rendering and DDL
//! - `linking`: sampling-based schema linking
//! - `refine`: the sub-question refinement loop

pub mod config;
pub mod dialect;
pub mod error;
pub mod execution;
pub mod extract;
pub mod linking;
pub mod llm;
pub mod refine;
pub mod retry;
pub mod schema;
pub mod tokens;

pub use config::HarnessConfig;
pub use dialect::Dialect;
pub use error::{HarnessError, Result};
