//! Execution Module - dialect execution adapters
//!
//! - ExecutionEngine trait with the four-way status contract
//! - ResultSet rendering shared by every backend
//! - race primitive for the multi-process warehouse path
//! - EngineFactory choosing one engine per dialect
//! - RelationProfile for referenced-relation checks

pub mod engine;
pub mod profile;
pub mod race;
pub mod result;
pub mod router;

// Engine implementations
pub mod bigquery_engine;
pub mod mysql_engine;
pub mod snowflake_engine;
pub mod sqlite_engine;

pub use engine::{ExecutionEngine, ExecutionResult, StatusCode};
pub use profile::RelationProfile;
pub use race::{race, Contender, ProcessContender, ProcessOutput, RaceConfig, RaceOutcome, WorkerCommand};
pub use result::{RenderOptions, ResultSet};
pub use router::EngineFactory;
