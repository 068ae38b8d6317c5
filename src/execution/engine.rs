//! Execution Engine Trait - the uniform contract every backend adapter meets
//!
//! `execute` never returns `Err`: expected SQL and connection failures, as well
//! as anything unexpected inside an adapter, are folded into an
//! `ExecutionResult` carrying one of four status codes.

use crate::dialect::Dialect;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Uniform four-way status taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// 0: payload is a rendered result set, or `None` for non-fetching statements.
    Success,
    /// 1: malformed or invalid SQL. Input for the repair sub-loop.
    ProgrammingError,
    /// 2: connection or backend failure.
    DatabaseError,
    /// 3: timeout or anything unclassified.
    UnknownOrTimeout,
}

impl StatusCode {
    pub fn code(&self) -> u8 {
        match self {
            StatusCode::Success => 0,
            StatusCode::ProgrammingError => 1,
            StatusCode::DatabaseError => 2,
            StatusCode::UnknownOrTimeout => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(StatusCode::Success),
            1 => Some(StatusCode::ProgrammingError),
            2 => Some(StatusCode::DatabaseError),
            3 => Some(StatusCode::UnknownOrTimeout),
            _ => None,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// `(status_code, payload)` pair returned by every adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: StatusCode,
    pub payload: Option<String>,
}

impl ExecutionResult {
    pub fn success(payload: Option<String>) -> Self {
        Self { status: StatusCode::Success, payload }
    }

    pub fn programming_error(message: impl Into<String>) -> Self {
        Self { status: StatusCode::ProgrammingError, payload: Some(message.into()) }
    }

    pub fn database_error(message: impl Into<String>) -> Self {
        Self { status: StatusCode::DatabaseError, payload: Some(message.into()) }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self { status: StatusCode::UnknownOrTimeout, payload: Some(message.into()) }
    }

    pub fn is_success(&self) -> bool {
        self.status == StatusCode::Success
    }

    /// The raw contract pair.
    pub fn as_pair(&self) -> (u8, Option<String>) {
        (self.status.code(), self.payload.clone())
    }

    /// Payload text for prompts and terminal output.
    pub fn payload_text(&self) -> &str {
        self.payload.as_deref().unwrap_or("None")
    }

    /// True when the payload is the empty result-set marker.
    pub fn is_empty_result(&self) -> bool {
        self.is_success()
            && self
                .payload
                .as_deref()
                .map(|p| p.trim_start().starts_with("[]"))
                .unwrap_or(false)
    }
}

/// Execution engine trait - one implementation per backend
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Engine name used in logs (e.g., "sqlite", "snowflake")
    fn name(&self) -> &'static str;

    fn dialect(&self) -> Dialect;

    /// Run `query` against `target` (SQLite: db id or file path; Snowflake: database
    /// id; MySQL/Doris: database name; BigQuery: unused). With `fetch` false the
    /// statement is committed and the payload is `None`.
    async fn execute(&self, query: &str, target: &str, fetch: bool) -> ExecutionResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip() {
        for code in 0..4u8 {
            assert_eq!(StatusCode::from_code(code).unwrap().code(), code);
        }
        assert!(StatusCode::from_code(4).is_none());
    }

    #[test]
    fn test_empty_result_detection() {
        assert!(ExecutionResult::success(Some("[]\n\nQuery Time: 0.0010 s".into())).is_empty_result());
        assert!(!ExecutionResult::success(None).is_empty_result());
        assert!(!ExecutionResult::programming_error("[] near").is_empty_result());
        assert_eq!(ExecutionResult::success(None).as_pair(), (0, None));
    }
}
