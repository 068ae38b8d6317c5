//! Query Refinement
//!
//! - `session`: the Begin → Continue loop and its optional pre-stages
//! - `state`: step actions and the sub-question trace
//! - `repair`: execution with Snowflake completion and the fix sub-loop
//! - `prompts`: prompt builders and the output policy

pub mod prompts;
pub mod repair;
pub mod session;
pub mod state;

pub use repair::{needs_completion, StatementRunner};
pub use session::{RefinementSession, SessionOptions, SessionOutcome};
pub use state::{LoopState, StepAction, SubQuestionTrace, TraceEntry};
