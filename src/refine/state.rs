//! Session state and the sub-question trace.

use crate::execution::{ExecutionResult, StatusCode};
use crate::tokens;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the session is in the Begin → Continue protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopState {
    Begin,
    Continue,
    Done,
}

/// What one step did with its SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepAction {
    Begin,
    Extend,
    Revise,
    Explore,
    Rephrase,
}

impl StepAction {
    /// Parse a model-supplied `current_state`. Unrecognised values extend.
    pub fn parse(state: &str) -> Self {
        let lower = state.trim().to_lowercase();
        if lower.contains("rephrase") {
            StepAction::Rephrase
        } else if lower.contains("revise") {
            StepAction::Revise
        } else if lower.contains("explore") {
            StepAction::Explore
        } else {
            StepAction::Extend
        }
    }

    /// Whether SQL from this step can become the accepted answer.
    pub fn moves_accepted(&self) -> bool {
        !matches!(self, StepAction::Explore)
    }
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepAction::Begin => "Begin",
            StepAction::Extend => "Extend",
            StepAction::Revise => "Revise",
            StepAction::Explore => "Explore",
            StepAction::Rephrase => "Rephrase",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub sub_question: String,
    pub sql: String,
    pub action: StepAction,
    pub result: ExecutionResult,
}

/// Append-only record of a session's steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubQuestionTrace {
    entries: Vec<TraceEntry>,
}

impl SubQuestionTrace {
    pub fn push(&mut self, entry: TraceEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&TraceEntry> {
        self.entries.last()
    }

    /// Latest entry whose SQL counts as the answer so far: it must have run
    /// successfully, and Explore steps never qualify. A Revise supersedes
    /// whatever came before it.
    pub fn accepted(&self) -> Option<&TraceEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.action.moves_accepted() && e.result.status == StatusCode::Success)
    }

    /// History block for the next prompt, each result cut to `result_tokens`.
    pub fn history_text(&self, result_tokens: usize) -> String {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| {
                format!(
                    "Step {} ({}): {}\n```sql\n{}\n```\nStatus: {}\nResult:\n{}",
                    i + 1,
                    e.action,
                    e.sub_question,
                    e.sql,
                    e.result.status.code(),
                    tokens::truncate(e.result.payload_text(), result_tokens)
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}
