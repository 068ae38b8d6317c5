//! Retry bookkeeping
//!
//! Every call site that retries a model call (linking rounds, extraction,
//! completion, repair) owns one `RetryState`: attempt count, the last failure
//! and an explicit give-up value. Nested layers each get their own state, so
//! the give-up behaviour of each layer can be checked in isolation.

use std::fmt;
use std::future::Future;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryState {
    label: &'static str,
    max_attempts: usize,
    attempts: usize,
    last_error: Option<String>,
}

/// Result of driving a retry layer to completion.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T> {
    Succeeded { value: T, attempts: usize },
    Exhausted { attempts: usize, last_error: Option<String> },
}

impl<T> RetryOutcome<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            RetryOutcome::Succeeded { value, .. } => Some(value),
            RetryOutcome::Exhausted { .. } => None,
        }
    }

    /// The value, or the layer's give-up value.
    pub fn unwrap_or(self, give_up: T) -> T {
        self.ok().unwrap_or(give_up)
    }

    pub fn attempts(&self) -> usize {
        match self {
            RetryOutcome::Succeeded { attempts, .. } | RetryOutcome::Exhausted { attempts, .. } => *attempts,
        }
    }
}

impl RetryState {
    pub fn new(label: &'static str, max_attempts: usize) -> Self {
        Self {
            label,
            max_attempts: max_attempts.max(1),
            attempts: 0,
            last_error: None,
        }
    }

    /// Start the next attempt. Returns `false` once the bound is reached.
    pub fn begin_attempt(&mut self) -> bool {
        if self.attempts >= self.max_attempts {
            return false;
        }
        self.attempts += 1;
        debug!("{}: attempt {}/{}", self.label, self.attempts, self.max_attempts);
        true
    }

    pub fn record_failure(&mut self, error: impl fmt::Display) {
        let message = error.to_string();
        warn!("{}: attempt {}/{} failed: {}", self.label, self.attempts, self.max_attempts, message);
        self.last_error = Some(message);
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub fn succeed<T>(&self, value: T) -> RetryOutcome<T> {
        RetryOutcome::Succeeded { value, attempts: self.attempts }
    }

    pub fn give_up<T>(&self) -> RetryOutcome<T> {
        warn!("{}: giving up after {} attempts", self.label, self.attempts);
        RetryOutcome::Exhausted {
            attempts: self.attempts,
            last_error: self.last_error.clone(),
        }
    }

    /// Drive `op` until it returns `Ok` or the bound is reached. The closure
    /// receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(mut self, mut op: F) -> RetryOutcome<T>
    where
        E: fmt::Display,
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        while self.begin_attempt() {
            match op(self.attempts).await {
                Ok(value) => return self.succeed(value),
                Err(e) => self.record_failure(e),
            }
        }
        self.give_up()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_succeeds_on_third_attempt() {
        let outcome = RetryState::new("unit", 5)
            .run(|attempt| async move {
                if attempt < 3 {
                    Err(format!("attempt {} failed", attempt))
                } else {
                    Ok(attempt * 10)
                }
            })
            .await;
        assert_eq!(outcome, RetryOutcome::Succeeded { value: 30, attempts: 3 });
    }

    #[tokio::test]
    async fn test_exhaustion_keeps_last_error() {
        let outcome: RetryOutcome<()> = RetryState::new("unit", 2)
            .run(|attempt| async move { Err(format!("boom {}", attempt)) })
            .await;
        assert_eq!(
            outcome,
            RetryOutcome::Exhausted { attempts: 2, last_error: Some("boom 2".to_string()) }
        );
    }

    #[test]
    fn test_manual_state_machine() {
        let mut state = RetryState::new("manual", 2);
        assert!(state.begin_attempt());
        state.record_failure("empty extraction");
        assert!(state.begin_attempt());
        assert!(state.is_exhausted());
        assert!(!state.begin_attempt());
        assert_eq!(state.last_error(), Some("empty extraction"));
        assert_eq!(state.give_up::<u8>().unwrap_or(7), 7);
    }

    #[test]
    fn test_zero_bound_still_allows_one_attempt() {
        let mut state = RetryState::new("zero", 0);
        assert!(state.begin_attempt());
        assert!(!state.begin_attempt());
    }
}
