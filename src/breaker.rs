//! Circuit breaker seam.
//!
//! The client only needs to ask whether calls are allowed and to report how
//! each call turned out; the breaker's own state machine lives elsewhere.

use std::fmt;

use thiserror::Error;

/// The breaker refused a call.
#[derive(Debug, Error)]
#[error("circuit breaker is open: {reason}")]
pub struct BreakerOpen {
    reason: String,
}

impl BreakerOpen {
    /// Create a new refusal with a reason for the logs.
    pub fn new<S: Into<String>>(reason: S) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// How a downstream call ended, as far as the breaker is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The full response was received.
    Success,

    /// The call failed during setup or mid-stream.
    Failure,
}

/// A circuit breaker consulted around each downstream call.
pub trait CircuitBreaker: fmt::Debug + Send + Sync + 'static {
    /// Returns an error if calls are currently refused.
    fn allow(&self) -> Result<(), BreakerOpen>;

    /// Record the outcome of a call.
    fn report(&self, outcome: Outcome);
}
