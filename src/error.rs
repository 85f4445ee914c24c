//! Planner error abstractions.

use thiserror::Error;

// Error messages.
pub const ERR_ITER_FAILURE: &str = "error returned during key/value iteration from database";
pub const ERR_DB_FLUSH: &str = "error flushing database state";

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// A stream could not be read from or written to; the operation may be retried.
    #[error("stream unavailable: {0}")]
    StreamUnavailable(String),
    /// A fenced append was attempted by a writer which does not hold the stream's writer lease.
    #[error("writer lease not held: {0}")]
    LeaseNotHeld(String),
    /// A planner invariant has been violated, which indicates either a transport contract
    /// breach or a second planner acting under the same identity.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

impl ShutdownError {
    /// Construct a shutdown error from an invariant violation.
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self(AppError::InvariantViolation(msg.into()).into())
    }

    /// Check if this error was caused by an invariant violation.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self.0.downcast_ref::<AppError>(), Some(AppError::InvariantViolation(_)))
    }
}

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
