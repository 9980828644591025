//! Error types for the environment abstraction layer.

use thiserror::Error;

/// Errors produced by the advisor capability or its guard.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdvisorError {
    /// The breaker is open; the call was rejected without being issued.
    #[error("advisor circuit breaker is open")]
    BreakerOpen,

    /// The call did not complete within the configured deadline.
    #[error("advisor timed out after {0}ms")]
    Timeout(u64),

    /// Transport failure (connection refused, channel closed, ...).
    #[error("advisor transport error: {0}")]
    Transport(String),

    /// The reply could not be parsed into the decision schema.
    #[error("malformed advisor reply: {0}")]
    Malformed(String),
}

impl AdvisorError {
    /// Creates a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Creates a malformed-reply error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}
