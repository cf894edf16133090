//! Error types for the harness protocol.

use thiserror::Error;

use crate::session::SessionPhase;

/// Errors surfaced by the engine, runner, and their ports.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("invalid transition: {from:?} -> {to:?}")]
    InvalidTransition { from: SessionPhase, to: SessionPhase },
    #[error("session cancelled while waiting: {0}")]
    Cancelled(String),
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("session not configured: {0}")]
    NotConfigured(String),
    #[error("environment error: {0}")]
    Environment(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl HarnessError {
    pub fn environment(msg: impl Into<String>) -> Self {
        Self::Environment(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// True when the error only signals that a blocked caller was released by
    /// a stop and should wind down quietly.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

impl From<serde_json::Error> for HarnessError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for HarnessError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

/// Convenience result type for harness operations.
pub type HarnessResult<T> = Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_error_names_both_phases() {
        let error = HarnessError::InvalidTransition {
            from: SessionPhase::Stopped,
            to: SessionPhase::Paused,
        };
        let rendered = error.to_string();
        assert!(rendered.contains("Stopped"));
        assert!(rendered.contains("Paused"));
    }

    #[test]
    fn cancellation_is_distinguishable() {
        assert!(HarnessError::cancelled("stop").is_cancellation());
        assert!(!HarnessError::environment("boom").is_cancellation());
    }
}
