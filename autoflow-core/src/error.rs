//! ABOUTME: Error taxonomy for the autoflow workflow engine
//! ABOUTME: Provides `Error` enum and `Result` type alias shared by every crate in the workspace

use thiserror::Error;

/// The kind of an [`Error::Executor`] failure, as reported by an adapter.
///
/// Adapters classify their own failures; the engine only needs to know
/// whether a retry is sensible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ExecutorErrorKind {
    /// Transient failure; retrying with the step's retry policy is safe.
    Retryable,
    /// Failure is not expected to succeed on retry.
    Permanent,
}

/// Comprehensive error enum for all autoflow operations.
///
/// Each document/schema failure
/// surfaces before execution, each execution failure carries enough
/// context (step id, expression) for a human-readable report.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid workflow document: {message}")]
    InvalidDocument { message: String },

    #[error("invalid workflow schema: {message}")]
    InvalidSchema { message: String },

    #[error("missing required inputs: {}", .missing.join(", "))]
    MissingInputs { missing: Vec<String> },

    #[error("expression error in step '{step_id}': {message} (expression: `{expression}`)")]
    Expression {
        step_id: String,
        expression: String,
        message: String,
    },

    #[error("type error: {message}")]
    Type { message: String },

    #[error("unknown operation '{operation}' for core.transform")]
    UnknownOperation { operation: String },

    #[error("executor error ({kind:?}) from '{action}': {message}")]
    Executor {
        action: String,
        kind: ExecutorErrorKind,
        message: String,
    },

    #[error("step '{step_id}' timed out after {elapsed_ms}ms")]
    Timeout { step_id: String, elapsed_ms: u64 },

    #[error("while loop exceeded max_iterations ({max_iterations}) in step '{step_id}'")]
    MaxIterationsExceeded {
        step_id: String,
        max_iterations: u64,
    },

    #[error("budget '{limit_name}' exceeded: {spent:.4} >= {max_cost:.4} {currency}")]
    BudgetExceeded {
        limit_name: String,
        spent: f64,
        max_cost: f64,
        currency: String,
    },

    #[error("run cancelled")]
    Cancelled,

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    pub fn invalid_document(message: impl Into<String>) -> Self {
        Self::InvalidDocument {
            message: message.into(),
        }
    }

    pub fn invalid_schema(message: impl Into<String>) -> Self {
        Self::InvalidSchema {
            message: message.into(),
        }
    }

    pub fn expression(
        step_id: impl Into<String>,
        expression: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Expression {
            step_id: step_id.into(),
            expression: expression.into(),
            message: message.into(),
        }
    }

    /// Whether a step wrapped in a retry policy should attempt another attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Executor {
                kind: ExecutorErrorKind::Retryable,
                ..
            } | Self::Timeout { .. }
        )
    }
}

/// Convenience Result type alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_inputs_message_lists_names() {
        let err = Error::MissingInputs {
            missing: vec!["user_id".to_string(), "email".to_string()],
        };
        assert_eq!(err.to_string(), "missing required inputs: user_id, email");
    }

    #[test]
    fn retryable_classification() {
        let retryable = Error::Executor {
            action: "slack.post".to_string(),
            kind: ExecutorErrorKind::Retryable,
            message: "rate limited".to_string(),
        };
        let permanent = Error::Executor {
            action: "slack.post".to_string(),
            kind: ExecutorErrorKind::Permanent,
            message: "bad token".to_string(),
        };
        assert!(retryable.is_retryable());
        assert!(!permanent.is_retryable());
        assert!(Error::Timeout {
            step_id: "s1".to_string(),
            elapsed_ms: 10
        }
        .is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }
}
