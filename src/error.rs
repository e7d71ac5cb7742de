//! Error Types
//!
//! Every fallible operation in the crate reports one of the enums below.
//!
//! - [`ValidationError`]: malformed or cyclic workflow definitions
//! - [`TransitionError`]: illegal step or execution status changes
//! - [`PoolError`] / [`ProviderError`]: session pool and provider failures
//! - [`CapabilityError`]: outcome of a failed step attempt
//! - [`OrchestratorError`]: errors surfaced by the orchestrator API
//! - [`ConfigError`] / [`ParseError`]: settings and workflow file loading

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Rejections raised while checking a workflow definition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("workflow has no steps")]
    EmptyWorkflow,

    #[error("step has empty or whitespace-only ID")]
    EmptyStepId,

    #[error("step '{0}' has no action specified")]
    EmptyAction(String),

    #[error("duplicate step ID: '{0}'")]
    DuplicateStepId(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("workflow contains cyclic dependencies between steps: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    #[error("{context} payload is {size} bytes, limit is {limit}")]
    PayloadTooLarge {
        context: String,
        size: usize,
        limit: usize,
    },

    #[error("invalid setting: {0}")]
    InvalidSetting(String),
}

/// An attempted status change that the state machine does not allow.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{entity}: cannot move from {from} to {to}")]
pub struct TransitionError {
    pub entity: String,
    pub from: String,
    pub to: String,
}

/// Failure reported by the remote session provider.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("session provider error: {0}")]
pub struct ProviderError(pub String);

/// Errors from the session pool.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PoolError {
    #[error("no '{task_type}' session available after waiting {waited:?}")]
    PoolExhausted { task_type: String, waited: Duration },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session {0} is leased and cannot be refreshed")]
    SessionBusy(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("session pool is shut down")]
    ShutDown,
}

/// Classification of a failed step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityErrorKind {
    /// The capability reported a failure
    Failed,
    /// The attempt exceeded the step timeout
    Timeout,
    /// No session could be leased for the step
    SessionUnavailable,
    /// The execution was cancelled while the attempt was in flight
    Cancelled,
    /// The capability returned a result the core refuses to carry
    InvalidResult,
}

impl fmt::Display for CapabilityErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::SessionUnavailable => "session unavailable",
            Self::Cancelled => "cancelled",
            Self::InvalidResult => "invalid result",
        };
        f.write_str(label)
    }
}

/// Outcome value of a failed step attempt, consumed by the retry logic.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct CapabilityError {
    pub kind: CapabilityErrorKind,
    pub message: String,
}

impl CapabilityError {
    pub fn new(kind: CapabilityErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(CapabilityErrorKind::Failed, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            CapabilityErrorKind::Timeout,
            format!("step exceeded timeout of {}s", after.as_secs_f64()),
        )
    }

    pub fn session_unavailable(message: impl Into<String>) -> Self {
        Self::new(CapabilityErrorKind::SessionUnavailable, message)
    }

    pub fn cancelled() -> Self {
        Self::new(CapabilityErrorKind::Cancelled, "execution cancelled")
    }
}

/// Errors returned by the orchestrator API.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrchestratorError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    InvalidState(#[from] TransitionError),

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error("orchestrator coordinator is not running")]
    Unavailable,
}

/// Errors raised while loading [`crate::config::Settings`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised while loading a workflow file.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to read workflow file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse workflow YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cyclic_dependency_message_lists_steps() {
        let err = ValidationError::CyclicDependency(vec!["a".into(), "b".into()]);
        assert_eq!(
            err.to_string(),
            "workflow contains cyclic dependencies between steps: a, b"
        );
    }

    #[test]
    fn test_unknown_dependency_message() {
        let err = ValidationError::UnknownDependency {
            step: "merge".into(),
            dependency: "search".into(),
        };
        assert!(err.to_string().contains("merge"));
        assert!(err.to_string().contains("search"));
    }

    #[test]
    fn test_capability_error_display() {
        let err = CapabilityError::failed("element not found");
        assert_eq!(err.to_string(), "failed: element not found");

        let err = CapabilityError::timeout(Duration::from_secs(30));
        assert_eq!(err.kind, CapabilityErrorKind::Timeout);
        assert!(err.to_string().contains("30"));
    }

    #[test]
    fn test_pool_error_from_provider() {
        let err: PoolError = ProviderError("quota exceeded".into()).into();
        assert!(matches!(err, PoolError::Provider(_)));
        assert_eq!(err.to_string(), "session provider error: quota exceeded");
    }

    #[test]
    fn test_orchestrator_error_from_validation() {
        let err: OrchestratorError = ValidationError::EmptyWorkflow.into();
        assert_eq!(err, OrchestratorError::Validation(ValidationError::EmptyWorkflow));
    }
}
