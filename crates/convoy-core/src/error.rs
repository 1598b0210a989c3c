// crates/convoy-core/src/error.rs

//! Error taxonomy for the Convoy orchestrator
//!
//! Kinds map one-to-one to the failure classes the core distinguishes:
//! validation failures reject a job before (or immediately after) dispatch,
//! backend errors are subject to per-step retry, step failures abort a
//! pipeline, and deadlocks indicate a broken pipeline definition that no
//! outer retry can repair. Effect-handler failures are intentionally absent:
//! they are logged and swallowed by the dispatcher, never surfaced as values.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvoyError {
    /// Missing required field, bad template target type, malformed pipeline
    #[error("validation failed: {0}")]
    Validation(String),

    /// Named backend missing from the registry or failing its health probe
    #[error("backend '{name}' unavailable: {reason}")]
    BackendUnavailable { name: String, reason: String },

    /// Remote returned non-2xx or an error body
    #[error("backend execution failed: {0}")]
    BackendExecution(String),

    /// A non-optional step exhausted its retries
    #[error("step '{step}' failed: {message}")]
    StepFailure { step: String, message: String },

    /// No step is runnable and none is running, but pending steps remain
    #[error("pipeline deadlock: steps {steps:?} can never become runnable")]
    Deadlock { steps: Vec<String> },

    /// Broker or worker-pool failure
    #[error("queue error: {0}")]
    Queue(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ConvoyError {
    /// Message recorded as the job's error. A step failure surfaces the
    /// failing step's message verbatim, without the step-name wrapper.
    pub fn job_error(&self) -> String {
        match self {
            ConvoyError::StepFailure { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ConvoyError::Validation(message.into())
    }

    pub fn backend_unavailable(name: impl Into<String>, reason: impl Into<String>) -> Self {
        ConvoyError::BackendUnavailable {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn backend_execution(message: impl Into<String>) -> Self {
        ConvoyError::BackendExecution(message.into())
    }

    pub fn step_failure(step: impl Into<String>, message: impl Into<String>) -> Self {
        ConvoyError::StepFailure {
            step: step.into(),
            message: message.into(),
        }
    }

    pub fn queue(message: impl Into<String>) -> Self {
        ConvoyError::Queue(message.into())
    }
}

pub type Result<T> = std::result::Result<T, ConvoyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_step_and_message() {
        let err = ConvoyError::step_failure("resize", "remote returned 500");
        assert_eq!(err.to_string(), "step 'resize' failed: remote returned 500");
    }

    #[test]
    fn job_error_unwraps_the_step_message() {
        let err = ConvoyError::step_failure("resize", "remote returned 500");
        assert_eq!(err.job_error(), "remote returned 500");

        let err = ConvoyError::backend_execution("connection refused");
        assert_eq!(err.job_error(), "backend execution failed: connection refused");
    }

    #[test]
    fn deadlock_names_pending_steps() {
        let err = ConvoyError::Deadlock {
            steps: vec!["a".into(), "b".into()],
        };
        let text = err.to_string();
        assert!(text.contains("\"a\""));
        assert!(text.contains("\"b\""));
    }
}
