// ⚠️ Reconciliation Errors
//
// Only Configuration and Cancelled stop a pass. Everything else is collected
// into the pass report and sent once, at the end, as a consolidated error report.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    /// The pass cannot run at all (no reviewers, invalid config, store unreachable).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// One unresolved record could not be classified.
    #[error("classification failed for '{subject}': {message}")]
    Classification { subject: String, message: String },

    /// A collaborator call (create/delete/correlate/notify/lookup) failed.
    #[error("{operation} failed for '{target}': {message}")]
    ExternalCall {
        operation: &'static str,
        target: String,
        message: String,
    },

    /// A completed case could not be attributed to a reviewer.
    #[error("cannot decode decision for '{form_name}': {message}")]
    DecisionDecode { form_name: String, message: String },

    #[error("reconciliation pass cancelled")]
    Cancelled,
}

impl ReconcileError {
    pub fn external(operation: &'static str, target: impl Into<String>, err: anyhow::Error) -> Self {
        ReconcileError::ExternalCall {
            operation,
            target: target.into(),
            message: format!("{err:#}"),
        }
    }

    pub fn classification(subject: impl Into<String>, message: impl Into<String>) -> Self {
        ReconcileError::Classification {
            subject: subject.into(),
            message: message.into(),
        }
    }

    /// Fatal errors abort the pass and suppress all output.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReconcileError::Configuration(_) | ReconcileError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_configuration_and_cancel_are_fatal() {
        assert!(ReconcileError::Configuration("no reviewers".into()).is_fatal());
        assert!(ReconcileError::Cancelled.is_fatal());
        assert!(!ReconcileError::classification("jdoe", "bad").is_fatal());
        assert!(!ReconcileError::DecisionDecode {
            form_name: "f".into(),
            message: "m".into()
        }
        .is_fatal());
    }

    #[test]
    fn test_external_keeps_context_chain() {
        let err = anyhow::anyhow!("connection reset").context("deleting case");
        let wrapped = ReconcileError::external("delete_case", "abc", err);

        assert_eq!(
            wrapped.to_string(),
            "delete_case failed for 'abc': deleting case: connection reset"
        );
    }
}
