//! The top-level error taxonomy a sync cycle can fail with, plus the
//! severity classification the status surface and daemon loop use to decide
//! whether a failure is worth paging on or just logging and moving past.

use miette::Diagnostic;
use thiserror::Error;

use crate::config::ConfigError;
use crate::lark::SinkError;
use jira_client::SourceError;
use sync_store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Expected, self-correcting: a single issue's retries were exhausted,
    /// a malformed field was skipped. The cycle otherwise completed.
    Warning,
    /// This table's cycle did not complete; the next scheduled cycle will
    /// retry the whole thing.
    CycleFailed,
    /// Configuration or credentials are wrong; no cycle for this binding (or
    /// any binding, for global config errors) can succeed until fixed.
    Fatal,
}

#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("configuration error")]
    Config(#[from] ConfigError),

    #[error("source error")]
    Source(#[from] SourceError),

    #[error("sink error")]
    Sink(#[from] SinkError),

    #[error("local store error")]
    Store(#[from] StoreError),

    #[error("issue {0} could not be synced after exhausting retries")]
    IssueFailed(String),

    #[error(
        "table binding {binding}: none of the configured identity-column candidates ({candidates}) \
         is a hyperlink-typed column in the sink table"
    )]
    IdentityColumnNotHyperlink { binding: String, candidates: String },

    #[error("issue {0}: sink row no longer exists; clearing this table's log to reseed on the next cycle")]
    Precondition(String),

    #[error("error creating data directory {path}")]
    DataDirError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown table binding {0}")]
    UnknownBinding(String),
}

impl SyncError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            SyncError::Config(_) => ErrorSeverity::Fatal,
            SyncError::IdentityColumnNotHyperlink { .. } => ErrorSeverity::Fatal,
            SyncError::DataDirError { .. } => ErrorSeverity::Fatal,
            SyncError::UnknownBinding(_) => ErrorSeverity::Fatal,
            SyncError::Sink(e) if e.is_fatal() => ErrorSeverity::Fatal,
            SyncError::IssueFailed(_) => ErrorSeverity::Warning,
            SyncError::Precondition(_) => ErrorSeverity::Warning,
            SyncError::Source(_) | SyncError::Sink(_) | SyncError::Store(_) => {
                ErrorSeverity::CycleFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_column_not_hyperlink_is_fatal() {
        let err = SyncError::IdentityColumnNotHyperlink {
            binding: "mgmt/tp".to_string(),
            candidates: "Ticket".to_string(),
        };
        assert_eq!(err.severity(), ErrorSeverity::Fatal);
    }

    #[test]
    fn single_issue_failure_is_a_warning() {
        let err = SyncError::IssueFailed("TP-1".to_string());
        assert_eq!(err.severity(), ErrorSeverity::Warning);
    }

    #[test]
    fn precondition_failure_is_a_warning() {
        let err = SyncError::Precondition("TP-1".to_string());
        assert_eq!(err.severity(), ErrorSeverity::Warning);
    }
}
