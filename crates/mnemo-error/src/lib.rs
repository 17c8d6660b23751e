//! Error taxonomy for the mnemo knowledge store.
//!
//! The taxonomy is flat and closed: every surfaced failure maps to exactly
//! one variant, and `MnemoError::kind_name` returns the stable wire name.
//! Errors are `Clone` so that coalesced cache loads can hand the same
//! failure to every waiter.

use std::fmt;

/// Convenience alias used across every mnemo crate.
pub type Result<T, E = MnemoError> = std::result::Result<T, E>;

/// A rollback failure paired with the label of the operation whose
/// compensation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackFailure {
    /// Label of the operation whose rollback failed.
    pub operation: String,
    /// The error the final rollback attempt produced.
    pub error: Box<MnemoError>,
}

impl fmt::Display for RollbackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.operation, self.error)
    }
}

/// Closed error set for the storage engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MnemoError {
    /// The named object does not exist.
    #[error("{what} not found: {key}")]
    NotFound { what: &'static str, key: String },

    /// The named object already exists and the operation requires absence.
    #[error("{what} already exists: {key}")]
    AlreadyExists { what: &'static str, key: String },

    /// The caller supplied an invalid value. `hint` may carry a
    /// nearest-match suggestion for closed vocabularies.
    #[error("invalid {what}: {value}{}", .hint.as_deref().map(|h| format!(" (did you mean `{h}`?)")).unwrap_or_default())]
    InvalidArgument {
        what: &'static str,
        value: String,
        hint: Option<String>,
    },

    /// A compare-and-swap observed a different prior value.
    #[error("precondition failed on {what}: expected {expected}, found {actual}")]
    PreconditionFailed {
        what: &'static str,
        expected: String,
        actual: String,
    },

    /// A deadline elapsed before the operation finished.
    #[error("timeout during {0}")]
    Timeout(String),

    /// The operation was cancelled through its context.
    #[error("operation cancelled")]
    Cancelled,

    /// Concurrent modification detected.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The byte backend refused or failed the request.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Stored bytes disagree with their digest or declared shape.
    #[error("integrity error in {what}: {detail}")]
    Integrity { what: &'static str, detail: String },

    /// An operation inside a transaction failed; rollback ran.
    #[error("transaction failed at `{operation}`: {cause}")]
    TransactionExecution {
        operation: String,
        cause: Box<MnemoError>,
    },

    /// Rollback itself failed after an operation error. Wraps both the
    /// original cause and every compensation that could not be applied.
    #[error("rollback failed ({} compensation(s)) after: {cause}", .failures.len())]
    TransactionRollback {
        cause: Box<MnemoError>,
        failures: Vec<RollbackFailure>,
    },

    /// A transaction method was called in the wrong lifecycle state.
    #[error("invalid transaction state: expected {expected}, found {actual}")]
    InvalidTransactionState {
        expected: &'static str,
        actual: &'static str,
    },

    /// Invariant violation that callers cannot act on.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MnemoError {
    /// Build an [`MnemoError::Internal`] from anything displayable.
    pub fn internal(msg: impl fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }

    /// Build a [`MnemoError::NotFound`].
    pub fn not_found(what: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            key: key.into(),
        }
    }

    /// Build an [`MnemoError::InvalidArgument`] without a suggestion.
    pub fn invalid(what: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidArgument {
            what,
            value: value.into(),
            hint: None,
        }
    }

    /// Build an [`MnemoError::BackendUnavailable`] from an I/O error.
    pub fn backend(err: impl fmt::Display) -> Self {
        Self::BackendUnavailable(err.to_string())
    }

    /// Stable wire name for the error kind.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NotFound",
            Self::AlreadyExists { .. } => "AlreadyExists",
            Self::InvalidArgument { .. } => "InvalidArgument",
            Self::PreconditionFailed { .. } => "PreconditionFailed",
            Self::Timeout(_) => "Timeout",
            Self::Cancelled => "Cancelled",
            Self::Conflict(_) => "Conflict",
            Self::BackendUnavailable(_) => "BackendUnavailable",
            Self::Integrity { .. } => "IntegrityError",
            Self::TransactionExecution { .. } => "TransactionExecutionError",
            Self::TransactionRollback { .. } => "TransactionRollbackError",
            Self::InvalidTransactionState { .. } => "InvalidTransactionStateError",
            Self::Internal(_) => "Internal",
        }
    }

    /// Whether retrying the same call can reasonably succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable(_) | Self::PreconditionFailed { .. } | Self::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_are_stable() {
        let cases: Vec<(MnemoError, &str)> = vec![
            (MnemoError::not_found("entity", "ab"), "NotFound"),
            (MnemoError::Cancelled, "Cancelled"),
            (
                MnemoError::Integrity {
                    what: "blob",
                    detail: "digest mismatch".to_owned(),
                },
                "IntegrityError",
            ),
            (
                MnemoError::InvalidTransactionState {
                    expected: "pending",
                    actual: "committed",
                },
                "InvalidTransactionStateError",
            ),
        ];
        for (err, name) in cases {
            assert_eq!(err.kind_name(), name, "case={name}");
        }
    }

    #[test]
    fn test_invalid_argument_suggestion_renders() {
        let err = MnemoError::InvalidArgument {
            what: "noun kind",
            value: "Persn".to_owned(),
            hint: Some("Person".to_owned()),
        };
        let msg = err.to_string();
        assert!(msg.contains("Persn"), "case=value_in_message msg={msg}");
        assert!(
            msg.contains("did you mean `Person`?"),
            "case=hint_in_message msg={msg}"
        );
    }

    #[test]
    fn test_rollback_error_wraps_cause_and_failures() {
        let err = MnemoError::TransactionRollback {
            cause: Box::new(MnemoError::backend("socket closed")),
            failures: vec![RollbackFailure {
                operation: "hnsw_insert".to_owned(),
                error: Box::new(MnemoError::internal("index poisoned")),
            }],
        };
        assert_eq!(err.kind_name(), "TransactionRollbackError");
        assert!(err.to_string().contains("1 compensation(s)"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(MnemoError::backend("503").is_transient());
        assert!(!MnemoError::Cancelled.is_transient());
        assert!(!MnemoError::not_found("ref", "refs/head").is_transient());
    }
}
