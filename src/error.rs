//! Error kinds and exit-code mapping.
//!
//! Every fallible path in the rebuild discriminates between four kinds:
//! transient errors worth retrying, fatal per-index errors, operator aborts,
//! and startup preconditions. The kind decides both the retry behaviour and
//! the process exit code.

use thiserror::Error;

/// Server error codes treated as transient (step-down, shutdown, replication
/// state changes, time limits). Anything else in a command error is fatal.
pub const RETRYABLE_SERVER_CODES: &[i32] = &[
    6,     // HostUnreachable
    7,     // HostNotFound
    89,    // NetworkTimeout
    91,    // ShutdownInProgress
    189,   // PrimarySteppedDown
    262,   // ExceededTimeLimit
    9001,  // SocketException
    10107, // NotWritablePrimary
    11600, // InterruptedAtShutdown
    11602, // InterruptedDueToReplStateChange
    13435, // NotPrimaryNoSecondaryOk
    13436, // NotPrimaryOrSecondary
];

/// `IndexOptionsConflict` - an index with the same name but different
/// options already exists.
pub const INDEX_OPTIONS_CONFLICT: i32 = 85;
/// `IndexKeySpecsConflict` - an index with the same name but a different
/// key pattern already exists.
pub const INDEX_KEY_SPECS_CONFLICT: i32 = 86;
/// `IndexNotFound` - dropping an index that is already gone.
pub const INDEX_NOT_FOUND: i32 = 27;
/// `NamespaceNotFound` - the collection itself is gone.
pub const NAMESPACE_NOT_FOUND: i32 = 26;

#[derive(Debug, Error)]
pub enum RebuildError {
    /// Transient failure - retried within the bounded retry budget, escalated
    /// to `Fatal` once the budget is exhausted.
    #[error("{message}")]
    Retryable { message: String },

    /// Unrecoverable for the current index. The orchestrator records it and
    /// moves on to the next index.
    #[error("{message}")]
    Fatal { message: String, code: Option<i32> },

    /// The operator answered "no" at a confirmation, or SIGINT was received.
    #[error("aborted by operator")]
    Aborted,

    /// The environment refuses the command before any mutation.
    #[error("precondition not met: {message}")]
    Precondition { message: String },
}

impl RebuildError {
    pub fn retryable<M: std::fmt::Display>(message: M) -> Self {
        RebuildError::Retryable { message: message.to_string() }
    }

    pub fn fatal<M: std::fmt::Display>(message: M) -> Self {
        RebuildError::Fatal { message: message.to_string(), code: None }
    }

    pub fn precondition<M: std::fmt::Display>(message: M) -> Self {
        RebuildError::Precondition { message: message.to_string() }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, RebuildError::Retryable { .. })
    }

    /// Server error code, if this came back from a command.
    pub fn server_code(&self) -> Option<i32> {
        match self {
            RebuildError::Fatal { code, .. } => *code,
            _ => None,
        }
    }

    /// Both conflict codes mean "an index with that name exists with another
    /// spec" - callers list and compare before deciding.
    pub fn is_index_conflict(&self) -> bool {
        matches!(
            self.server_code(),
            Some(INDEX_OPTIONS_CONFLICT) | Some(INDEX_KEY_SPECS_CONFLICT)
        )
    }

    /// A retryable error whose budget ran out becomes fatal.
    pub fn into_fatal(self) -> Self {
        match self {
            RebuildError::Retryable { message } => RebuildError::Fatal {
                message: format!("retry budget exhausted: {}", message),
                code: None,
            },
            other => other,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            RebuildError::Aborted => 2,
            RebuildError::Precondition { .. } => 3,
            _ => 1,
        }
    }
}

impl From<anyhow::Error> for RebuildError {
    fn from(err: anyhow::Error) -> Self {
        RebuildError::fatal(err)
    }
}

/// Classify a driver error into a [`RebuildError`].
///
/// Network, server-selection and pool errors are transient by nature. Command
/// errors are transient only for the step-down/interruption code set;
/// everything else (auth, validation, conflicts) is fatal.
pub fn classify_driver_error(err: mongodb::error::Error) -> RebuildError {
    use mongodb::error::ErrorKind;

    match &*err.kind {
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::ConnectionPoolCleared { .. } => {
            RebuildError::Retryable { message: err.to_string() }
        }
        ErrorKind::Command(cmd) => {
            let code = cmd.code;
            if RETRYABLE_SERVER_CODES.contains(&code) {
                RebuildError::Retryable { message: err.to_string() }
            } else {
                RebuildError::Fatal { message: err.to_string(), code: Some(code) }
            }
        }
        _ => RebuildError::Fatal { message: err.to_string(), code: None },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(RebuildError::fatal("boom").exit_code(), 1);
        assert_eq!(RebuildError::retryable("blip").exit_code(), 1);
        assert_eq!(RebuildError::Aborted.exit_code(), 2);
        assert_eq!(RebuildError::precondition("version").exit_code(), 3);
    }

    #[test]
    fn retryable_escalates_to_fatal() {
        let err = RebuildError::retryable("network blip").into_fatal();
        assert!(!err.is_retryable());
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn conflict_detection() {
        let err = RebuildError::Fatal {
            message: "already exists".to_string(),
            code: Some(INDEX_OPTIONS_CONFLICT),
        };
        assert!(err.is_index_conflict());
        assert!(!RebuildError::fatal("other").is_index_conflict());
    }
}
