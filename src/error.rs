use std::fmt;

use thiserror::Error;

/// Failures reported by the document store or the auth provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("badly formatted email: {0}")]
    InvalidEmail(String),
    #[error("password must be at least {0} characters")]
    WeakPassword(usize),
    #[error("an account already exists for {0}")]
    EmailAlreadyInUse(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("failed to decode stored document: {0}")]
    Codec(String),
}

impl From<rusqlite::Error> for BackendError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match e.sqlite_error_code() {
            Some(
                ErrorCode::PermissionDenied
                | ErrorCode::ReadOnly
                | ErrorCode::AuthorizationForStatementDenied,
            ) => BackendError::PermissionDenied(e.to_string()),
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                BackendError::Unavailable(e.to_string())
            }
            _ => BackendError::Database(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        BackendError::Codec(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Add,
    Toggle,
    Delete,
}

impl fmt::Display for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WriteOp::Add => "add",
            WriteOp::Toggle => "toggle",
            WriteOp::Delete => "delete",
        })
    }
}

/// Failure of an authenticated task-store operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("task feed failed: {0}")]
    Feed(BackendError),
    #[error("failed to {op} task: {source}")]
    Write { op: WriteOp, source: BackendError },
    #[error("{op} was interrupted before the backend answered")]
    Interrupted { op: WriteOp },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}
