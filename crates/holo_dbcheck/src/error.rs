//! Typed failures surfaced by dbCheck.
//!
//! Every variant carries a stable numeric code so health-log records and
//! command replies can be matched without parsing messages.

use thiserror::Error;

/// Stable numeric error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Storage = 1,
    BadValue = 2,
    NoSuchKey = 4,
    Unauthorized = 13,
    NamespaceNotFound = 26,
    InvalidNamespace = 73,
    WriteConflict = 112,
    PrimarySteppedDown = 189,
    Interrupted = 11601,
    UnsupportedFeatureVersion = 40614,
    NotReplicated = 40616,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DbCheckError {
    #[error("{0}")]
    NamespaceNotFound(String),

    #[error("{0}")]
    InvalidNamespace(String),

    #[error("cannot run dbCheck on {0} because it is not replicated")]
    NotReplicated(String),

    #[error("dbCheck requires feature compatibility version >= {required}, current is {current}")]
    UnsupportedFeatureVersion { required: String, current: String },

    #[error("not authorized to run dbCheck on {0}")]
    Unauthorized(String),

    #[error("bad value: {0}")]
    BadValue(String),

    #[error("document missing _id in {0}")]
    NoSuchKey(String),

    /// Operation killed or process shutting down.
    #[error("operation was interrupted")]
    Interrupted,

    /// Lost the right to accept writes for the namespace.
    #[error("dbCheck terminated by stepdown")]
    RoleLost,

    /// Transient storage contention; the caller retries the whole unit.
    #[error("write conflict")]
    WriteConflict,

    #[error("storage error: {0}")]
    Storage(String),
}

impl DbCheckError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DbCheckError::NamespaceNotFound(_) => ErrorCode::NamespaceNotFound,
            DbCheckError::InvalidNamespace(_) => ErrorCode::InvalidNamespace,
            DbCheckError::NotReplicated(_) => ErrorCode::NotReplicated,
            DbCheckError::UnsupportedFeatureVersion { .. } => ErrorCode::UnsupportedFeatureVersion,
            DbCheckError::Unauthorized(_) => ErrorCode::Unauthorized,
            DbCheckError::BadValue(_) => ErrorCode::BadValue,
            DbCheckError::NoSuchKey(_) => ErrorCode::NoSuchKey,
            DbCheckError::Interrupted => ErrorCode::Interrupted,
            DbCheckError::RoleLost => ErrorCode::PrimarySteppedDown,
            DbCheckError::WriteConflict => ErrorCode::WriteConflict,
            DbCheckError::Storage(_) => ErrorCode::Storage,
        }
    }

    /// Retried in place, never visible outside the log writer.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbCheckError::WriteConflict)
    }

    /// Stops the whole run rather than a single collection.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, DbCheckError::Interrupted | DbCheckError::RoleLost)
    }
}

impl From<serde_json::Error> for DbCheckError {
    fn from(err: serde_json::Error) -> Self {
        DbCheckError::BadValue(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(DbCheckError::WriteConflict.is_transient());
        assert!(!DbCheckError::WriteConflict.is_run_fatal());
        assert!(DbCheckError::RoleLost.is_run_fatal());
        assert!(DbCheckError::Interrupted.is_run_fatal());
        assert!(!DbCheckError::NamespaceNotFound("x".into()).is_run_fatal());
        assert_eq!(DbCheckError::RoleLost.code() as i32, 189);
        assert_eq!(DbCheckError::NotReplicated("a.b".into()).code() as i32, 40616);
    }
}
