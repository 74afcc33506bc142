//! Error types for the cypher-query crate.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Coarse classification of a failure, as reported to callers in a
/// [`QueryOutcome`](crate::dispatcher::QueryOutcome).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    /// Required connection fields are missing.
    ConfigIncomplete,
    /// Backend unreachable or authentication failed.
    ConnectionError,
    /// No plan could be produced or the generated output failed validation.
    TranslationRejected,
    /// The backend call failed.
    ExecutionError,
    /// The backend call exceeded its deadline. A kind of execution failure.
    Timeout,
    /// The caller abandoned the query between reasoning iterations.
    Cancelled,
}

/// Errors produced by the dispatch core.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Incomplete configuration: missing {}", .0.join(", "))]
    ConfigIncomplete(Vec<&'static str>),

    #[error("No backend selected. Configure a database first.")]
    NoBackend,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Translation rejected: {0}")]
    TranslationRejected(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Query timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("Query cancelled")]
    Cancelled,
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigIncomplete(_) | Self::NoBackend => ErrorKind::ConfigIncomplete,
            Self::Connection(_) => ErrorKind::ConnectionError,
            Self::TranslationRejected(_) => ErrorKind::TranslationRejected,
            Self::Execution(_) => ErrorKind::ExecutionError,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Errors returned by backend drivers.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend could not be reached or the session is no longer usable.
    #[error("{0}")]
    Connection(String),

    /// The backend rejected or failed a single statement. The session is
    /// still usable.
    #[error("{0}")]
    Query(String),

    /// The statement was refused before reaching the backend.
    #[error("{0}")]
    Rejected(String),
}

impl BackendError {
    /// Whether the reasoning loop can report this error to the model and
    /// keep going.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Connection(_))
    }
}

impl From<BackendError> for DispatchError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Connection(msg) => Self::Connection(msg),
            BackendError::Query(msg) | BackendError::Rejected(msg) => Self::Execution(msg),
        }
    }
}
