use ulid::Ulid;

use crate::calendar::CalendarError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("time slot overlaps booking {0}")]
    Overlap(Ulid),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transaction aborted after {0} conflicting attempts")]
    TxConflict(usize),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

/// The caller-facing error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthorized,
    NotFound,
    InvalidInput,
    Conflict,
    Serialization,
    PreconditionFailed,
    Upstream,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Unauthorized(_) => ErrorKind::Unauthorized,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::InvalidInput(_) | EngineError::LimitExceeded(_) => ErrorKind::InvalidInput,
            EngineError::Overlap(_) | EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::TxConflict(_) => ErrorKind::Serialization,
            EngineError::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            EngineError::WalError(_) => ErrorKind::Upstream,
        }
    }

    pub(crate) fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        EngineError::NotFound(format!("{what} {id}"))
    }
}

impl From<CalendarError> for EngineError {
    fn from(e: CalendarError) -> Self {
        EngineError::InvalidInput(e.to_string())
    }
}
