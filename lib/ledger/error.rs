use super::Points;
use thiserror::Error;

/// Coarse handling class for a failure, as seen by jobs and the HTTP boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network or database transport failure; already retried by the storage layer.
    Transient,
    /// Upstream backpressure. Handled by pausing, never reported as a job failure.
    RateLimited,
    /// Upstream has no answer yet.
    NotYetAvailable,
    /// Business-key or state race.
    Conflict,
    /// Malformed data or constraint violation.
    Permanent,
}

/// Domain error returned by every storage and service operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid order number: {0}")]
    InvalidOrderNumber(String),

    #[error("unprocessable order number: {0}")]
    UnprocessableOrder(String),

    #[error("order {0} was already submitted by this user")]
    OrderAlreadySubmitted(String),

    #[error("order {0} was already submitted by another user")]
    OrderOwnedByAnotherUser(String),

    #[error("insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: Points, available: Points },

    #[error("no content")]
    NoContent,

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::Unavailable(_) => ErrorKind::Transient,
            LedgerError::NoContent => ErrorKind::NotYetAvailable,
            LedgerError::AlreadyExists(_)
            | LedgerError::OrderAlreadySubmitted(_)
            | LedgerError::OrderOwnedByAnotherUser(_)
            | LedgerError::InsufficientBalance { .. } => ErrorKind::Conflict,
            LedgerError::InvalidPayload(_)
            | LedgerError::NotFound(_)
            | LedgerError::InvalidOrderNumber(_)
            | LedgerError::UnprocessableOrder(_)
            | LedgerError::Internal(_) => ErrorKind::Permanent,
        }
    }
}
