use diesel::result::{DatabaseErrorKind, Error as DieselError};

use super::StoreError;
use crate::ledger::LedgerError;

/// Whether a failed storage attempt may be retried as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Retriable,
    NonRetriable,
}

/// Domain error a failure code maps to when it is surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainMapping {
    AlreadyExists,
    InvalidPayload,
    NotFound,
}

impl DomainMapping {
    fn into_error(self, message: String) -> LedgerError {
        match self {
            DomainMapping::AlreadyExists => LedgerError::AlreadyExists(message),
            DomainMapping::InvalidPayload => LedgerError::InvalidPayload(message),
            DomainMapping::NotFound => LedgerError::NotFound(message),
        }
    }
}

/// Maps raw storage failures to a retry decision and, once retries stop, a domain error.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, err: &StoreError) -> Classification;

    fn translate(&self, op: &str, err: StoreError) -> LedgerError;
}

pub const CONNECTION_EXCEPTION: &str = "08000";

/// SQLSTATEs worth another attempt: connection loss, rollback/serialization/deadlock, and
/// "cannot connect now" while the server starts.
pub const PG_RETRYABLE_CODES: &[&str] = &[
    CONNECTION_EXCEPTION,
    "08003",
    "08006",
    "40000",
    "40001",
    "40P01",
    "57P03",
];

pub const PG_DOMAIN_CODES: &[(&str, DomainMapping)] = &[
    ("23505", DomainMapping::AlreadyExists),
    ("22023", DomainMapping::InvalidPayload),
    ("P0002", DomainMapping::NotFound),
];

// diesel reports these as `DatabaseErrorKind::Unknown`, so the server message is all we have.
const PG_MESSAGE_CODES: &[(&str, &str)] = &[
    ("deadlock detected", "40P01"),
    ("could not serialize access", "40001"),
    ("the database system is starting up", "57P03"),
    ("server closed the connection unexpectedly", "08006"),
    ("invalid input syntax", "22P02"),
    ("syntax error", "42601"),
];

/// Table-driven Postgres classifier. Anything without a retryable code is `NonRetriable`.
#[derive(Debug, Clone, Copy)]
pub struct PgErrorClassifier {
    retryable_codes: &'static [&'static str],
    domain_codes: &'static [(&'static str, DomainMapping)],
}

impl Default for PgErrorClassifier {
    fn default() -> Self {
        Self {
            retryable_codes: PG_RETRYABLE_CODES,
            domain_codes: PG_DOMAIN_CODES,
        }
    }
}

impl PgErrorClassifier {
    pub fn with_tables(
        retryable_codes: &'static [&'static str],
        domain_codes: &'static [(&'static str, DomainMapping)],
    ) -> Self {
        Self {
            retryable_codes,
            domain_codes,
        }
    }

    fn domain_for(&self, code: &str) -> Option<DomainMapping> {
        self.domain_codes
            .iter()
            .find(|(candidate, _)| *candidate == code)
            .map(|(_, mapping)| *mapping)
    }
}

impl ErrorClassifier for PgErrorClassifier {
    fn classify(&self, err: &StoreError) -> Classification {
        match sqlstate(err) {
            Some(code) if self.retryable_codes.contains(&code) => Classification::Retriable,
            _ => Classification::NonRetriable,
        }
    }

    fn translate(&self, op: &str, err: StoreError) -> LedgerError {
        if let StoreError::Rejected(rejection) = err {
            return rejection;
        }

        let code = sqlstate(&err);
        let message = format!("{op}: {err}");
        match code.and_then(|code| self.domain_for(code)) {
            Some(mapping) => mapping.into_error(message),
            None if self.classify(&err) == Classification::Retriable => {
                LedgerError::Unavailable(message)
            }
            None => LedgerError::Internal(message),
        }
    }
}

/// Best-effort SQLSTATE for a storage failure.
pub fn sqlstate(err: &StoreError) -> Option<&'static str> {
    match err {
        StoreError::Pool(_) => Some(CONNECTION_EXCEPTION),
        StoreError::Rejected(_) => None,
        StoreError::Database(db_err) => diesel_sqlstate(db_err),
    }
}

fn diesel_sqlstate(err: &DieselError) -> Option<&'static str> {
    match err {
        DieselError::DatabaseError(kind, info) => match kind {
            DatabaseErrorKind::UniqueViolation => Some("23505"),
            DatabaseErrorKind::ForeignKeyViolation => Some("23503"),
            DatabaseErrorKind::NotNullViolation => Some("23502"),
            DatabaseErrorKind::CheckViolation => Some("23514"),
            DatabaseErrorKind::SerializationFailure => Some("40001"),
            DatabaseErrorKind::ReadOnlyTransaction => Some("25006"),
            DatabaseErrorKind::ClosedConnection => Some("08003"),
            DatabaseErrorKind::UnableToSendCommand => Some("08006"),
            _ => sqlstate_from_message(info.message()),
        },
        DieselError::RollbackTransaction => Some("40000"),
        DieselError::NotFound => Some("P0002"),
        _ => None,
    }
}

fn sqlstate_from_message(message: &str) -> Option<&'static str> {
    let lowered = message.to_ascii_lowercase();
    PG_MESSAGE_CODES
        .iter()
        .find(|(needle, _)| lowered.contains(needle))
        .map(|(_, code)| *code)
}
