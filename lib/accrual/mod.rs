mod client;

pub use client::{parse_retry_after, AccrualClientConfig, HttpAccrualClient};

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;

use crate::ledger::Points;

/// Order status as reported by the accrual service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccrualStatus {
    Registered,
    Processing,
    Invalid,
    Processed,
    /// Anything the service starts sending that this build does not know yet.
    Unknown(String),
}

impl AccrualStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "REGISTERED" => Self::Registered,
            "PROCESSING" => Self::Processing,
            "INVALID" => Self::Invalid,
            "PROCESSED" => Self::Processed,
            other => Self::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccrualError {
    #[error("failed to build accrual http client: {0}")]
    Build(String),

    #[error("invalid accrual base url `{0}`")]
    InvalidBaseUrl(String),

    #[error("accrual request failed: {0}")]
    Transport(String),

    #[error("unexpected accrual response status {0}")]
    UnexpectedStatus(u16),

    #[error("could not decode accrual response: {0}")]
    Decode(String),
}

/// Result of one `GET /api/orders/{number}` call.
///
/// Rate limiting and "not registered yet" are ordinary outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccrualOutcome {
    Success {
        status: AccrualStatus,
        awarded: Option<Points>,
    },
    RateLimited {
        retry_after: Duration,
    },
    NotRegistered,
    TransientFailure(AccrualError),
}

impl AccrualOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            AccrualOutcome::Success { .. } => "success",
            AccrualOutcome::RateLimited { .. } => "rate_limited",
            AccrualOutcome::NotRegistered => "not_registered",
            AccrualOutcome::TransientFailure(_) => "transient_failure",
        }
    }
}

/// Looks up one order at the accrual service.
///
/// Implementations apply their own request timeout; callers never wrap this in one.
pub trait AccrualClient: Send + Sync {
    fn fetch_status<'a>(&'a self, number: &'a str) -> BoxFuture<'a, AccrualOutcome>;
}

impl<T> AccrualClient for Arc<T>
where
    T: AccrualClient + ?Sized,
{
    fn fetch_status<'a>(&'a self, number: &'a str) -> BoxFuture<'a, AccrualOutcome> {
        (**self).fetch_status(number)
    }
}
