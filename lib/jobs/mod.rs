mod balance;
mod order;
pub mod throttle;

pub use balance::BalanceJob;
pub use order::OrderJob;
pub use throttle::Throttle;

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;

use crate::accrual::{AccrualError, AccrualOutcome};
use crate::ledger::{ErrorKind, LedgerError, Order, Points, SweepReport, Transition};
use crate::server::monitoring::{EngineMetrics, ENGINE_METRICS};

/// Capabilities the job system needs from the ledger service.
///
/// Every storage-backed method has already been through the retry layer, so an error here is
/// terminal for the current attempt.
pub trait LedgerService: Send + Sync {
    fn claim_new_orders<'a>(&'a self, limit: i64) -> BoxFuture<'a, Result<Vec<Order>, LedgerError>>;

    fn reclaim_stale_orders<'a>(
        &'a self,
        limit: i64,
        lease: Duration,
    ) -> BoxFuture<'a, Result<Vec<Order>, LedgerError>>;

    fn fetch_accrual<'a>(&'a self, number: &'a str) -> BoxFuture<'a, AccrualOutcome>;

    fn mark_processed<'a>(
        &'a self,
        order: &'a Order,
        points: Points,
    ) -> BoxFuture<'a, Result<Transition, LedgerError>>;

    fn mark_invalid<'a>(&'a self, order: &'a Order) -> BoxFuture<'a, Result<Transition, LedgerError>>;

    /// Appends the order's accrual entry if it is missing and recomputes the owner's balance.
    fn post_accrual<'a>(&'a self, order: &'a Order) -> BoxFuture<'a, Result<u64, LedgerError>>;

    fn sweep_missing_accruals<'a>(&'a self) -> BoxFuture<'a, Result<SweepReport, LedgerError>>;

    fn metrics(&self) -> Option<&'static EngineMetrics> {
        ENGINE_METRICS.get()
    }
}

impl<T> LedgerService for Arc<T>
where
    T: LedgerService + ?Sized,
{
    fn claim_new_orders<'a>(&'a self, limit: i64) -> BoxFuture<'a, Result<Vec<Order>, LedgerError>> {
        (**self).claim_new_orders(limit)
    }

    fn reclaim_stale_orders<'a>(
        &'a self,
        limit: i64,
        lease: Duration,
    ) -> BoxFuture<'a, Result<Vec<Order>, LedgerError>> {
        (**self).reclaim_stale_orders(limit, lease)
    }

    fn fetch_accrual<'a>(&'a self, number: &'a str) -> BoxFuture<'a, AccrualOutcome> {
        (**self).fetch_accrual(number)
    }

    fn mark_processed<'a>(
        &'a self,
        order: &'a Order,
        points: Points,
    ) -> BoxFuture<'a, Result<Transition, LedgerError>> {
        (**self).mark_processed(order, points)
    }

    fn mark_invalid<'a>(&'a self, order: &'a Order) -> BoxFuture<'a, Result<Transition, LedgerError>> {
        (**self).mark_invalid(order)
    }

    fn post_accrual<'a>(&'a self, order: &'a Order) -> BoxFuture<'a, Result<u64, LedgerError>> {
        (**self).post_accrual(order)
    }

    fn sweep_missing_accruals<'a>(&'a self) -> BoxFuture<'a, Result<SweepReport, LedgerError>> {
        (**self).sweep_missing_accruals()
    }

    fn metrics(&self) -> Option<&'static EngineMetrics> {
        (**self).metrics()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("accrual lookup for order {number} failed: {source}")]
    Accrual {
        number: String,
        #[source]
        source: AccrualError,
    },

    #[error("ledger update for order {number} failed: {source}")]
    Ledger {
        number: String,
        #[source]
        source: LedgerError,
    },

    #[error("missing-accrual sweep failed: {0}")]
    Sweep(#[source] LedgerError),
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::Accrual { .. } => ErrorKind::Transient,
            JobError::Ledger { source, .. } | JobError::Sweep(source) => source.kind(),
        }
    }
}

/// Unit of work carried by the job queue.
#[derive(Debug, Clone)]
pub enum Job {
    Order(OrderJob),
    Balance(BalanceJob),
}

impl Job {
    pub fn order(order: Order, throttle: Arc<Throttle>) -> Self {
        Job::Order(OrderJob::new(order, throttle))
    }

    pub fn balance() -> Self {
        Job::Balance(BalanceJob)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Job::Order(_) => "order",
            Job::Balance(_) => "balance",
        }
    }

    pub async fn process(&self, svc: &dyn LedgerService) -> Result<(), JobError> {
        match self {
            Job::Order(job) => job.process(svc).await,
            Job::Balance(job) => job.process(svc).await,
        }
    }
}
