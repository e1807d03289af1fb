pub mod classify;
pub mod pg;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use diesel::result::Error as DieselError;
use diesel_async::pooled_connection::deadpool::PoolError;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::ledger::{
    Balance, LedgerError, Order, Points, SweepReport, Transition, UserId, Withdrawal,
    WithdrawalRequest,
};

pub use classify::{Classification, ErrorClassifier, PgErrorClassifier};
pub use pg::PgLedgerStore;
pub use retry::{RetryPolicy, RetryTerminal};

/// Raw failure of one storage attempt, before classification.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] DieselError),

    #[error("connection pool error: {0}")]
    Pool(#[from] PoolError),

    /// A business rule rejected the operation inside a transaction; never retried.
    #[error(transparent)]
    Rejected(LedgerError),
}

/// Ledger persistence used by the service and, through it, by jobs and pollers.
///
/// Every method is one logical operation wrapped in the retry/classification layer, so
/// callers only ever see domain errors.
pub trait LedgerStore: Send + Sync {
    fn register_user<'a>(&'a self, login: &'a str) -> BoxFuture<'a, Result<UserId, LedgerError>>;

    /// Inserts a `NEW` order, distinguishing "already yours" from "someone else's".
    fn create_order<'a>(
        &'a self,
        user_id: UserId,
        number: &'a str,
    ) -> BoxFuture<'a, Result<(), LedgerError>>;

    fn list_orders<'a>(&'a self, user_id: UserId) -> BoxFuture<'a, Result<Vec<Order>, LedgerError>>;

    /// Claims up to `limit` `NEW` orders (oldest first) and flips them to `PROCESSING`.
    fn claim_new_orders<'a>(&'a self, limit: i64) -> BoxFuture<'a, Result<Vec<Order>, LedgerError>>;

    /// Re-stamps up to `limit` `PROCESSING` orders whose lease is older than `lease` or unset.
    fn reclaim_stale_orders<'a>(
        &'a self,
        limit: i64,
        lease: Duration,
    ) -> BoxFuture<'a, Result<Vec<Order>, LedgerError>>;

    fn mark_processed<'a>(
        &'a self,
        number: &'a str,
        points: Points,
    ) -> BoxFuture<'a, Result<Transition, LedgerError>>;

    fn mark_invalid<'a>(&'a self, number: &'a str) -> BoxFuture<'a, Result<Transition, LedgerError>>;

    /// Appends the accrual entry for a processed order and recomputes the owner's balance.
    ///
    /// Returns the number of entries inserted (0 when the entry already existed).
    fn post_accrual<'a>(
        &'a self,
        user_id: UserId,
        number: &'a str,
    ) -> BoxFuture<'a, Result<u64, LedgerError>>;

    fn sweep_missing_accruals<'a>(&'a self) -> BoxFuture<'a, Result<SweepReport, LedgerError>>;

    fn get_balance<'a>(&'a self, user_id: UserId) -> BoxFuture<'a, Result<Balance, LedgerError>>;

    /// Checks funds and appends a withdrawal entry under a per-user row lock.
    ///
    /// A repeat of an already recorded reference with the same amount returns the current
    /// balance and writes nothing.
    fn record_withdrawal<'a>(
        &'a self,
        user_id: UserId,
        request: &'a WithdrawalRequest,
    ) -> BoxFuture<'a, Result<Balance, LedgerError>>;

    fn list_withdrawals<'a>(
        &'a self,
        user_id: UserId,
    ) -> BoxFuture<'a, Result<Vec<Withdrawal>, LedgerError>>;
}

impl<T> LedgerStore for Arc<T>
where
    T: LedgerStore + ?Sized,
{
    fn register_user<'a>(&'a self, login: &'a str) -> BoxFuture<'a, Result<UserId, LedgerError>> {
        (**self).register_user(login)
    }

    fn create_order<'a>(
        &'a self,
        user_id: UserId,
        number: &'a str,
    ) -> BoxFuture<'a, Result<(), LedgerError>> {
        (**self).create_order(user_id, number)
    }

    fn list_orders<'a>(&'a self, user_id: UserId) -> BoxFuture<'a, Result<Vec<Order>, LedgerError>> {
        (**self).list_orders(user_id)
    }

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

    fn mark_processed<'a>(
        &'a self,
        number: &'a str,
        points: Points,
    ) -> BoxFuture<'a, Result<Transition, LedgerError>> {
        (**self).mark_processed(number, points)
    }

    fn mark_invalid<'a>(&'a self, number: &'a str) -> BoxFuture<'a, Result<Transition, LedgerError>> {
        (**self).mark_invalid(number)
    }

    fn post_accrual<'a>(
        &'a self,
        user_id: UserId,
        number: &'a str,
    ) -> BoxFuture<'a, Result<u64, LedgerError>> {
        (**self).post_accrual(user_id, number)
    }

    fn sweep_missing_accruals<'a>(&'a self) -> BoxFuture<'a, Result<SweepReport, LedgerError>> {
        (**self).sweep_missing_accruals()
    }

    fn get_balance<'a>(&'a self, user_id: UserId) -> BoxFuture<'a, Result<Balance, LedgerError>> {
        (**self).get_balance(user_id)
    }

    fn record_withdrawal<'a>(
        &'a self,
        user_id: UserId,
        request: &'a WithdrawalRequest,
    ) -> BoxFuture<'a, Result<Balance, LedgerError>> {
        (**self).record_withdrawal(user_id, request)
    }

    fn list_withdrawals<'a>(
        &'a self,
        user_id: UserId,
    ) -> BoxFuture<'a, Result<Vec<Withdrawal>, LedgerError>> {
        (**self).list_withdrawals(user_id)
    }
}
