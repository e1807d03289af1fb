use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::{Array, BigInt, Double, Text};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::classify::{Classification, ErrorClassifier, PgErrorClassifier};
use super::retry::{run_with_retry, RetryPolicy};
use super::{LedgerStore, StoreError};
use crate::db::models::{BalanceRow, NewOrder, NewUser, OrderRecord, UserIdRow};
use crate::db::schema::{user_balance_entries, user_orders, user_point_balances, users};
use crate::db::DbPool;
use crate::ledger::{
    Balance, EntryKind, ErrorKind, LedgerError, Order, OrderStatus, Points, SweepReport,
    Transition, UserId, Withdrawal, WithdrawalRequest,
};
use crate::server::monitoring::ENGINE_METRICS;

const ORDER_COLUMNS: &str = "u.id, u.user_id, u.order_number, u.status, u.points_awarded, \
                             u.created_at, u.processing_started_at";

// Oldest `NEW` rows first; rows locked by a concurrent claimer are skipped, never waited on.
const CLAIM_NEW_ORDERS_SQL: &str = "WITH ts AS (SELECT now() AS ts) \
     UPDATE user_orders u \
     SET status = 'PROCESSING', processing_started_at = ts.ts \
     FROM ts \
     WHERE u.id IN ( \
         SELECT id FROM user_orders \
         WHERE status = 'NEW' \
         ORDER BY created_at ASC \
         LIMIT $1 \
         FOR UPDATE SKIP LOCKED \
     ) \
     RETURNING ";

const RECLAIM_STALE_ORDERS_SQL: &str = "WITH ts AS (SELECT now() AS ts) \
     UPDATE user_orders u \
     SET processing_started_at = ts.ts \
     FROM ts \
     WHERE u.status = 'PROCESSING' AND u.id IN ( \
         SELECT id FROM user_orders \
         WHERE status = 'PROCESSING' \
           AND (processing_started_at IS NULL \
                OR processing_started_at < now() - make_interval(secs => $2)) \
         ORDER BY processing_started_at ASC NULLS FIRST, created_at ASC \
         LIMIT $1 \
         FOR UPDATE SKIP LOCKED \
     ) \
     RETURNING ";

const POST_ACCRUAL_SQL: &str = "INSERT INTO user_balance_entries \
         (user_id, entry_type, amount_points, order_id) \
     SELECT uo.user_id, 'accrual', uo.points_awarded, uo.id \
     FROM user_orders uo \
     WHERE uo.status = 'PROCESSED' \
       AND uo.points_awarded IS NOT NULL \
       AND uo.user_id = $1 \
       AND uo.order_number = $2 \
     ON CONFLICT (order_id, entry_type) DO NOTHING";

const SWEEP_CANDIDATE_USERS_SQL: &str = "SELECT DISTINCT uo.user_id \
     FROM user_orders uo \
     LEFT JOIN user_balance_entries ube \
         ON ube.order_id = uo.id AND ube.entry_type = 'accrual' \
     WHERE uo.status = 'PROCESSED' \
       AND uo.points_awarded IS NOT NULL \
       AND ube.id IS NULL \
     ORDER BY uo.user_id";

// Restricted to users whose balance rows the sweep already holds locked.
const SWEEP_MISSING_ACCRUALS_SQL: &str = "WITH inserted AS ( \
         INSERT INTO user_balance_entries (user_id, entry_type, amount_points, order_id) \
         SELECT uo.user_id, 'accrual', uo.points_awarded, uo.id \
         FROM user_orders uo \
         LEFT JOIN user_balance_entries ube \
             ON ube.order_id = uo.id AND ube.entry_type = 'accrual' \
         WHERE uo.status = 'PROCESSED' \
           AND uo.points_awarded IS NOT NULL \
           AND ube.id IS NULL \
           AND uo.user_id = ANY($1) \
         ON CONFLICT (order_id, entry_type) DO NOTHING \
         RETURNING user_id \
     ) \
     SELECT user_id FROM inserted";

const RECOMPUTE_BALANCE_SQL: &str = "INSERT INTO user_point_balances \
         (user_id, balance, withdrawal, updated_at) \
     SELECT $1, \
         (COALESCE(SUM(amount_points) FILTER (WHERE entry_type = 'accrual'), 0) \
          - COALESCE(SUM(amount_points) FILTER (WHERE entry_type = 'withdrawal'), 0))::BIGINT, \
         COALESCE(SUM(amount_points) FILTER (WHERE entry_type = 'withdrawal'), 0)::BIGINT, \
         now() \
     FROM user_balance_entries \
     WHERE user_id = $1 \
     ON CONFLICT (user_id) DO UPDATE \
     SET balance = EXCLUDED.balance, \
         withdrawal = EXCLUDED.withdrawal, \
         updated_at = EXCLUDED.updated_at \
     RETURNING balance, withdrawal";

const ENSURE_BALANCE_ROW_SQL: &str = "INSERT INTO user_point_balances (user_id) VALUES ($1) \
     ON CONFLICT (user_id) DO NOTHING";

const LOCK_BALANCE_ROW_SQL: &str = "SELECT balance, withdrawal FROM user_point_balances \
     WHERE user_id = $1 FOR UPDATE";

/// Postgres-backed ledger store.
///
/// Each public operation is one attempt closure run through [`run_with_retry`]; the classifier
/// decides which failures get another attempt and what domain error the caller finally sees.
pub struct PgLedgerStore {
    pool: DbPool,
    classifier: Arc<dyn ErrorClassifier>,
    retry_policy: RetryPolicy,
    cancel: CancellationToken,
}

impl PgLedgerStore {
    pub fn new(pool: DbPool, retry_policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self::with_classifier(
            pool,
            Arc::new(PgErrorClassifier::default()),
            retry_policy,
            cancel,
        )
    }

    pub fn with_classifier(
        pool: DbPool,
        classifier: Arc<dyn ErrorClassifier>,
        retry_policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pool,
            classifier,
            retry_policy,
            cancel,
        }
    }

    async fn run<T, F, Fut>(&self, op: &'static str, mut attempt: F) -> Result<T, LedgerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let classifier = &self.classifier;
        let result = run_with_retry(
            &self.retry_policy,
            &self.cancel,
            op_seed(op),
            |_| attempt(),
            |err| {
                let retryable = classifier.classify(err) == Classification::Retriable;
                if retryable {
                    debug!(event = "storage_attempt_failed", op, error = %err, "retrying storage operation");
                }
                retryable
            },
        )
        .await;

        match result {
            Ok((value, attempts)) => {
                record_retries(attempts);
                Ok(value)
            }
            Err(terminal) => {
                record_retries(terminal.attempts);
                if terminal.cancelled {
                    return Err(LedgerError::Unavailable(format!(
                        "{op}: cancelled while backing off: {}",
                        terminal.error
                    )));
                }

                let err = classifier.translate(op, terminal.error);
                match err.kind() {
                    ErrorKind::Conflict | ErrorKind::NotYetAvailable => {
                        debug!(event = "storage_op_rejected", op, error = %err);
                    }
                    _ => {
                        warn!(
                            event = "storage_op_failed",
                            op,
                            attempts = terminal.attempts,
                            exhausted_retryable = terminal.exhausted_retryable,
                            error = %err,
                            "storage operation failed"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    /// Conditional status update. Applies only while the order sits in a legal source status
    /// for `next`; anything else reports [`Transition::Skipped`].
    async fn settle(
        &self,
        op: &'static str,
        number: &str,
        next: OrderStatus,
        points: Option<Points>,
    ) -> Result<Transition, LedgerError> {
        let sources: Vec<&'static str> = OrderStatus::sources_of(next)
            .into_iter()
            .map(OrderStatus::as_db_str)
            .collect();
        let sources = &sources;
        self.run(op, || async move {
            let mut conn = self.pool.get().await?;
            let target = user_orders::table
                .filter(user_orders::order_number.eq(number))
                .filter(user_orders::status.eq_any(sources.clone()));
            let rows = match points {
                Some(points) => {
                    diesel::update(target)
                        .set((
                            user_orders::status.eq(next.as_db_str()),
                            user_orders::points_awarded.eq(Some(points.hundredths())),
                        ))
                        .execute(&mut conn)
                        .await?
                }
                None => {
                    diesel::update(target)
                        .set(user_orders::status.eq(next.as_db_str()))
                        .execute(&mut conn)
                        .await?
                }
            };
            Ok::<_, StoreError>(Transition::from_rows_affected(rows))
        })
        .await
    }

    /// Resolves a unique-key race on order insert into the matching ownership error.
    async fn ownership_conflict(&self, user_id: UserId, number: &str) -> LedgerError {
        let owner = self
            .run("order_owner", || async move {
                let mut conn = self.pool.get().await?;
                let owner = user_orders::table
                    .filter(user_orders::order_number.eq(number))
                    .select(user_orders::user_id)
                    .first::<i64>(&mut conn)
                    .await
                    .optional()?;
                Ok::<_, StoreError>(owner)
            })
            .await;

        match owner {
            Ok(Some(owner)) if owner == user_id => {
                LedgerError::OrderAlreadySubmitted(number.to_string())
            }
            Ok(Some(_)) => LedgerError::OrderOwnedByAnotherUser(number.to_string()),
            Ok(None) => LedgerError::Internal(format!(
                "order {number} conflicted on insert but has no owner"
            )),
            Err(err) => err,
        }
    }
}

impl LedgerStore for PgLedgerStore {
    fn register_user<'a>(&'a self, login: &'a str) -> BoxFuture<'a, Result<UserId, LedgerError>> {
        Box::pin(async move {
            self.run("register_user", || async move {
                let mut conn = self.pool.get().await?;
                let id = diesel::insert_into(users::table)
                    .values(NewUser { login_name: login })
                    .returning(users::id)
                    .get_result::<i64>(&mut conn)
                    .await?;
                Ok::<_, StoreError>(id)
            })
            .await
        })
    }

    fn create_order<'a>(
        &'a self,
        user_id: UserId,
        number: &'a str,
    ) -> BoxFuture<'a, Result<(), LedgerError>> {
        Box::pin(async move {
            let inserted = self
                .run("create_order", || async move {
                    let mut conn = self.pool.get().await?;
                    conn.build_transaction()
                        .serializable()
                        .run(|conn| {
                            async move {
                                let owner = user_orders::table
                                    .filter(user_orders::order_number.eq(number))
                                    .select(user_orders::user_id)
                                    .first::<i64>(conn)
                                    .await
                                    .optional()?;
                                match owner {
                                    Some(owner) if owner == user_id => {
                                        return Err(StoreError::Rejected(
                                            LedgerError::OrderAlreadySubmitted(number.to_string()),
                                        ));
                                    }
                                    Some(_) => {
                                        return Err(StoreError::Rejected(
                                            LedgerError::OrderOwnedByAnotherUser(
                                                number.to_string(),
                                            ),
                                        ));
                                    }
                                    None => {}
                                }

                                let user_exists = users::table
                                    .find(user_id)
                                    .select(users::id)
                                    .first::<i64>(conn)
                                    .await
                                    .optional()?
                                    .is_some();
                                if !user_exists {
                                    return Err(StoreError::Rejected(LedgerError::NotFound(
                                        format!("user {user_id}"),
                                    )));
                                }

                                diesel::insert_into(user_orders::table)
                                    .values(NewOrder {
                                        user_id,
                                        order_number: number,
                                    })
                                    .execute(conn)
                                    .await?;
                                Ok::<_, StoreError>(())
                            }
                            .scope_boxed()
                        })
                        .await
                })
                .await;

            match inserted {
                Err(LedgerError::AlreadyExists(_)) => {
                    Err(self.ownership_conflict(user_id, number).await)
                }
                other => other,
            }
        })
    }

    fn list_orders<'a>(&'a self, user_id: UserId) -> BoxFuture<'a, Result<Vec<Order>, LedgerError>> {
        Box::pin(async move {
            let records = self
                .run("list_orders", || async move {
                    let mut conn = self.pool.get().await?;
                    let records = user_orders::table
                        .filter(user_orders::user_id.eq(user_id))
                        .order(user_orders::created_at.desc())
                        .select(OrderRecord::as_select())
                        .load::<OrderRecord>(&mut conn)
                        .await?;
                    Ok::<_, StoreError>(records)
                })
                .await?;
            into_orders(records)
        })
    }

    fn claim_new_orders<'a>(&'a self, limit: i64) -> BoxFuture<'a, Result<Vec<Order>, LedgerError>> {
        Box::pin(async move {
            let sql = format!("{CLAIM_NEW_ORDERS_SQL}{ORDER_COLUMNS}");
            let sql = sql.as_str();
            let records = self
                .run("claim_new_orders", || async move {
                    let mut conn = self.pool.get().await?;
                    conn.build_transaction()
                        .read_committed()
                        .run(|conn| {
                            async move {
                                let records = sql_query(sql)
                                    .bind::<BigInt, _>(limit)
                                    .load::<OrderRecord>(conn)
                                    .await?;
                                Ok::<_, StoreError>(records)
                            }
                            .scope_boxed()
                        })
                        .await
                })
                .await?;

            let mut orders = into_orders(records)?;
            orders.sort_by_key(|order| order.created_at);
            Ok(orders)
        })
    }

    fn reclaim_stale_orders<'a>(
        &'a self,
        limit: i64,
        lease: Duration,
    ) -> BoxFuture<'a, Result<Vec<Order>, LedgerError>> {
        Box::pin(async move {
            let sql = format!("{RECLAIM_STALE_ORDERS_SQL}{ORDER_COLUMNS}");
            let sql = sql.as_str();
            let lease_secs = lease.as_secs_f64();
            let records = self
                .run("reclaim_stale_orders", || async move {
                    let mut conn = self.pool.get().await?;
                    conn.build_transaction()
                        .read_committed()
                        .run(|conn| {
                            async move {
                                let records = sql_query(sql)
                                    .bind::<BigInt, _>(limit)
                                    .bind::<Double, _>(lease_secs)
                                    .load::<OrderRecord>(conn)
                                    .await?;
                                Ok::<_, StoreError>(records)
                            }
                            .scope_boxed()
                        })
                        .await
                })
                .await?;

            let mut orders = into_orders(records)?;
            orders.sort_by_key(|order| order.created_at);
            Ok(orders)
        })
    }

    fn mark_processed<'a>(
        &'a self,
        number: &'a str,
        points: Points,
    ) -> BoxFuture<'a, Result<Transition, LedgerError>> {
        Box::pin(self.settle("mark_processed", number, OrderStatus::Processed, Some(points)))
    }

    fn mark_invalid<'a>(&'a self, number: &'a str) -> BoxFuture<'a, Result<Transition, LedgerError>> {
        Box::pin(self.settle("mark_invalid", number, OrderStatus::Invalid, None))
    }

    fn post_accrual<'a>(
        &'a self,
        user_id: UserId,
        number: &'a str,
    ) -> BoxFuture<'a, Result<u64, LedgerError>> {
        Box::pin(async move {
            self.run("post_accrual", || async move {
                let mut conn = self.pool.get().await?;
                conn.build_transaction()
                    .read_committed()
                    .run(|conn| {
                        async move {
                            lock_balance_row(conn, user_id).await?;
                            let inserted = sql_query(POST_ACCRUAL_SQL)
                                .bind::<BigInt, _>(user_id)
                                .bind::<Text, _>(number)
                                .execute(conn)
                                .await?;
                            recompute_in(conn, user_id).await?;
                            Ok::<_, StoreError>(inserted as u64)
                        }
                        .scope_boxed()
                    })
                    .await
            })
            .await
        })
    }

    fn sweep_missing_accruals<'a>(&'a self) -> BoxFuture<'a, Result<SweepReport, LedgerError>> {
        Box::pin(async move {
            self.run("sweep_missing_accruals", || async move {
                let mut conn = self.pool.get().await?;
                conn.build_transaction()
                    .read_committed()
                    .run(|conn| {
                        async move {
                            let candidates: BTreeSet<UserId> =
                                sql_query(SWEEP_CANDIDATE_USERS_SQL)
                                    .load::<UserIdRow>(conn)
                                    .await?
                                    .into_iter()
                                    .map(|row| row.user_id)
                                    .collect();
                            if candidates.is_empty() {
                                return Ok::<_, StoreError>(SweepReport::default());
                            }
                            // Locked in ascending user order.
                            for user_id in &candidates {
                                lock_balance_row(conn, *user_id).await?;
                            }

                            let locked: Vec<UserId> = candidates.into_iter().collect();
                            let rows = sql_query(SWEEP_MISSING_ACCRUALS_SQL)
                                .bind::<Array<BigInt>, _>(locked)
                                .load::<UserIdRow>(conn)
                                .await?;
                            let users: BTreeSet<UserId> =
                                rows.iter().map(|row| row.user_id).collect();
                            for user_id in &users {
                                recompute_in(conn, *user_id).await?;
                            }
                            Ok::<_, StoreError>(SweepReport {
                                entries_inserted: rows.len() as u64,
                                users_recomputed: users.into_iter().collect(),
                            })
                        }
                        .scope_boxed()
                    })
                    .await
            })
            .await
        })
    }

    fn get_balance<'a>(&'a self, user_id: UserId) -> BoxFuture<'a, Result<Balance, LedgerError>> {
        Box::pin(async move {
            self.run("get_balance", || async move {
                let mut conn = self.pool.get().await?;
                sql_query(ENSURE_BALANCE_ROW_SQL)
                    .bind::<BigInt, _>(user_id)
                    .execute(&mut conn)
                    .await?;
                let (current, withdrawn) = user_point_balances::table
                    .find(user_id)
                    .select((user_point_balances::balance, user_point_balances::withdrawal))
                    .first::<(i64, i64)>(&mut conn)
                    .await?;
                Ok::<_, StoreError>(Balance {
                    current: Points::from_hundredths(current),
                    withdrawn: Points::from_hundredths(withdrawn),
                })
            })
            .await
        })
    }

    fn record_withdrawal<'a>(
        &'a self,
        user_id: UserId,
        request: &'a WithdrawalRequest,
    ) -> BoxFuture<'a, Result<Balance, LedgerError>> {
        Box::pin(async move {
            self.run("record_withdrawal", || async move {
                let mut conn = self.pool.get().await?;
                conn.build_transaction()
                    .read_committed()
                    .run(|conn| {
                        async move {
                            let locked = lock_balance_row(conn, user_id).await?;

                            // A retry after a lost COMMIT acknowledgement lands here.
                            let recorded = user_balance_entries::table
                                .filter(user_balance_entries::user_id.eq(user_id))
                                .filter(
                                    user_balance_entries::entry_type
                                        .eq(EntryKind::Withdrawal.as_db_str()),
                                )
                                .filter(
                                    user_balance_entries::withdrawal_ref
                                        .eq(request.order_number.as_str()),
                                )
                                .select(user_balance_entries::amount_points)
                                .first::<i64>(conn)
                                .await
                                .optional()?;
                            match recorded {
                                Some(amount) if amount == request.amount.hundredths() => {
                                    return Ok(Balance::from(locked));
                                }
                                Some(_) => {
                                    return Err(StoreError::Rejected(LedgerError::AlreadyExists(
                                        format!("withdrawal {}", request.order_number),
                                    )));
                                }
                                None => {}
                            }

                            let available = Points::from_hundredths(locked.balance);
                            if available < request.amount {
                                return Err(StoreError::Rejected(
                                    LedgerError::InsufficientBalance {
                                        requested: request.amount,
                                        available,
                                    },
                                ));
                            }

                            diesel::insert_into(user_balance_entries::table)
                                .values((
                                    user_balance_entries::user_id.eq(user_id),
                                    user_balance_entries::entry_type
                                        .eq(EntryKind::Withdrawal.as_db_str()),
                                    user_balance_entries::amount_points
                                        .eq(request.amount.hundredths()),
                                    user_balance_entries::withdrawal_ref
                                        .eq(Some(request.order_number.as_str())),
                                ))
                                .execute(conn)
                                .await?;
                            let balance = recompute_in(conn, user_id).await?;
                            Ok::<_, StoreError>(balance)
                        }
                        .scope_boxed()
                    })
                    .await
            })
            .await
        })
    }

    fn list_withdrawals<'a>(
        &'a self,
        user_id: UserId,
    ) -> BoxFuture<'a, Result<Vec<Withdrawal>, LedgerError>> {
        Box::pin(async move {
            let rows = self
                .run("list_withdrawals", || async move {
                    let mut conn = self.pool.get().await?;
                    let rows = user_balance_entries::table
                        .filter(user_balance_entries::user_id.eq(user_id))
                        .filter(
                            user_balance_entries::entry_type.eq(EntryKind::Withdrawal.as_db_str()),
                        )
                        .order(user_balance_entries::posted_at.desc())
                        .select((
                            user_balance_entries::withdrawal_ref,
                            user_balance_entries::amount_points,
                            user_balance_entries::posted_at,
                        ))
                        .load::<(Option<String>, i64, DateTime<Utc>)>(&mut conn)
                        .await?;
                    Ok::<_, StoreError>(rows)
                })
                .await?;

            Ok(rows
                .into_iter()
                .map(|(reference, amount, posted_at)| Withdrawal {
                    order_number: reference.unwrap_or_default(),
                    amount: Points::from_hundredths(amount),
                    processed_at: posted_at,
                })
                .collect())
        })
    }
}

/// Creates the user's balance row if missing and locks it until the transaction ends.
///
/// Every transaction that appends entries takes this lock before its insert. Under read
/// committed the recompute that follows then sees every entry the previous holder committed.
async fn lock_balance_row(
    conn: &mut AsyncPgConnection,
    user_id: UserId,
) -> Result<BalanceRow, diesel::result::Error> {
    sql_query(ENSURE_BALANCE_ROW_SQL)
        .bind::<BigInt, _>(user_id)
        .execute(conn)
        .await?;
    sql_query(LOCK_BALANCE_ROW_SQL)
        .bind::<BigInt, _>(user_id)
        .get_result::<BalanceRow>(conn)
        .await
}

/// Rewrites the materialized balance from the entry log. Callers hold the row lock.
async fn recompute_in(
    conn: &mut AsyncPgConnection,
    user_id: UserId,
) -> Result<Balance, diesel::result::Error> {
    let row = sql_query(RECOMPUTE_BALANCE_SQL)
        .bind::<BigInt, _>(user_id)
        .get_result::<BalanceRow>(conn)
        .await?;
    Ok(Balance::from(row))
}

fn into_orders(records: Vec<OrderRecord>) -> Result<Vec<Order>, LedgerError> {
    records.into_iter().map(Order::try_from).collect()
}

fn record_retries(attempts: u32) {
    let retries = attempts.saturating_sub(1);
    if retries == 0 {
        return;
    }
    if let Some(metrics) = ENGINE_METRICS.get() {
        metrics.storage_retries_total.inc_by(u64::from(retries));
    }
}

/// FNV-1a over the operation name, so each operation gets its own jitter sequence.
fn op_seed(op: &str) -> u64 {
    op.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}
