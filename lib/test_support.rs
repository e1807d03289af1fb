use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::accrual::{AccrualClient, AccrualOutcome};
use crate::jobs::LedgerService;
use crate::ledger::{
    Balance, EntryKind, LedgerError, Order, OrderStatus, Points, SweepReport, Transition, UserId,
    Withdrawal, WithdrawalRequest,
};
use crate::storage::LedgerStore;

pub(crate) fn processing_order(id: i64, user_id: UserId, number: &str) -> Order {
    Order {
        id,
        user_id,
        number: number.to_string(),
        status: OrderStatus::Processing,
        points_awarded: None,
        created_at: Utc::now(),
        processing_started_at: Some(Utc::now()),
    }
}

/// One recorded call against [`MockLedgerService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ServiceCall {
    ClaimNew(i64),
    Reclaim(i64, Duration),
    FetchAccrual(String),
    MarkProcessed(String, Points),
    MarkInvalid(String),
    PostAccrual(String),
    Sweep,
}

/// Scripted ledger service. Empty scripts fall back to the quiet outcome for each call.
#[derive(Default)]
pub(crate) struct MockLedgerService {
    accrual: Mutex<VecDeque<AccrualOutcome>>,
    claims: Mutex<VecDeque<Result<Vec<Order>, LedgerError>>>,
    reclaims: Mutex<VecDeque<Result<Vec<Order>, LedgerError>>>,
    transitions: Mutex<VecDeque<Result<Transition, LedgerError>>>,
    posts: Mutex<VecDeque<Result<u64, LedgerError>>>,
    sweeps: Mutex<VecDeque<Result<SweepReport, LedgerError>>>,
    panicking_sweeps: AtomicU32,
    calls: Mutex<Vec<ServiceCall>>,
}

impl MockLedgerService {
    pub(crate) fn with_accrual(self, outcomes: Vec<AccrualOutcome>) -> Self {
        *self.accrual.lock().expect("accrual mutex poisoned") = outcomes.into();
        self
    }

    pub(crate) fn with_claims(self, claims: Vec<Result<Vec<Order>, LedgerError>>) -> Self {
        *self.claims.lock().expect("claims mutex poisoned") = claims.into();
        self
    }

    pub(crate) fn with_reclaims(self, reclaims: Vec<Result<Vec<Order>, LedgerError>>) -> Self {
        *self.reclaims.lock().expect("reclaims mutex poisoned") = reclaims.into();
        self
    }

    pub(crate) fn with_transitions(self, transitions: Vec<Result<Transition, LedgerError>>) -> Self {
        *self.transitions.lock().expect("transitions mutex poisoned") = transitions.into();
        self
    }

    pub(crate) fn with_post_results(self, posts: Vec<Result<u64, LedgerError>>) -> Self {
        *self.posts.lock().expect("posts mutex poisoned") = posts.into();
        self
    }

    pub(crate) fn with_sweeps(self, sweeps: Vec<Result<SweepReport, LedgerError>>) -> Self {
        *self.sweeps.lock().expect("sweeps mutex poisoned") = sweeps.into();
        self
    }

    /// The next `count` sweeps panic instead of returning.
    pub(crate) fn with_panicking_sweeps(self, count: u32) -> Self {
        self.panicking_sweeps.store(count, Ordering::SeqCst);
        self
    }

    pub(crate) fn calls(&self) -> Vec<ServiceCall> {
        self.calls.lock().expect("calls mutex poisoned").clone()
    }

    pub(crate) fn count_calls(&self, predicate: impl Fn(&ServiceCall) -> bool) -> usize {
        self.calls
            .lock()
            .expect("calls mutex poisoned")
            .iter()
            .filter(|call| predicate(call))
            .count()
    }

    fn record(&self, call: ServiceCall) {
        self.calls.lock().expect("calls mutex poisoned").push(call);
    }
}

fn next_or<T>(queue: &Mutex<VecDeque<T>>, fallback: impl FnOnce() -> T) -> T {
    queue
        .lock()
        .expect("script mutex poisoned")
        .pop_front()
        .unwrap_or_else(fallback)
}

impl LedgerService for MockLedgerService {
    fn claim_new_orders<'a>(&'a self, limit: i64) -> BoxFuture<'a, Result<Vec<Order>, LedgerError>> {
        Box::pin(async move {
            self.record(ServiceCall::ClaimNew(limit));
            next_or(&self.claims, || Ok(Vec::new()))
        })
    }

    fn reclaim_stale_orders<'a>(
        &'a self,
        limit: i64,
        lease: Duration,
    ) -> BoxFuture<'a, Result<Vec<Order>, LedgerError>> {
        Box::pin(async move {
            self.record(ServiceCall::Reclaim(limit, lease));
            next_or(&self.reclaims, || Ok(Vec::new()))
        })
    }

    fn fetch_accrual<'a>(&'a self, number: &'a str) -> BoxFuture<'a, AccrualOutcome> {
        Box::pin(async move {
            self.record(ServiceCall::FetchAccrual(number.to_string()));
            next_or(&self.accrual, || AccrualOutcome::NotRegistered)
        })
    }

    fn mark_processed<'a>(
        &'a self,
        order: &'a Order,
        points: Points,
    ) -> BoxFuture<'a, Result<Transition, LedgerError>> {
        Box::pin(async move {
            self.record(ServiceCall::MarkProcessed(order.number.clone(), points));
            next_or(&self.transitions, || Ok(Transition::Applied))
        })
    }

    fn mark_invalid<'a>(&'a self, order: &'a Order) -> BoxFuture<'a, Result<Transition, LedgerError>> {
        Box::pin(async move {
            self.record(ServiceCall::MarkInvalid(order.number.clone()));
            next_or(&self.transitions, || Ok(Transition::Applied))
        })
    }

    fn post_accrual<'a>(&'a self, order: &'a Order) -> BoxFuture<'a, Result<u64, LedgerError>> {
        Box::pin(async move {
            self.record(ServiceCall::PostAccrual(order.number.clone()));
            next_or(&self.posts, || Ok(1))
        })
    }

    fn sweep_missing_accruals<'a>(&'a self) -> BoxFuture<'a, Result<SweepReport, LedgerError>> {
        Box::pin(async move {
            self.record(ServiceCall::Sweep);
            let panics_left = self.panicking_sweeps.load(Ordering::SeqCst);
            if panics_left > 0 {
                self.panicking_sweeps.store(panics_left - 1, Ordering::SeqCst);
                panic!("scripted sweep panic");
            }
            next_or(&self.sweeps, || Ok(SweepReport::default()))
        })
    }
}

/// Accrual client answering from per-order scripts; unscripted orders are `NotRegistered`.
#[derive(Default)]
pub(crate) struct MockAccrualClient {
    plans: Mutex<HashMap<String, VecDeque<AccrualOutcome>>>,
    call_counts: Mutex<HashMap<String, u32>>,
}

impl MockAccrualClient {
    pub(crate) fn script(&self, number: &str, outcomes: Vec<AccrualOutcome>) {
        self.plans
            .lock()
            .expect("plans mutex poisoned")
            .entry(number.to_string())
            .or_default()
            .extend(outcomes);
    }

    pub(crate) fn calls_for(&self, number: &str) -> u32 {
        *self
            .call_counts
            .lock()
            .expect("call_count mutex poisoned")
            .get(number)
            .unwrap_or(&0)
    }
}

impl AccrualClient for MockAccrualClient {
    fn fetch_status<'a>(&'a self, number: &'a str) -> BoxFuture<'a, AccrualOutcome> {
        Box::pin(async move {
            *self
                .call_counts
                .lock()
                .expect("call_count mutex poisoned")
                .entry(number.to_string())
                .or_insert(0) += 1;

            self.plans
                .lock()
                .expect("plans mutex poisoned")
                .get_mut(number)
                .and_then(|plan| plan.pop_front())
                .unwrap_or(AccrualOutcome::NotRegistered)
        })
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    user_id: UserId,
    kind: EntryKind,
    amount: Points,
    order_id: Option<i64>,
    withdrawal_ref: Option<String>,
    posted_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    logins: Vec<String>,
    orders: Vec<Order>,
    entries: Vec<MemoryEntry>,
    balances: HashMap<UserId, Balance>,
}

impl MemoryState {
    fn user_exists(&self, user_id: UserId) -> bool {
        user_id >= 1 && (user_id as usize) <= self.logins.len()
    }

    fn has_accrual(&self, order_id: i64) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.kind == EntryKind::Accrual && entry.order_id == Some(order_id))
    }

    fn insert_accrual(&mut self, order_index: usize) -> bool {
        let order = &self.orders[order_index];
        let Some(points) = order.points_awarded else {
            return false;
        };
        if order.status != OrderStatus::Processed || self.has_accrual(order.id) {
            return false;
        }
        self.entries.push(MemoryEntry {
            user_id: order.user_id,
            kind: EntryKind::Accrual,
            amount: points,
            order_id: Some(order.id),
            withdrawal_ref: None,
            posted_at: Utc::now(),
        });
        true
    }

    fn computed_balance(&self, user_id: UserId) -> Balance {
        let (mut accrued, mut withdrawn) = (0i64, 0i64);
        for entry in self.entries.iter().filter(|entry| entry.user_id == user_id) {
            match entry.kind {
                EntryKind::Accrual => accrued += entry.amount.hundredths(),
                EntryKind::Withdrawal => withdrawn += entry.amount.hundredths(),
            }
        }
        Balance {
            current: Points::from_hundredths(accrued - withdrawn),
            withdrawn: Points::from_hundredths(withdrawn),
        }
    }

    fn recompute(&mut self, user_id: UserId) -> Balance {
        let balance = self.computed_balance(user_id);
        self.balances.insert(user_id, balance);
        balance
    }

    fn transition(&mut self, number: &str, next: OrderStatus, points: Option<Points>) -> Transition {
        match self.orders.iter_mut().find(|order| order.number == number) {
            Some(order) if order.status.can_transition_to(next) => {
                order.status = next;
                if points.is_some() {
                    order.points_awarded = points;
                }
                Transition::Applied
            }
            _ => Transition::Skipped,
        }
    }
}

/// In-memory [`LedgerStore`] with the same conditional-update and uniqueness rules as Postgres.
#[derive(Default)]
pub(crate) struct MemoryLedgerStore {
    state: Mutex<MemoryState>,
}

impl MemoryLedgerStore {
    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        f(&mut self.state.lock().expect("memory store mutex poisoned"))
    }

    /// Adds an already-processed order plus its accrual entry for `user_id`.
    pub(crate) fn credit(&self, user_id: UserId, number: &str, points: Points) {
        self.with_state(|state| {
            let id = state.orders.len() as i64 + 1;
            state.orders.push(Order {
                id,
                user_id,
                number: number.to_string(),
                status: OrderStatus::Processed,
                points_awarded: Some(points),
                created_at: Utc::now(),
                processing_started_at: Some(Utc::now()),
            });
            let index = state.orders.len() - 1;
            state.insert_accrual(index);
            state.recompute(user_id);
        });
    }

    pub(crate) fn accrual_entries_for(&self, order: &Order) -> usize {
        self.with_state(|state| {
            state
                .entries
                .iter()
                .filter(|entry| entry.kind == EntryKind::Accrual && entry.order_id == Some(order.id))
                .count()
        })
    }

    /// Every materialized balance equals the sum over that user's entries.
    pub(crate) fn balances_match_entries(&self) -> bool {
        self.with_state(|state| {
            state
                .balances
                .iter()
                .all(|(user_id, balance)| *balance == state.computed_balance(*user_id))
        })
    }

    pub(crate) fn order_status(&self, number: &str) -> Option<OrderStatus> {
        self.with_state(|state| {
            state
                .orders
                .iter()
                .find(|order| order.number == number)
                .map(|order| order.status)
        })
    }

    /// Moves every lease stamp `by` into the past.
    pub(crate) fn backdate_leases(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        self.with_state(|state| {
            for order in &mut state.orders {
                if let Some(stamp) = order.processing_started_at {
                    order.processing_started_at = Some(stamp - by);
                }
            }
        });
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn register_user<'a>(&'a self, login: &'a str) -> BoxFuture<'a, Result<UserId, LedgerError>> {
        Box::pin(async move {
            self.with_state(|state| {
                if state.logins.iter().any(|existing| existing == login) {
                    return Err(LedgerError::AlreadyExists(format!("login {login}")));
                }
                state.logins.push(login.to_string());
                Ok(state.logins.len() as UserId)
            })
        })
    }

    fn create_order<'a>(
        &'a self,
        user_id: UserId,
        number: &'a str,
    ) -> BoxFuture<'a, Result<(), LedgerError>> {
        Box::pin(async move {
            self.with_state(|state| {
                if let Some(existing) = state.orders.iter().find(|order| order.number == number) {
                    return Err(if existing.user_id == user_id {
                        LedgerError::OrderAlreadySubmitted(number.to_string())
                    } else {
                        LedgerError::OrderOwnedByAnotherUser(number.to_string())
                    });
                }
                if !state.user_exists(user_id) {
                    return Err(LedgerError::NotFound(format!("user {user_id}")));
                }
                let id = state.orders.len() as i64 + 1;
                state.orders.push(Order {
                    id,
                    user_id,
                    number: number.to_string(),
                    status: OrderStatus::New,
                    points_awarded: None,
                    created_at: Utc::now(),
                    processing_started_at: None,
                });
                Ok(())
            })
        })
    }

    fn list_orders<'a>(&'a self, user_id: UserId) -> BoxFuture<'a, Result<Vec<Order>, LedgerError>> {
        Box::pin(async move {
            Ok(self.with_state(|state| {
                state
                    .orders
                    .iter()
                    .rev()
                    .filter(|order| order.user_id == user_id)
                    .cloned()
                    .collect()
            }))
        })
    }

    fn claim_new_orders<'a>(&'a self, limit: i64) -> BoxFuture<'a, Result<Vec<Order>, LedgerError>> {
        Box::pin(async move {
            Ok(self.with_state(|state| {
                let now = Utc::now();
                state
                    .orders
                    .iter_mut()
                    .filter(|order| order.status == OrderStatus::New)
                    .take(limit.max(0) as usize)
                    .map(|order| {
                        order.status = OrderStatus::Processing;
                        order.processing_started_at = Some(now);
                        order.clone()
                    })
                    .collect()
            }))
        })
    }

    fn reclaim_stale_orders<'a>(
        &'a self,
        limit: i64,
        lease: Duration,
    ) -> BoxFuture<'a, Result<Vec<Order>, LedgerError>> {
        Box::pin(async move {
            let lease = chrono::Duration::from_std(lease)
                .map_err(|err| LedgerError::InvalidPayload(err.to_string()))?;
            Ok(self.with_state(|state| {
                let now = Utc::now();
                let cutoff = now - lease;
                let mut stale: Vec<&mut Order> = state
                    .orders
                    .iter_mut()
                    .filter(|order| {
                        order.status == OrderStatus::Processing
                            && order
                                .processing_started_at
                                .map_or(true, |stamp| stamp < cutoff)
                    })
                    .collect();
                stale.sort_by_key(|order| (order.processing_started_at, order.created_at));
                stale
                    .into_iter()
                    .take(limit.max(0) as usize)
                    .map(|order| {
                        order.processing_started_at = Some(now);
                        order.clone()
                    })
                    .collect()
            }))
        })
    }

    fn mark_processed<'a>(
        &'a self,
        number: &'a str,
        points: Points,
    ) -> BoxFuture<'a, Result<Transition, LedgerError>> {
        Box::pin(async move {
            Ok(self.with_state(|state| {
                state.transition(number, OrderStatus::Processed, Some(points))
            }))
        })
    }

    fn mark_invalid<'a>(&'a self, number: &'a str) -> BoxFuture<'a, Result<Transition, LedgerError>> {
        Box::pin(async move {
            Ok(self.with_state(|state| state.transition(number, OrderStatus::Invalid, None)))
        })
    }

    fn post_accrual<'a>(
        &'a self,
        user_id: UserId,
        number: &'a str,
    ) -> BoxFuture<'a, Result<u64, LedgerError>> {
        Box::pin(async move {
            Ok(self.with_state(|state| {
                let position = state
                    .orders
                    .iter()
                    .position(|order| order.user_id == user_id && order.number == number);
                let inserted = position.map_or(false, |index| state.insert_accrual(index));
                state.recompute(user_id);
                u64::from(inserted)
            }))
        })
    }

    fn sweep_missing_accruals<'a>(&'a self) -> BoxFuture<'a, Result<SweepReport, LedgerError>> {
        Box::pin(async move {
            Ok(self.with_state(|state| {
                let mut users = BTreeSet::new();
                let mut inserted = 0;
                for index in 0..state.orders.len() {
                    if state.insert_accrual(index) {
                        inserted += 1;
                        users.insert(state.orders[index].user_id);
                    }
                }
                for user_id in &users {
                    state.recompute(*user_id);
                }
                SweepReport {
                    entries_inserted: inserted,
                    users_recomputed: users.into_iter().collect(),
                }
            }))
        })
    }

    fn get_balance<'a>(&'a self, user_id: UserId) -> BoxFuture<'a, Result<Balance, LedgerError>> {
        Box::pin(async move {
            Ok(self.with_state(|state| *state.balances.entry(user_id).or_default()))
        })
    }

    fn record_withdrawal<'a>(
        &'a self,
        user_id: UserId,
        request: &'a WithdrawalRequest,
    ) -> BoxFuture<'a, Result<Balance, LedgerError>> {
        Box::pin(async move {
            self.with_state(|state| {
                let recorded = state.entries.iter().find(|entry| {
                    entry.user_id == user_id
                        && entry.kind == EntryKind::Withdrawal
                        && entry.withdrawal_ref.as_deref() == Some(request.order_number.as_str())
                });
                match recorded {
                    Some(entry) if entry.amount == request.amount => {
                        return Ok(*state.balances.entry(user_id).or_default());
                    }
                    Some(_) => {
                        return Err(LedgerError::AlreadyExists(format!(
                            "withdrawal {}",
                            request.order_number
                        )));
                    }
                    None => {}
                }

                let available = state.balances.entry(user_id).or_default().current;
                if available < request.amount {
                    return Err(LedgerError::InsufficientBalance {
                        requested: request.amount,
                        available,
                    });
                }
                state.entries.push(MemoryEntry {
                    user_id,
                    kind: EntryKind::Withdrawal,
                    amount: request.amount,
                    order_id: None,
                    withdrawal_ref: Some(request.order_number.clone()),
                    posted_at: Utc::now(),
                });
                Ok(state.recompute(user_id))
            })
        })
    }

    fn list_withdrawals<'a>(
        &'a self,
        user_id: UserId,
    ) -> BoxFuture<'a, Result<Vec<Withdrawal>, LedgerError>> {
        Box::pin(async move {
            Ok(self.with_state(|state| {
                state
                    .entries
                    .iter()
                    .rev()
                    .filter(|entry| entry.user_id == user_id && entry.kind == EntryKind::Withdrawal)
                    .map(|entry| Withdrawal {
                        order_number: entry.withdrawal_ref.clone().unwrap_or_default(),
                        amount: entry.amount,
                        processed_at: entry.posted_at,
                    })
                    .collect()
            }))
        })
    }
}
