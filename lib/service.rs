use std::time::Duration;

use futures::future::BoxFuture;
use tracing::info;

use crate::accrual::{AccrualClient, AccrualOutcome};
use crate::jobs::LedgerService;
use crate::ledger::{
    Balance, LedgerError, Order, Points, SweepReport, Transition, UserId, Withdrawal,
    WithdrawalRequest,
};
use crate::luhn;
use crate::storage::LedgerStore;

/// The ledger service shared by the job system and whatever front end owns users.
pub struct LoyaltyService<S, A> {
    store: S,
    accrual: A,
}

impl<S, A> LoyaltyService<S, A>
where
    S: LedgerStore,
    A: AccrualClient,
{
    pub fn new(store: S, accrual: A) -> Self {
        Self { store, accrual }
    }

    pub async fn register_user(&self, login: &str) -> Result<UserId, LedgerError> {
        let login = login.trim();
        if login.is_empty() {
            return Err(LedgerError::InvalidPayload("login must not be empty".to_string()));
        }
        self.store.register_user(login).await
    }

    /// Records a purchase number for `user_id` in `NEW` state.
    pub async fn submit_order(&self, user_id: UserId, number: &str) -> Result<(), LedgerError> {
        let number = number.trim();
        if !luhn::is_valid(number) {
            return Err(LedgerError::InvalidOrderNumber(number.to_string()));
        }
        self.store.create_order(user_id, number).await?;
        info!(event = "order_submitted", user_id, order_number = number);
        Ok(())
    }

    pub async fn list_orders(&self, user_id: UserId) -> Result<Vec<Order>, LedgerError> {
        self.store.list_orders(user_id).await
    }

    pub async fn get_balance(&self, user_id: UserId) -> Result<Balance, LedgerError> {
        self.store.get_balance(user_id).await
    }

    /// Spends `amount` against `order_number`, refusing to overdraw the balance.
    pub async fn withdraw(
        &self,
        user_id: UserId,
        order_number: &str,
        amount: Points,
    ) -> Result<Balance, LedgerError> {
        let order_number = order_number.trim();
        if !luhn::is_valid(order_number) {
            return Err(LedgerError::UnprocessableOrder(order_number.to_string()));
        }
        if !amount.is_positive() {
            return Err(LedgerError::InvalidPayload(format!(
                "withdrawal amount must be positive, got {amount}"
            )));
        }

        let request = WithdrawalRequest {
            order_number: order_number.to_string(),
            amount,
        };
        let balance = self.store.record_withdrawal(user_id, &request).await?;
        info!(
            event = "withdrawal_recorded",
            user_id,
            order_number,
            amount = %amount,
            balance = %balance.current
        );
        Ok(balance)
    }

    /// Newest first; an empty history is `NoContent`.
    pub async fn list_withdrawals(&self, user_id: UserId) -> Result<Vec<Withdrawal>, LedgerError> {
        let withdrawals = self.store.list_withdrawals(user_id).await?;
        if withdrawals.is_empty() {
            return Err(LedgerError::NoContent);
        }
        Ok(withdrawals)
    }
}

impl<S, A> LedgerService for LoyaltyService<S, A>
where
    S: LedgerStore,
    A: AccrualClient,
{
    fn claim_new_orders<'a>(&'a self, limit: i64) -> BoxFuture<'a, Result<Vec<Order>, LedgerError>> {
        self.store.claim_new_orders(limit)
    }

    fn reclaim_stale_orders<'a>(
        &'a self,
        limit: i64,
        lease: Duration,
    ) -> BoxFuture<'a, Result<Vec<Order>, LedgerError>> {
        self.store.reclaim_stale_orders(limit, lease)
    }

    fn fetch_accrual<'a>(&'a self, number: &'a str) -> BoxFuture<'a, AccrualOutcome> {
        self.accrual.fetch_status(number)
    }

    fn mark_processed<'a>(
        &'a self,
        order: &'a Order,
        points: Points,
    ) -> BoxFuture<'a, Result<Transition, LedgerError>> {
        self.store.mark_processed(&order.number, points)
    }

    fn mark_invalid<'a>(&'a self, order: &'a Order) -> BoxFuture<'a, Result<Transition, LedgerError>> {
        self.store.mark_invalid(&order.number)
    }

    fn post_accrual<'a>(&'a self, order: &'a Order) -> BoxFuture<'a, Result<u64, LedgerError>> {
        self.store.post_accrual(order.user_id, &order.number)
    }

    fn sweep_missing_accruals<'a>(&'a self) -> BoxFuture<'a, Result<SweepReport, LedgerError>> {
        self.store.sweep_missing_accruals()
    }
}

#[cfg(test)]
mod tests {
    use super::LoyaltyService;
    use crate::accrual::{AccrualOutcome, AccrualStatus};
    use crate::jobs::{Job, LedgerService, Throttle};
    use crate::ledger::{Balance, LedgerError, OrderStatus, Points};
    use crate::test_support::{MemoryLedgerStore, MockAccrualClient};
    use std::sync::Arc;

    type TestService = LoyaltyService<Arc<MemoryLedgerStore>, Arc<MockAccrualClient>>;

    fn service() -> (TestService, Arc<MemoryLedgerStore>, Arc<MockAccrualClient>) {
        let store = Arc::new(MemoryLedgerStore::default());
        let accrual = Arc::new(MockAccrualClient::default());
        (
            LoyaltyService::new(Arc::clone(&store), Arc::clone(&accrual)),
            store,
            accrual,
        )
    }

    #[tokio::test]
    async fn processed_order_credits_the_owner() {
        let (svc, store, accrual) = service();
        let user = svc.register_user("alice").await.expect("register");
        svc.submit_order(user, "79927398713").await.expect("submit");

        let claimed = svc.claim_new_orders(10).await.expect("claim");
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, OrderStatus::Processing);

        accrual.script(
            "79927398713",
            vec![AccrualOutcome::Success {
                status: AccrualStatus::Processed,
                awarded: Some(Points::whole(50)),
            }],
        );
        let throttle = Arc::new(Throttle::new());
        Job::order(claimed[0].clone(), throttle)
            .process(&svc)
            .await
            .expect("order job");

        let orders = svc.list_orders(user).await.expect("orders");
        assert_eq!(orders[0].status, OrderStatus::Processed);
        assert_eq!(orders[0].points_awarded, Some(Points::whole(50)));
        assert_eq!(store.accrual_entries_for(&claimed[0]), 1);
        assert_eq!(
            svc.get_balance(user).await.expect("balance"),
            Balance {
                current: Points::whole(50),
                withdrawn: Points::ZERO,
            }
        );
    }

    #[tokio::test]
    async fn submit_rejects_bad_numbers_and_duplicates() {
        let (svc, _, _) = service();
        let alice = svc.register_user("alice").await.expect("register");
        let bob = svc.register_user("bob").await.expect("register");

        assert_eq!(
            svc.submit_order(alice, "79927398710").await,
            Err(LedgerError::InvalidOrderNumber("79927398710".to_string()))
        );

        svc.submit_order(alice, "79927398713").await.expect("first submit");
        assert_eq!(
            svc.submit_order(alice, "79927398713").await,
            Err(LedgerError::OrderAlreadySubmitted("79927398713".to_string()))
        );
        assert_eq!(
            svc.submit_order(bob, "79927398713").await,
            Err(LedgerError::OrderOwnedByAnotherUser("79927398713".to_string()))
        );
        assert!(matches!(
            svc.submit_order(999, "12345678903").await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn overdraft_is_rejected_without_writing() {
        let (svc, store, _) = service();
        let user = svc.register_user("alice").await.expect("register");
        store.credit(user, "79927398713", Points::whole(50));

        let err = svc
            .withdraw(user, "2377225624", Points::whole(100))
            .await
            .expect_err("overdraft must fail");
        assert_eq!(
            err,
            LedgerError::InsufficientBalance {
                requested: Points::whole(100),
                available: Points::whole(50),
            }
        );
        assert_eq!(svc.list_withdrawals(user).await, Err(LedgerError::NoContent));
        assert_eq!(
            svc.get_balance(user).await.expect("balance").current,
            Points::whole(50)
        );
    }

    #[tokio::test]
    async fn withdrawal_moves_points_to_withdrawn() {
        let (svc, store, _) = service();
        let user = svc.register_user("alice").await.expect("register");
        store.credit(user, "79927398713", Points::whole(50));

        let balance = svc
            .withdraw(user, "2377225624", Points::from_hundredths(1550))
            .await
            .expect("withdraw");
        assert_eq!(balance.current, Points::from_hundredths(3450));
        assert_eq!(balance.withdrawn, Points::from_hundredths(1550));

        let history = svc.list_withdrawals(user).await.expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].order_number, "2377225624");
        assert_eq!(history[0].amount, Points::from_hundredths(1550));
    }

    #[tokio::test]
    async fn repeated_withdrawal_reference_is_applied_once() {
        let (svc, store, _) = service();
        let user = svc.register_user("alice").await.expect("register");
        store.credit(user, "79927398713", Points::whole(50));

        let first = svc
            .withdraw(user, "2377225624", Points::whole(20))
            .await
            .expect("withdraw");
        let replay = svc
            .withdraw(user, "2377225624", Points::whole(20))
            .await
            .expect("replayed withdraw");
        assert_eq!(replay, first);
        assert_eq!(replay.current, Points::whole(30));
        assert_eq!(svc.list_withdrawals(user).await.expect("history").len(), 1);

        assert!(matches!(
            svc.withdraw(user, "2377225624", Points::whole(5)).await,
            Err(LedgerError::AlreadyExists(_))
        ));
        assert!(store.balances_match_entries());
    }

    #[tokio::test]
    async fn withdraw_validates_input() {
        let (svc, _, _) = service();
        let user = svc.register_user("alice").await.expect("register");

        assert_eq!(
            svc.withdraw(user, "12a4", Points::whole(1)).await,
            Err(LedgerError::UnprocessableOrder("12a4".to_string()))
        );
        assert!(matches!(
            svc.withdraw(user, "2377225624", Points::ZERO).await,
            Err(LedgerError::InvalidPayload(_))
        ));
    }

    #[tokio::test]
    async fn sweep_repairs_missing_entry_once() {
        let (svc, store, _) = service();
        let user = svc.register_user("alice").await.expect("register");
        svc.submit_order(user, "79927398713").await.expect("submit");
        let claimed = svc.claim_new_orders(10).await.expect("claim");

        // Status write lands, the entry insert never happens.
        svc.mark_processed(&claimed[0], Points::whole(50))
            .await
            .expect("mark processed");
        assert_eq!(store.accrual_entries_for(&claimed[0]), 0);

        Job::balance().process(&svc).await.expect("first sweep");
        assert_eq!(store.accrual_entries_for(&claimed[0]), 1);
        let after_first = svc.get_balance(user).await.expect("balance");
        assert_eq!(after_first.current, Points::whole(50));

        Job::balance().process(&svc).await.expect("second sweep");
        assert_eq!(store.accrual_entries_for(&claimed[0]), 1);
        assert_eq!(svc.get_balance(user).await.expect("balance"), after_first);
    }

    #[tokio::test]
    async fn concurrent_jobs_post_exactly_one_accrual() {
        let (svc, store, accrual) = service();
        let svc = Arc::new(svc);
        let user = svc.register_user("alice").await.expect("register");
        svc.submit_order(user, "79927398713").await.expect("submit");
        let order = svc.claim_new_orders(1).await.expect("claim").remove(0);

        accrual.script(
            "79927398713",
            (0..8)
                .map(|_| AccrualOutcome::Success {
                    status: AccrualStatus::Processed,
                    awarded: Some(Points::whole(50)),
                })
                .collect(),
        );
        let throttle = Arc::new(Throttle::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let svc = Arc::clone(&svc);
            let job = Job::order(order.clone(), Arc::clone(&throttle));
            handles.push(tokio::spawn(async move { job.process(&svc).await }));
        }
        for handle in handles {
            handle.await.expect("job task panicked").expect("job failed");
        }
        Job::balance().process(&svc).await.expect("sweep");

        assert_eq!(accrual.calls_for("79927398713"), 8);
        assert_eq!(store.accrual_entries_for(&order), 1);
        assert_eq!(
            svc.get_balance(user).await.expect("balance").current,
            Points::whole(50)
        );
        assert!(store.balances_match_entries());
    }

    #[tokio::test]
    async fn terminal_orders_never_regress() {
        let (svc, _, _) = service();
        let user = svc.register_user("alice").await.expect("register");
        svc.submit_order(user, "79927398713").await.expect("submit");
        let order = svc.claim_new_orders(1).await.expect("claim").remove(0);

        svc.mark_processed(&order, Points::whole(5))
            .await
            .expect("processed");
        let stale = svc.mark_invalid(&order).await.expect("stale invalid");
        assert_eq!(stale, crate::ledger::Transition::Skipped);
        assert_eq!(
            svc.list_orders(user).await.expect("orders")[0].status,
            OrderStatus::Processed
        );
    }
}
