use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::{JobQueue, Offer};
use crate::jobs::{Job, LedgerService, Throttle};
use crate::ledger::LedgerError;
use crate::server::monitoring::ENGINE_METRICS;
use crate::storage::retry::deterministic_jitter;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub batch_size: i64,
    pub new_order_interval: Duration,
    pub reclaim_interval: Duration,
    /// How long a `PROCESSING` lease stays valid before the order is re-offered.
    pub lease: Duration,
    pub balance_interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            batch_size: 30,
            new_order_interval: Duration::from_secs(5),
            reclaim_interval: Duration::from_secs(3),
            lease: Duration::from_secs(300),
            balance_interval: Duration::from_secs(30),
        }
    }
}

/// Which orders a poll cycle claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSource {
    New,
    Stale { lease: Duration },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub claimed: usize,
    pub enqueued: usize,
    pub dropped: usize,
    pub queue_closed: bool,
}

/// Claims one batch from `source` and offers an order job for each claimed row.
///
/// Rows whose job is dropped stay `PROCESSING` with a fresh lease and come back through the
/// stale source once the lease runs out.
pub async fn poll_orders_once(
    svc: &dyn LedgerService,
    queue: &JobQueue,
    throttle: &Arc<Throttle>,
    source: OrderSource,
    batch_size: i64,
) -> Result<PollReport, LedgerError> {
    let orders = match source {
        OrderSource::New => svc.claim_new_orders(batch_size).await?,
        OrderSource::Stale { lease } => svc.reclaim_stale_orders(batch_size, lease).await?,
    };

    if let Some(metrics) = ENGINE_METRICS.get() {
        let claimed = orders.len() as u64;
        match source {
            OrderSource::New => metrics.orders_claimed_total.inc_by(claimed),
            OrderSource::Stale { .. } => metrics.orders_reclaimed_total.inc_by(claimed),
        };
    }

    let mut report = PollReport {
        claimed: orders.len(),
        ..PollReport::default()
    };
    for order in orders {
        match queue.offer(Job::order(order, Arc::clone(throttle))) {
            Offer::Enqueued => report.enqueued += 1,
            Offer::Dropped => report.dropped += 1,
            Offer::Closed => {
                report.queue_closed = true;
                break;
            }
        }
    }
    Ok(report)
}

/// The three periodic producers feeding the job queue.
pub struct Pollers {
    svc: Arc<dyn LedgerService>,
    queue: JobQueue,
    throttle: Arc<Throttle>,
    config: PollerConfig,
}

impl Pollers {
    pub fn new(
        svc: Arc<dyn LedgerService>,
        queue: JobQueue,
        throttle: Arc<Throttle>,
        config: PollerConfig,
    ) -> Self {
        Self {
            svc,
            queue,
            throttle,
            config,
        }
    }

    /// Spawns the new-order, reclaim and balance pollers. Each stops when `cancel` fires.
    pub fn spawn(self, cancel: &CancellationToken) -> JoinSet<()> {
        let mut tasks = JoinSet::new();
        tasks.spawn(order_poller(
            "new_order",
            Arc::clone(&self.svc),
            self.queue.clone(),
            Arc::clone(&self.throttle),
            OrderSource::New,
            self.config.batch_size,
            self.config.new_order_interval,
            cancel.clone(),
        ));
        tasks.spawn(order_poller(
            "reclaim",
            Arc::clone(&self.svc),
            self.queue.clone(),
            Arc::clone(&self.throttle),
            OrderSource::Stale {
                lease: self.config.lease,
            },
            self.config.batch_size,
            self.config.reclaim_interval,
            cancel.clone(),
        ));
        tasks.spawn(balance_poller(
            self.queue,
            self.config.balance_interval,
            cancel.clone(),
        ));
        tasks
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn order_poller(
    name: &'static str,
    svc: Arc<dyn LedgerService>,
    queue: JobQueue,
    throttle: Arc<Throttle>,
    source: OrderSource,
    batch_size: i64,
    period: Duration,
    cancel: CancellationToken,
) {
    tick_loop(name, period, cancel, || {
        let svc = Arc::clone(&svc);
        let queue = queue.clone();
        let throttle = Arc::clone(&throttle);
        async move {
            let report = poll_orders_once(&*svc, &queue, &throttle, source, batch_size).await?;
            if report.claimed > 0 {
                debug!(
                    event = "poll_completed",
                    poller = name,
                    claimed = report.claimed,
                    enqueued = report.enqueued,
                    dropped = report.dropped,
                    "orders offered to job queue"
                );
            }
            Ok(!report.queue_closed)
        }
    })
    .await;
}

pub async fn balance_poller(queue: JobQueue, period: Duration, cancel: CancellationToken) {
    tick_loop("balance", period, cancel, || {
        let queue = queue.clone();
        async move { Ok(queue.offer(Job::balance()) != Offer::Closed) }
    })
    .await;
}

/// Runs `tick` every `period` until cancelled or until it reports `Ok(false)`.
///
/// The first tick fires one period after start. A failed tick is followed by a jittered
/// pause of between half and one full period.
async fn tick_loop<F, Fut>(name: &'static str, period: Duration, cancel: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, LedgerError>>,
{
    let period = period.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut consecutive_failures: u32 = 0;

    info!(
        event = "poller_started",
        poller = name,
        period_ms = period.as_millis() as u64,
        "poller started"
    );

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match tick().await {
            Ok(true) => consecutive_failures = 0,
            Ok(false) => {
                info!(event = "poller_queue_closed", poller = name, "job queue closed; poller exiting");
                return;
            }
            Err(err) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                let backoff = failure_backoff(name, period, consecutive_failures);
                warn!(
                    event = "poll_failed",
                    poller = name,
                    kind = ?err.kind(),
                    error = %err,
                    consecutive_failures,
                    backoff_ms = backoff.as_millis() as u64,
                    "poll cycle failed; backing off"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }

    info!(event = "poller_stopped", poller = name, "poller stopped");
}

fn failure_backoff(name: &str, period: Duration, attempt: u32) -> Duration {
    let half = period.as_millis() / 2;
    let seed = name
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
        });
    let millis = half + deterministic_jitter(seed, attempt, half);
    Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
}
