use crate::build_info;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use prometheus_client::registry::Registry;
use tokio::sync::OnceCell;

/// Registers immutable build metadata for `/metrics` scraping.
///
/// Encoded as a labeled gauge with value `1` so it stays valid Prometheus text exposition
/// while carrying stable build labels.
pub fn register_build_info_metric(registry: &mut Registry, prefix: &str) {
    let build_info_metric = Family::<BuildInfoLabels, Gauge>::default();
    build_info_metric
        .get_or_create(&BuildInfoLabels {
            service: "ledger_worker",
            version: build_info::VERSION,
            commit: build_info::short_commit_hash(),
        })
        .set(1);
    let sub_registry = registry.sub_registry_with_prefix(prefix);
    sub_registry.register(
        "build_info",
        "Build identity labels for this process",
        build_info_metric,
    );
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct BuildInfoLabels {
    service: &'static str,
    version: &'static str,
    commit: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AccrualOutcomeLabels {
    pub outcome: &'static str,
}

#[derive(Clone)]
pub struct EngineMetrics {
    /// Jobs accepted by the bounded queue.
    pub jobs_enqueued_total: Counter,
    /// Jobs discarded because the queue was full. Order jobs come back through reclaim.
    pub jobs_dropped_total: Counter,
    pub jobs_succeeded_total: Counter,
    pub jobs_failed_total: Counter,
    /// Orders moved from `NEW` to `PROCESSING` by the new-order poller.
    pub orders_claimed_total: Counter,
    /// Stale `PROCESSING` leases refreshed by the reclaim poller.
    pub orders_reclaimed_total: Counter,
    pub throttle_pauses_total: Counter,
    /// Accrual entries written, by job or by sweep.
    pub accrual_entries_posted_total: Counter,
    /// Storage attempts repeated after a retryable failure.
    pub storage_retries_total: Counter,
    pub workers_alive: Gauge,
    /// Approximate number of queued jobs, sampled on enqueue and dequeue.
    pub queue_depth: Gauge,
    pub accrual_requests: Family<AccrualOutcomeLabels, Counter>,
}

impl EngineMetrics {
    fn init() -> Self {
        Self {
            jobs_enqueued_total: Counter::default(),
            jobs_dropped_total: Counter::default(),
            jobs_succeeded_total: Counter::default(),
            jobs_failed_total: Counter::default(),
            orders_claimed_total: Counter::default(),
            orders_reclaimed_total: Counter::default(),
            throttle_pauses_total: Counter::default(),
            accrual_entries_posted_total: Counter::default(),
            storage_retries_total: Counter::default(),
            workers_alive: Gauge::default(),
            queue_depth: Gauge::default(),
            accrual_requests: Family::default(),
        }
    }

    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::init();
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "jobs_enqueued",
            "Total number of jobs accepted by the queue",
            metrics.jobs_enqueued_total.clone(),
        );
        sub_registry.register(
            "jobs_dropped",
            "Total number of jobs dropped because the queue was full",
            metrics.jobs_dropped_total.clone(),
        );
        sub_registry.register(
            "jobs_succeeded",
            "Total number of jobs processed without error",
            metrics.jobs_succeeded_total.clone(),
        );
        sub_registry.register(
            "jobs_failed",
            "Total number of jobs that returned an error",
            metrics.jobs_failed_total.clone(),
        );
        sub_registry.register(
            "orders_claimed",
            "Total number of NEW orders claimed for processing",
            metrics.orders_claimed_total.clone(),
        );
        sub_registry.register(
            "orders_reclaimed",
            "Total number of stale PROCESSING orders reclaimed",
            metrics.orders_reclaimed_total.clone(),
        );
        sub_registry.register(
            "throttle_pauses",
            "Total number of rate-limit pauses applied to accrual calls",
            metrics.throttle_pauses_total.clone(),
        );
        sub_registry.register(
            "accrual_entries_posted",
            "Total number of accrual ledger entries inserted",
            metrics.accrual_entries_posted_total.clone(),
        );
        sub_registry.register(
            "storage_retries",
            "Total number of storage operation retries",
            metrics.storage_retries_total.clone(),
        );
        sub_registry.register(
            "workers_alive",
            "Number of live job worker tasks",
            metrics.workers_alive.clone(),
        );
        sub_registry.register(
            "queue_depth",
            "Current bounded job queue depth",
            metrics.queue_depth.clone(),
        );
        sub_registry.register(
            "accrual_requests",
            "Accrual service lookups by outcome",
            metrics.accrual_requests.clone(),
        );
        metrics
    }

    pub fn record_accrual_outcome(&self, outcome: &'static str) {
        self.accrual_requests
            .get_or_create(&AccrualOutcomeLabels { outcome })
            .inc();
    }
}

pub static ENGINE_METRICS: OnceCell<EngineMetrics> = OnceCell::const_new();
