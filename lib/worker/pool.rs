use std::sync::Arc;
use std::time::Duration;

use flume::Receiver;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::jobs::{Job, LedgerService};
use crate::server::monitoring::ENGINE_METRICS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerExit {
    Cancelled,
    QueueClosed,
}

/// Fixed set of long-lived workers draining the job queue.
///
/// A worker that panics while the token is live is replaced after `restart_delay`.
/// The pool returns once the token is cancelled or the queue has no senders left.
pub struct WorkerPool {
    svc: Arc<dyn LedgerService>,
    receiver: Receiver<Job>,
    workers: usize,
    restart_delay: Duration,
}

impl WorkerPool {
    pub fn new(svc: Arc<dyn LedgerService>, receiver: Receiver<Job>, workers: usize) -> Self {
        Self {
            svc,
            receiver,
            workers: workers.max(1),
            restart_delay: Duration::from_secs(1),
        }
    }

    pub fn with_restart_delay(mut self, restart_delay: Duration) -> Self {
        self.restart_delay = restart_delay;
        self
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut workers = JoinSet::new();
        for worker_idx in 0..self.workers {
            self.spawn_worker(&mut workers, worker_idx, &cancel);
        }
        set_workers_alive(workers.len());
        info!(
            event = "worker_pool_started",
            workers = self.workers,
            "job workers started"
        );

        let mut next_idx = self.workers;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    while workers.join_next().await.is_some() {}
                    set_workers_alive(0);
                    info!(event = "worker_pool_stopped", "job workers stopped");
                    return;
                }
                maybe_joined = workers.join_next() => {
                    let Some(joined) = maybe_joined else {
                        set_workers_alive(0);
                        info!(event = "worker_pool_drained", "job queue closed; workers exited");
                        return;
                    };

                    match joined {
                        Ok((_, WorkerExit::Cancelled | WorkerExit::QueueClosed)) => {}
                        Err(err) => {
                            error!(
                                event = "worker_panicked",
                                error = %err,
                                restart_after_ms = self.restart_delay.as_millis() as u64,
                                "job worker panicked; restarting replacement"
                            );
                            if !cancel.is_cancelled() && !self.receiver.is_disconnected() {
                                tokio::select! {
                                    biased;
                                    _ = cancel.cancelled() => {}
                                    _ = tokio::time::sleep(self.restart_delay) => {
                                        self.spawn_worker(&mut workers, next_idx, &cancel);
                                        next_idx += 1;
                                    }
                                }
                            }
                        }
                    }
                    set_workers_alive(workers.len());
                }
            }
        }
    }

    fn spawn_worker(
        &self,
        workers: &mut JoinSet<(usize, WorkerExit)>,
        worker_idx: usize,
        cancel: &CancellationToken,
    ) {
        workers.spawn(run_worker(
            worker_idx,
            Arc::clone(&self.svc),
            self.receiver.clone(),
            cancel.clone(),
        ));
    }
}

fn set_workers_alive(count: usize) {
    if let Some(metrics) = ENGINE_METRICS.get() {
        metrics.workers_alive.set(count as i64);
    }
}

async fn run_worker(
    worker_idx: usize,
    svc: Arc<dyn LedgerService>,
    receiver: Receiver<Job>,
    cancel: CancellationToken,
) -> (usize, WorkerExit) {
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => return (worker_idx, WorkerExit::Cancelled),
            received = receiver.recv_async() => match received {
                Ok(job) => job,
                Err(_) => return (worker_idx, WorkerExit::QueueClosed),
            },
        };

        if let Some(metrics) = ENGINE_METRICS.get() {
            metrics.queue_depth.set(receiver.len() as i64);
        }

        match job.process(&*svc).await {
            Ok(()) => {
                if let Some(metrics) = ENGINE_METRICS.get() {
                    metrics.jobs_succeeded_total.inc();
                }
                debug!(event = "job_completed", worker_idx, job = job.label(), "job completed");
            }
            Err(err) => {
                if let Some(metrics) = ENGINE_METRICS.get() {
                    metrics.jobs_failed_total.inc();
                }
                warn!(
                    event = "job_failed",
                    worker_idx,
                    job = job.label(),
                    kind = ?err.kind(),
                    error = %err,
                    "job failed; order left for reclaim"
                );
            }
        }
    }
}
