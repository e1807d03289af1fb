use flume::{Receiver, Sender, TrySendError};
use tracing::warn;

use crate::jobs::Job;
use crate::server::monitoring::ENGINE_METRICS;

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Enqueued,
    /// The queue was full. Order jobs are picked up again by the reclaim poller.
    Dropped,
    /// Every receiver is gone; the pool has shut down.
    Closed,
}

/// Producer side of the bounded job queue shared by all pollers.
#[derive(Debug, Clone)]
pub struct JobQueue {
    sender: Sender<Job>,
}

impl JobQueue {
    /// Creates a queue holding at most `capacity` jobs (minimum 1) and its worker-side receiver.
    pub fn bounded(capacity: usize) -> (Self, Receiver<Job>) {
        let (sender, receiver) = flume::bounded(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Offers `job` without waiting for space.
    pub fn offer(&self, job: Job) -> Offer {
        let label = job.label();
        match self.sender.try_send(job) {
            Ok(()) => {
                if let Some(metrics) = ENGINE_METRICS.get() {
                    metrics.jobs_enqueued_total.inc();
                    metrics.queue_depth.set(self.sender.len() as i64);
                }
                Offer::Enqueued
            }
            Err(TrySendError::Full(job)) => {
                if let Some(metrics) = ENGINE_METRICS.get() {
                    metrics.jobs_dropped_total.inc();
                }
                match &job {
                    Job::Order(order_job) => warn!(
                        event = "order_job_dropped",
                        order_number = %order_job.order.number,
                        capacity = self.capacity(),
                        "job queue full; order left for reclaim"
                    ),
                    Job::Balance(_) => warn!(
                        event = "balance_job_dropped",
                        capacity = self.capacity(),
                        "job queue full; sweep skipped this cycle"
                    ),
                }
                Offer::Dropped
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!(
                    event = "job_queue_closed",
                    job = label,
                    "job queue has no receivers"
                );
                Offer::Closed
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.sender.capacity().unwrap_or(0)
    }
}
