use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{JobError, LedgerService, Throttle};
use crate::accrual::{AccrualOutcome, AccrualStatus};
use crate::ledger::{Order, Points, Transition};

/// Reconciles one claimed order against the accrual service.
#[derive(Debug, Clone)]
pub struct OrderJob {
    pub order: Order,
    pub throttle: Arc<Throttle>,
}

impl OrderJob {
    pub fn new(order: Order, throttle: Arc<Throttle>) -> Self {
        Self { order, throttle }
    }

    pub async fn process(&self, svc: &dyn LedgerService) -> Result<(), JobError> {
        let number = self.order.number.as_str();

        if self.throttle.is_paused() {
            debug!(
                event = "order_job_throttled",
                order_number = number,
                remaining_ms = self.throttle.remaining().as_millis() as u64,
                "accrual calls paused; leaving order for reclaim"
            );
            return Ok(());
        }

        match svc.fetch_accrual(number).await {
            AccrualOutcome::RateLimited { retry_after } => {
                self.throttle.pause(retry_after);
                if let Some(metrics) = svc.metrics() {
                    metrics.throttle_pauses_total.inc();
                }
                info!(
                    event = "throttle_paused",
                    order_number = number,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "accrual service rate limited; pausing outbound calls"
                );
                Ok(())
            }
            AccrualOutcome::NotRegistered => {
                debug!(
                    event = "order_not_registered",
                    order_number = number,
                    "accrual service does not know the order yet"
                );
                Ok(())
            }
            AccrualOutcome::TransientFailure(source) => Err(JobError::Accrual {
                number: number.to_string(),
                source,
            }),
            AccrualOutcome::Success { status, awarded } => {
                self.apply_status(svc, status, awarded).await
            }
        }
    }

    async fn apply_status(
        &self,
        svc: &dyn LedgerService,
        status: AccrualStatus,
        awarded: Option<Points>,
    ) -> Result<(), JobError> {
        let number = self.order.number.as_str();
        let ledger_err = |source| JobError::Ledger {
            number: number.to_string(),
            source,
        };

        match status {
            AccrualStatus::Registered | AccrualStatus::Processing => Ok(()),
            AccrualStatus::Invalid => {
                let transition = svc.mark_invalid(&self.order).await.map_err(ledger_err)?;
                log_transition(number, "INVALID", transition);
                Ok(())
            }
            AccrualStatus::Processed => {
                let points = awarded.unwrap_or(Points::ZERO);
                let transition = svc
                    .mark_processed(&self.order, points)
                    .await
                    .map_err(ledger_err)?;
                log_transition(number, "PROCESSED", transition);

                // A skipped transition still posts: the entry insert is idempotent and this
                // closes the gap if an earlier run died between the two writes.
                let inserted = svc.post_accrual(&self.order).await.map_err(ledger_err)?;
                if inserted > 0 {
                    if let Some(metrics) = svc.metrics() {
                        metrics.accrual_entries_posted_total.inc_by(inserted);
                    }
                }
                Ok(())
            }
            AccrualStatus::Unknown(raw) => {
                warn!(
                    event = "accrual_status_unknown",
                    order_number = number,
                    status = %raw,
                    "ignoring unknown accrual status"
                );
                Ok(())
            }
        }
    }
}

fn log_transition(number: &str, target: &str, transition: Transition) {
    match transition {
        Transition::Applied => info!(
            event = "order_transitioned",
            order_number = number,
            status = target,
            "order status updated"
        ),
        Transition::Skipped => debug!(
            event = "order_transition_skipped",
            order_number = number,
            status = target,
            "order no longer PROCESSING; update skipped"
        ),
    }
}
