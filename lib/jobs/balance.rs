use tracing::{debug, info};

use super::{JobError, LedgerService};

/// Catch-up sweep for processed orders whose accrual entry never got written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalanceJob;

impl BalanceJob {
    pub async fn process(&self, svc: &dyn LedgerService) -> Result<(), JobError> {
        let report = svc
            .sweep_missing_accruals()
            .await
            .map_err(JobError::Sweep)?;

        if report.entries_inserted == 0 {
            debug!(event = "balance_sweep_clean", "no missing accrual entries");
            return Ok(());
        }

        if let Some(metrics) = svc.metrics() {
            metrics
                .accrual_entries_posted_total
                .inc_by(report.entries_inserted);
        }
        info!(
            event = "balance_sweep_repaired",
            entries_inserted = report.entries_inserted,
            users_recomputed = report.users_recomputed.len(),
            "inserted missing accrual entries"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::BalanceJob;
    use crate::jobs::JobError;
    use crate::ledger::{LedgerError, SweepReport};
    use crate::test_support::{MockLedgerService, ServiceCall};

    #[tokio::test]
    async fn runs_one_sweep() {
        let svc = MockLedgerService::default().with_sweeps(vec![Ok(SweepReport {
            entries_inserted: 2,
            users_recomputed: vec![1, 2],
        })]);

        BalanceJob.process(&svc).await.expect("sweep should succeed");
        assert_eq!(svc.calls(), vec![ServiceCall::Sweep]);
    }

    #[tokio::test]
    async fn sweep_failure_is_reported() {
        let svc = MockLedgerService::default()
            .with_sweeps(vec![Err(LedgerError::Internal("boom".to_string()))]);

        let err = BalanceJob
            .process(&svc)
            .await
            .expect_err("sweep failure should surface");
        assert_eq!(err, JobError::Sweep(LedgerError::Internal("boom".to_string())));
    }
}
