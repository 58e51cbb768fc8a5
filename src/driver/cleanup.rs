//! Fails jobs whose holder disappeared too many times.

use crate::background_jobs::{BackgroundJob, JobContext, JobError};
use crate::history::{HistoricJob, HistoryWriter};
use crate::jobs::{JobStore, JobStoreError};
use crate::metrics;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    /// Expired jobs left for another claim.
    pub reclaimable: usize,
    pub abandoned: usize,
    pub failed: usize,
}

/// Finalizes expired jobs that already used up `max_attempts` claims.
///
/// Jobs below the limit are left alone: their expired lease makes them
/// claimable again.
pub struct AbandonedJobCleaner {
    store: Arc<dyn JobStore>,
    history: Arc<dyn HistoryWriter>,
    max_attempts: u32,
    interval: Duration,
}

impl AbandonedJobCleaner {
    pub fn new(
        store: Arc<dyn JobStore>,
        history: Arc<dyn HistoryWriter>,
        max_attempts: u32,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            history,
            max_attempts,
            interval,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0
    }

    pub fn sweep(&self, now: DateTime<Utc>) -> Result<CleanupReport, JobStoreError> {
        let mut report = CleanupReport::default();
        if !self.is_enabled() {
            return Ok(report);
        }

        for job in self.store.list_expired(now)? {
            if job.attempts < self.max_attempts {
                report.reclaimable += 1;
                continue;
            }
            let message = format!("abandoned after {} attempts", job.attempts);
            let abandoned = match self.store.abandon(&job.key, &message) {
                Ok(Some(abandoned)) => abandoned,
                // Claimed again or removed since the listing.
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to abandon job {}: {}", job.key, e);
                    report.failed += 1;
                    continue;
                }
            };

            if let Err(e) = self.store.delete(&abandoned.key) {
                warn!("Failed to delete abandoned job {}: {}", abandoned.key, e);
            }
            if let Err(e) = self.history.write(&HistoricJob::from_job(&abandoned, now)) {
                warn!(
                    "Failed to write history for abandoned job {}: {:#}",
                    abandoned.key, e
                );
                metrics::record_history_write_failure();
            }
            metrics::record_job_abandoned();
            warn!("Job {} {}", abandoned.key, message);
            report.abandoned += 1;
        }
        Ok(report)
    }
}

impl BackgroundJob for AbandonedJobCleaner {
    fn id(&self) -> &'static str {
        "abandoned_job_cleanup"
    }

    fn name(&self) -> &'static str {
        "Abandoned Job Cleanup"
    }

    fn description(&self) -> &'static str {
        "Fail expired jobs that reached the maximum number of attempts"
    }

    fn interval(&self) -> Duration {
        if self.is_enabled() {
            self.interval
        } else {
            Duration::ZERO
        }
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        let report = self
            .sweep(Utc::now())
            .map_err(|e| JobError::ExecutionFailed(e.to_string()))?;
        if report.abandoned > 0 || report.failed > 0 {
            info!(
                "Abandoned job cleanup: {} abandoned, {} failed, {} reclaimable",
                report.abandoned, report.failed, report.reclaimable
            );
        }
        Ok(())
    }
}
