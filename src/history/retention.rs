//! Age-based deletion of finished job records.

use super::HistoryStore;
use crate::background_jobs::{BackgroundJob, JobContext, JobError};
use crate::metrics;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetentionReport {
    pub expired: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Deletes history records that finished more than `retention` ago.
/// A zero retention keeps everything.
pub struct HistoryCleaner {
    store: Arc<dyn HistoryStore>,
    retention: Duration,
    interval: Duration,
}

impl HistoryCleaner {
    pub fn new(store: Arc<dyn HistoryStore>, retention: Duration, interval: Duration) -> Self {
        Self {
            store,
            retention,
            interval,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.retention.is_zero()
    }

    /// One pass over the store. Failing to delete one record does not stop the sweep.
    pub fn sweep(&self, now: DateTime<Utc>) -> anyhow::Result<RetentionReport> {
        let mut report = RetentionReport::default();
        if !self.is_enabled() {
            return Ok(report);
        }

        let retention = chrono::Duration::from_std(self.retention)?;
        let cutoff = now - retention;
        let expired = self.store.list_finished_before(cutoff)?;
        report.expired = expired.len();

        for job in expired {
            match self.store.delete(&job.uid) {
                Ok(true) => report.deleted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        "Failed to delete history record {} ({}): {:#}",
                        job.key, job.uid, e
                    );
                    report.failed += 1;
                }
            }
        }

        metrics::record_history_deletions(report.deleted);
        Ok(report)
    }
}

impl BackgroundJob for HistoryCleaner {
    fn id(&self) -> &'static str {
        "history_cleanup"
    }

    fn name(&self) -> &'static str {
        "History Cleanup"
    }

    fn description(&self) -> &'static str {
        "Delete finished job records older than the history expiration"
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
            .map_err(|e| JobError::ExecutionFailed(format!("{:#}", e)))?;

        if report.expired > 0 {
            info!(
                "History cleanup: {} expired, {} deleted, {} failed",
                report.expired, report.deleted, report.failed
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{HistoricJob, HistoryWriter, InMemoryHistoryStore};
    use crate::jobs::{Job, JobAction, JobKey, JobSpec, RepositoryRef};

    const TWO_HOURS: Duration = Duration::from_secs(2 * 60 * 60);

    fn finished(name: &str, finished_at: DateTime<Utc>) -> HistoricJob {
        let job = Job::new(
            JobKey::new("ns", name),
            JobSpec {
                repository: RepositoryRef::new("ns", "repo"),
                action: JobAction::Sync { incremental: false },
            },
        );
        let mut historic = HistoricJob::from_job(&job, finished_at);
        historic.finished_at = finished_at;
        historic
    }

    fn seeded_store(now: DateTime<Utc>) -> Arc<InMemoryHistoryStore> {
        let store = Arc::new(InMemoryHistoryStore::new());
        store
            .write(&finished("three-hours", now - chrono::Duration::hours(3)))
            .unwrap();
        store
            .write(&finished("ninety-minutes", now - chrono::Duration::minutes(90)))
            .unwrap();
        store.write(&finished("just-now", now)).unwrap();
        store
    }

    #[test]
    fn test_sweep_deletes_only_older_than_retention() {
        let now = Utc::now();
        let store = seeded_store(now);
        let cleaner = HistoryCleaner::new(store.clone(), TWO_HOURS, Duration::from_secs(60));

        let report = cleaner.sweep(now).unwrap();
        assert_eq!(
            report,
            RetentionReport {
                expired: 1,
                deleted: 1,
                failed: 0
            }
        );

        let remaining: Vec<String> = store
            .list(None, 10)
            .unwrap()
            .into_iter()
            .map(|j| j.key.name)
            .collect();
        assert_eq!(remaining, vec!["just-now", "ninety-minutes"]);
    }

    #[test]
    fn test_zero_retention_deletes_nothing() {
        let now = Utc::now();
        let store = seeded_store(now);
        let cleaner = HistoryCleaner::new(store.clone(), Duration::ZERO, Duration::from_secs(60));

        assert!(!cleaner.is_enabled());
        assert_eq!(cleaner.interval(), Duration::ZERO);
        assert_eq!(cleaner.sweep(now).unwrap(), RetentionReport::default());
        assert_eq!(store.len(), 3);
    }

    /// Fails to delete one specific record.
    struct StubbornStore {
        inner: InMemoryHistoryStore,
        stubborn_uid: String,
    }

    impl HistoryWriter for StubbornStore {
        fn write(&self, job: &HistoricJob) -> anyhow::Result<()> {
            self.inner.write(job)
        }
    }

    impl HistoryStore for StubbornStore {
        fn get(&self, uid: &str) -> anyhow::Result<Option<HistoricJob>> {
            self.inner.get(uid)
        }

        fn list(&self, namespace: Option<&str>, limit: usize) -> anyhow::Result<Vec<HistoricJob>> {
            self.inner.list(namespace, limit)
        }

        fn list_finished_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<Vec<HistoricJob>> {
            self.inner.list_finished_before(cutoff)
        }

        fn delete(&self, uid: &str) -> anyhow::Result<bool> {
            if uid == self.stubborn_uid {
                anyhow::bail!("record is locked");
            }
            self.inner.delete(uid)
        }
    }

    #[test]
    fn test_sweep_continues_after_delete_failure() {
        let now = Utc::now();
        let oldest = finished("oldest", now - chrono::Duration::hours(5));
        let store = Arc::new(StubbornStore {
            inner: InMemoryHistoryStore::new(),
            stubborn_uid: oldest.uid.clone(),
        });
        store.write(&oldest).unwrap();
        store
            .write(&finished("old", now - chrono::Duration::hours(4)))
            .unwrap();

        let cleaner = HistoryCleaner::new(store.clone(), TWO_HOURS, Duration::from_secs(60));
        let report = cleaner.sweep(now).unwrap();

        assert_eq!(report.expired, 2);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(store.inner.len(), 1);
    }

    #[test]
    fn test_execute_respects_cancellation() {
        let now = Utc::now();
        let store = seeded_store(now);
        let cleaner = HistoryCleaner::new(store.clone(), TWO_HOURS, Duration::from_secs(60));

        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let result = cleaner.execute(&JobContext::new(token));
        assert!(matches!(result, Err(JobError::Cancelled)));
        assert_eq!(store.len(), 3);
    }
}
