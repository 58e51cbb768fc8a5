use super::context::JobContext;
use super::job::{BackgroundJob, JobError, ShutdownBehavior};
use crate::metrics;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for each running job.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(30);

/// Idle wait when nothing is registered; only shutdown can end it.
const IDLE_SLEEP: Duration = Duration::from_secs(3600);

struct ScheduledJob {
    job: Arc<dyn BackgroundJob>,
    next_run_at: Instant,
}

/// Runs registered background jobs at their intervals until shutdown.
pub struct JobScheduler {
    jobs: Vec<ScheduledJob>,

    /// Currently running jobs with their task handles.
    running_handles: HashMap<&'static str, JoinHandle<()>>,

    /// Cancellation tokens for each running job.
    job_cancel_tokens: HashMap<&'static str, CancellationToken>,

    /// Token to signal scheduler shutdown.
    shutdown_token: CancellationToken,
}

impl JobScheduler {
    pub fn new(shutdown_token: CancellationToken) -> Self {
        Self {
            jobs: Vec::new(),
            running_handles: HashMap::new(),
            job_cancel_tokens: HashMap::new(),
            shutdown_token,
        }
    }

    /// Register a job with the scheduler. Jobs with a zero interval are skipped.
    pub fn register_job(&mut self, job: Arc<dyn BackgroundJob>) {
        let interval = job.interval();
        if interval.is_zero() {
            warn!("Not registering job {}: interval is zero", job.id());
            return;
        }
        info!(
            "Registering job: {} - {} (every {:?})",
            job.id(),
            job.description(),
            interval
        );
        self.jobs.push(ScheduledJob {
            job,
            next_run_at: Instant::now() + interval,
        });
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Main scheduler loop.
    pub async fn run(mut self) {
        info!(
            "Starting background job scheduler with {} registered jobs",
            self.jobs.len()
        );

        loop {
            self.cleanup_completed_jobs().await;

            let wake_at = self
                .jobs
                .iter()
                .map(|scheduled| scheduled.next_run_at)
                .min()
                .unwrap_or_else(|| Instant::now() + IDLE_SLEEP);
            debug!(
                "Scheduler sleeping for {:?} until next scheduled job",
                wake_at.saturating_duration_since(Instant::now())
            );

            tokio::select! {
                _ = tokio::time::sleep_until(wake_at) => {
                    self.run_due_jobs();
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Scheduler received shutdown signal");
                    self.shutdown().await;
                    break;
                }
            }
        }

        info!("Background job scheduler stopped");
    }

    fn run_due_jobs(&mut self) {
        let now = Instant::now();
        let mut due = Vec::new();
        for scheduled in &mut self.jobs {
            if scheduled.next_run_at <= now {
                scheduled.next_run_at = now + scheduled.job.interval();
                due.push(Arc::clone(&scheduled.job));
            }
        }
        for job in due {
            if self.running_handles.contains_key(job.id()) {
                debug!("Job {} is still running, skipping this run", job.id());
                continue;
            }
            self.spawn_job(job);
        }
    }

    fn spawn_job(&mut self, job: Arc<dyn BackgroundJob>) {
        let job_id = job.id();
        info!("Starting background job: {}", job_id);
        metrics::set_background_job_running(job_id, true);

        let cancel_token = self.shutdown_token.child_token();
        self.job_cancel_tokens.insert(job_id, cancel_token.clone());
        let ctx = JobContext::new(cancel_token);

        let handle = tokio::spawn(async move {
            let start_time = std::time::Instant::now();
            let result = tokio::task::spawn_blocking(move || job.execute(&ctx)).await;
            let elapsed = start_time.elapsed();

            let status_label = match result {
                Ok(Ok(())) => {
                    info!("Job {} completed successfully in {:?}", job_id, elapsed);
                    "success"
                }
                Ok(Err(JobError::Cancelled)) => {
                    info!("Job {} was cancelled after {:?}", job_id, elapsed);
                    "cancelled"
                }
                Ok(Err(e)) => {
                    error!("Job {} failed after {:?}: {}", job_id, elapsed, e);
                    "failed"
                }
                Err(e) => {
                    error!("Job {} panicked after {:?}: {}", job_id, elapsed, e);
                    "panic"
                }
            };

            metrics::record_background_job_execution(job_id, status_label, elapsed);
            metrics::set_background_job_running(job_id, false);
        });

        self.running_handles.insert(job_id, handle);
    }

    /// Clean up handles for completed jobs.
    async fn cleanup_completed_jobs(&mut self) {
        let completed: Vec<&'static str> = self
            .running_handles
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(job_id, _)| *job_id)
            .collect();

        for job_id in completed {
            if let Some(handle) = self.running_handles.remove(job_id) {
                let _ = handle.await;
            }
            self.job_cancel_tokens.remove(job_id);
        }
    }

    /// Gracefully shut down the scheduler.
    async fn shutdown(&mut self) {
        info!("Shutting down background job scheduler...");

        let behaviors: HashMap<&'static str, ShutdownBehavior> = self
            .jobs
            .iter()
            .map(|scheduled| (scheduled.job.id(), scheduled.job.shutdown_behavior()))
            .collect();

        for (job_id, token) in &self.job_cancel_tokens {
            if behaviors.get(job_id).copied().unwrap_or_default() == ShutdownBehavior::Cancellable
            {
                debug!("Cancelling job: {}", job_id);
                token.cancel();
            }
        }

        for (job_id, handle) in self.running_handles.drain() {
            if behaviors.get(job_id).copied().unwrap_or_default()
                == ShutdownBehavior::WaitForCompletion
            {
                info!("Waiting for job {} to complete...", job_id);
            }
            if tokio::time::timeout(SHUTDOWN_WAIT, handle).await.is_err() {
                warn!("Job {} did not finish within {:?}", job_id, SHUTDOWN_WAIT);
            }
        }

        self.job_cancel_tokens.clear();
        info!("Background job scheduler shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct TestJob {
        id: &'static str,
        interval: Duration,
        execution_count: Arc<AtomicUsize>,
        should_fail: Arc<AtomicBool>,
    }

    impl BackgroundJob for TestJob {
        fn id(&self) -> &'static str {
            self.id
        }

        fn name(&self) -> &'static str {
            "Test Job"
        }

        fn description(&self) -> &'static str {
            "A test job for unit tests"
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        fn execute(&self, _ctx: &JobContext) -> Result<(), JobError> {
            self.execution_count.fetch_add(1, Ordering::SeqCst);
            if self.should_fail.load(Ordering::SeqCst) {
                Err(JobError::ExecutionFailed("Test failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn test_job(id: &'static str, interval: Duration) -> (Arc<TestJob>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let job = Arc::new(TestJob {
            id,
            interval,
            execution_count: count.clone(),
            should_fail: Arc::new(AtomicBool::new(false)),
        });
        (job, count)
    }

    #[test]
    fn test_zero_interval_is_not_registered() {
        let mut scheduler = JobScheduler::new(CancellationToken::new());
        let (job, _) = test_job("disabled", Duration::ZERO);
        scheduler.register_job(job);
        assert_eq!(scheduler.job_count(), 0);
    }

    #[tokio::test]
    async fn test_job_runs_repeatedly_at_interval() {
        let shutdown_token = CancellationToken::new();
        let mut scheduler = JobScheduler::new(shutdown_token.clone());
        let (job, count) = test_job("fast", Duration::from_millis(30));
        scheduler.register_job(job);

        let sched_handle = tokio::spawn(scheduler.run());
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(
            count.load(Ordering::SeqCst) >= 2,
            "Job should have executed several times"
        );

        shutdown_token.cancel();
        tokio::time::timeout(Duration::from_secs(2), sched_handle)
            .await
            .expect("scheduler should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_failing_job_keeps_being_scheduled() {
        let shutdown_token = CancellationToken::new();
        let mut scheduler = JobScheduler::new(shutdown_token.clone());
        let count = Arc::new(AtomicUsize::new(0));
        scheduler.register_job(Arc::new(TestJob {
            id: "failing",
            interval: Duration::from_millis(30),
            execution_count: count.clone(),
            should_fail: Arc::new(AtomicBool::new(true)),
        }));

        let sched_handle = tokio::spawn(scheduler.run());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(count.load(Ordering::SeqCst) >= 2);

        shutdown_token.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), sched_handle).await;
    }

    #[tokio::test]
    async fn test_first_run_waits_one_interval() {
        let shutdown_token = CancellationToken::new();
        let mut scheduler = JobScheduler::new(shutdown_token.clone());
        let (job, count) = test_job("slow_interval", Duration::from_secs(60));
        scheduler.register_job(job);

        let sched_handle = tokio::spawn(scheduler.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        shutdown_token.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), sched_handle).await;
    }

    #[tokio::test]
    async fn test_empty_scheduler_stops_on_shutdown() {
        let shutdown_token = CancellationToken::new();
        let scheduler = JobScheduler::new(shutdown_token.clone());
        let sched_handle = tokio::spawn(scheduler.run());

        shutdown_token.cancel();
        tokio::time::timeout(Duration::from_secs(2), sched_handle)
            .await
            .expect("scheduler should stop")
            .unwrap();
    }
}
