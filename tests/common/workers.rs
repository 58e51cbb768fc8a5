//! Workers with controllable timing for driver tests.

use async_trait::async_trait;
use repo_job_controller::jobs::{Job, JobKey, JobKind};
use repo_job_controller::repository::Repository;
use repo_job_controller::workers::{
    ProgressRecorder, Worker, WorkerContext, WorkerError, WorkerResult,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Handles sync jobs by sleeping; honours cancellation.
pub struct SlowWorker {
    pub delay: Duration,
}

#[async_trait]
impl Worker for SlowWorker {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn matches(&self, job: &Job) -> bool {
        job.kind() == JobKind::Sync
    }

    async fn process(
        &self,
        ctx: &WorkerContext,
        _job: &Job,
        _repository: Arc<dyn Repository>,
        progress: &mut ProgressRecorder,
    ) -> Result<WorkerResult, WorkerError> {
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {}
            _ = ctx.cancellation_token.cancelled() => return Err(WorkerError::Cancelled),
        }
        progress.set_message("done sleeping");
        Ok(progress.to_result())
    }
}

/// Counts how many times each sync job was processed.
#[derive(Default)]
pub struct CountingWorker {
    runs: Mutex<HashMap<JobKey, usize>>,
}

impl CountingWorker {
    pub fn runs(&self) -> HashMap<JobKey, usize> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Worker for CountingWorker {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn matches(&self, job: &Job) -> bool {
        job.kind() == JobKind::Sync
    }

    async fn process(
        &self,
        _ctx: &WorkerContext,
        job: &Job,
        _repository: Arc<dyn Repository>,
        progress: &mut ProgressRecorder,
    ) -> Result<WorkerResult, WorkerError> {
        *self.runs.lock().unwrap().entry(job.key.clone()).or_default() += 1;
        tokio::time::sleep(Duration::from_millis(5)).await;
        progress.set_message("counted");
        Ok(progress.to_result())
    }
}

/// Blocks its thread for `stall` like a frozen process, so the slot cannot
/// renew its lease, then waits for cancellation.
pub struct StallingWorker {
    stall: Duration,
    runs: AtomicUsize,
    cancelled: AtomicBool,
}

impl StallingWorker {
    pub fn new(stall: Duration) -> Self {
        Self {
            stall,
            runs: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for StallingWorker {
    fn name(&self) -> &'static str {
        "stalling"
    }

    fn matches(&self, job: &Job) -> bool {
        job.kind() == JobKind::Sync
    }

    async fn process(
        &self,
        ctx: &WorkerContext,
        _job: &Job,
        _repository: Arc<dyn Repository>,
        progress: &mut ProgressRecorder,
    ) -> Result<WorkerResult, WorkerError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.stall);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(30)) => {}
            _ = ctx.cancellation_token.cancelled() => {
                self.cancelled.store(true, Ordering::SeqCst);
                return Err(WorkerError::Cancelled);
            }
        }
        progress.set_message("woke up");
        Ok(progress.to_result())
    }
}
