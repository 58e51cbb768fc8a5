use super::{AbortCause, DriverShared, JobOutcome};
use crate::history::HistoricJob;
use crate::jobs::{
    lease_expiry, ClaimFilter, Job, JobEventKind, JobKey, JobState, JobStatus, JobStoreError,
};
use crate::metrics;
use crate::workers::{ProgressRecorder, WorkerContext, WorkerError, WorkerResult};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One unit of the driver's pool: `Idle -> Claiming -> Running -> Finalizing`.
pub(super) struct Slot {
    shared: Arc<DriverShared>,
    holder: String,
    filter: ClaimFilter,
}

impl Slot {
    pub(super) fn new(shared: Arc<DriverShared>, index: usize) -> Self {
        let holder = shared.config.holder_for_slot(index);
        let filter = shared.config.effective_claim_filter();
        Self {
            shared,
            holder,
            filter,
        }
    }

    pub(super) async fn run(self, shutdown: CancellationToken) {
        let mut subscription = self.shared.store.subscribe();
        let mut poll = tokio::time::interval(self.shared.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("Slot {} started", self.holder);

        loop {
            // Idle
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = poll.tick() => {}
                event = subscription.recv() => {
                    if !matches!(event.kind, JobEventKind::Created | JobEventKind::Released) {
                        continue;
                    }
                    debug!("Slot {} woken by {:?} on {}", self.holder, event.kind, event.key);
                }
            }

            // Claiming
            while !shutdown.is_cancelled() {
                match self.shared.store.claim(
                    &self.filter,
                    &self.holder,
                    self.shared.config.lease_duration,
                ) {
                    Ok(Some(job)) => self.execute(job, &shutdown).await,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Slot {} failed to claim: {}", self.holder, e);
                        break;
                    }
                }
            }
        }
        debug!("Slot {} stopped", self.holder);
    }

    async fn execute(&self, job: Job, shutdown: &CancellationToken) {
        let started = Instant::now();
        let kind = job.kind();
        metrics::record_job_claimed(kind.as_str());
        info!(
            "Slot {} claimed {} job {} (attempt {})",
            self.holder, kind, job.key, job.attempts
        );

        let outcome = self.run_job(&job, shutdown).await;
        let label = self.finalize(&job, outcome);
        metrics::record_job_finished(kind.as_str(), label, started.elapsed());
    }

    /// Running: resolve, dispatch and supervise the worker.
    pub(super) async fn run_job(&self, job: &Job, shutdown: &CancellationToken) -> JobOutcome {
        let repository = match self.shared.resolver.resolve(&job.spec.repository).await {
            Ok(repository) => repository,
            Err(e) => {
                return JobOutcome::Completed(failed_status(
                    &job.status,
                    format!("failed to resolve repository {}: {}", job.spec.repository, e),
                ))
            }
        };
        let worker = match self.shared.workers.select(job) {
            Ok(worker) => worker,
            Err(e) => return JobOutcome::Completed(failed_status(&job.status, e.to_string())),
        };
        debug!("Dispatching {} to worker {}", job.key, worker.name());

        let config = &self.shared.config;
        let token = shutdown.child_token();
        let ctx = WorkerContext::new(job.key.clone(), token.clone());
        let mut progress = ProgressRecorder::new(
            self.shared.store.clone(),
            job.key.clone(),
            self.holder.clone(),
            job.status.clone(),
            config.progress_interval,
        );

        let (result, abort) = {
            let process = worker.process(&ctx, job, repository, &mut progress);
            tokio::pin!(process);
            let renewal = self.hold_lease(&job.key);
            tokio::pin!(renewal);
            let deadline = tokio::time::sleep(config.max_job_duration);
            tokio::pin!(deadline);

            let abort = tokio::select! {
                result = &mut process => Ok(result),
                _ = &mut renewal => Err(AbortCause::LeaseLost),
                _ = &mut deadline => Err(AbortCause::Timeout),
                _ = shutdown.cancelled() => Err(AbortCause::Shutdown),
            };
            match abort {
                Ok(result) => (Some(result), None),
                Err(cause) => {
                    warn!("Aborting job {}: {:?}", job.key, cause);
                    token.cancel();
                    // Renewal continues through the grace period.
                    let grace = tokio::time::sleep(config.abort_grace);
                    tokio::pin!(grace);
                    tokio::select! {
                        result = &mut process => (Some(result), Some(cause)),
                        _ = &mut renewal, if cause != AbortCause::LeaseLost => {
                            (None, Some(AbortCause::LeaseLost))
                        }
                        _ = &mut grace => {
                            warn!(
                                "Worker {} ignored cancellation of {} for {:?}",
                                worker.name(),
                                job.key,
                                config.abort_grace
                            );
                            (None, Some(cause))
                        }
                    }
                }
            }
        };

        match (abort, result) {
            (Some(cause), _) => JobOutcome::from_abort(cause, || {
                let message = format!(
                    "job exceeded the maximum duration of {:?}",
                    config.max_job_duration
                );
                let mut status = progress.status(JobState::Timeout);
                status.push_error(message.clone());
                status.message = message;
                status
            }),
            (None, Some(Ok(result))) => JobOutcome::Completed(completed_status(&progress, result)),
            (None, Some(Err(WorkerError::Cancelled))) if shutdown.is_cancelled() => {
                JobOutcome::Interrupted
            }
            (None, Some(Err(e))) => {
                let mut status = progress.status(JobState::Failed);
                status.message = e.to_string();
                status.push_error(e.to_string());
                JobOutcome::Completed(status)
            }
            (None, None) => JobOutcome::Completed(failed_status(
                &job.status,
                "worker returned no result".to_string(),
            )),
        }
    }

    /// Renew the lease every renewal interval. Resolves only once the lease is lost.
    async fn hold_lease(&self, key: &JobKey) {
        let config = &self.shared.config;
        let period = config.lease_renewal_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let expiry = lease_expiry(Utc::now(), config.lease_duration);
            match self.shared.store.renew_lease(key, &self.holder, expiry) {
                Ok(_) => {
                    metrics::record_lease_renewal("renewed");
                    debug!("Renewed lease on {} until {}", key, expiry);
                }
                Err(JobStoreError::LeaseLost(_)) | Err(JobStoreError::NotFound(_)) => {
                    metrics::record_lease_renewal("lost");
                    warn!("Slot {} lost the lease on {}", self.holder, key);
                    return;
                }
                Err(e) => {
                    // Retried on the next tick; an expired lease surfaces as LeaseLost.
                    metrics::record_lease_renewal("error");
                    warn!("Failed to renew lease on {}: {}", key, e);
                }
            }
        }
    }

    /// Finalizing. Returns the label recorded in metrics.
    pub(super) fn finalize(&self, job: &Job, outcome: JobOutcome) -> &'static str {
        let label = outcome.label();
        match outcome {
            JobOutcome::Completed(status) => {
                let store = &self.shared.store;
                match store.update_status(&job.key, &self.holder, &status) {
                    Ok(()) => {}
                    // NotFound: the abandoned job cleaner already finalized it.
                    Err(JobStoreError::LeaseLost(_)) | Err(JobStoreError::NotFound(_)) => {
                        warn!(
                            "Lease on {} lost before its {} result was saved; dropping it",
                            job.key, status.state
                        );
                        return "lease_lost";
                    }
                    Err(e) => warn!("Failed to persist final status of {}: {}", job.key, e),
                }

                let now = Utc::now();
                let mut finished = job.clone();
                finished.lease = None;
                finished.apply_status(status, now);

                if let Err(e) = store.delete(&job.key) {
                    warn!("Failed to delete finished job {}: {}", job.key, e);
                }
                if let Err(e) = self.shared.history.write(&HistoricJob::from_job(&finished, now)) {
                    error!("Failed to write history for {}: {:#}", job.key, e);
                    metrics::record_history_write_failure();
                }
                info!(
                    "Job {} finished as {}: {}",
                    job.key, finished.status.state, finished.status.message
                );
            }
            JobOutcome::LeaseLost => {
                warn!("Dropping result of {}: lease is held elsewhere", job.key);
            }
            JobOutcome::Interrupted => {
                match self.shared.store.release_lease(
                    &job.key,
                    &self.holder,
                    "released on controller shutdown",
                ) {
                    Ok(()) => info!("Released {} for another controller", job.key),
                    Err(e) => warn!("Failed to release {}: {}", job.key, e),
                }
            }
        }
        label
    }
}

fn failed_status(base: &JobStatus, message: String) -> JobStatus {
    let mut status = base.clone();
    status.state = JobState::Failed;
    status.push_error(message.clone());
    status.message = message;
    status
}

fn completed_status(progress: &ProgressRecorder, result: WorkerResult) -> JobStatus {
    if !result.state.is_terminal() {
        let mut status = progress.status(JobState::Failed);
        let message = format!("worker returned non-terminal state {}", result.state);
        status.push_error(message.clone());
        status.message = message;
        return status;
    }
    let mut status = progress.status(result.state);
    status.message = result.message;
    status.summary = result.summary;
    status
}
