//! Bounded pool of slots running the claim, execute, finalize loop.
//!
//! Every slot owns one lease holder name. A slot sleeps until the poll tick
//! or a store notification, claims jobs until none is left, and executes each
//! one under the max-duration deadline while renewing its lease. Housekeeping
//! (abandoned jobs, history retention) runs on the background job scheduler.

mod cleanup;
mod config;
mod slot;

pub use cleanup::{AbandonedJobCleaner, CleanupReport};
pub use config::*;

use crate::background_jobs::{BackgroundJob, JobScheduler};
use crate::history::{HistoryCleaner, HistoryStore, HistoryWriter};
use crate::jobs::{JobStatus, JobStore};
use crate::repository::RepositoryResolver;
use crate::workers::WorkerRegistry;
use slot::Slot;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("missing required dependency: {0}")]
    MissingDependency(&'static str),

    #[error("invalid driver configuration: {0}")]
    InvalidConfig(String),
}

/// Why the driver stopped a worker before it returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortCause {
    /// The max job duration elapsed.
    Timeout,
    /// Renewal found the lease held by someone else, or gone.
    LeaseLost,
    /// The driver is shutting down.
    Shutdown,
}

/// How one execution ended, as seen by the slot that finalizes it.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// A terminal status to persist before the job moves to history.
    Completed(JobStatus),
    /// Another holder owns the job. Nothing may be written.
    LeaseLost,
    /// Stopped by shutdown. The job is handed back to the store.
    Interrupted,
}

impl JobOutcome {
    pub fn from_abort(cause: AbortCause, timed_out: impl FnOnce() -> JobStatus) -> Self {
        match cause {
            AbortCause::Timeout => JobOutcome::Completed(timed_out()),
            AbortCause::LeaseLost => JobOutcome::LeaseLost,
            AbortCause::Shutdown => JobOutcome::Interrupted,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Completed(status) => status.state.as_str(),
            JobOutcome::LeaseLost => "lease_lost",
            JobOutcome::Interrupted => "interrupted",
        }
    }
}

/// Shared by every slot of one driver.
pub(crate) struct DriverShared {
    pub(crate) config: DriverConfig,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) history: Arc<dyn HistoryWriter>,
    pub(crate) resolver: Arc<dyn RepositoryResolver>,
    pub(crate) workers: WorkerRegistry,
}

pub struct JobDriver {
    config: DriverConfig,
    store: Arc<dyn JobStore>,
    history: Arc<dyn HistoryWriter>,
    resolver: Option<Arc<dyn RepositoryResolver>>,
    workers: WorkerRegistry,
    history_store: Option<Arc<dyn HistoryStore>>,
    background_jobs: Vec<Arc<dyn BackgroundJob>>,
}

impl JobDriver {
    pub fn new(
        config: DriverConfig,
        store: Arc<dyn JobStore>,
        history: Arc<dyn HistoryWriter>,
        workers: WorkerRegistry,
    ) -> Self {
        Self {
            config,
            store,
            history,
            resolver: None,
            workers,
            history_store: None,
            background_jobs: Vec::new(),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn RepositoryResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Enables age-based retention on `store` using `history_expiration`.
    pub fn with_history_store(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.history_store = Some(store);
        self
    }

    /// Extra housekeeping scheduled next to the built-in cleanup loops.
    pub fn with_background_job(mut self, job: Arc<dyn BackgroundJob>) -> Self {
        self.background_jobs.push(job);
        self
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    fn scheduler(&self, shutdown: CancellationToken) -> JobScheduler {
        let mut scheduler = JobScheduler::new(shutdown);
        scheduler.register_job(Arc::new(AbandonedJobCleaner::new(
            self.store.clone(),
            self.history.clone(),
            self.config.max_attempts,
            self.config.cleanup_interval,
        )));
        if let Some(store) = &self.history_store {
            scheduler.register_job(Arc::new(HistoryCleaner::new(
                store.clone(),
                self.config.history_expiration,
                self.config.cleanup_interval,
            )));
        }
        for job in &self.background_jobs {
            scheduler.register_job(job.clone());
        }
        scheduler
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Cancelling stops new claims and interrupts in-flight workers; slots
    /// still finalizing get `shutdown_grace` before they are aborted.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), DriverError> {
        self.config.validate()?;
        let resolver = self
            .resolver
            .clone()
            .ok_or(DriverError::MissingDependency("repository resolver"))?;
        if self.workers.is_empty() {
            return Err(DriverError::InvalidConfig(
                "no workers registered".to_string(),
            ));
        }

        let shared = Arc::new(DriverShared {
            config: self.config.clone(),
            store: self.store.clone(),
            history: self.history.clone(),
            resolver,
            workers: self.workers.clone(),
        });

        info!(
            "Starting job driver {} with {} slots (workers: {})",
            self.config.identity,
            self.config.slots,
            self.workers.names().join(", ")
        );

        let scheduler = self.scheduler(shutdown.clone());
        let scheduler_handle = tokio::spawn(scheduler.run());

        let mut slots = JoinSet::new();
        for index in 0..self.config.slots {
            let slot = Slot::new(shared.clone(), index);
            slots.spawn(slot.run(shutdown.clone()));
        }

        tokio::select! {
            _ = join_slots(&mut slots) => {}
            _ = shutdown.cancelled() => {}
        }
        if !slots.is_empty() {
            let grace = self.config.shutdown_grace;
            if tokio::time::timeout(grace, join_slots(&mut slots))
                .await
                .is_err()
            {
                warn!(
                    "{} slots still busy after {:?}, aborting them",
                    slots.len(),
                    grace
                );
                slots.abort_all();
                join_slots(&mut slots).await;
            }
        }

        if let Err(e) = scheduler_handle.await {
            error!("Background job scheduler failed: {}", e);
        }
        info!("Job driver {} stopped", self.config.identity);
        Ok(())
    }
}

async fn join_slots(slots: &mut JoinSet<()>) {
    while let Some(joined) = slots.join_next().await {
        if let Err(e) = joined {
            if !e.is_cancelled() {
                error!("Driver slot panicked: {}", e);
            }
        }
    }
}
