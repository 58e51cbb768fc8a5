//! Job executors and the content interfaces they drive.
//!
//! The driver picks exactly one [`Worker`] per job through a
//! [`WorkerRegistry`]. Workers never persist terminal state themselves: they
//! stream progress through a [`ProgressRecorder`] and return a
//! [`WorkerResult`] that the driver finalizes.

mod delete;
mod export;
mod migrate;
mod mirror;
mod move_files;
mod progress;
mod sync;

pub use delete::DeleteWorker;
pub use export::ExportWorker;
pub use migrate::MigrateWorker;
pub use mirror::DirectoryMirror;
pub use move_files::MoveWorker;
pub use progress::{ProgressRecorder, DEFAULT_PROGRESS_INTERVAL};
pub use sync::SyncWorker;

use crate::jobs::{Job, JobKey, JobKind, JobState, ResourceSummary};
use crate::repository::{Repository, RepositoryError, RepositoryRef};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Outcomes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemAction {
    Created,
    Updated,
    Deleted,
    Unchanged,
    Moved,
}

/// What happened to one file or resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub path: String,
    /// Summary group, derived from the path.
    pub group: String,
    pub action: ItemAction,
    pub error: Option<String>,
}

impl ItemOutcome {
    pub fn ok(path: impl Into<String>, action: ItemAction) -> Self {
        let path = path.into();
        Self {
            group: group_for(&path),
            path,
            action,
            error: None,
        }
    }

    pub fn failed(path: impl Into<String>, action: ItemAction, error: impl ToString) -> Self {
        let mut outcome = Self::ok(path, action);
        outcome.error = Some(error.to_string());
        outcome
    }
}

fn group_for(path: &str) -> String {
    if path.ends_with('/') {
        return "directory".to_string();
    }
    Path::new(path)
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| "file".to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub state: JobState,
    pub message: String,
    pub summary: Vec<ResourceSummary>,
    pub items: Vec<ItemOutcome>,
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("cancelled")]
    Cancelled,

    #[error("sync is disabled for repository {0}")]
    SyncDisabled(RepositoryRef),

    #[error("repository {0} is read-only")]
    ReadOnly(RepositoryRef),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("{phase} phase failed: {source}")]
    Phase {
        phase: &'static str,
        #[source]
        source: Box<WorkerError>,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("{0}")]
    Failed(String),
}

impl WorkerError {
    pub fn in_phase(self, phase: &'static str) -> Self {
        match self {
            WorkerError::Cancelled => WorkerError::Cancelled,
            other => WorkerError::Phase {
                phase,
                source: Box::new(other),
            },
        }
    }
}

/// Raised when a job cannot be routed to exactly one worker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("no worker registered for {0} jobs")]
    NoMatchingWorker(JobKind),

    #[error("several workers match {kind} jobs: {}", .workers.join(", "))]
    AmbiguousWorker {
        kind: JobKind,
        workers: Vec<&'static str>,
    },
}

// =============================================================================
// Worker
// =============================================================================

/// Per-execution context handed to a worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub key: JobKey,
    pub cancellation_token: CancellationToken,
}

impl WorkerContext {
    pub fn new(key: JobKey, cancellation_token: CancellationToken) -> Self {
        Self {
            key,
            cancellation_token,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// `Err(Cancelled)` once the driver has aborted this execution.
    pub fn checkpoint(&self) -> Result<(), WorkerError> {
        if self.is_cancelled() {
            Err(WorkerError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &'static str;

    fn matches(&self, job: &Job) -> bool;

    async fn process(
        &self,
        ctx: &WorkerContext,
        job: &Job,
        repository: Arc<dyn Repository>,
        progress: &mut ProgressRecorder,
    ) -> Result<WorkerResult, WorkerError>;
}

/// Workers in registration order.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    workers: Vec<Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The five standard workers on top of one content backend.
    pub fn standard(
        syncer: Arc<dyn Syncer>,
        exporter: Arc<dyn Exporter>,
        cleaner: Arc<dyn NamespaceCleaner>,
    ) -> Self {
        Self::new()
            .with_worker(Arc::new(SyncWorker::new(syncer.clone())))
            .with_worker(Arc::new(ExportWorker::new(exporter.clone())))
            .with_worker(Arc::new(MigrateWorker::new(
                exporter,
                cleaner,
                syncer.clone(),
            )))
            .with_worker(Arc::new(DeleteWorker::new(syncer.clone())))
            .with_worker(Arc::new(MoveWorker::new(syncer)))
    }

    pub fn with_worker(mut self, worker: Arc<dyn Worker>) -> Self {
        self.workers.push(worker);
        self
    }

    pub fn register(&mut self, worker: Arc<dyn Worker>) {
        self.workers.push(worker);
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.workers.iter().map(|w| w.name()).collect()
    }

    /// The single worker matching `job`.
    pub fn select(&self, job: &Job) -> Result<Arc<dyn Worker>, DispatchError> {
        let mut matching = self.workers.iter().filter(|w| w.matches(job));
        let Some(first) = matching.next() else {
            return Err(DispatchError::NoMatchingWorker(job.kind()));
        };
        let others: Vec<&'static str> = matching.map(|w| w.name()).collect();
        if !others.is_empty() {
            let mut workers = vec![first.name()];
            workers.extend(others);
            return Err(DispatchError::AmbiguousWorker {
                kind: job.kind(),
                workers,
            });
        }
        Ok(Arc::clone(first))
    }
}

// =============================================================================
// Content interfaces
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Leave unchanged content out of the item list.
    pub incremental: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportOptions {
    pub branch: Option<String>,
    /// Directory prefix inside the repository.
    pub path: Option<String>,
    pub message: String,
}

/// Pulls repository content into the instance.
#[async_trait]
pub trait Syncer: Send + Sync {
    async fn sync(
        &self,
        ctx: &WorkerContext,
        repository: &dyn Repository,
        options: &SyncOptions,
        progress: &mut ProgressRecorder,
    ) -> Result<(), WorkerError>;
}

/// Pushes instance content into the repository.
#[async_trait]
pub trait Exporter: Send + Sync {
    async fn export(
        &self,
        ctx: &WorkerContext,
        repository: &dyn Repository,
        options: &ExportOptions,
        progress: &mut ProgressRecorder,
    ) -> Result<(), WorkerError>;
}

/// Removes every resource an instance holds for a namespace.
#[async_trait]
pub trait NamespaceCleaner: Send + Sync {
    async fn clean(
        &self,
        ctx: &WorkerContext,
        namespace: &str,
        progress: &mut ProgressRecorder,
    ) -> Result<(), WorkerError>;
}
