//! Terminal records of finished jobs and their age-based retention.

mod memory_history_store;
mod retention;
mod schema;
mod sqlite_history_store;
mod tracing_writer;

pub use memory_history_store::InMemoryHistoryStore;
pub use retention::{HistoryCleaner, RetentionReport};
pub use schema::HISTORY_VERSIONED_SCHEMAS;
pub use sqlite_history_store::SqliteHistoryStore;
pub use tracing_writer::TracingHistoryWriter;

use crate::jobs::{Job, JobKey, JobSpec, JobStatus, StateTransition};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Immutable snapshot of a job at the moment it finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricJob {
    pub key: JobKey,
    pub uid: String,
    pub spec: JobSpec,
    pub status: JobStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub transitions: Vec<StateTransition>,
}

impl HistoricJob {
    /// Snapshot `job`. `finished_at` falls back to `now` when the status has none.
    pub fn from_job(job: &Job, now: DateTime<Utc>) -> Self {
        Self {
            key: job.key.clone(),
            uid: job.uid.clone(),
            spec: job.spec.clone(),
            status: job.status.clone(),
            attempts: job.attempts,
            created_at: job.created_at,
            finished_at: job.status.finished_at.unwrap_or(now),
            transitions: job.transitions.clone(),
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.status.started_at.map(|started| self.finished_at - started)
    }
}

/// Append-only sink for finished jobs.
pub trait HistoryWriter: Send + Sync {
    fn write(&self, job: &HistoricJob) -> Result<()>;
}

/// Queryable history, with the deletion surface retention needs.
pub trait HistoryStore: HistoryWriter {
    fn get(&self, uid: &str) -> Result<Option<HistoricJob>>;

    /// Most recently finished first.
    fn list(&self, namespace: Option<&str>, limit: usize) -> Result<Vec<HistoricJob>>;

    /// Records with `finished_at` strictly before `cutoff`, oldest first.
    fn list_finished_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<HistoricJob>>;

    /// Returns whether a record was removed.
    fn delete(&self, uid: &str) -> Result<bool>;
}

/// Writes every record to each inner writer. All writers are attempted; the
/// first error is returned.
pub struct FanoutHistoryWriter {
    writers: Vec<Arc<dyn HistoryWriter>>,
}

impl FanoutHistoryWriter {
    pub fn new(writers: Vec<Arc<dyn HistoryWriter>>) -> Self {
        Self { writers }
    }
}

impl HistoryWriter for FanoutHistoryWriter {
    fn write(&self, job: &HistoricJob) -> Result<()> {
        let mut first_error = None;
        for writer in &self.writers {
            if let Err(e) = writer.write(job) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
