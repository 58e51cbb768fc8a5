//! Live job records, the claim/lease protocol and change notifications.

mod memory_job_store;
mod models;
pub mod notifier;
mod schema;
mod sqlite_job_store;

pub use memory_job_store::InMemoryJobStore;
pub use models::*;
pub use notifier::{JobEvent, JobEventKind, JobNotifier, JobSubscription};
pub use schema::JOB_VERSIONED_SCHEMAS;
pub use sqlite_job_store::SqliteJobStore;

use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    #[error("job {0} already exists")]
    AlreadyExists(JobKey),

    #[error("job {0} not found")]
    NotFound(JobKey),

    #[error("lease on job {0} is no longer held")]
    LeaseLost(JobKey),

    #[error("job store unavailable: {0:#}")]
    Unavailable(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for JobStoreError {
    fn from(err: rusqlite::Error) -> Self {
        JobStoreError::Unavailable(err.into())
    }
}

impl From<serde_json::Error> for JobStoreError {
    fn from(err: serde_json::Error) -> Self {
        JobStoreError::Unavailable(err.into())
    }
}

/// Durable store of live (not yet finished) jobs.
///
/// Every write that succeeds publishes a [`JobEvent`] to subscribers.
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with `AlreadyExists` when the key is taken.
    fn create(&self, job: Job) -> Result<Job, JobStoreError>;

    fn get(&self, key: &JobKey) -> Result<Option<Job>, JobStoreError>;

    /// All live jobs in creation order, optionally restricted to one namespace.
    fn list(&self, namespace: Option<&str>) -> Result<Vec<Job>, JobStoreError>;

    /// Atomically lease the oldest claimable job matching `filter`.
    ///
    /// Losing a race on one candidate moves on to the next; `None` means
    /// nothing was claimable.
    fn claim(
        &self,
        filter: &ClaimFilter,
        holder: &str,
        lease_duration: Duration,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Extend a lease still held by `holder`.
    fn renew_lease(
        &self,
        key: &JobKey,
        holder: &str,
        new_expiry: DateTime<Utc>,
    ) -> Result<Lease, JobStoreError>;

    /// Replace the status of a job whose lease `holder` still holds.
    fn update_status(
        &self,
        key: &JobKey,
        holder: &str,
        status: &JobStatus,
    ) -> Result<(), JobStoreError>;

    /// Give the job back: the lease is cleared and the job is `Pending` again.
    fn release_lease(&self, key: &JobKey, holder: &str, message: &str)
        -> Result<(), JobStoreError>;

    /// Remove a live record. Deleting a missing job is not an error.
    fn delete(&self, key: &JobKey) -> Result<(), JobStoreError>;

    /// Non-terminal jobs whose lease expired at or before `now`.
    fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError>;

    /// Fail a job whose lease has expired. Returns `None` when the job was
    /// claimed again (or removed) in the meantime.
    fn abandon(&self, key: &JobKey, message: &str) -> Result<Option<Job>, JobStoreError>;

    fn subscribe(&self) -> JobSubscription;
}

pub(crate) fn lease_expiry(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    now + chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}
