//! Repository job controller library
//!
//! Leased job queue, worker dispatch and history for repository sync jobs.
//! The `job-controller` binary wires these modules together; tests use them directly.

pub mod background_jobs;
pub mod config;
pub mod driver;
pub mod history;
pub mod jobs;
pub mod metrics;
pub mod repository;
pub mod sqlite_persistence;
pub mod workers;

// Re-export commonly used types for convenience
pub use driver::{DriverConfig, DriverError, JobDriver};
pub use history::{HistoricJob, HistoryStore, HistoryWriter, SqliteHistoryStore};
pub use jobs::{Job, JobKey, JobState, JobStore, JobStoreError, SqliteJobStore};
pub use workers::WorkerRegistry;
