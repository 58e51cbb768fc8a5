//! Periodic housekeeping that runs alongside the job driver.
//!
//! Jobs here are interval-driven and blocking (SQLite sweeps); the scheduler
//! runs each on `spawn_blocking` and never overlaps two runs of the same job.

mod context;
mod job;
mod scheduler;

pub use context::JobContext;
pub use job::{BackgroundJob, JobError, ShutdownBehavior};
pub use scheduler::JobScheduler;
