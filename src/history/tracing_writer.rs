use super::{HistoricJob, HistoryWriter};
use anyhow::Result;
use tracing::info;

/// Emits one structured event per finished job under the `job_history` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHistoryWriter;

impl HistoryWriter for TracingHistoryWriter {
    fn write(&self, job: &HistoricJob) -> Result<()> {
        let duration_ms = job.duration().map(|d| d.num_milliseconds()).unwrap_or(0);
        info!(
            target: "job_history",
            namespace = %job.key.namespace,
            name = %job.key.name,
            uid = %job.uid,
            kind = %job.spec.kind(),
            repository = %job.spec.repository,
            state = %job.status.state,
            attempts = job.attempts,
            duration_ms,
            errors = job.status.errors.len(),
            "{}",
            job.status.message
        );
        Ok(())
    }
}
