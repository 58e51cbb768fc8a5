use super::export::ensure_writable;
use super::sync::run_sync;
use super::{
    ItemAction, ItemOutcome, ProgressRecorder, Syncer, Worker, WorkerContext, WorkerError,
    WorkerResult,
};
use crate::jobs::{Job, JobAction, JobKind};
use crate::repository::Repository;
use async_trait::async_trait;
use std::sync::Arc;

/// Removes files from the repository. Deleting on the default branch is
/// followed by an incremental sync so the instance drops them too.
pub struct DeleteWorker {
    syncer: Arc<dyn Syncer>,
}

impl DeleteWorker {
    pub fn new(syncer: Arc<dyn Syncer>) -> Self {
        Self { syncer }
    }
}

#[async_trait]
impl Worker for DeleteWorker {
    fn name(&self) -> &'static str {
        "delete"
    }

    fn matches(&self, job: &Job) -> bool {
        job.kind() == JobKind::Delete
    }

    async fn process(
        &self,
        ctx: &WorkerContext,
        job: &Job,
        repository: Arc<dyn Repository>,
        progress: &mut ProgressRecorder,
    ) -> Result<WorkerResult, WorkerError> {
        let JobAction::Delete { git_ref, paths } = &job.spec.action else {
            return Err(WorkerError::InvalidJob(format!(
                "delete worker cannot run {} jobs",
                job.kind()
            )));
        };
        if paths.is_empty() {
            return Err(WorkerError::InvalidJob("no paths to delete".to_string()));
        }
        let repository = repository.as_ref();
        ensure_writable(repository)?;

        progress.set_total(paths.len());
        progress.set_message(format!("deleting {} paths", paths.len()));
        let message = format!("Delete requested by {}", job.key);
        for path in paths {
            ctx.checkpoint()?;
            let outcome = match repository.delete(path, git_ref.as_deref(), &message).await {
                Ok(()) => ItemOutcome::ok(path, ItemAction::Deleted),
                Err(e) => ItemOutcome::failed(path, ItemAction::Deleted, e),
            };
            progress.record(outcome);
        }

        if git_ref.is_none() {
            progress.set_message("syncing after delete");
            run_sync(self.syncer.as_ref(), ctx, repository, true, progress)
                .await
                .map_err(|e| e.in_phase("sync"))?;
        }

        progress.set_message(format!("deleted {} paths", paths.len()));
        Ok(progress.to_result())
    }
}
