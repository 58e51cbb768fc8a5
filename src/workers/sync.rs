use super::{
    ProgressRecorder, SyncOptions, Syncer, Worker, WorkerContext, WorkerError, WorkerResult,
};
use crate::jobs::{Job, JobAction, JobKind};
use crate::repository::Repository;
use async_trait::async_trait;
use std::sync::Arc;

/// Pulls a repository into the instance.
pub struct SyncWorker {
    syncer: Arc<dyn Syncer>,
}

impl SyncWorker {
    pub fn new(syncer: Arc<dyn Syncer>) -> Self {
        Self { syncer }
    }
}

/// Shared by every worker that ends with a sync. Fails when the repository
/// does not allow pulling content.
pub(super) async fn run_sync(
    syncer: &dyn Syncer,
    ctx: &WorkerContext,
    repository: &dyn Repository,
    incremental: bool,
    progress: &mut ProgressRecorder,
) -> Result<(), WorkerError> {
    if !repository.info().sync_enabled {
        return Err(WorkerError::SyncDisabled(repository.info().reference()));
    }
    syncer
        .sync(ctx, repository, &SyncOptions { incremental }, progress)
        .await
}

#[async_trait]
impl Worker for SyncWorker {
    fn name(&self) -> &'static str {
        "sync"
    }

    fn matches(&self, job: &Job) -> bool {
        job.kind() == JobKind::Sync
    }

    async fn process(
        &self,
        ctx: &WorkerContext,
        job: &Job,
        repository: Arc<dyn Repository>,
        progress: &mut ProgressRecorder,
    ) -> Result<WorkerResult, WorkerError> {
        let JobAction::Sync { incremental } = job.spec.action else {
            return Err(WorkerError::InvalidJob(format!(
                "sync worker cannot run {} jobs",
                job.kind()
            )));
        };

        progress.set_message(if incremental {
            "incremental sync"
        } else {
            "full sync"
        });
        run_sync(
            self.syncer.as_ref(),
            ctx,
            repository.as_ref(),
            incremental,
            progress,
        )
        .await?;

        progress.set_message("sync completed");
        Ok(progress.to_result())
    }
}
