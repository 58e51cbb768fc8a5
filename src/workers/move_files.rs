use super::export::ensure_writable;
use super::sync::run_sync;
use super::{
    ItemAction, ItemOutcome, ProgressRecorder, Syncer, Worker, WorkerContext, WorkerError,
    WorkerResult,
};
use crate::jobs::{Job, JobAction, JobKind};
use crate::repository::{base_name, normalize_path, Repository};
use async_trait::async_trait;
use std::sync::Arc;

/// Moves files into a target directory of the repository.
pub struct MoveWorker {
    syncer: Arc<dyn Syncer>,
}

impl MoveWorker {
    pub fn new(syncer: Arc<dyn Syncer>) -> Self {
        Self { syncer }
    }
}

#[async_trait]
impl Worker for MoveWorker {
    fn name(&self) -> &'static str {
        "move"
    }

    fn matches(&self, job: &Job) -> bool {
        job.kind() == JobKind::Move
    }

    async fn process(
        &self,
        ctx: &WorkerContext,
        job: &Job,
        repository: Arc<dyn Repository>,
        progress: &mut ProgressRecorder,
    ) -> Result<WorkerResult, WorkerError> {
        let JobAction::Move {
            git_ref,
            paths,
            target_path,
        } = &job.spec.action
        else {
            return Err(WorkerError::InvalidJob(format!(
                "move worker cannot run {} jobs",
                job.kind()
            )));
        };
        if !target_path.ends_with('/') {
            return Err(WorkerError::InvalidJob(format!(
                "target path {} is not a directory",
                target_path
            )));
        }
        let target_dir = normalize_path(target_path)?;
        if paths.is_empty() {
            return Err(WorkerError::InvalidJob("no paths to move".to_string()));
        }
        let repository = repository.as_ref();
        ensure_writable(repository)?;

        progress.set_total(paths.len());
        progress.set_message(format!("moving {} paths to {}", paths.len(), target_dir));
        let message = format!("Move requested by {}", job.key);
        for path in paths {
            ctx.checkpoint()?;
            let destination = format!("{}{}", target_dir, base_name(path));
            let outcome = match repository
                .rename(path, &destination, git_ref.as_deref(), &message)
                .await
            {
                Ok(()) => ItemOutcome::ok(destination, ItemAction::Moved),
                Err(e) => ItemOutcome::failed(path, ItemAction::Moved, e),
            };
            progress.record(outcome);
        }

        if git_ref.is_none() {
            progress.set_message("syncing after move");
            run_sync(self.syncer.as_ref(), ctx, repository, true, progress)
                .await
                .map_err(|e| e.in_phase("sync"))?;
        }

        progress.set_message(format!("moved {} paths", paths.len()));
        Ok(progress.to_result())
    }
}
