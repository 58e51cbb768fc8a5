use super::export::ensure_writable;
use super::sync::run_sync;
use super::{
    ExportOptions, Exporter, NamespaceCleaner, ProgressRecorder, Syncer, Worker, WorkerContext,
    WorkerError, WorkerResult,
};
use crate::jobs::{Job, JobAction, JobKind};
use crate::repository::Repository;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Moves a namespace under repository management: export everything, wipe
/// the namespace, then sync it back from the repository.
pub struct MigrateWorker {
    exporter: Arc<dyn Exporter>,
    cleaner: Arc<dyn NamespaceCleaner>,
    syncer: Arc<dyn Syncer>,
}

impl MigrateWorker {
    pub fn new(
        exporter: Arc<dyn Exporter>,
        cleaner: Arc<dyn NamespaceCleaner>,
        syncer: Arc<dyn Syncer>,
    ) -> Self {
        Self {
            exporter,
            cleaner,
            syncer,
        }
    }
}

#[async_trait]
impl Worker for MigrateWorker {
    fn name(&self) -> &'static str {
        "migrate"
    }

    fn matches(&self, job: &Job) -> bool {
        job.kind() == JobKind::Migrate
    }

    async fn process(
        &self,
        ctx: &WorkerContext,
        job: &Job,
        repository: Arc<dyn Repository>,
        progress: &mut ProgressRecorder,
    ) -> Result<WorkerResult, WorkerError> {
        let JobAction::Migrate { history, message } = &job.spec.action else {
            return Err(WorkerError::InvalidJob(format!(
                "migrate worker cannot run {} jobs",
                job.kind()
            )));
        };
        let repository = repository.as_ref();
        ensure_writable(repository)?;
        if !repository.info().sync_enabled {
            return Err(WorkerError::SyncDisabled(repository.info().reference()));
        }
        let namespace = repository.info().namespace.clone();

        progress.set_message(if *history {
            "exporting resources with history"
        } else {
            "exporting resources"
        });
        let options = ExportOptions {
            branch: None,
            path: None,
            message: message.clone().unwrap_or_else(|| {
                format!(
                    "Migrate {} into {}",
                    namespace,
                    repository.info().reference()
                )
            }),
        };
        self.exporter
            .export(ctx, repository, &options, progress)
            .await
            .map_err(|e| e.in_phase("export"))?;
        ctx.checkpoint()?;

        progress.set_message("cleaning namespace");
        self.cleaner
            .clean(ctx, &namespace, progress)
            .await
            .map_err(|e| e.in_phase("clean"))?;
        ctx.checkpoint()?;

        progress.set_message("syncing from repository");
        run_sync(self.syncer.as_ref(), ctx, repository, false, progress)
            .await
            .map_err(|e| e.in_phase("sync"))?;

        info!("Migrated namespace {} into {}", namespace, repository.info().reference());
        progress.set_message("migration completed");
        Ok(progress.to_result())
    }
}
