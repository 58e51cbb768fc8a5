use super::{
    ExportOptions, Exporter, ProgressRecorder, Worker, WorkerContext, WorkerError, WorkerResult,
};
use crate::jobs::{Job, JobAction, JobKind};
use crate::repository::Repository;
use async_trait::async_trait;
use std::sync::Arc;

/// Pushes instance content into the repository.
pub struct ExportWorker {
    exporter: Arc<dyn Exporter>,
}

impl ExportWorker {
    pub fn new(exporter: Arc<dyn Exporter>) -> Self {
        Self { exporter }
    }
}

pub(super) fn ensure_writable(repository: &dyn Repository) -> Result<(), WorkerError> {
    if repository.info().read_only {
        return Err(WorkerError::ReadOnly(repository.info().reference()));
    }
    Ok(())
}

#[async_trait]
impl Worker for ExportWorker {
    fn name(&self) -> &'static str {
        "export"
    }

    fn matches(&self, job: &Job) -> bool {
        job.kind() == JobKind::Export
    }

    async fn process(
        &self,
        ctx: &WorkerContext,
        job: &Job,
        repository: Arc<dyn Repository>,
        progress: &mut ProgressRecorder,
    ) -> Result<WorkerResult, WorkerError> {
        let JobAction::Export {
            branch,
            path,
            message,
        } = &job.spec.action
        else {
            return Err(WorkerError::InvalidJob(format!(
                "export worker cannot run {} jobs",
                job.kind()
            )));
        };
        ensure_writable(repository.as_ref())?;

        let options = ExportOptions {
            branch: branch.clone(),
            path: path.clone(),
            message: message
                .clone()
                .unwrap_or_else(|| format!("Export from {}", job.key)),
        };
        progress.set_message("exporting resources");
        self.exporter
            .export(ctx, repository.as_ref(), &options, progress)
            .await?;

        progress.set_message("export completed");
        Ok(progress.to_result())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobKey, JobSpec, JobState, JobStatus};
    use crate::repository::{LocalRepository, RepositoryInfo, RepositoryRef};
    use crate::workers::DirectoryMirror;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn export_job() -> Job {
        Job::new(
            JobKey::new("ns", "export-1"),
            JobSpec {
                repository: RepositoryRef::new("ns", "repo"),
                action: JobAction::Export {
                    branch: None,
                    path: None,
                    message: None,
                },
            },
        )
    }

    fn repository(dir: &TempDir, read_only: bool) -> Arc<dyn Repository> {
        let info = RepositoryInfo {
            namespace: "ns".to_string(),
            name: "repo".to_string(),
            branch: "main".to_string(),
            read_only,
            sync_enabled: true,
        };
        Arc::new(LocalRepository::new(info, &dir.path().join("repo")).unwrap())
    }

    #[tokio::test]
    async fn test_export_pushes_instance_content() {
        let dir = TempDir::new().unwrap();
        let mirror = Arc::new(DirectoryMirror::new(dir.path().join("instance")));
        let ns_dir = mirror.namespace_dir("ns");
        std::fs::create_dir_all(&ns_dir).unwrap();
        std::fs::write(ns_dir.join("a.json"), b"a").unwrap();
        std::fs::write(ns_dir.join("b.yaml"), b"b").unwrap();

        let repo = repository(&dir, false);
        let job = export_job();
        let ctx = WorkerContext::new(job.key.clone(), CancellationToken::new());
        let mut progress = ProgressRecorder::detached(JobStatus::pending(), Duration::ZERO);
        let result = ExportWorker::new(mirror)
            .process(&ctx, &job, repo.clone(), &mut progress)
            .await
            .unwrap();

        assert_eq!(result.state, JobState::Succeeded);
        assert_eq!(result.summary.len(), 2);
        assert_eq!(repo.list(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_read_only_repository_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mirror = Arc::new(DirectoryMirror::new(dir.path().join("instance")));
        let job = export_job();
        let ctx = WorkerContext::new(job.key.clone(), CancellationToken::new());
        let mut progress = ProgressRecorder::detached(JobStatus::pending(), Duration::ZERO);
        let err = ExportWorker::new(mirror)
            .process(&ctx, &job, repository(&dir, true), &mut progress)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::ReadOnly(_)));
    }
}
