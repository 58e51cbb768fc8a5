//! Common test infrastructure
//!
//! A [`TestController`] owns a temporary directory with the job and history
//! databases, one local repository (`team/dashboards`) and the mirror the
//! reference workers sync into. Tests open as many stores on it as they need,
//! which is how several controller instances share one database.

#![allow(dead_code)]

mod workers;

pub use workers::{CountingWorker, SlowWorker, StallingWorker};

use repo_job_controller::driver::{DriverConfig, JobDriver};
use repo_job_controller::history::{HistoryStore, SqliteHistoryStore};
use repo_job_controller::jobs::{
    Job, JobAction, JobKey, JobNotifier, JobSpec, RepositoryRef, SqliteJobStore,
};
use repo_job_controller::repository::{RepositorySettings, StaticRepositoryResolver};
use repo_job_controller::workers::{DirectoryMirror, WorkerRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const NAMESPACE: &str = "team";
pub const REPOSITORY: &str = "dashboards";

pub struct TestController {
    pub dir: TempDir,
    pub repository: RepositorySettings,
}

impl TestController {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let repository = RepositorySettings {
            namespace: NAMESPACE.to_string(),
            name: REPOSITORY.to_string(),
            path: dir.path().join("repository"),
            branch: "main".to_string(),
            read_only: false,
            sync_enabled: true,
        };
        Self { dir, repository }
    }

    pub fn jobs_db_path(&self) -> PathBuf {
        self.dir.path().join("jobs.db")
    }

    pub fn mirror_dir(&self) -> PathBuf {
        self.dir.path().join("mirror")
    }

    /// A new connection to the shared jobs database, with its own notifier.
    pub fn job_store(&self) -> Arc<SqliteJobStore> {
        Arc::new(
            SqliteJobStore::new(self.jobs_db_path())
                .unwrap()
                .with_notifier(JobNotifier::new(16)),
        )
    }

    pub fn history_store(&self) -> Arc<SqliteHistoryStore> {
        Arc::new(SqliteHistoryStore::new(self.dir.path().join("history.db")).unwrap())
    }

    /// Write a file on the repository's default branch.
    pub fn seed_file(&self, path: &str, content: &str) {
        let full = self.repository.path.join("main").join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, content).unwrap();
    }

    pub fn mirror_file(&self, path: &str) -> Option<String> {
        std::fs::read_to_string(self.mirror_dir().join(NAMESPACE).join(path)).ok()
    }

    pub fn resolver(&self) -> Arc<StaticRepositoryResolver> {
        Arc::new(StaticRepositoryResolver::from_settings(&[self.repository.clone()]).unwrap())
    }

    pub fn standard_workers(&self) -> WorkerRegistry {
        let mirror = Arc::new(DirectoryMirror::new(self.mirror_dir()));
        WorkerRegistry::standard(mirror.clone(), mirror.clone(), mirror)
    }

    /// A driver over `store` writing into the shared history database.
    pub fn driver(
        &self,
        config: DriverConfig,
        store: Arc<SqliteJobStore>,
        workers: WorkerRegistry,
    ) -> JobDriver {
        let history = self.history_store();
        JobDriver::new(config, store, history.clone(), workers)
            .with_resolver(self.resolver())
            .with_history_store(history as Arc<dyn HistoryStore>)
    }
}

pub fn new_job(name: &str, action: JobAction) -> Job {
    Job::new(
        JobKey::new(NAMESPACE, name),
        JobSpec {
            repository: RepositoryRef::new(NAMESPACE, REPOSITORY),
            action,
        },
    )
}

pub fn sync_job(name: &str) -> Job {
    new_job(name, JobAction::Sync { incremental: false })
}

/// Timings small enough for tests; notification wake-ups are still exercised
/// because the poll interval stays long unless a test lowers it.
pub fn fast_config(identity: &str) -> DriverConfig {
    DriverConfig {
        identity: identity.to_string(),
        slots: 2,
        lease_duration: Duration::from_secs(10),
        lease_renewal_interval: Duration::from_secs(2),
        poll_interval: Duration::from_secs(30),
        cleanup_interval: Duration::from_millis(100),
        abort_grace: Duration::from_millis(200),
        shutdown_grace: Duration::from_secs(5),
        ..Default::default()
    }
}

pub struct RunningDriver {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl RunningDriver {
    pub fn spawn(driver: JobDriver) -> Self {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            driver.run(token).await.unwrap();
        });
        Self { shutdown, handle }
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("driver did not stop")
            .unwrap();
    }
}

/// Check `condition` every 20ms until it holds or `timeout` elapses.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
