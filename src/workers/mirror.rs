//! Filesystem-backed instance content.
//!
//! Each namespace lives in `<root>/<namespace>/`. Content is compared by
//! SHA-256, so unchanged files are never rewritten.

use super::{
    ExportOptions, Exporter, ItemAction, ItemOutcome, NamespaceCleaner, ProgressRecorder,
    SyncOptions, Syncer, WorkerContext, WorkerError,
};
use crate::repository::{
    content_hash, normalize_path, scan_directory, FileEntry, Repository, RepositoryError,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[cfg(feature = "slowdown")]
const SLOWDOWN_PER_ITEM: std::time::Duration = std::time::Duration::from_millis(250);

pub struct DirectoryMirror {
    root: PathBuf,
}

impl DirectoryMirror {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join(namespace)
    }

    async fn scan(&self, dir: PathBuf) -> Result<Vec<FileEntry>, WorkerError> {
        let entries = tokio::task::spawn_blocking(move || scan_directory(&dir))
            .await
            .map_err(|e| WorkerError::Failed(format!("scan task failed: {}", e)))??;
        Ok(entries)
    }
}

async fn item_pause() {
    #[cfg(feature = "slowdown")]
    tokio::time::sleep(SLOWDOWN_PER_ITEM).await;
}

async fn write_file(dir: &Path, path: &str, data: &[u8]) -> Result<(), RepositoryError> {
    let full = dir.join(normalize_path(path)?);
    if let Some(parent) = full.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&full, data).await?;
    Ok(())
}

fn join_prefix(prefix: Option<&str>, path: &str) -> String {
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{}/{}", prefix, path),
        None => path.to_string(),
    }
}

#[async_trait]
impl Syncer for DirectoryMirror {
    async fn sync(
        &self,
        ctx: &WorkerContext,
        repository: &dyn Repository,
        options: &SyncOptions,
        progress: &mut ProgressRecorder,
    ) -> Result<(), WorkerError> {
        let namespace = &repository.info().namespace;
        let dir = self.namespace_dir(namespace);
        let remote = repository.list(None).await?;
        let local: BTreeMap<String, String> = self
            .scan(dir.clone())
            .await?
            .into_iter()
            .map(|e| (e.path, e.hash))
            .collect();

        let stale: Vec<&String> = local
            .keys()
            .filter(|path| !remote.iter().any(|e| &e.path == *path))
            .collect();
        let unchanged = remote
            .iter()
            .filter(|e| local.get(&e.path) == Some(&e.hash))
            .count();
        let skipped = if options.incremental { unchanged } else { 0 };
        progress.add_total(remote.len() + stale.len() - skipped);

        for entry in &remote {
            ctx.checkpoint()?;
            item_pause().await;
            let action = match local.get(&entry.path) {
                None => ItemAction::Created,
                Some(hash) if *hash != entry.hash => ItemAction::Updated,
                Some(_) => {
                    if !options.incremental {
                        progress.record(ItemOutcome::ok(&entry.path, ItemAction::Unchanged));
                    }
                    continue;
                }
            };
            let copied = match repository.read(&entry.path, None).await {
                Ok(data) => write_file(&dir, &entry.path, &data).await,
                Err(e) => Err(e),
            };
            progress.record(match copied {
                Ok(()) => ItemOutcome::ok(&entry.path, action),
                Err(e) => ItemOutcome::failed(&entry.path, action, e),
            });
        }

        for path in stale {
            ctx.checkpoint()?;
            item_pause().await;
            let removed = tokio::fs::remove_file(dir.join(path)).await;
            progress.record(match removed {
                Ok(()) => ItemOutcome::ok(path, ItemAction::Deleted),
                Err(e) => ItemOutcome::failed(path, ItemAction::Deleted, e),
            });
        }

        info!(
            "Synced {} into {:?}: {} items",
            repository.info().reference(),
            dir,
            progress.items().len()
        );
        Ok(())
    }
}

#[async_trait]
impl Exporter for DirectoryMirror {
    async fn export(
        &self,
        ctx: &WorkerContext,
        repository: &dyn Repository,
        options: &ExportOptions,
        progress: &mut ProgressRecorder,
    ) -> Result<(), WorkerError> {
        let namespace = &repository.info().namespace;
        let dir = self.namespace_dir(namespace);
        let branch = options.branch.as_deref();
        let local = self.scan(dir.clone()).await?;
        let remote: HashMap<String, String> = repository
            .list(branch)
            .await?
            .into_iter()
            .map(|e| (e.path, e.hash))
            .collect();
        progress.add_total(local.len());

        for entry in &local {
            ctx.checkpoint()?;
            item_pause().await;
            let target = join_prefix(options.path.as_deref(), &entry.path);
            let action = match remote.get(&target) {
                None => ItemAction::Created,
                Some(hash) if *hash != entry.hash => ItemAction::Updated,
                Some(_) => {
                    progress.record(ItemOutcome::ok(&target, ItemAction::Unchanged));
                    continue;
                }
            };
            let written = match tokio::fs::read(dir.join(&entry.path)).await {
                Ok(data) => {
                    debug!("Exporting {} ({})", target, content_hash(&data));
                    repository
                        .write(&target, &data, branch, &options.message)
                        .await
                }
                Err(e) => Err(e.into()),
            };
            progress.record(match written {
                Ok(()) => ItemOutcome::ok(&target, action),
                Err(e) => ItemOutcome::failed(&target, action, e),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl NamespaceCleaner for DirectoryMirror {
    async fn clean(
        &self,
        ctx: &WorkerContext,
        namespace: &str,
        progress: &mut ProgressRecorder,
    ) -> Result<(), WorkerError> {
        let dir = self.namespace_dir(namespace);
        let local = self.scan(dir.clone()).await?;
        progress.add_total(local.len());

        for entry in &local {
            ctx.checkpoint()?;
            item_pause().await;
            let removed = tokio::fs::remove_file(dir.join(&entry.path)).await;
            progress.record(match removed {
                Ok(()) => ItemOutcome::ok(&entry.path, ItemAction::Deleted),
                Err(e) => ItemOutcome::failed(&entry.path, ItemAction::Deleted, e),
            });
        }
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(RepositoryError::from)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobKey, JobStatus};
    use crate::repository::{LocalRepository, RepositoryInfo};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn repository(dir: &TempDir) -> LocalRepository {
        let info = RepositoryInfo {
            namespace: "ns".to_string(),
            name: "repo".to_string(),
            branch: "main".to_string(),
            read_only: false,
            sync_enabled: true,
        };
        LocalRepository::new(info, &dir.path().join("repo")).unwrap()
    }

    fn context() -> WorkerContext {
        WorkerContext::new(JobKey::new("ns", "job"), CancellationToken::new())
    }

    fn recorder() -> ProgressRecorder {
        ProgressRecorder::detached(JobStatus::pending(), Duration::ZERO)
    }

    fn actions(progress: &ProgressRecorder) -> Vec<(String, ItemAction)> {
        progress
            .items()
            .iter()
            .map(|i| (i.path.clone(), i.action))
            .collect()
    }

    #[tokio::test]
    async fn test_sync_creates_updates_and_removes() {
        let dir = TempDir::new().unwrap();
        let repo = repository(&dir);
        let mirror = DirectoryMirror::new(dir.path().join("instance"));
        let ns_dir = mirror.namespace_dir("ns");
        std::fs::create_dir_all(&ns_dir).unwrap();
        std::fs::write(ns_dir.join("same.json"), b"same").unwrap();
        std::fs::write(ns_dir.join("changed.json"), b"old").unwrap();
        std::fs::write(ns_dir.join("stale.json"), b"gone").unwrap();

        repo.write("same.json", b"same", None, "seed").await.unwrap();
        repo.write("changed.json", b"new", None, "seed").await.unwrap();
        repo.write("dir/new.json", b"n", None, "seed").await.unwrap();

        let mut progress = recorder();
        mirror
            .sync(&context(), &repo, &SyncOptions { incremental: true }, &mut progress)
            .await
            .unwrap();

        assert_eq!(
            actions(&progress),
            vec![
                ("changed.json".to_string(), ItemAction::Updated),
                ("dir/new.json".to_string(), ItemAction::Created),
                ("stale.json".to_string(), ItemAction::Deleted),
            ]
        );
        assert_eq!(std::fs::read(ns_dir.join("changed.json")).unwrap(), b"new");
        assert!(!ns_dir.join("stale.json").exists());
        assert_eq!(progress.progress(), 1.0);
    }

    #[tokio::test]
    async fn test_full_sync_reports_unchanged() {
        let dir = TempDir::new().unwrap();
        let repo = repository(&dir);
        let mirror = DirectoryMirror::new(dir.path().join("instance"));
        repo.write("a.json", b"a", None, "seed").await.unwrap();

        let mut first = recorder();
        mirror
            .sync(&context(), &repo, &SyncOptions::default(), &mut first)
            .await
            .unwrap();
        let mut second = recorder();
        mirror
            .sync(&context(), &repo, &SyncOptions::default(), &mut second)
            .await
            .unwrap();

        assert_eq!(
            actions(&second),
            vec![("a.json".to_string(), ItemAction::Unchanged)]
        );
    }

    #[tokio::test]
    async fn test_export_writes_under_prefix() {
        let dir = TempDir::new().unwrap();
        let repo = repository(&dir);
        let mirror = DirectoryMirror::new(dir.path().join("instance"));
        let ns_dir = mirror.namespace_dir("ns");
        std::fs::create_dir_all(&ns_dir).unwrap();
        std::fs::write(ns_dir.join("a.json"), b"a").unwrap();

        let options = ExportOptions {
            branch: Some("export".to_string()),
            path: Some("/exported/".to_string()),
            message: "export".to_string(),
        };
        let mut progress = recorder();
        mirror
            .export(&context(), &repo, &options, &mut progress)
            .await
            .unwrap();

        assert_eq!(
            actions(&progress),
            vec![("exported/a.json".to_string(), ItemAction::Created)]
        );
        assert_eq!(
            repo.read("exported/a.json", Some("export")).await.unwrap(),
            b"a"
        );
        assert!(repo.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clean_removes_namespace() {
        let dir = TempDir::new().unwrap();
        let mirror = DirectoryMirror::new(dir.path().join("instance"));
        let ns_dir = mirror.namespace_dir("ns");
        std::fs::create_dir_all(ns_dir.join("sub")).unwrap();
        std::fs::write(ns_dir.join("sub/a.json"), b"a").unwrap();

        let mut progress = recorder();
        mirror.clean(&context(), "ns", &mut progress).await.unwrap();
        assert!(!ns_dir.exists());
        assert_eq!(progress.items().len(), 1);

        // Cleaning an empty namespace is a no-op.
        mirror.clean(&context(), "ns", &mut recorder()).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_sync_stops() {
        let dir = TempDir::new().unwrap();
        let repo = repository(&dir);
        repo.write("a.json", b"a", None, "seed").await.unwrap();
        let mirror = DirectoryMirror::new(dir.path().join("instance"));

        let ctx = context();
        ctx.cancellation_token.cancel();
        let err = mirror
            .sync(&ctx, &repo, &SyncOptions::default(), &mut recorder())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Cancelled));
    }
}
