use super::{
    content_hash, normalize_path, FileEntry, Repository, RepositoryError, RepositoryInfo,
    RepositoryRef, RepositoryResolver,
};
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use walkdir::WalkDir;

fn default_branch() -> String {
    "main".to_string()
}

fn default_true() -> bool {
    true
}

/// One `[[repositories]]` entry of the config file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RepositorySettings {
    pub namespace: String,
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_true")]
    pub sync_enabled: bool,
}

/// Repository kept in a directory: each ref is a subdirectory of the root.
pub struct LocalRepository {
    info: RepositoryInfo,
    root: PathBuf,
}

impl LocalRepository {
    pub fn open(settings: &RepositorySettings) -> anyhow::Result<Self> {
        let info = RepositoryInfo {
            namespace: settings.namespace.clone(),
            name: settings.name.clone(),
            branch: settings.branch.clone(),
            read_only: settings.read_only,
            sync_enabled: settings.sync_enabled,
        };
        Self::new(info, &settings.path)
    }

    pub fn new(info: RepositoryInfo, root: &Path) -> anyhow::Result<Self> {
        validate_ref(&info.branch)?;
        std::fs::create_dir_all(root.join(&info.branch)).with_context(|| {
            format!(
                "Failed to create repository directory for {}/{} at {:?}",
                info.namespace, info.name, root
            )
        })?;
        Ok(Self {
            info,
            root: root.to_path_buf(),
        })
    }

    fn ref_dir(&self, git_ref: Option<&str>) -> Result<PathBuf, RepositoryError> {
        let git_ref = git_ref.unwrap_or(&self.info.branch);
        validate_ref(git_ref)?;
        Ok(self.root.join(git_ref))
    }

    fn resolve(&self, path: &str, git_ref: Option<&str>) -> Result<PathBuf, RepositoryError> {
        let normalized = normalize_path(path)?;
        Ok(self.ref_dir(git_ref)?.join(normalized.trim_end_matches('/')))
    }

    fn ensure_writable(&self) -> Result<(), RepositoryError> {
        if self.info.read_only {
            return Err(RepositoryError::ReadOnly(self.info.reference()));
        }
        Ok(())
    }
}

fn validate_ref(git_ref: &str) -> Result<(), RepositoryError> {
    if git_ref.is_empty() || git_ref.contains('/') || git_ref == "." || git_ref == ".." {
        return Err(RepositoryError::InvalidPath(format!("ref {}", git_ref)));
    }
    Ok(())
}

fn not_found(path: &str) -> impl FnOnce(std::io::Error) -> RepositoryError + '_ {
    move |e| {
        if e.kind() == ErrorKind::NotFound {
            RepositoryError::NotFound(path.to_string())
        } else {
            RepositoryError::Io(e)
        }
    }
}

/// Walk `dir` and hash every file. Paths come back relative and slash-separated.
pub(crate) fn scan_directory(dir: &Path) -> Result<Vec<FileEntry>, RepositoryError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| RepositoryError::Other(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| RepositoryError::Other(e.into()))?;
        let path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let data = std::fs::read(entry.path())?;
        entries.push(FileEntry {
            path,
            hash: content_hash(&data),
            size: data.len() as u64,
        });
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

#[async_trait]
impl Repository for LocalRepository {
    fn info(&self) -> &RepositoryInfo {
        &self.info
    }

    async fn list(&self, git_ref: Option<&str>) -> Result<Vec<FileEntry>, RepositoryError> {
        let dir = self.ref_dir(git_ref)?;
        tokio::task::spawn_blocking(move || scan_directory(&dir))
            .await
            .map_err(|e| RepositoryError::Other(e.into()))?
    }

    async fn read(&self, path: &str, git_ref: Option<&str>) -> Result<Vec<u8>, RepositoryError> {
        let full = self.resolve(path, git_ref)?;
        tokio::fs::read(&full).await.map_err(not_found(path))
    }

    async fn write(
        &self,
        path: &str,
        data: &[u8],
        git_ref: Option<&str>,
        message: &str,
    ) -> Result<(), RepositoryError> {
        self.ensure_writable()?;
        let full = self.resolve(path, git_ref)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, data).await?;
        debug!("{}: wrote {} ({})", self.info.reference(), path, message);
        Ok(())
    }

    async fn delete(
        &self,
        path: &str,
        git_ref: Option<&str>,
        message: &str,
    ) -> Result<(), RepositoryError> {
        self.ensure_writable()?;
        let full = self.resolve(path, git_ref)?;
        if path.ends_with('/') {
            tokio::fs::remove_dir_all(&full)
                .await
                .map_err(not_found(path))?;
        } else {
            tokio::fs::remove_file(&full)
                .await
                .map_err(not_found(path))?;
        }
        debug!("{}: deleted {} ({})", self.info.reference(), path, message);
        Ok(())
    }

    async fn rename(
        &self,
        from: &str,
        to: &str,
        git_ref: Option<&str>,
        message: &str,
    ) -> Result<(), RepositoryError> {
        self.ensure_writable()?;
        let source = self.resolve(from, git_ref)?;
        let target = self.resolve(to, git_ref)?;
        if !tokio::fs::try_exists(&source).await? {
            return Err(RepositoryError::NotFound(from.to_string()));
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&source, &target).await?;
        debug!(
            "{}: moved {} to {} ({})",
            self.info.reference(),
            from,
            to,
            message
        );
        Ok(())
    }
}

/// Resolver over a fixed set of repositories, usually built from config.
#[derive(Default)]
pub struct StaticRepositoryResolver {
    repositories: HashMap<RepositoryRef, Arc<dyn Repository>>,
}

impl StaticRepositoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &[RepositorySettings]) -> anyhow::Result<Self> {
        let mut resolver = Self::new();
        for entry in settings {
            resolver = resolver.with_repository(Arc::new(LocalRepository::open(entry)?));
        }
        Ok(resolver)
    }

    pub fn with_repository(mut self, repository: Arc<dyn Repository>) -> Self {
        self.repositories
            .insert(repository.info().reference(), repository);
        self
    }

    pub fn len(&self) -> usize {
        self.repositories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }
}

#[async_trait]
impl RepositoryResolver for StaticRepositoryResolver {
    async fn resolve(
        &self,
        reference: &RepositoryRef,
    ) -> Result<Arc<dyn Repository>, RepositoryError> {
        self.repositories
            .get(reference)
            .cloned()
            .ok_or_else(|| RepositoryError::UnknownRepository(reference.clone()))
    }
}
